#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use kalloc_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;
use numa_kalloc::{MAX_SIZE, MIN_SIZE};

const MAX_OFFSET: usize = 2 * MAX_SIZE;
const MAX_PAGES: usize = 3 * MAX_SIZE / MIN_SIZE;

#[derive(Clone, Debug)]
struct Args {
    offset: usize,
    len: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let offset = usize::arbitrary(un)? % MAX_OFFSET;
        // Allow a ragged tail so waste accounting is exercised too.
        let len = (usize::arbitrary(un)? % MAX_PAGES) * MIN_SIZE + usize::arbitrary(un)? % MIN_SIZE;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { offset, len, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { offset, len, ops } = args;

    let buddy = match BuddySubject::new(offset, len) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(buddy);
    eval.evaluate(ops).unwrap();
});
