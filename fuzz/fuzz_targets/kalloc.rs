#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::Arbitrary;
use kalloc_hater::KallocSubject;
use libfuzzer_sys::fuzz_target;
use numa_kalloc::{MAX_SIZE, PGSIZE};

const MAX_BUDDIES: u8 = 4;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    nbuddies: u8,
    load_balance: bool,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let Args {
        nbuddies,
        load_balance,
        ops,
    } = args;

    let nbuddies = usize::from(1 + nbuddies % MAX_BUDDIES);
    let subject = match KallocSubject::new(2 * MAX_SIZE, nbuddies, load_balance) {
        Some(s) => s,
        None => return,
    };
    let initial = subject.kalloc().report().total.free_bytes;

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();

    // Everything was freed again; only the hot cache may still hold pages.
    let report = eval.into_subject().kalloc().report();
    assert_eq!(report.total.free_bytes + report.hot_pages * PGSIZE, initial);
});
