use std::num::NonZeroUsize;
use std::thread;

pub fn host_parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Number of runner slots to activate for `trial_count` trials.
///
/// A limit of zero is treated as one so that a non-empty batch always gets a
/// runner.
pub fn partition(trial_count: usize, concurrency_limit: Option<usize>) -> usize {
    partition_with_hint(trial_count, concurrency_limit, host_parallelism())
}

pub(crate) fn partition_with_hint(
    trial_count: usize,
    concurrency_limit: Option<usize>,
    host_hint: usize,
) -> usize {
    let cap = concurrency_limit.unwrap_or(host_hint).max(1);
    trial_count.min(cap)
}
