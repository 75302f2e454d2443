use std::sync::atomic::{AtomicUsize, Ordering};

// Default heuristic values; adjust at runtime for unusual core counts or
// workloads instead of recompiling.
const DEFAULT_PARALLEL_TASKS_PER_THREAD: usize = 64;
const DEFAULT_SERIAL_THRESHOLD: usize = 256;

static PARALLEL_TASKS_PER_THREAD: AtomicUsize =
    AtomicUsize::new(DEFAULT_PARALLEL_TASKS_PER_THREAD);
static SERIAL_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_SERIAL_THRESHOLD);

pub fn get_parallel_tasks_per_thread() -> usize {
    PARALLEL_TASKS_PER_THREAD.load(Ordering::Relaxed)
}

pub fn set_parallel_tasks_per_thread(val: usize) {
    PARALLEL_TASKS_PER_THREAD.store(val.max(1), Ordering::Relaxed);
}

pub fn get_serial_threshold() -> usize {
    SERIAL_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_serial_threshold(val: usize) {
    SERIAL_THRESHOLD.store(val, Ordering::Relaxed);
}

/// Minimum rayon chunk length so a stage over `n_items` splits into roughly
/// `tasks_per_thread` pieces per worker.
pub fn chunk_min_len(n_items: usize) -> usize {
    let num_threads = rayon::current_num_threads();
    (n_items / (num_threads * get_parallel_tasks_per_thread())).max(1)
}
