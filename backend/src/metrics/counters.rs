use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub admitted: Arc<AtomicU64>,
    pub enqueue_failures: Arc<AtomicU64>,

    // rejection reasons
    pub rejected_invalid: Arc<AtomicU64>,
    pub rejected_user_not_found: Arc<AtomicU64>,
    pub rejected_rate_limit: Arc<AtomicU64>,
    pub rejected_insufficient: Arc<AtomicU64>,

    // executor outcomes
    pub exec_done: Arc<AtomicU64>,
    pub exec_retried: Arc<AtomicU64>,
    pub exec_failed: Arc<AtomicU64>,
    pub exec_duplicates: Arc<AtomicU64>,
    pub exec_errors: Arc<AtomicU64>,
    pub refunds: Arc<AtomicU64>,

    pub reconcile_requeued: Arc<AtomicU64>,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
