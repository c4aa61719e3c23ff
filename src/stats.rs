use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing event counter.
///
/// Each counter sits on its own cache line so that threads bumping different
/// counters do not contend with each other or with the structure's hot
/// pointers.
#[derive(Debug, Default)]
pub(crate) struct Counter(CachePadded<AtomicU64>);

impl Counter {
    pub(crate) fn new() -> Self {
        Self(CachePadded::new(AtomicU64::new(0)))
    }

    #[inline]
    pub(crate) fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value. Concurrent increments may or may not be observed.
    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_zero() {
        assert_eq!(Counter::new().get(), 0);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        let counter = Arc::new(Counter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.incr();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.get(), 4000);
    }
}
