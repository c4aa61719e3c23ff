//! Michael-Scott queue.
//!
//! Maged M. Michael and Michael L. Scott. 1996. Simple, fast, and practical
//! non-blocking and blocking concurrent queue algorithms. PODC '96.

use crate::reclaim::{self, Link};
use crate::stats::Counter;
use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// A node in the lock-free queue
struct Node<T> {
    /// The value stored in this node, `None` for the initial sentinel.
    ///
    /// Once `head` moves onto a node, the dequeuer that moved it takes the
    /// value and the node becomes the new sentinel.
    data: ManuallyDrop<Option<T>>,
    /// Pointer to the next node in the queue
    next: Atomic<Node<T>>,
}

impl<T> Link for Node<T> {
    fn next(&self) -> &Atomic<Self> {
        &self.next
    }
}

/// A lock-free FIFO queue implementation using epoch-based memory reclamation
///
/// `head` always points at a sentinel whose value has been consumed; the
/// queue is empty when the sentinel has no successor. `tail` may lag one or
/// more nodes behind the real end of the list, and every operation that
/// notices this helps move it forward.
///
/// # Examples
/// ```
/// use lfds::MichaelScottQueue;
///
/// let queue = MichaelScottQueue::new();
/// queue.enqueue(42);
/// assert_eq!(queue.dequeue(), Some(42));
/// assert_eq!(queue.dequeue(), None);
/// ```
pub struct MichaelScottQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    enqueues: Counter,
    dequeues: Counter,
    empty_dequeues: Counter,
}

// SAFETY: values are only ever moved between threads, never shared, and all
// internal state is accessed through atomics.
unsafe impl<T: Send> Send for MichaelScottQueue<T> {}
unsafe impl<T: Send> Sync for MichaelScottQueue<T> {}

/// A point-in-time snapshot of a queue's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Values appended to the queue.
    pub enqueues: u64,
    /// Dequeues that returned a value.
    pub dequeues: u64,
    /// Dequeues that observed an empty queue.
    pub empty_dequeues: u64,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MichaelScottQueue stats:")?;
        writeln!(f, "Number of enqueues:          {}", self.enqueues)?;
        writeln!(f, "Number of dequeues:          {}", self.dequeues)?;
        write!(f, "Number of empty dequeues:    {}", self.empty_dequeues)
    }
}

impl<T: Send> MichaelScottQueue<T> {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        let sentinel = Owned::new(Node {
            data: ManuallyDrop::new(None),
            next: Atomic::null(),
        });
        // SAFETY: the queue is not shared yet.
        let sentinel = sentinel.into_shared(unsafe { epoch::unprotected() });
        debug!("created michael-scott queue");

        Self {
            head: CachePadded::new(Atomic::from(sentinel)),
            tail: CachePadded::new(Atomic::from(sentinel)),
            enqueues: Counter::new(),
            dequeues: Counter::new(),
            empty_dequeues: Counter::new(),
        }
    }

    /// Adds a value to the back of the queue.
    pub fn enqueue(&self, value: T) {
        let guard = reclaim::pin();
        let node = Owned::new(Node {
            data: ManuallyDrop::new(Some(value)),
            next: Atomic::null(),
        })
        .into_shared(&guard);

        let mut tail;
        loop {
            tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: `tail` is never null, and `head` never moves past it,
            // so it has not been retired before we pinned.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            if tail != self.tail.load(Ordering::Acquire, &guard) {
                continue;
            }

            if next.is_null() {
                if tail_ref
                    .next
                    .compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    )
                    .is_ok()
                {
                    break;
                }
            } else {
                // Tail has fallen behind, help advance it
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }

        // If this fails, a concurrent thread already advanced the tail
        let _ = self
            .tail
            .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed, &guard);

        self.enqueues.incr();
        trace!("enqueue");
    }

    /// Removes and returns the value at the front of the queue, or `None` if
    /// the queue was empty.
    pub fn dequeue(&self) -> Option<T> {
        let guard = reclaim::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: `head` is never null and we are pinned.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);

            if head != self.head.load(Ordering::Acquire, &guard) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    self.empty_dequeues.incr();
                    trace!("dequeue on empty queue");
                    return None;
                }

                // Tail has fallen behind, help advance it
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            } else if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // SAFETY: `tail` is ahead of `head`, so `next` is non-null.
                // Winning the CAS makes us the only reader of its value, and
                // the old sentinel is now unreachable.
                let value = unsafe {
                    let value = reclaim::take(&next.deref().data);
                    reclaim::retire(&guard, head);
                    value
                };
                self.dequeues.incr();
                trace!("dequeue");
                return value;
            }
        }
    }

    /// Returns true if the queue is empty.
    ///
    /// Note: Due to concurrent operations, the answer may be stale by the
    /// time this call returns.
    pub fn is_empty(&self) -> bool {
        let guard = reclaim::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        // SAFETY: `head` is never null and we are pinned.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueues: self.enqueues.get(),
            dequeues: self.dequeues.get(),
            empty_dequeues: self.empty_dequeues.get(),
        }
    }
}

impl<T: Send> Default for MichaelScottQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MichaelScottQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MichaelScottQueue").finish_non_exhaustive()
    }
}

impl<T> Drop for MichaelScottQueue<T> {
    fn drop(&mut self) {
        // The sentinel's value is either absent or was moved out by the
        // dequeue that made it the sentinel.
        let mut sentinel = true;
        // SAFETY: `&mut self` gives exclusive access to the list.
        unsafe {
            reclaim::free_chain(&*self.head, |node| {
                if !mem::take(&mut sentinel) {
                    ManuallyDrop::drop(&mut node.data);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_queue_basic_operations() {
        let queue = MichaelScottQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_queue_interleaved_scenario() {
        let queue = MichaelScottQueue::new();
        assert_eq!(queue.dequeue(), None);

        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.dequeue(), Some(1));

        queue.enqueue(3);
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_empty_queue() {
        let queue: MichaelScottQueue<i32> = MichaelScottQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);

        queue.enqueue(7);
        assert!(!queue.is_empty());
        assert_eq!(queue.dequeue(), Some(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_stats() {
        let queue = MichaelScottQueue::new();
        for i in 0..5 {
            queue.enqueue(i);
        }
        for _ in 0..7 {
            queue.dequeue();
        }

        assert_eq!(
            queue.stats(),
            QueueStats {
                enqueues: 5,
                dequeues: 5,
                empty_dequeues: 2,
            }
        );

        let report = queue.stats().to_string();
        assert!(report.starts_with("MichaelScottQueue stats:"));
        assert!(report.contains("Number of enqueues:          5"));
    }

    #[derive(Debug)]
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_releases_remaining_values_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = MichaelScottQueue::new();
        for _ in 0..10 {
            queue.enqueue(Tracked(Arc::clone(&drops)));
        }

        for _ in 0..4 {
            drop(queue.dequeue());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);

        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_queue_concurrent_producers_then_consumers() {
        let queue = Arc::new(MichaelScottQueue::new());
        let num_producers = 5;
        let num_items_per_producer = 1000;
        let total_items = num_producers * num_items_per_producer;

        let producers: Vec<_> = (0..num_producers)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for j in 0..num_items_per_producer {
                        queue.enqueue(i * num_items_per_producer + j);
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut received = Vec::new();
                    while let Some(value) = queue.dequeue() {
                        received.push(value);
                    }
                    received
                })
            })
            .collect();

        let mut total_received = Vec::new();
        for handle in consumers {
            total_received.extend(handle.join().unwrap());
        }
        total_received.sort_unstable();

        let expected: Vec<_> = (0..total_items).collect();
        assert_eq!(total_received, expected);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_per_producer_fifo_order() {
        let queue = Arc::new(MichaelScottQueue::new());
        let producers = 4;
        let per_producer = 2000;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..per_producer {
                        queue.enqueue((p, seq));
                    }
                })
            })
            .collect();

        // Consume concurrently with the producers.
        let mut last_seen = vec![None; producers];
        let mut received = 0;
        while received < producers * per_producer {
            if let Some((p, seq)) = queue.dequeue() {
                if let Some(prev) = last_seen[p] {
                    assert!(seq > prev, "producer {p}: {seq} dequeued after {prev}");
                }
                last_seen[p] = Some(seq);
                received += 1;
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.dequeue(), None);
    }

    fn busy_wait(duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn test_concurrent_stress_no_loss_no_duplicates() {
        let threads = 8;
        let per_thread = 500;
        let mut items: Vec<usize> = (0..threads * per_thread).collect();
        items.shuffle(&mut rand::rng());

        let queue = MichaelScottQueue::new();
        let dequeued: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = items
                .chunks(per_thread)
                .map(|chunk| {
                    let queue = &queue;
                    s.spawn(move || {
                        for &item in chunk {
                            queue.enqueue(item);
                            busy_wait(Duration::from_micros(1));
                        }
                        let mut out = Vec::with_capacity(chunk.len());
                        for _ in 0..chunk.len() {
                            if let Some(item) = queue.dequeue() {
                                out.push(item);
                            }
                            busy_wait(Duration::from_micros(1));
                        }
                        out
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        // Each thread dequeues only after its own enqueues, so the queue
        // always holds at least as many items as pending dequeues.
        assert_eq!(dequeued.len(), threads * per_thread);
        let unique: HashSet<_> = dequeued.iter().copied().collect();
        assert_eq!(unique.len(), dequeued.len());
        assert_eq!(queue.dequeue(), None);

        let stats = queue.stats();
        assert_eq!(stats.enqueues, (threads * per_thread) as u64);
        assert_eq!(stats.dequeues, (threads * per_thread) as u64);
    }
}
