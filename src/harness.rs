//! Benchmark workload: every worker inserts its share of a shuffled set of
//! unique items, then removes the same number of items. Afterwards the run is
//! checked for lost or duplicated items.

use anyhow::{anyhow, Result};
use lfds::{EliminationBackoffStack, MichaelScottQueue, StackHandle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// One thread's view of the structure under test.
pub trait Worker {
    fn insert(&self, item: u32);
    fn remove(&self) -> Option<u32>;
}

impl Worker for StackHandle<'_, u32> {
    fn insert(&self, item: u32) {
        self.push(item);
    }

    fn remove(&self) -> Option<u32> {
        self.pop()
    }
}

impl Worker for &MichaelScottQueue<u32> {
    fn insert(&self, item: u32) {
        self.enqueue(item);
    }

    fn remove(&self) -> Option<u32> {
        self.dequeue()
    }
}

#[derive(Debug)]
pub struct Workload {
    threads: usize,
    items: Vec<u32>,
    /// Busy work performed after every operation.
    work: Duration,
}

impl Workload {
    /// Builds the items `0..num_items` in a fixed shuffled order.
    pub fn new(threads: usize, num_items: u32, work: Duration) -> Self {
        let mut items: Vec<u32> = (0..num_items).collect();
        items.shuffle(&mut StdRng::seed_from_u64(0));
        Self {
            threads,
            items,
            work,
        }
    }

    fn per_worker(&self) -> usize {
        self.items.len() / self.threads
    }

    /// Items actually handed to workers; the remainder of an uneven split is
    /// left out.
    pub fn inserted(&self) -> usize {
        self.per_worker() * self.threads
    }

    fn shares(&self) -> impl Iterator<Item = &[u32]> {
        let per_worker = self.per_worker();
        self.items[..self.inserted()].chunks(per_worker.max(1))
    }

    fn busy_work(&self) {
        if self.work.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.work;
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub elapsed: Duration,
    pub inserted: usize,
    pub removed: Vec<u32>,
    /// Whether a final removal after the run still found an item.
    pub leftover: bool,
}

impl Report {
    /// Post-run invariant violations, empty when the run was correct.
    pub fn errors(&self, structure: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.leftover {
            errors.push(format!("The {structure} is not empty after test"));
        }
        if self.removed.len() != self.inserted {
            errors.push(format!(
                "Inserted {} items but removed {} items",
                self.inserted,
                self.removed.len()
            ));
        }
        let unique: HashSet<_> = self.removed.iter().collect();
        if unique.len() < self.removed.len() {
            errors.push(format!(
                "Duplicate element(s) were removed from the {structure}"
            ));
        }

        errors
    }
}

pub fn run_stack(stack: &EliminationBackoffStack<u32>, workload: &Workload) -> Result<Report> {
    let (elapsed, removed) = drive(workload, || Ok(stack.register()?))?;
    let leftover = stack.register()?.pop().is_some();

    Ok(Report {
        elapsed,
        inserted: workload.inserted(),
        removed,
        leftover,
    })
}

pub fn run_queue(queue: &MichaelScottQueue<u32>, workload: &Workload) -> Result<Report> {
    let (elapsed, removed) = drive(workload, || Ok(queue))?;
    let leftover = queue.dequeue().is_some();

    Ok(Report {
        elapsed,
        inserted: workload.inserted(),
        removed,
        leftover,
    })
}

/// Runs one worker thread per share and collects everything they removed.
fn drive<W: Worker>(
    workload: &Workload,
    attach: impl Fn() -> Result<W> + Sync,
) -> Result<(Duration, Vec<u32>)> {
    info!(
        threads = workload.threads,
        items = workload.inserted(),
        "starting workers"
    );
    let start = Instant::now();

    let removed = thread::scope(|s| {
        let handles: Vec<_> = workload
            .shares()
            .map(|share| {
                let attach = &attach;
                s.spawn(move || -> Result<Vec<u32>> {
                    let worker = attach()?;
                    for &item in share {
                        worker.insert(item);
                        workload.busy_work();
                    }

                    let mut removed = Vec::with_capacity(share.len());
                    for _ in 0..share.len() {
                        if let Some(item) = worker.remove() {
                            removed.push(item);
                        }
                        workload.busy_work();
                    }
                    Ok(removed)
                })
            })
            .collect();

        handles.into_iter().try_fold(Vec::new(), |mut all, handle| {
            let removed = handle
                .join()
                .map_err(|_| anyhow!("benchmark worker panicked"))??;
            all.extend(removed);
            Ok::<_, anyhow::Error>(all)
        })
    })?;

    let elapsed = start.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "workers finished");
    Ok((elapsed, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfds::StackConfig;

    #[test]
    fn test_workload_items_are_a_shuffled_permutation() {
        let workload = Workload::new(4, 100, Duration::ZERO);
        let mut sorted = workload.items.clone();
        sorted.sort_unstable();

        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(workload.items, sorted);
        // The shuffle is seeded, so every run uses the same order.
        assert_eq!(workload.items, Workload::new(4, 100, Duration::ZERO).items);
    }

    #[test]
    fn test_uneven_split_drops_remainder() {
        let workload = Workload::new(3, 10, Duration::ZERO);
        assert_eq!(workload.inserted(), 9);
        let shares: Vec<_> = workload.shares().collect();
        assert_eq!(shares.len(), 3);
        assert!(shares.iter().all(|share| share.len() == 3));
    }

    #[test]
    fn test_more_threads_than_items() {
        let workload = Workload::new(4, 2, Duration::ZERO);
        assert_eq!(workload.inserted(), 0);
        assert_eq!(workload.shares().count(), 0);
    }

    #[test]
    fn test_report_errors() {
        let clean = Report {
            elapsed: Duration::ZERO,
            inserted: 3,
            removed: vec![2, 0, 1],
            leftover: false,
        };
        assert!(clean.errors("stack").is_empty());

        let broken = Report {
            elapsed: Duration::ZERO,
            inserted: 3,
            removed: vec![1, 1],
            leftover: true,
        };
        assert_eq!(
            broken.errors("queue"),
            vec![
                "The queue is not empty after test".to_string(),
                "Inserted 3 items but removed 2 items".to_string(),
                "Duplicate element(s) were removed from the queue".to_string(),
            ]
        );
    }

    #[test]
    fn test_stack_run_is_clean() {
        let stack = EliminationBackoffStack::with_config(
            StackConfig::new(4).spin_delay(Duration::from_micros(10)),
        )
        .unwrap();
        let workload = Workload::new(4, 4000, Duration::ZERO);

        let report = run_stack(&stack, &workload).unwrap();
        assert_eq!(report.errors("stack"), Vec::<String>::new());
        assert_eq!(stack.stats().total_pushes(), 4000);
    }

    #[test]
    fn test_queue_run_is_clean() {
        let queue = MichaelScottQueue::new();
        let workload = Workload::new(4, 4000, Duration::from_nanos(100));

        let report = run_queue(&queue, &workload).unwrap();
        assert_eq!(report.errors("queue"), Vec::<String>::new());
        assert_eq!(queue.stats().enqueues, 4000);
    }
}
