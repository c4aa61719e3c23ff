//! The elimination layer of the stack.
//!
//! A thread whose CAS on `top` failed publishes its pending operation in
//! `location[id]`, then swaps its id into a random `collision` slot. If the
//! previous occupant of that slot has an opposite operation published, the two
//! try to eliminate each other. Otherwise the thread waits for the configured
//! spin delay in case someone collides with it, and then retracts.
//!
//! Reclamation of the published records follows two rules:
//!
//! * a pop's `ThreadInfo` is always retired by the pop itself;
//! * a push's `ThreadInfo` (and the node it carries) belongs to the pop that
//!   eliminated it, which retires it after unlinking it from `location`.

use super::Node;
use crate::config::{StackConfig, MAX_SPIN_DELAY};
use crate::reclaim;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Marks a collision slot that no thread has visited yet.
const EMPTY: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Op {
    Push,
    Pop,
}

/// A pending operation advertised in the elimination array.
pub(super) struct ThreadInfo<T> {
    pub(super) id: usize,
    pub(super) op: Op,
    /// The pushed node for a push; for a pop, the node received from the
    /// push it eliminated.
    pub(super) cell: Atomic<Node<T>>,
}

impl<T> ThreadInfo<T> {
    pub(super) fn alloc<'g>(
        id: usize,
        op: Op,
        cell: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> Shared<'g, Self> {
        Owned::new(Self {
            id,
            op,
            cell: Atomic::from(cell),
        })
        .into_shared(guard)
    }
}

pub(super) struct EliminationLayer<T> {
    location: Box<[CachePadded<Atomic<ThreadInfo<T>>>]>,
    collision: Box<[AtomicUsize]>,
    spin_delay: Duration,
    spin_jitter: bool,
}

impl<T> EliminationLayer<T> {
    pub(super) fn new(config: &StackConfig) -> Self {
        let level = config.concurrency_level;
        Self {
            location: (0..level)
                .map(|_| CachePadded::new(Atomic::null()))
                .collect(),
            collision: (0..level).map(|_| AtomicUsize::new(EMPTY)).collect(),
            // Bounded even for a config that skipped `validate`.
            spin_delay: config.spin_delay.min(MAX_SPIN_DELAY),
            spin_jitter: config.spin_jitter,
        }
    }

    /// Tries to complete the operation described by `my_info` against a
    /// concurrent opposite operation.
    ///
    /// On success a push's value has been handed over (and the caller no
    /// longer owns `my_info`), or a pop's `cell` holds the received node. On
    /// failure `my_info` is unpublished again and still owned by the caller.
    pub(super) fn try_eliminate<'g>(
        &self,
        my_info: Shared<'g, ThreadInfo<T>>,
        guard: &'g Guard,
    ) -> bool {
        // SAFETY: the caller owns `my_info` and stays pinned until it is retired.
        let me = unsafe { my_info.deref() };
        let my_slot = &self.location[me.id];
        my_slot.store(my_info, Ordering::Release);

        let pos = rand::rng().random_range(0..self.collision.len());
        let his_id = self.collision[pos].swap(me.id, Ordering::AcqRel);

        if his_id != EMPTY {
            let his_info = self.location[his_id].load(Ordering::Acquire, guard);
            // SAFETY: records are retired only after leaving `location`, and
            // we are pinned.
            if let Some(his) = unsafe { his_info.as_ref() } {
                if his.id == his_id && his.op != me.op {
                    if my_slot
                        .compare_exchange(
                            my_info,
                            Shared::null(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        return self.try_collision(my_info, his_info, guard);
                    }

                    // Someone collided with us first.
                    self.finish_collision(me, guard);
                    return true;
                }
            }
        }

        self.spin();

        if my_slot
            .compare_exchange(
                my_info,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_err()
        {
            self.finish_collision(me, guard);
            return true;
        }

        false
    }

    /// Eliminates against `his_info`, which was found published under its
    /// owner's id. `my_info` must already be unpublished.
    fn try_collision<'g>(
        &self,
        my_info: Shared<'g, ThreadInfo<T>>,
        his_info: Shared<'g, ThreadInfo<T>>,
        guard: &'g Guard,
    ) -> bool {
        // SAFETY: both records are protected by the guard.
        let (me, his) = unsafe { (my_info.deref(), his_info.deref()) };
        let his_slot = &self.location[his.id];

        match me.op {
            // Leave our record in the pop's slot; the pop picks it up when it
            // fails to retract.
            Op::Push => his_slot
                .compare_exchange(
                    his_info,
                    my_info,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok(),
            Op::Pop => {
                if his_slot
                    .compare_exchange(
                        his_info,
                        Shared::null(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_err()
                {
                    return false;
                }

                me.cell
                    .store(his.cell.load(Ordering::Acquire, guard), Ordering::Relaxed);
                self.location[me.id].store(Shared::null(), Ordering::Release);
                // SAFETY: the push's record just left `location` and the push
                // will not touch it again after seeing its retraction fail.
                unsafe { reclaim::retire(guard, his_info) };
                true
            }
        }
    }

    /// Harvests a collision that another thread completed on our behalf.
    fn finish_collision(&self, me: &ThreadInfo<T>, guard: &Guard) {
        if me.op != Op::Pop {
            return;
        }

        let slot = &self.location[me.id];
        let his_info = slot.load(Ordering::Acquire, guard);
        // SAFETY: only a push replaces a published pop record, and it leaves
        // its own record in the pop's slot.
        let his = unsafe { his_info.deref() };
        me.cell
            .store(his.cell.load(Ordering::Acquire, guard), Ordering::Relaxed);
        slot.store(Shared::null(), Ordering::Release);
        // SAFETY: the record is no longer reachable from `location`.
        unsafe { reclaim::retire(guard, his_info) };
    }

    /// Busy-waits for a partner to show up.
    fn spin(&self) {
        let delay = if self.spin_jitter {
            let max = u64::try_from(self.spin_delay.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(rand::rng().random_range(max / 2..=max))
        } else {
            self.spin_delay
        };

        let deadline = Instant::now() + delay;
        let backoff = Backoff::new();
        while Instant::now() < deadline {
            backoff.spin();
        }
    }
}

impl<T> fmt::Debug for EliminationLayer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EliminationLayer")
            .field("slots", &self.collision.len())
            .field("spin_delay", &self.spin_delay)
            .field("spin_jitter", &self.spin_jitter)
            .finish()
    }
}
