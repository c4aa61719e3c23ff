//! Elimination-backoff stack.
//!
//! Danny Hendler, Nir Shavit, and Lena Yerushalmi. 2004. A scalable lock-free
//! stack algorithm. SPAA '04.
//!
//! The stack is a Treiber stack: `push` and `pop` CAS a single `top` pointer.
//! When that CAS loses a race, the operation backs off into an elimination
//! layer where a concurrent push and pop can hand a value to each other
//! without touching `top` at all.

mod elimination;

use crate::config::{ConfigError, StackConfig};
use crate::reclaim::{self, Link};
use crate::stats::Counter;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use elimination::{EliminationLayer, Op, ThreadInfo};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

/// Error types that can occur during stack operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    /// Every thread slot is held by a live [`StackHandle`]
    #[error("all {level} thread slots of the stack are in use")]
    ConcurrencyLevelExceeded { level: usize },
}

/// A node in the stack
///
/// The payload is moved out by whichever thread wins the node, so dropping a
/// node never drops its payload.
pub(crate) struct Node<T> {
    data: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

impl<T> Link for Node<T> {
    fn next(&self) -> &Atomic<Self> {
        &self.next
    }
}

/// Returned by a single stack attempt that lost its CAS race.
struct Contended;

/// A lock-free LIFO stack with an elimination-backoff layer.
///
/// Threads operate on the stack through a [`StackHandle`] obtained from
/// [`register`](Self::register). At most `concurrency_level` handles can be
/// alive at once.
///
/// # Examples
/// ```
/// use lfds::EliminationBackoffStack;
///
/// let stack = EliminationBackoffStack::new(1).unwrap();
/// let handle = stack.register().unwrap();
/// handle.push(1);
/// assert_eq!(handle.pop(), Some(1));
/// assert_eq!(handle.pop(), None);
/// ```
pub struct EliminationBackoffStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
    elimination: EliminationLayer<T>,
    /// `slots[id]` is set while a handle holds thread id `id`.
    slots: Box<[AtomicBool]>,
    stats: StackCounters,
}

// SAFETY: values are only ever moved between threads, never shared, and all
// internal state is accessed through atomics.
unsafe impl<T: Send> Send for EliminationBackoffStack<T> {}
unsafe impl<T: Send> Sync for EliminationBackoffStack<T> {}

#[derive(Debug, Default)]
struct StackCounters {
    pushes: Counter,
    pops: Counter,
    empty_pops: Counter,
    eliminated_pushes: Counter,
    eliminated_pops: Counter,
    failed_eliminations: Counter,
}

/// A point-in-time snapshot of a stack's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    /// Pushes completed by a CAS on `top`.
    pub pushes: u64,
    /// Pops that removed a value through a CAS on `top`.
    pub pops: u64,
    /// Pops that observed an empty stack.
    pub empty_pops: u64,
    /// Pushes whose value was handed directly to a concurrent pop.
    pub eliminated_pushes: u64,
    /// Pops that received their value directly from a concurrent push.
    pub eliminated_pops: u64,
    /// Elimination attempts that found no partner in time.
    pub failed_eliminations: u64,
}

impl StackStats {
    /// Values that entered the stack, by either path.
    pub fn total_pushes(&self) -> u64 {
        self.pushes + self.eliminated_pushes
    }

    /// Values that left the stack, by either path.
    pub fn total_pops(&self) -> u64 {
        self.pops + self.eliminated_pops
    }
}

impl fmt::Display for StackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EliminationBackoffStack stats:")?;
        writeln!(f, "Number of pushes:               {}", self.pushes)?;
        writeln!(f, "Number of pops:                 {}", self.pops)?;
        writeln!(f, "Number of empty pops:           {}", self.empty_pops)?;
        writeln!(f, "Number of eliminated pushes:    {}", self.eliminated_pushes)?;
        writeln!(f, "Number of eliminated pops:      {}", self.eliminated_pops)?;
        write!(f, "Number of failed eliminations:  {}", self.failed_eliminations)
    }
}

impl<T: Send> EliminationBackoffStack<T> {
    /// Creates an empty stack for up to `concurrency_level` concurrently
    /// registered threads, with the default spin delay.
    pub fn new(concurrency_level: usize) -> Result<Self, ConfigError> {
        Self::with_config(StackConfig::new(concurrency_level))
    }

    pub fn with_config(config: StackConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(
            concurrency_level = config.concurrency_level,
            spin_delay = ?config.spin_delay,
            spin_jitter = config.spin_jitter,
            "created elimination-backoff stack"
        );

        Ok(Self {
            top: CachePadded::new(Atomic::null()),
            elimination: EliminationLayer::new(&config),
            slots: (0..config.concurrency_level)
                .map(|_| AtomicBool::new(false))
                .collect(),
            stats: StackCounters::default(),
        })
    }

    /// Claims the lowest free thread id.
    ///
    /// The id is released when the returned handle is dropped.
    pub fn register(&self) -> Result<StackHandle<'_, T>, StackError> {
        for (id, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                debug!(id, "registered stack thread");
                return Ok(StackHandle {
                    stack: self,
                    id,
                    _not_sync: PhantomData,
                });
            }
        }

        Err(StackError::ConcurrencyLevelExceeded {
            level: self.slots.len(),
        })
    }

    pub fn concurrency_level(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the stack is empty
    ///
    /// Note: Due to concurrent operations, the answer may be stale by the
    /// time this call returns.
    pub fn is_empty(&self) -> bool {
        let guard = reclaim::pin();
        self.top.load(Ordering::Acquire, &guard).is_null()
    }

    pub fn stats(&self) -> StackStats {
        StackStats {
            pushes: self.stats.pushes.get(),
            pops: self.stats.pops.get(),
            empty_pops: self.stats.empty_pops.get(),
            eliminated_pushes: self.stats.eliminated_pushes.get(),
            eliminated_pops: self.stats.eliminated_pops.get(),
            failed_eliminations: self.stats.failed_eliminations.get(),
        }
    }

    /// Attempts to collect garbage from previous operations
    ///
    /// This is an optimization that can be called periodically to
    /// help manage memory usage.
    pub fn try_collect_garbage(&self) {
        reclaim::collect();
    }

    /// One attempt to link `node` in as the new top.
    fn try_push(&self, node: Shared<'_, Node<T>>, guard: &Guard) -> bool {
        let old_top = self.top.load(Ordering::Relaxed, guard);
        // SAFETY: the node is owned by the pushing thread and is not
        // reachable from `top` until the CAS below succeeds.
        unsafe { node.deref() }.next.store(old_top, Ordering::Relaxed);

        self.top
            .compare_exchange(old_top, node, Ordering::Release, Ordering::Relaxed, guard)
            .is_ok()
    }

    /// One attempt to unlink the top node. An empty stack is a successful
    /// attempt that yields `None`.
    fn try_pop(&self, guard: &Guard) -> Result<Option<T>, Contended> {
        let old_top = self.top.load(Ordering::Acquire, guard);
        // SAFETY: nodes are retired only after being unlinked, and we are pinned.
        let Some(top) = (unsafe { old_top.as_ref() }) else {
            return Ok(None);
        };
        let new_top = top.next.load(Ordering::Relaxed, guard);

        self.top
            .compare_exchange(old_top, new_top, Ordering::AcqRel, Ordering::Acquire, guard)
            .map_err(|_| Contended)?;

        // SAFETY: winning the CAS made us the only owner of the node's payload,
        // and the node is no longer reachable from `top`.
        unsafe {
            let value = reclaim::take(&top.data);
            reclaim::retire(guard, old_top);
            Ok(Some(value))
        }
    }
}

impl<T> fmt::Debug for EliminationBackoffStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EliminationBackoffStack")
            .field("concurrency_level", &self.slots.len())
            .field("elimination", &self.elimination)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for EliminationBackoffStack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no handle is alive, so nobody else can
        // reach the list.
        unsafe {
            reclaim::free_chain(&*self.top, |node| ManuallyDrop::drop(&mut node.data));
        }
    }
}

/// A registered thread's access to an [`EliminationBackoffStack`].
///
/// The handle owns one thread id of the stack's elimination layer. It can be
/// moved to another thread but not shared, so an id is never used by two
/// threads at once.
pub struct StackHandle<'a, T: Send> {
    stack: &'a EliminationBackoffStack<T>,
    id: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send> StackHandle<'_, T> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Pushes a value onto the stack, either through `top` or by handing it
    /// to a concurrent pop.
    pub fn push(&self, value: T) {
        let stack = self.stack;
        let guard = reclaim::pin();
        let node = Owned::new(Node {
            data: ManuallyDrop::new(value),
            next: Atomic::null(),
        })
        .into_shared(&guard);
        let mut info = Shared::null();

        loop {
            if stack.try_push(node, &guard) {
                stack.stats.pushes.incr();
                trace!(id = self.id, "push");
                break;
            }

            if info.is_null() {
                info = ThreadInfo::alloc(self.id, Op::Push, node, &guard);
            }
            if stack.elimination.try_eliminate(info, &guard) {
                // The pop we collided with took over both `info` and `node`.
                stack.stats.eliminated_pushes.incr();
                trace!(id = self.id, "eliminated push");
                return;
            }
            stack.stats.failed_eliminations.incr();
        }

        if !info.is_null() {
            // SAFETY: the elimination attempts all ended with `info` retracted.
            unsafe { reclaim::retire(&guard, info) };
        }
    }

    /// Removes and returns the top element from the stack
    ///
    /// # Returns
    /// * `Some(T)` if a value was popped or received from a concurrent push
    /// * `None` if the stack was empty
    pub fn pop(&self) -> Option<T> {
        let stack = self.stack;
        let guard = reclaim::pin();
        let mut info = Shared::null();

        let popped = loop {
            if let Ok(popped) = stack.try_pop(&guard) {
                if popped.is_some() {
                    stack.stats.pops.incr();
                    trace!(id = self.id, "pop");
                } else {
                    stack.stats.empty_pops.incr();
                    trace!(id = self.id, "pop on empty stack");
                }
                break popped;
            }

            if info.is_null() {
                info = ThreadInfo::alloc(self.id, Op::Pop, Shared::null(), &guard);
            }
            if stack.elimination.try_eliminate(info, &guard) {
                // SAFETY: a successful elimination leaves the partner's node in
                // our cell; that node never reached `top` and we are its only
                // owner.
                let value = unsafe {
                    let node = info.deref().cell.load(Ordering::Acquire, &guard);
                    let value = reclaim::take(&node.deref().data);
                    reclaim::retire(&guard, node);
                    value
                };
                stack.stats.eliminated_pops.incr();
                trace!(id = self.id, "eliminated pop");
                break Some(value);
            }
            stack.stats.failed_eliminations.incr();
        };

        if !info.is_null() {
            // SAFETY: a pop's info is unpublished once the operation completes
            // and is never retired by anyone else.
            unsafe { reclaim::retire(&guard, info) };
        }
        popped
    }
}

impl<T: Send> fmt::Debug for StackHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackHandle").field("id", &self.id).finish()
    }
}

impl<T: Send> Drop for StackHandle<'_, T> {
    fn drop(&mut self) {
        self.stack.slots[self.id].store(false, Ordering::Release);
        debug!(id = self.id, "released stack thread");
    }
}
