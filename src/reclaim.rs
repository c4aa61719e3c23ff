//! Epoch-based memory reclamation shared by the stack and the queue.
//!
//! Every dereference of a shared link (`top`, `head`, `tail`, `next`, an
//! elimination slot) happens under a [`Guard`] obtained from [`pin`]. A node
//! that has been unlinked is handed to [`retire`], which defers freeing it
//! until every guard that was live at the time of the call has been dropped.
//! A stale reader therefore never touches freed memory, and a retired address
//! cannot be reallocated and CAS'd back in while such a reader exists (ABA).

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

/// A heap node that is part of a singly linked chain.
pub(crate) trait Link: Sized {
    fn next(&self) -> &Atomic<Self>;
}

/// Pins the current thread to the global epoch.
#[inline]
pub(crate) fn pin() -> Guard {
    epoch::pin()
}

/// Schedules `node` for destruction once no pinned thread can observe it.
///
/// # Safety
///
/// `node` must be non-null, already unreachable from every shared location,
/// and retired at most once. Its payload must either have been moved out or
/// be owned by the node's destructor.
#[inline]
pub(crate) unsafe fn retire<T>(guard: &Guard, node: Shared<'_, T>) {
    debug_assert!(!node.is_null());
    guard.defer_destroy(node);
}

/// Moves a payload out of a node that will later be retired.
///
/// # Safety
///
/// The caller must be the single thread that won ownership of this payload
/// (the CAS that unlinked its node), and must take it exactly once.
#[inline]
pub(crate) unsafe fn take<T>(slot: &ManuallyDrop<T>) -> T {
    ptr::read(&**slot)
}

/// Frees every node reachable from `head`, calling `release` on each one
/// first so it can drop whatever payload it still owns.
///
/// # Safety
///
/// The caller must have exclusive access to the whole chain (typically from a
/// `Drop` impl holding `&mut self`), and every node in it must have been
/// allocated through `Owned`.
pub(crate) unsafe fn free_chain<N: Link>(head: &Atomic<N>, mut release: impl FnMut(&mut N)) {
    let guard = epoch::unprotected();
    let mut current = head.load(Ordering::Relaxed, guard);
    while !current.is_null() {
        let mut owned = current.into_owned();
        current = owned.next().load(Ordering::Relaxed, guard);
        release(&mut *owned);
    }
}

/// Nudges the collector into running pending destructors.
///
/// Reclamation happens on its own as threads pin and unpin; this only speeds
/// it up after a burst of removals.
pub(crate) fn collect() {
    let mut guard = epoch::pin();
    guard.flush();
    guard.repin();
    guard.flush();
}
