//! Lock-free concurrent containers.
//!
//! * [`EliminationBackoffStack`]: a Treiber stack with an elimination-backoff
//!   layer that lets a concurrent push and pop exchange a value without
//!   touching the shared top pointer.
//! * [`MichaelScottQueue`]: the classic two-pointer queue with a sentinel
//!   node.
//!
//! Neither structure ever takes a lock. Unlinked nodes are reclaimed through
//! epoch-based reclamation, so a thread that stalls holding a stale pointer
//! never reads freed memory.

mod config;
pub mod queue;
mod reclaim;
pub mod stack;
mod stats;

pub use config::{ConfigError, StackConfig, DEFAULT_SPIN_DELAY, MAX_SPIN_DELAY};
pub use queue::{MichaelScottQueue, QueueStats};
pub use stack::{EliminationBackoffStack, StackError, StackHandle, StackStats};
