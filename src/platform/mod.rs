//! Platform interfaces consumed by the core.
//!
//! The core performs no blocking I/O and owns no OS resources. It
//! consumes exactly two platform services through narrow traits:
//!
//! - a [`Scheduler`] for timer callbacks (retransmit deadlines,
//!   ack-delay windows, ICD mode timers), and
//! - a [`StateStore`] for the two values that survive a power cycle
//!   (Check-In counter, ICD configuration).
//!
//! [`TimerQueue`] and [`MemoryStore`] are the in-crate
//! implementations; [`driver`] adapts the timer queue to tokio time
//! for async deployments.

mod scheduler;
mod storage;

pub mod driver;

pub use scheduler::{Scheduler, TimerEvent, TimerHandle, TimerQueue};
pub use storage::{MemoryStore, StateStore};
