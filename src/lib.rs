//! ALICE-Lockfree — allocation-free lock-free primitives
//!
//! Building blocks for ISRs and hard real-time tasks where mutexes,
//! semaphores and heap allocation are off the table:
//! - Fixed-capacity block allocator over a static arena (lock-free free list)
//! - Wait-free SPSC ring queue (one producer, one consumer)
//! - SPMC broadcast log with per-reader overflow detection
//! - Tick clock and bounded polling for task-side callers
//!
//! Nothing here blocks, sleeps or allocates. Every container is `const`
//! constructible, so it can live in a `static` shared with an interrupt
//! handler.
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(any(test, feature = "std")), no_std)]

/// Emit a `tracing` event when the `tracing` feature is enabled.
///
/// Only used on cold paths (reset, clear, resync, timeouts), never on the
/// push/pop/read hot paths.
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        tracing::$level!($($arg)+);
    };
}
pub(crate) use trace_event;

pub mod block_alloc;
pub mod spsc;
pub mod spmc;
pub mod clock;
pub mod error;

pub use block_alloc::{Block, BlockAllocator, UninitBlock};
pub use spsc::{Consumer, Producer, SpscQueue};
pub use spmc::{Checked, FailFast, OverflowPolicy, Reader, SpmcLog, Writer};
pub use clock::{poll, Deadline, TickClock, Ticks, MAX_TICKS};
#[cfg(target_has_atomic = "64")]
pub use clock::SoftwareClock;
#[cfg(feature = "std")]
pub use clock::StdClock;
pub use error::{Overflow, TimedOut};
