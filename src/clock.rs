//! Tick clock and bounded polling
//!
//! The lock-free containers never wait. Task-side callers that want to wait
//! for data with a timeout poll them against a monotonic tick source. On
//! real hardware the source wraps SysTick (Cortex-M) or MTIME (RISC-V); for
//! tests there is a software counter.
//!
//! Never poll from an ISR.
//!
//! Author: Moroya Sakamoto

#[cfg(target_has_atomic = "64")]
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::TimedOut;

/// Ticks since an arbitrary epoch
pub type Ticks = u64;

/// Infinite timeout
pub const MAX_TICKS: Ticks = Ticks::MAX;

/// Monotonic tick source
pub trait TickClock {
    /// Current tick count
    fn now(&self) -> Ticks;
}

impl<C: TickClock + ?Sized> TickClock for &C {
    fn now(&self) -> Ticks {
        (**self).now()
    }
}

/// Software tick counter
///
/// Advanced explicitly, from any context.
#[cfg(target_has_atomic = "64")]
#[derive(Debug, Default)]
pub struct SoftwareClock {
    ticks: AtomicU64,
}

#[cfg(target_has_atomic = "64")]
impl SoftwareClock {
    /// Create a clock at tick 0
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advance time by `ticks`
    pub fn advance(&self, ticks: Ticks) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Reset to tick 0
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
    }
}

#[cfg(target_has_atomic = "64")]
impl TickClock for SoftwareClock {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Host clock, one tick per microsecond since construction
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    epoch: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Start counting from now
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl TickClock for StdClock {
    fn now(&self) -> Ticks {
        Ticks::try_from(self.epoch.elapsed().as_micros()).unwrap_or(MAX_TICKS)
    }
}

/// Deadline relative to an activation time
///
/// Expiry is measured as ticks elapsed since `start`, so a deadline that
/// straddles the top of the tick range still expires once the clock wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Activation time
    start: Ticks,
    /// Allowed ticks after `start`, `None` = never expires
    timeout: Option<Ticks>,
}

impl Deadline {
    /// Deadline `timeout` ticks after `start`
    ///
    /// A `timeout` of [`MAX_TICKS`] never expires.
    pub const fn new(start: Ticks, timeout: Ticks) -> Self {
        let timeout = if timeout == MAX_TICKS {
            None
        } else {
            Some(timeout)
        };
        Self { start, timeout }
    }

    /// Deadline `timeout` ticks from the clock's current time
    pub fn after(clock: &impl TickClock, timeout: Ticks) -> Self {
        Self::new(clock.now(), timeout)
    }

    /// Has the deadline passed?
    pub fn is_expired(&self, current: Ticks) -> bool {
        match self.timeout {
            Some(timeout) => self.elapsed(current) > timeout,
            None => false,
        }
    }

    /// Remaining time until deadline (0 if missed, [`MAX_TICKS`] if never)
    pub fn remaining(&self, current: Ticks) -> Ticks {
        match self.timeout {
            Some(timeout) => timeout.saturating_sub(self.elapsed(current)),
            None => MAX_TICKS,
        }
    }

    /// Elapsed since start
    pub fn elapsed(&self, current: Ticks) -> Ticks {
        current.wrapping_sub(self.start)
    }
}

/// Retry a non-blocking operation until it yields a value or `timeout`
/// ticks pass
///
/// `op` is tried at least once. Use it to wait on `Consumer::pop` or
/// `Reader::read` from task context:
///
/// ```
/// use alice_lockfree::{poll, SoftwareClock, SpscQueue};
///
/// let mut queue = SpscQueue::<u32, 4>::new();
/// let (mut tx, mut rx) = queue.split();
/// let clock = SoftwareClock::new();
///
/// tx.push(9);
/// assert_eq!(poll(&clock, 100, || rx.pop()), Ok(9));
/// ```
pub fn poll<T>(
    clock: &impl TickClock,
    timeout: Ticks,
    mut op: impl FnMut() -> Option<T>,
) -> Result<T, TimedOut> {
    let deadline = Deadline::after(clock, timeout);
    loop {
        if let Some(value) = op() {
            return Ok(value);
        }
        let now = clock.now();
        if deadline.is_expired(now) {
            let waited = deadline.elapsed(now);
            crate::trace_event!(debug, waited, timeout, "poll timed out");
            return Err(TimedOut { waited });
        }
        core::hint::spin_loop();
    }
}
