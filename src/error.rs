//! Error types
//!
//! Full/empty/nothing-new are steady-state conditions and are reported as
//! `bool` / `Option`. Only conditions a caller must act on get an error type.
//!
//! Author: Moroya Sakamoto

use crate::clock::Ticks;

/// A broadcast reader fell more than one full lap behind the writer.
///
/// The entry at the reader's cursor has been (or is being) overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reader overflowed: {lost} entries overwritten before they were read")]
pub struct Overflow {
    /// Entries overwritten between the cursor and the oldest safe position
    pub lost: usize,
}

/// A bounded poll ran out of time before the operation produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {waited} ticks")]
pub struct TimedOut {
    /// Ticks elapsed between the first attempt and giving up
    pub waited: Ticks,
}
