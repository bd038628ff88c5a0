//! Lock-free SPMC (Single-Producer, Multi-Consumer) broadcast log
//!
//! One writer appends to a fixed ring of `N` slots; any number of readers
//! follow it, each with a private cursor. The writer never waits for
//! readers: once the ring is full it overwrites the oldest entry
//! (newest wins). A reader that falls a full lap behind detects it.
//!
//! # Two-phase publication
//!
//! Logical positions grow without bound; position `p` lives in slot
//! `p % N`. The writer keeps two counters:
//! - `reserved` is bumped *before* a slot is overwritten, announcing that
//!   the entry `N` positions back is about to be destroyed,
//! - `published` is bumped *after* the slot is written, making the new entry
//!   readable.
//!
//! A reader at cursor `c` may trust slot `c % N` only while
//! `reserved <= c + N`. Readers copy the slot first and recheck `reserved`
//! afterwards (seqlock style), so a torn copy is discarded rather than
//! returned.
//!
//! # Overflow policies
//!
//! - [`FailFast`]: `read` panics on overflow. For consumers that must halt
//!   rather than act on corrupted broadcast state.
//! - [`Checked`]: `read` reports nothing on overflow; the caller asks
//!   [`Reader::has_overflowed`] and recovers (e.g. [`Reader::resync`]).
//!
//! Author: Moroya Sakamoto

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::Overflow;

mod sealed {
    pub trait Sealed {}
}

/// What a reader does when `read` finds its cursor overrun
pub trait OverflowPolicy: sealed::Sealed {
    /// Called with the detected overflow before `read` returns `None`
    fn on_overflow(overflow: Overflow);
}

/// Overflow is fatal: `read` panics
#[derive(Debug, Clone, Copy)]
pub struct FailFast;

/// Overflow is reported through [`Reader::has_overflowed`]
#[derive(Debug, Clone, Copy)]
pub struct Checked;

impl sealed::Sealed for FailFast {}
impl sealed::Sealed for Checked {}

impl OverflowPolicy for FailFast {
    fn on_overflow(overflow: Overflow) {
        panic!("broadcast reader desynchronized: {overflow}");
    }
}

impl OverflowPolicy for Checked {
    #[inline]
    fn on_overflow(_overflow: Overflow) {}
}

/// Broadcast log retaining the newest `N` entries
pub struct SpmcLog<T, const N: usize> {
    /// Ring storage, slot `p % N` holds position `p`
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    /// Positions whose slot write has started
    reserved: CachePadded<AtomicUsize>,
    /// Positions whose slot write has finished
    published: CachePadded<AtomicUsize>,
}

// SAFETY: the single writer is enforced by `&mut self` / `Writer`. Readers
// only copy slots out and validate the copy against `reserved`.
unsafe impl<T: Send, const N: usize> Sync for SpmcLog<T, N> {}

impl<T: Copy, const N: usize> SpmcLog<T, N> {
    const VALID_CAPACITY: () = assert!(N > 0, "SPMC capacity must be > 0");

    /// Create an empty log
    pub const fn new() -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            reserved: CachePadded::new(AtomicUsize::new(0)),
            published: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Append an entry (single-context use)
    pub fn push(&mut self, item: T) {
        // SAFETY: `&mut self` excludes every other writer.
        unsafe { self.append(item) }
    }

    /// Split into the writer and a shared half to create readers from
    pub fn split(&mut self) -> (Writer<'_, T, N>, &Self) {
        let log: &Self = self;
        (Writer { log, _role: PhantomData }, log)
    }

    /// Writer for a log that cannot be borrowed mutably (a `static` written
    /// from an ISR)
    ///
    /// # Safety
    ///
    /// At most one writer may exist at any time, through this method or
    /// [`split`](Self::split).
    pub unsafe fn writer_unchecked(&self) -> Writer<'_, T, N> {
        Writer { log: self, _role: PhantomData }
    }

    /// Attach a reader
    ///
    /// `from_current == false` starts at position 0 and replays every entry
    /// still retained; `true` starts at the live tail and only sees entries
    /// published after this call.
    pub fn reader<P: OverflowPolicy>(&self, from_current: bool) -> Reader<'_, T, N, P> {
        let cursor = if from_current {
            self.published.load(Ordering::Acquire)
        } else {
            0
        };
        Reader {
            log: self,
            cursor,
            _policy: PhantomData,
        }
    }

    /// All-time number of published entries
    pub fn total_count(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// Number of retained entries
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Forget every entry and restart positions at zero
    pub fn clear(&mut self) {
        crate::trace_event!(debug, total = *self.published.get_mut(), "spmc log cleared");
        *self.reserved.get_mut() = 0;
        *self.published.get_mut() = 0;
    }

    /// # Safety
    ///
    /// Caller is the only writer.
    unsafe fn append(&self, item: T) {
        let pos = self.published.load(Ordering::Relaxed);
        let next = pos.wrapping_add(1);

        // Phase 1: announce the overwrite of position `pos - N`
        self.reserved.store(next, Ordering::Relaxed);
        fence(Ordering::Release);

        ptr::write_volatile(self.slots[pos % N].get(), MaybeUninit::new(item));

        // Phase 2: make position `pos` readable
        self.published.store(next, Ordering::Release);
    }
}

impl<T: Copy, const N: usize> Default for SpmcLog<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> fmt::Debug for SpmcLog<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpmcLog")
            .field("capacity", &N)
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

/// The single writer of an [`SpmcLog`]
pub struct Writer<'a, T, const N: usize> {
    log: &'a SpmcLog<T, N>,
    /// One context writes at a time
    _role: PhantomData<Cell<()>>,
}

impl<T: Copy, const N: usize> Writer<'_, T, N> {
    /// Append an entry, overwriting the oldest one once the ring is full
    ///
    /// Never fails, never blocks.
    pub fn push(&mut self, item: T) {
        // SAFETY: this handle is the only writer.
        unsafe { self.log.append(item) }
    }

    /// All-time number of published entries
    pub fn total_count(&self) -> usize {
        self.log.total_count()
    }
}

/// Independent cursor into an [`SpmcLog`]
///
/// Cloning a reader snapshots its position; the copies then advance
/// independently.
pub struct Reader<'a, T, const N: usize, P> {
    log: &'a SpmcLog<T, N>,
    /// Next logical position to read
    cursor: usize,
    _policy: PhantomData<P>,
}

impl<'a, T: Copy, const N: usize, P: OverflowPolicy> Reader<'a, T, N, P> {
    /// Read the next entry
    ///
    /// Returns None when nothing new has been published. On overflow the
    /// policy decides: [`FailFast`] panics, [`Checked`] returns None without
    /// moving the cursor and leaves `has_overflowed()` true.
    ///
    /// Under [`Checked`] the two `None`s look the same, so a
    /// `while let Some(x) = reader.read()` drain stops silently at an
    /// overflow. Check `has_overflowed()` after the loop, or drain with
    /// [`try_read`](Self::try_read), which reports overflow as `Err`.
    pub fn read(&mut self) -> Option<T> {
        match self.try_read() {
            Ok(item) => item,
            Err(overflow) => {
                P::on_overflow(overflow);
                None
            }
        }
    }

    /// Read the next entry, reporting overflow as an error
    ///
    /// The cursor does not move on error.
    pub fn try_read(&mut self) -> Result<Option<T>, Overflow> {
        let published = self.log.published.load(Ordering::Acquire);
        if self.cursor == published {
            return Ok(None);
        }
        self.check()?;

        // SAFETY: the slot was initialized by the publish we acquired above.
        // The writer may be overwriting it concurrently; the copy stays a
        // `MaybeUninit` until the `reserved` recheck proves it untouched.
        let copy = unsafe { ptr::read_volatile(self.log.slots[self.cursor % N].get()) };
        fence(Ordering::Acquire);
        self.check()?;

        self.cursor = self.cursor.wrapping_add(1);
        // SAFETY: no overwrite of this slot started before the copy finished.
        Ok(Some(unsafe { copy.assume_init() }))
    }

    /// Has the writer started overwriting the entry at the cursor?
    ///
    /// Necessary, not sufficient: it can only be observed after the fact.
    pub fn has_overflowed(&self) -> bool {
        self.check().is_err()
    }

    /// Jump to the oldest entry still safe to read
    ///
    /// Returns the number of entries skipped (0 if not overflowed).
    pub fn resync(&mut self) -> usize {
        let reserved = self.log.reserved.load(Ordering::Acquire);
        if reserved.wrapping_sub(self.cursor) <= N {
            return 0;
        }
        let oldest = reserved.wrapping_sub(N);
        let skipped = oldest.wrapping_sub(self.cursor);
        crate::trace_event!(warn, skipped, position = oldest, "broadcast reader resynced");
        self.cursor = oldest;
        skipped
    }

    /// Jump to the live tail, dropping everything unread
    ///
    /// Returns the number of entries skipped.
    pub fn skip_to_live(&mut self) -> usize {
        let published = self.log.published.load(Ordering::Acquire);
        let skipped = published.wrapping_sub(self.cursor);
        crate::trace_event!(debug, skipped, position = published, "broadcast reader skipped to live tail");
        self.cursor = published;
        skipped
    }

    /// Next logical position this reader will read
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Published entries not yet read (may exceed `N` after overflow)
    pub fn lag(&self) -> usize {
        self.log
            .published
            .load(Ordering::Acquire)
            .wrapping_sub(self.cursor)
    }

    fn check(&self) -> Result<(), Overflow> {
        let ahead = self
            .log
            .reserved
            .load(Ordering::Relaxed)
            .wrapping_sub(self.cursor);
        if ahead > N {
            Err(Overflow { lost: ahead - N })
        } else {
            Ok(())
        }
    }
}

impl<T, const N: usize, P> Clone for Reader<'_, T, N, P> {
    fn clone(&self) -> Self {
        Self {
            log: self.log,
            cursor: self.cursor,
            _policy: PhantomData,
        }
    }
}

impl<T, const N: usize, P> fmt::Debug for Reader<'_, T, N, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("position", &self.cursor)
            .field("policy", &core::any::type_name::<P>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Message {
        value: usize,
    }

    #[test]
    fn test_capacity_four_scenario() {
        let mut log = SpmcLog::<Message, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for value in 0..4 {
            writer.push(Message { value });
        }
        for value in 0..4 {
            assert_eq!(reader.read(), Some(Message { value }));
        }
        assert_eq!(reader.read(), None);

        // One unread entry after catching up is far from a full lap
        writer.push(Message { value: 4 });
        assert!(!reader.has_overflowed());
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn test_overflow_boundary() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..4 {
            writer.push(v);
        }
        for v in 0..4 {
            assert_eq!(reader.read(), Some(v));
        }
        assert_eq!(reader.read(), None);

        // Exactly N unread entries: nothing overwritten yet
        for v in 4..8 {
            writer.push(v);
        }
        assert!(!reader.has_overflowed());

        // N + 1: position 4 has been overwritten
        writer.push(8);
        assert!(reader.has_overflowed());
    }

    #[test]
    fn test_one_push_after_catching_up_is_not_overflow() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);
        for v in 0..4 {
            writer.push(v);
            assert_eq!(reader.read(), Some(v));
        }
        writer.push(4);
        assert!(!reader.has_overflowed());
        assert_eq!(reader.read(), Some(4));
    }

    #[test]
    fn test_overflow_after_n_plus_one_pushes() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..4 {
            writer.push(v);
        }
        for _ in 0..4 {
            reader.read();
        }

        let mut snapshot = reader.clone();
        assert_eq!(snapshot.read(), None);

        for v in 0..5 {
            writer.push(v);
        }
        assert!(reader.has_overflowed());
        assert!(snapshot.has_overflowed());
    }

    #[test]
    fn test_checked_read_does_not_advance_on_overflow() {
        let mut log = SpmcLog::<u32, 2>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..3 {
            writer.push(v);
        }
        assert_eq!(reader.read(), None);
        assert_eq!(reader.position(), 0);
        assert!(reader.has_overflowed());
        assert_eq!(reader.try_read(), Err(Overflow { lost: 1 }));
    }

    #[test]
    fn test_checked_drain_loop_stops_at_overflow() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..6 {
            writer.push(v);
        }
        let mut drained = 0;
        while reader.read().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 0);
        assert!(reader.has_overflowed());
        assert_eq!(reader.lag(), 6);

        // try_read tells overflow apart from an empty log
        assert_eq!(reader.try_read(), Err(Overflow { lost: 2 }));
        assert_eq!(reader.resync(), 2);
        let mut seen = [0u32; 4];
        let mut n = 0;
        while let Ok(Some(v)) = reader.try_read() {
            seen[n] = v;
            n += 1;
        }
        assert_eq!(seen[..n], [2, 3, 4, 5]);
        assert_eq!(reader.try_read(), Ok(None));
    }

    #[test]
    fn test_resync_lands_on_oldest_retained() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..10 {
            writer.push(v);
        }
        assert!(reader.has_overflowed());
        assert_eq!(reader.resync(), 6);
        assert!(!reader.has_overflowed());
        for v in 6..10 {
            assert_eq!(reader.read(), Some(v));
        }
        assert_eq!(reader.read(), None);
        assert_eq!(reader.resync(), 0);
    }

    #[test]
    fn test_skip_to_live() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<Checked>(false);

        for v in 0..3 {
            writer.push(v);
        }
        assert_eq!(reader.lag(), 3);
        assert_eq!(reader.skip_to_live(), 3);
        assert_eq!(reader.lag(), 0);
        writer.push(3);
        assert_eq!(reader.read(), Some(3));
    }

    #[test]
    fn test_from_current_sees_only_new_entries() {
        let mut log = SpmcLog::<u32, 4>::new();
        let (mut writer, shared) = log.split();
        writer.push(1);
        writer.push(2);

        let mut replay = shared.reader::<FailFast>(false);
        let mut live = shared.reader::<FailFast>(true);
        assert_eq!(live.read(), None);

        writer.push(3);
        assert_eq!(live.read(), Some(3));
        assert_eq!(live.read(), None);

        assert_eq!(replay.read(), Some(1));
        assert_eq!(replay.read(), Some(2));
        assert_eq!(replay.read(), Some(3));
        assert_eq!(writer.total_count(), 3);
    }

    #[test]
    fn test_readers_are_independent() {
        let mut log = SpmcLog::<u32, 8>::new();
        let (mut writer, shared) = log.split();
        let mut fast = shared.reader::<Checked>(false);
        let mut slow = shared.reader::<Checked>(false);

        for v in 0..6 {
            writer.push(v);
            assert_eq!(fast.read(), Some(v));
        }
        assert_eq!(slow.read(), Some(0));
        assert_eq!(slow.read(), Some(1));
        assert_eq!(fast.lag(), 0);
        assert_eq!(slow.lag(), 4);
    }

    #[test]
    #[should_panic(expected = "broadcast reader desynchronized")]
    fn test_fail_fast_panics_on_overflow() {
        let mut log = SpmcLog::<u32, 2>::new();
        let (mut writer, shared) = log.split();
        let mut reader = shared.reader::<FailFast>(false);
        for v in 0..3 {
            writer.push(v);
        }
        let _ = reader.read();
    }

    #[test]
    fn test_clear() {
        let mut log = SpmcLog::<u32, 2>::new();
        log.push(1);
        log.push(2);
        log.push(3);
        log.clear();
        assert_eq!(log.total_count(), 0);
        let mut reader = log.reader::<Checked>(false);
        assert_eq!(reader.read(), None);
        assert!(!reader.has_overflowed());
    }

    #[test]
    fn test_static_log() {
        static LOG: SpmcLog<u64, 4> = SpmcLog::new();

        // SAFETY: this test is the only writer of LOG.
        let mut writer = unsafe { LOG.writer_unchecked() };
        let mut reader = LOG.reader::<Checked>(true);
        writer.push(11);
        assert_eq!(reader.read(), Some(11));
    }
}
