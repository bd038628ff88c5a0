//! Lock-free SPSC (Single-Producer, Single-Consumer) ring queue
//!
//! No heap, no mutex, no CAS. Wait-free on both sides: every operation is
//! a bounded number of loads and stores on two atomic cursors.
//!
//! The buffer holds `N + 1` slots. One slot is always held back from the
//! producer so that `head == tail` means empty and `tail + 1 == head` means
//! full, without a shared counter.
//!
//! # Ordering
//!
//! ```text
//! producer writes slot, Release-stores tail  ->  consumer Acquire-loads tail, reads slot
//! consumer reads slot, Release-stores head   ->  producer Acquire-loads head, reuses slot
//! ```
//!
//! Author: Moroya Sakamoto

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// `N` ring slots followed by the sentinel slot, laid out as `[T; N + 1]`
#[repr(C)]
struct Slots<T, const N: usize> {
    ring: [MaybeUninit<T>; N],
    sentinel: MaybeUninit<T>,
}

/// Lock-free SPSC ring queue holding up to `N` items
///
/// Fixed-size, no-alloc, interrupt-safe. Producer and consumer can run on
/// different cores or priorities without locking, as long as there is
/// exactly one of each.
pub struct SpscQueue<T, const N: usize> {
    /// Slot storage
    buffer: UnsafeCell<Slots<T, N>>,
    /// Read cursor (owned by consumer)
    head: CachePadded<AtomicUsize>,
    /// Write cursor (owned by producer)
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: the producer only writes slots outside [head, tail), the consumer
// only reads slots inside it; the cursors hand slots over with
// Release/Acquire.
unsafe impl<T: Send, const N: usize> Sync for SpscQueue<T, N> {}

impl<T: Copy, const N: usize> SpscQueue<T, N> {
    /// Slots in the buffer, including the sentinel
    const BUFFER_SIZE: usize = {
        assert!(N > 0, "SPSC capacity must be > 0");
        N + 1
    };

    /// Create a new empty queue
    pub const fn new() -> Self {
        let _ = Self::BUFFER_SIZE;
        Self {
            buffer: UnsafeCell::new(Slots {
                ring: [const { MaybeUninit::uninit() }; N],
                sentinel: MaybeUninit::uninit(),
            }),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Push an item (single-context use)
    ///
    /// Returns false if the queue is full.
    pub fn push(&mut self, item: T) -> bool {
        // SAFETY: `&mut self` excludes every other producer.
        unsafe { self.enqueue_with(|| item) }
    }

    /// Pop the oldest item (single-context use)
    ///
    /// Returns None if the queue is empty.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` excludes every other consumer.
        unsafe { self.dequeue() }
    }

    /// Split into the producer and consumer halves
    ///
    /// The halves are not `Clone`, so the single-producer/single-consumer
    /// discipline is enforced by the borrow checker.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let queue: &Self = self;
        (
            Producer { queue, _role: PhantomData },
            Consumer { queue, _role: PhantomData },
        )
    }

    /// Producer half of a queue that cannot be borrowed mutably (a `static`
    /// shared with an ISR)
    ///
    /// # Safety
    ///
    /// At most one producer context may use the queue at any time, through
    /// this method or [`split`](Self::split).
    pub unsafe fn producer_unchecked(&self) -> Producer<'_, T, N> {
        Producer { queue: self, _role: PhantomData }
    }

    /// Consumer half of a queue that cannot be borrowed mutably
    ///
    /// # Safety
    ///
    /// At most one consumer context may use the queue at any time.
    pub unsafe fn consumer_unchecked(&self) -> Consumer<'_, T, N> {
        Consumer { queue: self, _role: PhantomData }
    }

    /// Number of items in the queue (snapshot)
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            Self::BUFFER_SIZE - head + tail
        }
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    /// Is the queue full?
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        Self::advance(tail) == self.head.load(Ordering::Acquire)
    }

    /// Maximum number of queued items
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Drop every queued item
    pub fn clear(&mut self) {
        crate::trace_event!(debug, discarded = self.len(), "spsc queue cleared");
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
    }

    /// Write an item into the slot at `tail` and publish it
    ///
    /// `make` only runs when a slot is free.
    ///
    /// # Safety
    ///
    /// Caller is the only producer.
    unsafe fn enqueue_with(&self, make: impl FnOnce() -> T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next_tail = Self::advance(tail);

        if next_tail == self.head.load(Ordering::Acquire) {
            return false; // Full
        }

        self.slot(tail).write(make());
        self.tail.store(next_tail, Ordering::Release);
        true
    }

    /// Copy the item at `head` out and release its slot
    ///
    /// # Safety
    ///
    /// Caller is the only consumer.
    unsafe fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None; // Empty
        }

        let item = self.slot(head).read();
        self.head.store(Self::advance(head), Ordering::Release);
        Some(item)
    }

    /// Copy the item at `head` out without releasing it
    ///
    /// # Safety
    ///
    /// Caller is the only consumer.
    unsafe fn front(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        Some(self.slot(head).read())
    }

    /// Pointer to slot `idx`
    ///
    /// # Safety
    ///
    /// `idx < BUFFER_SIZE`. `Slots` is `repr(C)` with `N` elements followed by
    /// one more of the same type, so the whole struct is a `[T; N + 1]`.
    unsafe fn slot(&self, idx: usize) -> *mut T {
        debug_assert!(idx < Self::BUFFER_SIZE);
        self.buffer.get().cast::<T>().add(idx)
    }

    #[inline]
    fn advance(idx: usize) -> usize {
        let next = idx + 1;
        if next == Self::BUFFER_SIZE {
            0
        } else {
            next
        }
    }
}

impl<T: Copy, const N: usize> Default for SpscQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> fmt::Debug for SpscQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &N)
            .field("len", &self.len())
            .finish()
    }
}

/// Producer half of an [`SpscQueue`]
pub struct Producer<'a, T, const N: usize> {
    queue: &'a SpscQueue<T, N>,
    /// Keeps the handle `!Sync`: one context pushes at a time.
    _role: PhantomData<core::cell::Cell<()>>,
}

impl<T: Copy, const N: usize> Producer<'_, T, N> {
    /// Push an item
    ///
    /// Returns false if the queue is full; the queue is left untouched.
    pub fn push(&mut self, item: T) -> bool {
        // SAFETY: this handle is the only producer.
        unsafe { self.queue.enqueue_with(|| item) }
    }

    /// Construct an item in place, only if there is room for it
    pub fn push_with(&mut self, make: impl FnOnce() -> T) -> bool {
        // SAFETY: this handle is the only producer.
        unsafe { self.queue.enqueue_with(make) }
    }

    /// Is the queue full?
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Free slots (snapshot; may only grow until the next push)
    pub fn free_slots(&self) -> usize {
        N - self.queue.len()
    }
}

/// Consumer half of an [`SpscQueue`]
pub struct Consumer<'a, T, const N: usize> {
    queue: &'a SpscQueue<T, N>,
    /// Keeps the handle `!Sync`: one context pops at a time.
    _role: PhantomData<core::cell::Cell<()>>,
}

impl<T: Copy, const N: usize> Consumer<'_, T, N> {
    /// Pop the oldest item
    ///
    /// Returns None if the queue is empty.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: this handle is the only consumer.
        unsafe { self.queue.dequeue() }
    }

    /// Copy the oldest item without removing it
    pub fn peek(&self) -> Option<T> {
        // SAFETY: this handle is the only consumer; the head slot cannot be
        // reused by the producer until this handle advances `head`.
        unsafe { self.queue.front() }
    }

    /// Number of items waiting (snapshot; may only grow until the next pop)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
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
    fn test_push_pop() {
        let mut queue = SpscQueue::<u32, 8>::new();
        assert!(queue.is_empty());

        queue.push(42);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());

        let val = queue.pop();
        assert_eq!(val, Some(42));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_four_scenario() {
        let mut queue = SpscQueue::<Message, 4>::new();
        for value in 0..4 {
            assert!(queue.push(Message { value }));
        }
        assert!(queue.is_full());
        assert!(!queue.push(Message { value: 4 }));
        assert_eq!(queue.len(), 4);

        for value in 0..4 {
            assert_eq!(queue.pop(), Some(Message { value }));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_wraparound() {
        let mut queue = SpscQueue::<u32, 3>::new();
        // Fill and drain several times to cross the sentinel slot
        for round in 0..5 {
            for i in 0..3 {
                assert!(queue.push(round * 10 + i));
            }
            assert!(!queue.push(99));
            for i in 0..3 {
                assert_eq!(queue.pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn test_len_across_wrap() {
        let mut queue = SpscQueue::<u8, 2>::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(3)); // tail wraps to 0
        assert_eq!(queue.len(), 2);
        assert!(queue.is_full());
    }

    #[test]
    fn test_capacity() {
        let queue = SpscQueue::<u64, 16>::new();
        assert_eq!(queue.capacity(), 16);
    }

    #[test]
    fn test_clear() {
        let mut queue = SpscQueue::<u32, 8>::new();
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_split_halves() {
        let mut queue = SpscQueue::<u32, 2>::new();
        let (mut tx, mut rx) = queue.split();

        assert!(rx.is_empty());
        assert_eq!(rx.peek(), None);
        assert!(tx.push(7));
        assert_eq!(tx.free_slots(), 1);
        assert_eq!(rx.peek(), Some(7));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.pop(), Some(7));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_push_with_skips_constructor_when_full() {
        let mut queue = SpscQueue::<u32, 1>::new();
        let (mut tx, _rx) = queue.split();

        let mut built = 0;
        assert!(tx.push_with(|| {
            built += 1;
            5
        }));
        assert!(!tx.push_with(|| {
            built += 1;
            6
        }));
        assert_eq!(built, 1);
        assert!(tx.is_full());
    }

    #[test]
    fn test_static_queue() {
        static QUEUE: SpscQueue<u16, 4> = SpscQueue::new();

        // SAFETY: this test is the only producer and consumer of QUEUE.
        let (mut tx, mut rx) = unsafe { (QUEUE.producer_unchecked(), QUEUE.consumer_unchecked()) };
        assert!(tx.push(3));
        assert_eq!(rx.pop(), Some(3));
    }
}
