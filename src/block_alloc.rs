//! Lock-free fixed-capacity block allocator
//!
//! Hands out fixed-size blocks from one preallocated arena. No heap, no
//! mutex, no critical sections. Free blocks are threaded into an index-based
//! free list that lives beside the arena, so payload bytes are never
//! reinterpreted as links.
//!
//! # Progress
//!
//! `alloc` and `dealloc` are lock-free CAS retry loops: the system as a whole
//! always makes progress, a single caller may retry under contention.
//!
//! # ABA hazard
//!
//! The free-list head is an untagged index. If an `alloc` is preempted after
//! reading `head` and `next[head]`, and meanwhile another context pops that
//! block, pops its successor and pushes the first block back, the delayed CAS
//! succeeds with a stale successor and two callers end up owning one block.
//! Safe caller sets are:
//! - a single allocating context with any number of deallocating contexts
//!   (an ISR that allocates, tasks that free), or
//! - callers that cannot preempt each other in the middle of `alloc`.
//!
//! Many independent allocating threads on a multi-core host are not covered.
//!
//! Author: Moroya Sakamoto

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Free-list terminator
const NIL: usize = usize::MAX;

/// Lock-free block allocator over a static arena of `N` slots of `T`
///
/// Blocks are returned as owning handles ([`Block`], [`UninitBlock`]) that
/// borrow the allocator, so a block can neither outlive its arena nor be
/// freed twice. Dropping a handle frees the block.
pub struct BlockAllocator<T, const N: usize> {
    /// Block storage
    arena: [UnsafeCell<MaybeUninit<T>>; N],
    /// Free-list links, `next[i]` is the successor of free block `i`
    next: [AtomicUsize; N],
    /// First free block, or `NIL`
    head: CachePadded<AtomicUsize>,
    /// Allocated block count (introspection only)
    allocated: AtomicUsize,
}

// SAFETY: a block's payload is only reachable through the single handle that
// popped it off the free list. The free list itself is only touched through
// atomics.
unsafe impl<T: Send, const N: usize> Sync for BlockAllocator<T, N> {}
unsafe impl<T: Send, const N: usize> Send for BlockAllocator<T, N> {}

impl<T: Copy, const N: usize> BlockAllocator<T, N> {
    const VALID_CAPACITY: () = assert!(
        N > 0 && N < NIL,
        "block allocator capacity must be non-zero and leave room for the NIL index"
    );

    /// Create an allocator with every block free, linked in slot order
    pub const fn new() -> Self {
        let () = Self::VALID_CAPACITY;

        let mut next = [const { AtomicUsize::new(NIL) }; N];
        let mut i = 0;
        while i + 1 < N {
            next[i] = AtomicUsize::new(i + 1);
            i += 1;
        }

        Self {
            arena: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            next,
            head: CachePadded::new(AtomicUsize::new(0)),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate a block
    ///
    /// The block's contents are uninitialized. Returns `None` when every
    /// block is in use.
    pub fn alloc(&self) -> Option<UninitBlock<'_, T, N>> {
        self.pop().map(|index| UninitBlock {
            pool: self,
            index,
            _owns: PhantomData,
        })
    }

    /// Allocate a block and move `item` into it
    ///
    /// Gives `item` back when the allocator is exhausted.
    pub fn alloc_with(&self, item: T) -> Result<Block<'_, T, N>, T> {
        match self.alloc() {
            Some(block) => Ok(block.write(item)),
            None => Err(item),
        }
    }

    /// Return a block to the free list
    ///
    /// Equivalent to dropping the handle.
    pub fn dealloc(&self, block: Block<'_, T, N>) {
        debug_assert!(
            core::ptr::eq(block.pool, self),
            "block returned to an allocator it was not taken from"
        );
        drop(block);
    }

    /// Rebuild the free list in slot order
    ///
    /// Outstanding handles borrow the allocator, so `&mut self` proves none
    /// exist. Blocks leaked through [`Block::into_index`] are reclaimed too;
    /// their indices must not be passed to [`from_index`](Self::from_index)
    /// afterwards.
    pub fn reset(&mut self) {
        for (i, link) in self.next.iter_mut().enumerate() {
            *link.get_mut() = if i + 1 < N { i + 1 } else { NIL };
        }
        *self.head.get_mut() = 0;
        crate::trace_event!(debug, capacity = N, leaked = *self.allocated.get_mut(), "block allocator reset");
        *self.allocated.get_mut() = 0;
    }

    /// Reclaim a block previously released with [`Block::into_index`]
    ///
    /// # Safety
    ///
    /// `index` must come from `into_index` on a block of this allocator, and
    /// each such index may be reclaimed at most once (and not after a
    /// [`reset`](Self::reset)).
    pub unsafe fn from_index(&self, index: usize) -> Block<'_, T, N> {
        debug_assert!(index < N, "block index out of range");
        Block {
            pool: self,
            index,
            _owns: PhantomData,
        }
    }

    /// Number of allocated blocks
    ///
    /// Eventually consistent; never used for allocation decisions.
    pub fn allocation_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of free blocks
    pub fn free_count(&self) -> usize {
        N.saturating_sub(self.allocation_count())
    }

    /// Total number of blocks
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Pop the free-list head
    fn pop(&self) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        while head != NIL {
            let next = self.next[head].load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    return Some(head);
                }
                Err(actual) => head = actual,
            }
        }
        None
    }

    /// Push a block back onto the free list
    fn push(&self, index: usize) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            self.next[index].store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.arena[index].get()
    }
}

impl<T: Copy, const N: usize> Default for BlockAllocator<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for BlockAllocator<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("capacity", &N)
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Freshly allocated block whose contents are not initialized yet
pub struct UninitBlock<'a, T: Copy, const N: usize> {
    pool: &'a BlockAllocator<T, N>,
    index: usize,
    _owns: PhantomData<&'a mut T>,
}

impl<'a, T: Copy, const N: usize> UninitBlock<'a, T, N> {
    /// Initialize the block
    pub fn write(self, item: T) -> Block<'a, T, N> {
        // SAFETY: this handle is the block's only owner.
        unsafe { (*self.pool.slot(self.index)).write(item) };
        let block = Block {
            pool: self.pool,
            index: self.index,
            _owns: PhantomData,
        };
        mem::forget(self);
        block
    }

    /// Raw pointer to the block's storage
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.pool.slot(self.index).cast()
    }

    /// Arena slot index
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T: Copy, const N: usize> Drop for UninitBlock<'_, T, N> {
    fn drop(&mut self) {
        self.pool.push(self.index);
    }
}

/// Owning handle to an initialized block
///
/// Dereferences to the stored item. Dropping the handle frees the block.
pub struct Block<'a, T: Copy, const N: usize> {
    pool: &'a BlockAllocator<T, N>,
    index: usize,
    _owns: PhantomData<&'a mut T>,
}

impl<T: Copy, const N: usize> Block<'_, T, N> {
    /// Arena slot index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the stored item
    pub fn as_ptr(&self) -> *const T {
        self.pool.slot(self.index).cast_const().cast()
    }

    /// Give up the handle without freeing the block
    ///
    /// The index can cross contexts that cannot carry a borrow (an ISR
    /// handing a block to a task through an `SpscQueue<usize, _>`) and is
    /// turned back into a handle with [`BlockAllocator::from_index`].
    pub fn into_index(self) -> usize {
        let index = self.index;
        mem::forget(self);
        index
    }
}

impl<T: Copy, const N: usize> Deref for Block<'_, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized by `UninitBlock::write`, owned by this handle.
        unsafe { (*self.pool.slot(self.index)).assume_init_ref() }
    }
}

impl<T: Copy, const N: usize> DerefMut for Block<'_, T, N> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: initialized by `UninitBlock::write`, owned by this handle.
        unsafe { (*self.pool.slot(self.index)).assume_init_mut() }
    }
}

impl<T: Copy + fmt::Debug, const N: usize> fmt::Debug for Block<'_, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("item", &**self)
            .finish()
    }
}

impl<T: Copy, const N: usize> Drop for Block<'_, T, N> {
    fn drop(&mut self) {
        self.pool.push(self.index);
    }
}
