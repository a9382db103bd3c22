//! Fixed-block-size pool allocators.
//!
//! Three variants of the same allocator, differing only in how they protect
//! the free list: none (`BlockPool`), a mutex (`LockedBlockPool`), and a
//! tagged-index compare-and-swap (`LockFreeBlockPool`).
//!
//! All variants reject requests larger than their block size by returning
//! null, treat freeing null as a no-op, and count the number of blocks ever
//! carved from their backing storage so callers can observe whether freed
//! blocks are being reused.

use crate::sync::{Ordering, AtomicU32, AtomicU64, Mutex};

use crossbeam_utils::{Backoff, CachePadded};

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::mem;
use std::ptr;

/// Alignment of every block handed out by the pools. Large enough for any
/// type the job system stores in them.
pub const BLOCK_ALIGN: usize = 16;

/// The capability surface shared by the three pool variants.
pub trait BlockAlloc {
    /// Returns a block of at least `size` bytes, or null if `size` exceeds
    /// the pool's block size or the backing storage is exhausted.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Returns a block to the free list. Freeing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this same pool and must not
    /// be used after this call.
    unsafe fn free(&self, ptr: *mut u8);

    fn block_size(&self) -> usize;

    /// Number of blocks ever carved from the backing storage. Stops growing
    /// once the working set is served entirely from the free list.
    fn alloc_count(&self) -> u32;

    /// Allocate a block and construct `value` in it. Returns null (and drops
    /// `value`) if the allocation is rejected.
    ///
    /// # Safety
    ///
    /// The returned object must be destroyed with `destroy` on this pool.
    unsafe fn create<T>(&self, value: T) -> *mut T {
        debug_assert!(mem::align_of::<T>() <= BLOCK_ALIGN);

        let ptr = self.alloc(mem::size_of::<T>()) as *mut T;
        if !ptr.is_null() {
            ptr.write(value);
        }

        ptr
    }

    /// Drop the object in place and return its block to the pool. Null is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `obj` must come from `create` on this same pool and must not be used
    /// after this call.
    unsafe fn destroy<T>(&self, obj: *mut T) {
        if obj.is_null() {
            return;
        }

        ptr::drop_in_place(obj);
        self.free(obj as *mut u8);
    }
}

// Free blocks of the heap-carving pools store their link in-line, so blocks
// must be able to hold at least a pointer.
struct FreeBlock {
    next: *mut FreeBlock,
}

fn heap_block_size(requested: usize) -> usize {
    requested.max(mem::size_of::<FreeBlock>())
}

fn heap_layout(block_size: usize) -> Layout {
    Layout::from_size_align(block_size, BLOCK_ALIGN).unwrap()
}

/// The single-threaded variant. No synchronization at all; only correct when
/// used from one thread.
pub struct BlockPool {
    block_size: usize,
    free_list: Cell<*mut FreeBlock>,
    alloc_count: Cell<u32>,
}

impl BlockPool {
    pub fn new(block_size: usize) -> Self {
        BlockPool {
            block_size: heap_block_size(block_size),
            free_list: Cell::new(ptr::null_mut()),
            alloc_count: Cell::new(0),
        }
    }
}

impl BlockAlloc for BlockPool {
    fn alloc(&self, size: usize) -> *mut u8 {
        if size > self.block_size {
            return ptr::null_mut();
        }

        let head = self.free_list.get();
        if head.is_null() {
            self.alloc_count.set(self.alloc_count.get() + 1);
            return unsafe { alloc(heap_layout(self.block_size)) };
        }

        self.free_list.set(unsafe { (*head).next });

        head as *mut u8
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let block = ptr as *mut FreeBlock;
        (*block).next = self.free_list.get();
        self.free_list.set(block);
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc_count(&self) -> u32 {
        self.alloc_count.get()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // Blocks still in flight are the caller's contract violation; only
        // the free list can be returned to the heap.
        let mut block = self.free_list.get();
        while !block.is_null() {
            let next = unsafe { (*block).next };
            unsafe { dealloc(block as *mut u8, heap_layout(self.block_size)) };
            block = next;
        }
    }
}

/// The mutex-protected variant. The whole push/pop body runs under one lock.
pub struct LockedBlockPool {
    block_size: usize,
    free_list: Mutex<*mut FreeBlock>,
    alloc_count: AtomicU32,
}

unsafe impl Send for LockedBlockPool {}
unsafe impl Sync for LockedBlockPool {}

impl LockedBlockPool {
    pub fn new(block_size: usize) -> Self {
        LockedBlockPool {
            block_size: heap_block_size(block_size),
            free_list: Mutex::new(ptr::null_mut()),
            alloc_count: AtomicU32::new(0),
        }
    }
}

impl BlockAlloc for LockedBlockPool {
    fn alloc(&self, size: usize) -> *mut u8 {
        if size > self.block_size {
            return ptr::null_mut();
        }

        let mut free_list = self.free_list.lock().unwrap();

        let head = *free_list;
        if head.is_null() {
            self.alloc_count.fetch_add(1, Ordering::Relaxed);
            return unsafe { alloc(heap_layout(self.block_size)) };
        }

        *free_list = unsafe { (*head).next };

        head as *mut u8
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let mut free_list = self.free_list.lock().unwrap();

        let block = ptr as *mut FreeBlock;
        (*block).next = *free_list;
        *free_list = block;
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc_count(&self) -> u32 {
        self.alloc_count.load(Ordering::Relaxed)
    }
}

impl Drop for LockedBlockPool {
    fn drop(&mut self) {
        let mut block = *self.free_list.lock().unwrap();
        while !block.is_null() {
            let next = unsafe { (*block).next };
            unsafe { dealloc(block as *mut u8, heap_layout(self.block_size)) };
            block = next;
        }
    }
}

// Sentinel index for "no free block".
const NIL: u32 = u32::MAX;

#[inline]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// The lock-free variant.
///
/// Blocks live in a pre-sized arena and the free list is a chain of `u32`
/// indices. The list head packs `(generation, index)` into a single
/// `AtomicU64`; every successful push or pop bumps the generation, so a
/// compare-and-swap can never succeed against a head that was popped and
/// re-pushed in the meantime (the ABA hazard).
///
/// Carving a fresh block is a bump of an atomic cursor over the arena. Once
/// the arena is exhausted, `alloc` reports it with null when the free list is
/// also empty.
pub struct LockFreeBlockPool {
    arena: *mut u8,
    arena_layout: Layout,
    block_size: usize,
    capacity: u32,
    // Free-list link per block, indexed by block.
    links: Vec<AtomicU32>,
    // (generation, index) of the free-list head.
    head: CachePadded<AtomicU64>,
    // Number of blocks ever carved from the arena.
    cursor: CachePadded<AtomicU32>,
}

unsafe impl Send for LockFreeBlockPool {}
unsafe impl Sync for LockFreeBlockPool {}

impl LockFreeBlockPool {
    pub fn new(block_size: usize, capacity: u32) -> Self {
        assert!(capacity > 0 && capacity < NIL);

        // Round the block size up so that every arena offset stays aligned.
        let block_size = round_up(block_size.max(1), BLOCK_ALIGN);

        let arena_layout = Layout::from_size_align(
            block_size * capacity as usize,
            BLOCK_ALIGN,
        ).unwrap();

        let arena = unsafe { alloc(arena_layout) };
        assert!(!arena.is_null());

        let mut links = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            links.push(AtomicU32::new(NIL));
        }

        LockFreeBlockPool {
            arena,
            arena_layout,
            block_size,
            capacity,
            links,
            head: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            cursor: CachePadded::new(AtomicU32::new(0)),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.capacity);
        unsafe { self.arena.add(index as usize * self.block_size) }
    }

    #[inline]
    fn block_index(&self, ptr: *mut u8) -> u32 {
        let offset = ptr as usize - self.arena as usize;
        debug_assert!(offset % self.block_size == 0);
        let index = offset / self.block_size;
        debug_assert!(index < self.capacity as usize);
        index as u32
    }
}

impl BlockAlloc for LockFreeBlockPool {
    fn alloc(&self, size: usize) -> *mut u8 {
        if size > self.block_size {
            return ptr::null_mut();
        }

        let backoff = Backoff::new();
        loop {
            let current = self.head.load(Ordering::Acquire);
            let (generation, index) = unpack(current);

            if index == NIL {
                // The free list was empty when we looked: carve an untouched
                // block from the arena instead.
                let carved = self.cursor.fetch_add(1, Ordering::Relaxed);
                if carved >= self.capacity {
                    // Arena exhausted. Keep the counter saturated at capacity
                    // so alloc_count stays meaningful.
                    self.cursor.fetch_sub(1, Ordering::Relaxed);
                    return ptr::null_mut();
                }

                return self.block_ptr(carved);
            }

            let next = self.links[index as usize].load(Ordering::Relaxed);
            let new_head = pack(generation.wrapping_add(1), next);

            // If `index` was popped and re-pushed since the load above, the
            // generation moved on and this exchange fails instead of writing
            // a stale link into the list.
            if self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ).is_ok() {
                return self.block_ptr(index);
            }

            backoff.spin();
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let index = self.block_index(ptr);

        let backoff = Backoff::new();
        loop {
            let current = self.head.load(Ordering::Acquire);
            let (generation, head_index) = unpack(current);

            self.links[index as usize].store(head_index, Ordering::Relaxed);
            let new_head = pack(generation.wrapping_add(1), index);

            if self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ).is_ok() {
                return;
            }

            backoff.spin();
        }
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc_count(&self) -> u32 {
        self.cursor.load(Ordering::Relaxed).min(self.capacity)
    }
}

impl Drop for LockFreeBlockPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.arena, self.arena_layout) };
    }
}

fn round_up(value: usize, to: usize) -> usize {
    debug_assert!(to.is_power_of_two());
    (value + to - 1) & !(to - 1)
}
