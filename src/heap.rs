//! Bump heap plus a side table of page-mapped large objects, behind one
//! heap surface for the collector.
//!
//! Objects smaller than a page go to the bump heap; anything else gets
//! its own page mapping and an entry (header included) in a page-backed
//! vector. Only bump-heap objects are relocatable; large objects keep
//! displacement zero forever, so the compactor's phases stay correct
//! without special cases.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::bump::{BumpAllocations, BumpHeap};
use crate::cap::Capability;
use crate::config::PAGE_SIZE;
use crate::lock::Spinlock;
use crate::mark::{Allocation, IterableHeap, TraceHeap};
use crate::page::{self, MapError};
use crate::util::roundto;

struct LargeEntry<H> {
    header: UnsafeCell<H>,
    object: Capability,
}

/// The GC-mode heap: a bump heap for small objects spliced with directly
/// mapped large allocations.
pub struct BumpOrLargeHeap<H> {
    small: BumpHeap<H>,
    /// Guards `large`. Large allocations should be rare enough that a
    /// spinlock never sees real contention; the collector holds it for
    /// the duration of a cycle.
    large_lock: Spinlock,
    large: UnsafeCell<page::PageVec<LargeEntry<H>>>,
}

// safety: `large` is only touched under `large_lock`; everything else is
// the bump heap's problem
unsafe impl<H: Send + Sync> Send for BumpOrLargeHeap<H> {}
unsafe impl<H: Send + Sync> Sync for BumpOrLargeHeap<H> {}

impl<H: Default> BumpOrLargeHeap<H> {
    pub fn create(len: usize) -> Result<Self, MapError> {
        Ok(Self {
            small: BumpHeap::create(len)?,
            large_lock: Spinlock::new(),
            large: UnsafeCell::new(page::PageVec::with_capacity(64)),
        })
    }

    /// Allocate `size` bytes: bump for sub-page sizes, a dedicated page
    /// mapping otherwise.
    pub fn alloc(&self, size: usize) -> Option<Capability> {
        if size < PAGE_SIZE {
            return self.small.alloc(size);
        }
        let mapped = page::map_pages(size).ok()?;
        let object = Capability::from_raw_parts(mapped.as_ptr() as usize, roundto(size, PAGE_SIZE));
        {
            let _guard = self.large_lock.lock();
            // safety: mutated only under large_lock
            unsafe {
                (*self.large.get()).push(LargeEntry {
                    header: UnsafeCell::new(H::default()),
                    object,
                });
            }
        }
        Some(object)
    }

    pub fn set_gc(&self, gc: impl Fn() + Send + Sync + 'static) {
        self.small.set_gc(gc);
    }

    pub fn collect(&self) {
        self.small.collect();
    }

    /// Fence mutators out for a collection cycle.
    pub fn start_gc(&self) {
        self.small.start_gc();
        self.large_lock.raw_lock();
    }

    pub fn end_gc(&self) {
        // safety: paired with the raw_lock in start_gc
        unsafe { self.large_lock.raw_unlock() };
        self.small.end_gc();
    }

    /// Iterate only the relocatable (bump-heap) allocations, in address
    /// order.
    pub fn relocatable(&self) -> BumpAllocations<'_, H> {
        self.small.iter()
    }

    /// Slide a bump-heap object down by `disp`.
    ///
    /// # Safety
    /// See [`BumpHeap::move_object`]; additionally `obj` must not be a
    /// large allocation.
    pub unsafe fn move_object(&self, obj: &Capability, disp: isize) -> Capability {
        debug_assert!(self.small.contains(obj.base()));
        self.small.move_object(obj, disp)
    }

    pub fn set_last_object(&self, obj: Option<&Capability>) {
        self.small.set_last_object(obj)
    }

    fn lookup_large(&self, addr: usize) -> Option<Allocation<H>> {
        // Deliberately unlocked: the collector calls this while it holds
        // large_lock (pushes are fenced out for the whole cycle), and a
        // mutator lookup racing a concurrent large allocation was never
        // defined to begin with.
        // safety: see above
        let large = unsafe { &*self.large.get() };
        for entry in large.iter() {
            if entry.object.contains_addr(addr) {
                return Some(Allocation {
                    object: entry.object,
                    // safety: header storage lives as long as the heap
                    header: unsafe { NonNull::new_unchecked(entry.header.get()) },
                });
            }
        }
        None
    }

    pub fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        if let Some(a) = self.small.object_for_allocation(addr) {
            return Some(a);
        }
        self.lookup_large(addr)
    }
}

impl<H: Default> TraceHeap for BumpOrLargeHeap<H> {
    type Header = H;

    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        BumpOrLargeHeap::object_for_allocation(self, addr)
    }
}

impl<H: Default> IterableHeap for BumpOrLargeHeap<H> {
    type Iter<'a>
        = HeapAllocations<'a, H>
    where
        Self: 'a;

    fn allocations(&self) -> HeapAllocations<'_, H> {
        HeapAllocations {
            heap: self,
            small: self.small.iter(),
            small_done: false,
            large_idx: 0,
        }
    }
}

/// Bump-heap allocations in address order, then the large allocations.
pub struct HeapAllocations<'a, H> {
    heap: &'a BumpOrLargeHeap<H>,
    small: BumpAllocations<'a, H>,
    small_done: bool,
    large_idx: usize,
}

impl<'a, H: Default> Iterator for HeapAllocations<'a, H> {
    type Item = Allocation<H>;

    fn next(&mut self) -> Option<Allocation<H>> {
        if !self.small_done {
            if let Some(a) = self.small.next() {
                return Some(a);
            }
            self.small_done = true;
        }
        // safety: entries are stable while iterating (collector context)
        let large = unsafe { &*self.heap.large.get() };
        let entry = large.as_slice().get(self.large_idx)?;
        self.large_idx += 1;
        Some(Allocation {
            object: entry.object,
            // safety: header storage lives as long as the heap
            header: unsafe { NonNull::new_unchecked(entry.header.get()) },
        })
    }
}
