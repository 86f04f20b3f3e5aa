//! Monotonic bump-pointer heap with an object-start index.
//!
//! Allocation is a single fetch-add on the `start` offset. Because sizes
//! are arbitrary, the heap keeps a FAT-style bitmap with one bit per
//! allocation granule recording where objects *begin*; mapping an interior
//! pointer to its object is a short backward scan to the nearest set bit,
//! and finding the object's end is a forward scan to the next one. That
//! same index is what lets the compacting collector enumerate allocations
//! in address order and slide them downward.
//!
//! Cooperation with the collector goes through an odd/even `version`
//! counter: the collector makes it odd for the duration of a cycle, the
//! allocation path retries while it is odd, and the reserve/publish pair
//! itself runs as a suspension checkpoint so a stop-the-world can never
//! observe a half-made reservation.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use once_cell::sync::OnceCell;
use tracing::Level;

use crate::bitset::{words_for_bits, BitsRef};
use crate::cap::Capability;
use crate::loom_testing::*;
use crate::mark::{Allocation, IterableHeap, TraceHeap};
use crate::page::{self, MapError};
use crate::util::{divroundup, roundto};
use crate::world;

/// Objects are placed at multiples of this. Big enough for any primitive
/// alignment, and at least a word so the start bitmap stays small.
pub const ALLOC_GRANULARITY: usize = 16;

const fn header_bytes<H>() -> usize {
    if mem::size_of::<H>() == 0 {
        0
    } else {
        mem::size_of::<H>()
    }
}

/// A fixed-size bump heap with an optional per-object header: each object
/// is preceded by `H` (whole granules), which is how the compactor keeps
/// per-object state without a side table.
pub struct BumpHeap<H> {
    region: NonNull<u8>,
    region_len: usize,
    /// Offset of the first unallocated byte. Only ever grows outside of
    /// collections; `set_last_object` pulls it back.
    start: AtomicUsize,
    /// One bit per granule, set iff an object begins there.
    bits_words: NonNull<AtomicU64>,
    n_granules: usize,
    /// Odd while a collection is running.
    version: AtomicU64,
    /// Invoked when the bump passes the end of the heap.
    gc: OnceCell<Box<dyn Fn() + Send + Sync>>,
    _marker: PhantomData<H>,
}

// safety: shared state is atomic; object memory is handed out uniquely
unsafe impl<H: Send + Sync> Send for BumpHeap<H> {}
unsafe impl<H: Send + Sync> Sync for BumpHeap<H> {}

impl<H> BumpHeap<H> {
    /// Map a heap of `len` bytes (rounded up to whole granules' worth of
    /// index too).
    pub fn create(len: usize) -> Result<Self, MapError> {
        const {
            assert!(mem::size_of::<H>() % ALLOC_GRANULARITY == 0 || mem::size_of::<H>() == 0);
            assert!(mem::align_of::<H>() <= ALLOC_GRANULARITY);
        };
        let region_len = roundto(len, ALLOC_GRANULARITY);
        let n_granules = region_len / ALLOC_GRANULARITY;
        let words = words_for_bits(n_granules);
        let region = page::map_pages(region_len)?;
        let bits = page::map_pages(words * mem::size_of::<AtomicU64>())?;
        let bits_words: NonNull<AtomicU64> = bits.cast();
        // the index words need real construction, not just zero fill
        for w in 0..words {
            // safety: freshly mapped, exclusively ours
            unsafe {
                std::ptr::write(bits_words.as_ptr().add(w), AtomicU64::new(0));
            }
        }
        Ok(Self {
            region,
            region_len,
            start: AtomicUsize::new(0),
            bits_words,
            n_granules,
            version: AtomicU64::new(0),
            gc: OnceCell::new(),
            _marker: PhantomData,
        })
    }

    fn bits(&self) -> BitsRef<'_> {
        // safety: the words mapping lives as long as self
        BitsRef::new(
            unsafe {
                std::slice::from_raw_parts(self.bits_words.as_ptr(), words_for_bits(self.n_granules))
            },
            self.n_granules,
        )
    }

    fn base(&self) -> usize {
        self.region.as_ptr() as usize
    }

    /// The allocation frontier in bytes, clamped to the region (failed
    /// allocations may leave `start` past the end).
    fn frontier(&self) -> usize {
        self.start.load(Ordering::Relaxed).min(self.region_len)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.region_len
    }

    /// Set the callback used to trigger a collection when the heap runs
    /// out. May only be set once.
    pub fn set_gc(&self, gc: impl Fn() + Send + Sync + 'static) {
        if self.gc.set(Box::new(gc)).is_err() {
            panic!("gc callback already installed");
        }
    }

    /// Invoke the garbage collector.
    pub fn collect(&self) {
        if let Some(gc) = self.gc.get() {
            gc();
        }
    }

    /// Collection is starting; allocation stalls until [`end_gc`](Self::end_gc).
    pub fn start_gc(&self) {
        let v = self.version.fetch_add(1, Ordering::AcqRel);
        debug_assert!(v % 2 == 0, "nested collection");
    }

    /// Collection finished; allocation transactions resume.
    pub fn end_gc(&self) {
        let v = self.version.fetch_add(1, Ordering::AcqRel);
        debug_assert!(v % 2 == 1);
    }

    /// Allocate `size` bytes (plus the object header). Wait-free in the
    /// common case: one fetch-add plus one bit set. Returns a capability
    /// whose bounds are exactly `size`.
    ///
    /// When the bump passes the end of the heap the GC callback runs and
    /// the allocation retries; `None` means no callback is installed or
    /// collection failed to make room.
    pub fn alloc(&self, size: usize) -> Option<Capability> {
        let hsz = header_bytes::<H>();
        let total = roundto(size + hsz, ALLOC_GRANULARITY);
        loop {
            // a collection is running: retry until it finishes so we don't
            // allocate into a moving heap
            let mut v = self.version.load(Ordering::Acquire);
            while v % 2 == 1 {
                spin_hint();
                v = self.version.load(Ordering::Acquire);
            }
            // The reserve-and-publish pair below must be atomic with
            // respect to stop-the-world: a half-made reservation would be
            // revoked by the compactor's frontier truncation, leaving a
            // phantom start bit. The critical section delays suspension
            // until the bit is set, at which point the caller's stack
            // reference keeps the reservation alive like any other object.
            let critical = world::enter_critical();
            let offset = self.start.fetch_add(total, Ordering::Relaxed);
            if offset + total > self.region_len {
                drop(critical);
                let trace_span = tracing::span!(Level::TRACE, "bump::alloc_slow", size);
                let _span_enter = trace_span.enter();
                // start is left past the end; compaction truncates it back
                self.gc.get()?;
                let before = self.frontier();
                self.collect();
                if self.frontier() + total > self.region_len && self.frontier() >= before {
                    // collection didn't help; out of memory
                    return None;
                }
                continue;
            }
            self.bits().set(offset / ALLOC_GRANULARITY);
            drop(critical);
            return Some(Capability::from_raw_parts(self.base() + offset + hsz, size));
        }
    }

    /// The allocation containing `addr`, found by scanning the start
    /// bitmap backward for the object start and forward for its end.
    pub fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        if !self.contains(addr) {
            return None;
        }
        let hsz = header_bytes::<H>();
        let off = addr - self.base();
        let bits = self.bits();
        let obj_granule = bits.previous_one_at_or_before(off / ALLOC_GRANULARITY)?;
        let obj_off = obj_granule * ALLOC_GRANULARITY;
        let frontier = self.frontier();
        if obj_off >= frontier {
            return None;
        }
        let next = bits.one_after(obj_granule);
        let end = (next * ALLOC_GRANULARITY).min(frontier);
        if off >= end {
            // past the last object, in unallocated space
            return None;
        }
        let header = if hsz == 0 {
            NonNull::dangling()
        } else {
            // safety: in-bounds, granule-aligned
            unsafe { NonNull::new_unchecked((self.base() + obj_off) as *mut H) }
        };
        Some(Allocation {
            object: Capability::from_raw_parts(self.base() + obj_off + hsz, end - obj_off - hsz),
            header,
        })
    }

    /// Slide an object (and its header) down by `disp` bytes. Only the
    /// collector calls this, with the world stopped. Returns the moved
    /// object.
    ///
    /// # Safety
    /// `obj` must be an allocation of this heap, `disp <= 0`, and the
    /// destination range must contain no live object.
    pub unsafe fn move_object(&self, obj: &Capability, disp: isize) -> Capability {
        debug_assert!(disp <= 0);
        let hsz = header_bytes::<H>();
        let old_off = obj.base() - hsz - self.base();
        let new_off = old_off.wrapping_add_signed(disp);
        debug_assert!(old_off % ALLOC_GRANULARITY == 0);
        debug_assert!(new_off % ALLOC_GRANULARITY == 0);
        let bits = self.bits();
        let old_g = old_off / ALLOC_GRANULARITY;
        let new_g = new_off / ALLOC_GRANULARITY;
        let len = hsz + obj.length();
        bits.clear(old_g);
        // the destination span may carry stale start bits from the dead
        // objects being overwritten; they must not survive as phantom
        // object starts
        let len_g = divroundup(len, ALLOC_GRANULARITY);
        let stale_end = (new_g + len_g).min(old_g);
        for g in new_g + 1..stale_end {
            if bits.get(g) {
                bits.clear(g);
            }
        }
        bits.set(new_g);
        std::ptr::copy(
            (self.base() + old_off) as *const u8,
            (self.base() + new_off) as *mut u8,
            len,
        );
        obj.displaced(disp)
    }

    /// Truncate the allocation frontier to just past `obj` (or to zero if
    /// the heap has no live objects), reclaiming the tail. Start bits
    /// beyond the new frontier are stale and get dropped here.
    pub fn set_last_object(&self, obj: Option<&Capability>) {
        let new_start = match obj {
            Some(o) => roundto(o.base() + o.length() - self.base(), ALLOC_GRANULARITY),
            None => 0,
        };
        let old = self.start.swap(new_start, Ordering::Relaxed).min(self.region_len);
        let bits = self.bits();
        let mut g = new_start / ALLOC_GRANULARITY;
        let end_g = divroundup(old, ALLOC_GRANULARITY).min(self.n_granules);
        while g < end_g {
            if bits.get(g) {
                bits.clear(g);
            }
            g += 1;
        }
    }

    /// Number of set start bits; equals the number of allocations ever
    /// started and still below the frontier.
    pub fn live_start_bits(&self) -> usize {
        let bits = self.bits();
        let frontier_g = divroundup(self.frontier(), ALLOC_GRANULARITY);
        let mut n = 0;
        let mut g = if frontier_g == 0 {
            return 0;
        } else if bits.get(0) {
            n += 1;
            0
        } else {
            0
        };
        loop {
            g = bits.one_after(g);
            if g >= frontier_g {
                return n;
            }
            n += 1;
        }
    }

    /// Iterate allocations in address order.
    pub fn iter(&self) -> BumpAllocations<'_, H> {
        let bits = self.bits();
        let first = if self.frontier() > 0 && bits.get(0) {
            0
        } else {
            bits.one_after(0)
        };
        BumpAllocations {
            heap: self,
            granule: first,
            frontier: self.frontier(),
        }
    }
}

impl<H> Drop for BumpHeap<H> {
    fn drop(&mut self) {
        // safety: unmapping our own regions
        unsafe {
            page::unmap(self.region, self.region_len);
            page::unmap(
                self.bits_words.cast(),
                words_for_bits(self.n_granules) * mem::size_of::<AtomicU64>(),
            );
        }
    }
}

impl<H> TraceHeap for BumpHeap<H> {
    type Header = H;

    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        BumpHeap::object_for_allocation(self, addr)
    }
}

impl<H> IterableHeap for BumpHeap<H> {
    type Iter<'a>
        = BumpAllocations<'a, H>
    where
        Self: 'a;

    fn allocations(&self) -> BumpAllocations<'_, H> {
        self.iter()
    }
}

/// Address-ordered iterator over a bump heap's allocations.
pub struct BumpAllocations<'a, H> {
    heap: &'a BumpHeap<H>,
    granule: usize,
    frontier: usize,
}

impl<'a, H> Iterator for BumpAllocations<'a, H> {
    type Item = Allocation<H>;

    fn next(&mut self) -> Option<Allocation<H>> {
        let obj_off = self.granule * ALLOC_GRANULARITY;
        if obj_off >= self.frontier {
            return None;
        }
        let hsz = header_bytes::<H>();
        let bits = self.heap.bits();
        let next = bits.one_after(self.granule);
        let end = (next * ALLOC_GRANULARITY).min(self.frontier);
        let header = if hsz == 0 {
            NonNull::dangling()
        } else {
            // safety: in-bounds object start
            unsafe { NonNull::new_unchecked((self.heap.base() + obj_off) as *mut H) }
        };
        self.granule = next;
        Some(Allocation {
            object: Capability::from_raw_parts(
                self.heap.base() + obj_off + hsz,
                end - obj_off - hsz,
            ),
            header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_lookup() {
        let heap: BumpHeap<()> = BumpHeap::create(1 << 20).unwrap();
        let a = heap.alloc(24).unwrap();
        let b = heap.alloc(100).unwrap();
        assert_ne!(a.base(), b.base());
        assert_eq!(a.length(), 24);
        // interior pointers resolve to the enclosing object
        for k in 0..24 {
            let found = heap.object_for_allocation(a.base() + k).unwrap();
            assert_eq!(found.object.base(), a.base());
            assert!(found.object.length() >= 24);
        }
        let found = heap.object_for_allocation(b.base() + 99).unwrap();
        assert_eq!(found.object.base(), b.base());
        // past the frontier, and outside the region entirely
        assert!(heap.object_for_allocation(b.base() + 4096).is_none());
        assert!(heap.object_for_allocation(heap.base() + heap.region_len).is_none());
    }

    #[test]
    fn start_bits_track_allocations() {
        let heap: BumpHeap<()> = BumpHeap::create(1 << 20).unwrap();
        for i in 0..100 {
            heap.alloc(16 + (i % 7) * 8).unwrap();
        }
        assert_eq!(heap.live_start_bits(), 100);
        assert_eq!(heap.iter().count(), 100);
    }

    #[test]
    fn iteration_is_address_ordered() {
        let heap: BumpHeap<()> = BumpHeap::create(1 << 20).unwrap();
        for _ in 0..50 {
            heap.alloc(40).unwrap();
        }
        let mut last = 0;
        for alloc in heap.iter() {
            assert!(alloc.object.base() > last);
            last = alloc.object.base();
        }
    }

    #[test]
    fn exhaustion_without_gc_returns_none() {
        let heap: BumpHeap<()> = BumpHeap::create(4096).unwrap();
        let mut n = 0;
        while heap.alloc(64).is_some() {
            n += 1;
        }
        assert!(n > 0 && n <= 4096 / 64);
    }

    #[test]
    fn move_object_slides_down() {
        let heap: BumpHeap<()> = BumpHeap::create(1 << 20).unwrap();
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        unsafe {
            (a.base() as *mut u64).write(0xdead);
            (b.base() as *mut u64).write(0xbeef);
        }
        // pretend `a` died: slide b into its place
        let disp = a.base() as isize - b.base() as isize;
        let moved = unsafe { heap.move_object(&b, disp) };
        assert_eq!(moved.base(), a.base());
        assert_eq!(unsafe { (moved.base() as *const u64).read() }, 0xbeef);
        heap.set_last_object(Some(&moved));
        assert_eq!(heap.live_start_bits(), 1);
        // frontier reclaimed: the next alloc lands right after the moved
        // object
        let c = heap.alloc(16).unwrap();
        assert_eq!(c.base(), moved.base() + 32);
    }
}
