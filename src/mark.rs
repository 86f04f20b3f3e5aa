//! Generic reachability tracing.
//!
//! The marker is parameterized over a heap, a per-object header type, and
//! an optional filter, so the same trace loop drives both the compacting
//! and the sweeping collector. A heap only has to answer the question
//! "which allocation encloses this address?" and expose an iterator over
//! `(header, object)` pairs.

use std::ptr::NonNull;

use crate::cap::Capability;
use crate::page::PageVec;
use crate::roots::Roots;

/// One managed allocation: the object region and its out-of-line header.
pub struct Allocation<H> {
    pub object: Capability,
    pub header: NonNull<H>,
}

impl<H> Clone for Allocation<H> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<H> Copy for Allocation<H> {}

/// A heap the marker can trace over.
pub trait TraceHeap {
    type Header;

    /// Map any interior pointer to its enclosing allocation, or `None` if
    /// the address is not managed by this heap.
    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<Self::Header>>;
}

/// A heap whose allocations can be enumerated (each exactly once).
pub trait IterableHeap: TraceHeap {
    type Iter<'a>: Iterator<Item = Allocation<Self::Header>>
    where
        Self: 'a;

    fn allocations(&self) -> Self::Iter<'_>;
}

/// Tri-color state plus the bookkeeping bits the collectors need. The
/// marker only manipulates headers through this trait, so the packed
/// sweep header and the word-sized compact header both work.
pub trait MarkHeader {
    /// Back to unmarked, contains_pointers cleared. Collector-private
    /// flags (e.g. the sweep header's free bit) survive.
    fn reset(&mut self);
    fn set_marked(&mut self);
    fn set_visited(&mut self);
    fn set_contains_pointers(&mut self);
    fn is_unmarked(&self) -> bool;
    fn is_marked(&self) -> bool;
    fn is_visited(&self) -> bool;
    fn contains_pointers(&self) -> bool;
}

/// Marking filter: returning `false` makes the marker treat the object as
/// not worth tracing (it stays discoverable, just unvisited).
pub trait MarkFilter<H> {
    fn keep(header: &H, object: &Capability) -> bool;
}

/// Default filter: every object is traced.
pub struct AlwaysMark;

impl<H> MarkFilter<H> for AlwaysMark {
    #[inline]
    fn keep(_: &H, _: &Capability) -> bool {
        true
    }
}

/// The mark core: a work stack of grey objects and the trace loop.
///
/// The stack is page-allocated so it never appears inside the heap being
/// collected (and is invisible to conservative scans of it).
pub struct Marker<F = AlwaysMark> {
    mark_list: PageVec<usize>,
    /// Number of objects visited this cycle, for sanity checks.
    visited: u64,
    _filter: std::marker::PhantomData<F>,
}

impl<F> Marker<F> {
    pub fn new() -> Self {
        Self {
            mark_list: PageVec::with_capacity(4096),
            visited: 0,
            _filter: std::marker::PhantomData,
        }
    }

    pub fn visited(&self) -> u64 {
        self.visited
    }

    pub fn reset(&mut self) {
        self.visited = 0;
        debug_assert!(self.mark_list.is_empty());
    }

    /// Mark the object enclosing `p` as visited and scan it for outgoing
    /// pointers, pushing newly discovered objects onto the mark stack.
    pub fn mark_pointer<Heap>(&mut self, heap: &Heap, p: usize)
    where
        Heap: TraceHeap,
        Heap::Header: MarkHeader,
        F: MarkFilter<Heap::Header>,
    {
        // If this isn't an object the heap allocated, ignore it. Non-heap
        // memory is either a root (already seen) or assumed not to point
        // into the heap.
        let Some(alloc) = heap.object_for_allocation(p) else {
            return;
        };
        // Headers are touched through raw pointers with short-lived
        // borrows: a self-referential object makes `header` and
        // `pointee.header` the same location.
        let header = alloc.header.as_ptr();
        // safety: single collector thread, world is stopped
        unsafe {
            if !F::keep(&*header, &alloc.object) {
                return;
            }
            // Objects should only land on the mark stack once, but skip
            // any that come around again.
            if (*header).is_visited() {
                return;
            }
            self.visited += 1;
            (*header).reset();
            (*header).set_visited();
        }

        // Scan the object word by word for things that look like pointers.
        let base = alloc.object.base();
        let words = alloc.object.length() / std::mem::size_of::<usize>();
        for i in 0..words {
            // safety: in-bounds read of the object body
            let word = unsafe { ((base + i * std::mem::size_of::<usize>()) as *const usize).read() };
            if !Capability::from_word(word).is_valid() {
                continue;
            }
            let Some(pointee) = heap.object_for_allocation(word) else {
                continue;
            };
            let pointee_header = pointee.header.as_ptr();
            // safety: as above
            unsafe {
                (*header).set_contains_pointers();
                if (*pointee_header).is_unmarked() {
                    (*pointee_header).set_marked();
                    self.mark_list.push(word);
                }
            }
        }
    }

    /// Drain the mark stack, transitively visiting everything reachable.
    pub fn trace<Heap>(&mut self, heap: &Heap)
    where
        Heap: TraceHeap,
        Heap::Header: MarkHeader,
        F: MarkFilter<Heap::Header>,
    {
        while let Some(p) = self.mark_list.pop() {
            self.mark_pointer(heap, p);
        }
    }

    /// Seed the trace from the root set.
    pub fn mark_roots<Heap>(&mut self, heap: &Heap, roots: &mut Roots)
    where
        Heap: TraceHeap,
        Heap::Header: MarkHeader,
        F: MarkFilter<Heap::Header>,
    {
        roots.collect_roots_from_ranges();
        for root in roots.iter() {
            let Some(alloc) = heap.object_for_allocation(root.value) else {
                continue;
            };
            // safety: stop-the-world, collector-only access
            let header = unsafe { &*alloc.header.as_ptr() };
            if header.is_unmarked() {
                self.mark_pointer(heap, root.value);
            }
        }
    }
}
