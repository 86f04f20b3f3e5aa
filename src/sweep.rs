//! Mark/sweep collection over the slab heap.
//!
//! Reuses the generic mark core with a filter that refuses to trace
//! objects the mutator has already freed: an explicitly freed object
//! stays discoverable (so a stale interior pointer still resolves to a
//! bounded region instead of to garbage) but contributes nothing to
//! reachability, and its storage is reclaimed on the next cycle once
//! nothing reaches it.
//!
//! The header packs into one byte because the slab stores one per slot
//! for every allocation in every chunk.

use std::sync::Mutex;

use tracing::Level;

use crate::cap::Capability;
use crate::mark::{IterableHeap, MarkFilter, MarkHeader, Marker};
use crate::roots::Roots;
use crate::slab::SlabHeap;
use crate::world;

const COLOR_MASK: u8 = 0b0011;
const COLOR_MARKED: u8 = 0b0001;
const COLOR_VISITED: u8 = 0b0010;
const CONTAINS_POINTERS: u8 = 0b0100;
const IS_FREE: u8 = 0b1000;

/// Per-object mark/sweep state: `{color:2, contains_pointers:1,
/// is_free:1}` in a single byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepHeader(u8);

const _: () = assert!(std::mem::size_of::<SweepHeader>() == 1);

impl SweepHeader {
    pub fn is_free(&self) -> bool {
        self.0 & IS_FREE != 0
    }

    pub fn set_free(&mut self) {
        self.0 |= IS_FREE;
    }
}

impl MarkHeader for SweepHeader {
    fn reset(&mut self) {
        // the free flag deliberately survives collection; it is cleared
        // when the slot is handed out again
        self.0 &= IS_FREE;
    }
    fn set_marked(&mut self) {
        self.0 = (self.0 & !COLOR_MASK) | COLOR_MARKED;
    }
    fn set_visited(&mut self) {
        self.0 = (self.0 & !COLOR_MASK) | COLOR_VISITED;
    }
    fn set_contains_pointers(&mut self) {
        self.0 |= CONTAINS_POINTERS;
    }
    fn is_unmarked(&self) -> bool {
        self.0 & COLOR_MASK == 0
    }
    fn is_marked(&self) -> bool {
        self.0 & COLOR_MASK == COLOR_MARKED
    }
    fn is_visited(&self) -> bool {
        self.0 & COLOR_MASK == COLOR_VISITED
    }
    fn contains_pointers(&self) -> bool {
        self.0 & CONTAINS_POINTERS != 0
    }
}

/// Marking filter that skips explicitly freed objects.
pub struct SkipFree;

impl MarkFilter<SweepHeader> for SkipFree {
    #[inline]
    fn keep(header: &SweepHeader, _: &Capability) -> bool {
        !header.is_free()
    }
}

/// Heap operations the sweeper needs beyond tracing and iteration.
pub trait SweepableHeap: IterableHeap<Header = SweepHeader> {
    fn alloc_object(&self, size: usize) -> Option<Capability>;
    fn free_object(&self, obj: &Capability);
}

impl SweepableHeap for SlabHeap<SweepHeader> {
    fn alloc_object(&self, size: usize) -> Option<Capability> {
        self.alloc(size)
    }

    fn free_object(&self, obj: &Capability) {
        self.free(obj.base())
    }
}

/// What a sweep cycle found.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    /// Objects reached from the roots.
    pub visited: u64,
    /// Dead objects returned to the allocator.
    pub freed: u64,
    /// Objects freed by the mutator but still reachable from somewhere;
    /// their storage was zeroed but kept.
    pub free_reachable: u64,
}

struct SweeperState {
    roots: Roots,
    marker: Marker<SkipFree>,
}

/// Stop-the-world mark/sweep collector with deferred destruction.
pub struct MarkSweep<'h, Heap> {
    heap: &'h Heap,
    state: Mutex<SweeperState>,
}

impl<'h, Heap: SweepableHeap> MarkSweep<'h, Heap> {
    pub fn new(heap: &'h Heap) -> Self {
        let mut roots = Roots::new();
        roots.register_global_roots();
        Self {
            heap,
            state: Mutex::new(SweeperState {
                roots,
                marker: Marker::new(),
            }),
        }
    }

    /// Register an extra region to scan for roots on every collection.
    pub fn add_permanent_root_range(&self, range: Capability) {
        self.state.lock().unwrap().roots.add_permanent_range(range);
    }

    /// Allocate a managed object. The slot's header is reinitialized
    /// here: the allocator itself never touches headers, and a recycled
    /// slot must not inherit a stale free flag.
    pub fn alloc(&self, size: usize) -> Option<Capability> {
        let cap = self.heap.alloc_object(size)?;
        if let Some(alloc) = self.heap.object_for_allocation(cap.base()) {
            // safety: freshly allocated slot, nobody else references it
            unsafe {
                *alloc.header.as_ptr() = SweepHeader::default();
            }
        }
        Some(cap)
    }

    /// Mark an object freed. Reclamation is deferred to the next
    /// collection so stale pointers keep resolving to a bounded region
    /// in the meantime.
    pub fn free(&self, addr: usize) {
        if let Some(alloc) = self.heap.object_for_allocation(addr) {
            // safety: header mutation is a single byte store; racing
            // marks are excluded because collection stops the world
            unsafe {
                (*alloc.header.as_ptr()).set_free();
            }
        }
    }

    /// Run a full collection cycle.
    pub fn collect(&self) -> SweepStats {
        world::with_spilled_registers(|| self.collect_inner())
    }

    fn collect_inner(&self) -> SweepStats {
        let trace_span = tracing::span!(Level::DEBUG, "gc::sweep");
        let _span_enter = trace_span.enter();

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.marker.reset();
        state.roots.clear_temporary_roots();
        state.roots.stop_the_world();
        if world::current_thread_registered() {
            state.roots.add_thread(world::current_stack_region());
        }
        let roots = &mut state.roots;
        world::for_each_stopped_stack(|stack| roots.add_thread(stack));

        state.marker.mark_roots(self.heap, &mut state.roots);
        state.marker.trace(self.heap);
        let visited = state.marker.visited();

        let (freed, free_reachable) = self.free_unmarked();
        state.roots.start_the_world();
        tracing::event!(Level::DEBUG, visited, freed, free_reachable, "sweep complete");
        SweepStats {
            visited,
            freed,
            free_reachable,
        }
    }

    /// Walk every allocation: zero the reachable-but-freed ones, return
    /// the truly dead ones to the allocator, reset the colors of the
    /// live ones.
    fn free_unmarked(&self) -> (u64, u64) {
        let mut freed = 0u64;
        let mut free_reachable = 0u64;
        for alloc in self.heap.allocations() {
            // safety: world stopped, collector-only header access
            unsafe {
                let h = alloc.header.as_ptr();
                debug_assert!(!(*h).is_marked() || (*h).is_free());
                if (*h).is_free() {
                    std::ptr::write_bytes(
                        alloc.object.base() as *mut u8,
                        0,
                        alloc.object.length(),
                    );
                    free_reachable += 1;
                }
                if (*h).is_unmarked() {
                    self.heap.free_object(&alloc.object);
                    freed += 1;
                } else {
                    (*h).reset();
                }
            }
        }
        (freed, free_reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::TraceHeap;

    fn sweeper_with_slots() -> (SlabHeap<SweepHeader>, Box<[usize; 4]>) {
        (SlabHeap::new().unwrap(), Box::new([0usize; 4]))
    }

    fn collector_for<'h>(
        heap: &'h SlabHeap<SweepHeader>,
        slots: &[usize; 4],
    ) -> MarkSweep<'h, SlabHeap<SweepHeader>> {
        let gc = MarkSweep::new(heap);
        gc.add_permanent_root_range(Capability::from_raw_parts(
            slots.as_ptr() as usize,
            std::mem::size_of_val(slots),
        ));
        gc
    }

    #[test]
    fn collects_unreachable_objects() {
        let (heap, mut slots) = sweeper_with_slots();
        let gc = collector_for(&heap, &slots);

        let keep = gc.alloc(64).unwrap();
        let lose = gc.alloc(64).unwrap();
        unsafe {
            (keep.base() as *mut u64).write(17);
            (lose.base() as *mut u64).write(99);
        }
        slots[0] = keep.base();

        let stats = gc.collect();
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.freed, 1);
        // swept slot is reusable; the kept object is untouched
        assert!(heap.object_for_allocation(lose.base()).is_none());
        unsafe {
            assert_eq!((keep.base() as *const u64).read(), 17);
        }
        // kept object survives with its color reset: collect again
        let stats = gc.collect();
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.freed, 0);
    }

    #[test]
    fn reachable_but_freed_is_zeroed_not_freed() {
        let (heap, mut slots) = sweeper_with_slots();
        let gc = collector_for(&heap, &slots);

        let holder = gc.alloc(16).unwrap();
        let target = gc.alloc(64).unwrap();
        unsafe {
            (holder.base() as *mut usize).write(target.base());
            (target.base() as *mut u64).write(0xfeed);
        }
        slots[0] = holder.base();

        gc.free(target.base());
        let stats = gc.collect();
        // the holder is live; the freed target stays allocated but zeroed
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.free_reachable, 1);
        assert_eq!(stats.freed, 0);
        unsafe {
            assert_eq!((target.base() as *const u64).read(), 0);
        }
        assert!(heap.object_for_allocation(target.base()).is_some());

        // cut the reference: next cycle reclaims it for real
        unsafe {
            (holder.base() as *mut usize).write(0);
        }
        let stats = gc.collect();
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.freed, 1);
        assert!(heap.object_for_allocation(target.base()).is_none());
    }

    #[test]
    fn recycled_slot_gets_fresh_header() {
        let (heap, mut slots) = sweeper_with_slots();
        let gc = collector_for(&heap, &slots);

        let a = gc.alloc(48).unwrap();
        gc.free(a.base());
        gc.collect();
        // same class; most-full-first reuses the slot
        let b = gc.alloc(48).unwrap();
        assert_eq!(b.base(), a.base());
        slots[0] = b.base();
        let stats = gc.collect();
        // a stale free flag would have zeroed it instead of visiting
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.free_reachable, 0);
    }
}
