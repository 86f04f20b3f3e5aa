//! Mark/compact collection, after the LISP2 design.
//!
//! Four passes over a stopped world: trace reachability from the roots,
//! walk allocations in address order computing each live object's
//! (non-positive) displacement, rewrite every root slot and interior
//! pointer whose target moves, then slide the objects down. Unreachable
//! objects are never touched; they are simply overwritten as live objects
//! pack toward the bottom of the heap, and the bump frontier is truncated
//! to the end of the last live object.

use std::sync::Mutex;

use tracing::Level;

use crate::cap::Capability;
use crate::heap::BumpOrLargeHeap;
use crate::mark::{Allocation, AlwaysMark, IterableHeap, MarkHeader, Marker};
use crate::roots::Roots;
use crate::world;

/// Collector colors.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Color {
    /// Not seen by the collector yet.
    #[default]
    Unmarked = 0,
    /// Known live, contents not scanned yet.
    Marked,
    /// Scanned.
    Visited,
}

/// Per-object header for the compacting collector. Word aligned; the
/// displacement accounts for most of the size, and it must be stored per
/// object because the compactor plans every move before performing any.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactHeader {
    /// After relocation the object lives `displacement` bytes from where
    /// it was (always <= 0; objects only move down).
    pub displacement: i64,
    color: Color,
    contains_pointers: bool,
}

impl MarkHeader for CompactHeader {
    fn reset(&mut self) {
        self.color = Color::Unmarked;
        self.contains_pointers = false;
    }
    fn set_marked(&mut self) {
        self.color = Color::Marked;
    }
    fn set_visited(&mut self) {
        self.color = Color::Visited;
    }
    fn set_contains_pointers(&mut self) {
        self.contains_pointers = true;
    }
    fn is_unmarked(&self) -> bool {
        self.color == Color::Unmarked
    }
    fn is_marked(&self) -> bool {
        self.color == Color::Marked
    }
    fn is_visited(&self) -> bool {
        self.color == Color::Visited
    }
    fn contains_pointers(&self) -> bool {
        self.contains_pointers
    }
}

/// A heap the compactor can run against.
pub trait CompactableHeap: IterableHeap<Header = CompactHeader> {
    type RelocIter<'a>: Iterator<Item = Allocation<CompactHeader>>
    where
        Self: 'a;

    /// The relocatable allocations, in address order. (Page-mapped large
    /// objects are enumerable but never move.)
    fn relocatable(&self) -> Self::RelocIter<'_>;

    /// Slide one object (and its header) down by `disp` bytes.
    ///
    /// # Safety
    /// Collector-only, world stopped, destination dead.
    unsafe fn move_object(&self, obj: &Capability, disp: isize) -> Capability;

    /// Truncate the allocation frontier past the last live object.
    fn set_last_object(&self, obj: Option<&Capability>);

    fn begin_collection(&self);
    fn end_collection(&self);
}

impl CompactableHeap for BumpOrLargeHeap<CompactHeader> {
    type RelocIter<'a>
        = crate::bump::BumpAllocations<'a, CompactHeader>
    where
        Self: 'a;

    fn relocatable(&self) -> Self::RelocIter<'_> {
        BumpOrLargeHeap::relocatable(self)
    }

    unsafe fn move_object(&self, obj: &Capability, disp: isize) -> Capability {
        BumpOrLargeHeap::move_object(self, obj, disp)
    }

    fn set_last_object(&self, obj: Option<&Capability>) {
        BumpOrLargeHeap::set_last_object(self, obj)
    }

    fn begin_collection(&self) {
        self.start_gc()
    }

    fn end_collection(&self) {
        self.end_gc()
    }
}

impl CompactableHeap for crate::bump::BumpHeap<CompactHeader> {
    type RelocIter<'a>
        = crate::bump::BumpAllocations<'a, CompactHeader>
    where
        Self: 'a;

    fn relocatable(&self) -> Self::RelocIter<'_> {
        self.iter()
    }

    unsafe fn move_object(&self, obj: &Capability, disp: isize) -> Capability {
        crate::bump::BumpHeap::move_object(self, obj, disp)
    }

    fn set_last_object(&self, obj: Option<&Capability>) {
        crate::bump::BumpHeap::set_last_object(self, obj)
    }

    fn begin_collection(&self) {
        self.start_gc()
    }

    fn end_collection(&self) {
        self.end_gc()
    }
}

/// What a collection found and did.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectStats {
    /// Objects reached from the roots.
    pub visited: u64,
    /// Unreachable objects reclaimed (overwritten or truncated away).
    pub dead: u64,
    /// Live objects that were relocated.
    pub moved: u64,
}

struct CollectorState {
    roots: Roots,
    marker: Marker<AlwaysMark>,
}

/// Single-threaded stop-the-world mark/compact collector.
pub struct MarkCompact<'h, Heap> {
    heap: &'h Heap,
    /// Serializes collections; also owns the root set and mark stack.
    state: Mutex<CollectorState>,
}

impl<'h, Heap: CompactableHeap> MarkCompact<'h, Heap> {
    pub fn new(heap: &'h Heap) -> Self {
        let mut roots = Roots::new();
        roots.register_global_roots();
        Self {
            heap,
            state: Mutex::new(CollectorState {
                roots,
                marker: Marker::new(),
            }),
        }
    }

    /// Register an extra region to scan for roots on every collection.
    pub fn add_permanent_root_range(&self, range: Capability) {
        self.state.lock().unwrap().roots.add_permanent_range(range);
    }

    /// Run a full collection cycle.
    pub fn collect(&self) -> CollectStats {
        // Spill callee-saved registers into this frame so any pointer
        // that only lived in a register is visible to the stack scan.
        world::with_spilled_registers(|| self.collect_inner())
    }

    fn collect_inner(&self) -> CollectStats {
        let trace_span = tracing::span!(Level::DEBUG, "gc::compact");
        let _span_enter = trace_span.enter();

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.marker.reset();
        state.roots.clear_temporary_roots();
        // fence out allocation first: once we hold the heap's collection
        // locks no mutator can be suspended while holding them
        self.heap.begin_collection();
        state.roots.stop_the_world();
        // stacks are scanned only for threads that registered as
        // mutators; everyone else promised not to keep heap pointers
        // in automatic storage across a collection
        if world::current_thread_registered() {
            state.roots.add_thread(world::current_stack_region());
        }
        let roots = &mut state.roots;
        world::for_each_stopped_stack(|stack| roots.add_thread(stack));

        state.marker.mark_roots(self.heap, &mut state.roots);
        state.marker.trace(self.heap);
        let visited = state.marker.visited();
        tracing::event!(Level::DEBUG, visited, "mark complete");

        self.calculate_displacements();
        let (live, dead) = self.update_pointers(&state.roots);
        debug_assert_eq!(visited, live, "mark and fixup disagree on liveness");
        let moved = self.move_objects();
        tracing::event!(Level::DEBUG, live, dead, moved, "compaction complete");

        self.heap.end_collection();
        state.roots.start_the_world();
        CollectStats {
            visited,
            dead,
            moved,
        }
    }

    /// Walk relocatable allocations in address order, maintaining the
    /// highest byte the packed heap has reached. A live object found
    /// above that point is scheduled to move down onto it.
    fn calculate_displacements(&self) {
        let mut last_end = 0usize;
        for alloc in self.heap.relocatable() {
            let header_base = alloc.header.as_ptr() as usize;
            if last_end == 0 {
                last_end = header_base;
            }
            // safety: world stopped, collector is the only mutator of
            // headers
            unsafe {
                let h = alloc.header.as_ptr();
                if !(*h).is_visited() {
                    continue;
                }
                (*h).displacement = 0;
                if header_base > last_end {
                    (*h).displacement = last_end as i64 - header_base as i64;
                }
            }
            last_end = alloc.object.base() + alloc.object.length();
        }
    }

    /// Rewrite every root slot and every interior pointer whose target
    /// has a pending displacement. Must run before anything moves.
    fn update_pointers(&self, roots: &Roots) -> (u64, u64) {
        for root in roots.iter() {
            let Some(target) = self.heap.object_for_allocation(root.value) else {
                continue;
            };
            // safety: world stopped; root slots were discovered in
            // writable memory
            unsafe {
                let h = target.header.as_ptr();
                debug_assert!((*h).is_visited(), "root points at untraced object");
                let disp = (*h).displacement;
                if disp != 0 {
                    (root.slot as *mut usize).write(root.value.wrapping_add_signed(disp as isize));
                }
            }
        }

        let mut live = 0u64;
        let mut dead = 0u64;
        for alloc in self.heap.allocations() {
            // safety: as above
            unsafe {
                let h = alloc.header.as_ptr();
                if !(*h).is_visited() {
                    dead += 1;
                    continue;
                }
                live += 1;
                if !(*h).contains_pointers() {
                    continue;
                }
                let base = alloc.object.base();
                let words = alloc.object.length() / std::mem::size_of::<usize>();
                for i in 0..words {
                    let slot = (base + i * std::mem::size_of::<usize>()) as *mut usize;
                    let value = slot.read();
                    if !Capability::from_word(value).is_valid() {
                        continue;
                    }
                    let Some(pointee) = self.heap.object_for_allocation(value) else {
                        continue;
                    };
                    let disp = (*pointee.header.as_ptr()).displacement;
                    if disp != 0 {
                        slot.write(value.wrapping_add_signed(disp as isize));
                    }
                }
            }
        }
        (live, dead)
    }

    /// Slide everything with a pending displacement down, reset colors
    /// for the next cycle, and reclaim the tail of the heap.
    fn move_objects(&self) -> u64 {
        let mut moved = 0u64;
        let mut last: Option<Capability> = None;
        for alloc in self.heap.relocatable() {
            // safety: world stopped
            unsafe {
                let h = alloc.header.as_ptr();
                if !(*h).is_visited() {
                    debug_assert!((*h).is_unmarked());
                    continue;
                }
                (*h).reset();
                let disp = (*h).displacement;
                if disp != 0 {
                    let new_obj = self.heap.move_object(&alloc.object, disp as isize);
                    moved += 1;
                    last = Some(new_obj);
                } else {
                    last = Some(alloc.object);
                }
            }
        }
        self.heap.set_last_object(last.as_ref());
        // non-relocatable (large) objects were never visited by the loop
        // above; give them their color back too
        for alloc in self.heap.allocations() {
            // safety: world stopped
            unsafe {
                let h = alloc.header.as_ptr();
                if (*h).is_visited() {
                    (*h).reset();
                }
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bump::BumpHeap;

    const _: () = assert!(std::mem::size_of::<CompactHeader>() == 16);

    // a root slot the collector can find without any stack scanning
    fn rooted_heap() -> (BumpHeap<CompactHeader>, Box<[usize; 4]>) {
        let heap = BumpHeap::create(1 << 20).unwrap();
        let slots = Box::new([0usize; 4]);
        (heap, slots)
    }

    fn collector_for<'h>(
        heap: &'h BumpHeap<CompactHeader>,
        slots: &[usize; 4],
    ) -> MarkCompact<'h, BumpHeap<CompactHeader>> {
        let gc = MarkCompact::new(heap);
        gc.add_permanent_root_range(Capability::from_raw_parts(
            slots.as_ptr() as usize,
            std::mem::size_of_val(slots),
        ));
        gc
    }

    #[test]
    fn keeps_rooted_objects_and_packs_them() {
        let (heap, mut slots) = rooted_heap();
        let gc = collector_for(&heap, &slots);

        // three objects; drop the middle one
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let c = heap.alloc(32).unwrap();
        unsafe {
            (a.base() as *mut u64).write(0xaaaa);
            (b.base() as *mut u64).write(0xbbbb);
            (c.base() as *mut u64).write(0xcccc);
        }
        slots[0] = a.base();
        slots[1] = c.base();

        let stats = gc.collect();
        assert_eq!(stats.visited, 2);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.moved, 1);
        // root slots were rewritten to the packed locations
        let a2 = slots[0];
        let c2 = slots[1];
        assert_eq!(a2, a.base(), "first object had nowhere to move");
        assert!(c2 < c.base());
        unsafe {
            assert_eq!((a2 as *const u64).read(), 0xaaaa);
            assert_eq!((c2 as *const u64).read(), 0xcccc);
        }
    }

    #[test]
    fn interior_pointers_are_updated() {
        let (heap, mut slots) = rooted_heap();
        let gc = collector_for(&heap, &slots);

        // node -> payload, with a dead object between them; the payload
        // sits at the bottom so only the node relocates
        let payload = heap.alloc(48).unwrap();
        let _dead = heap.alloc(256).unwrap();
        let node = heap.alloc(32).unwrap();
        unsafe {
            (payload.base() as *mut u64).write(0x5eed);
            (node.base() as *mut usize).write(payload.base());
        }
        slots[0] = node.base();

        let stats = gc.collect();
        assert_eq!(stats.visited, 2);
        assert_eq!(stats.dead, 1);
        let node2 = slots[0];
        assert!(node2 < node.base());
        unsafe {
            let payload2 = (node2 as *const usize).read();
            assert_eq!(payload2, payload.base());
            assert_eq!((payload2 as *const u64).read(), 0x5eed);
        }
    }

    #[test]
    fn unreachable_heap_is_fully_reclaimed() {
        let (heap, slots) = rooted_heap();
        let gc = collector_for(&heap, &slots);
        for _ in 0..64 {
            heap.alloc(64).unwrap();
        }
        let stats = gc.collect();
        assert_eq!(stats.visited, 0);
        assert_eq!(stats.dead, 64);
        // frontier truncated to empty; the next allocation starts over
        assert_eq!(heap.live_start_bits(), 0);
        let fresh = heap.alloc(16).unwrap();
        let first = heap.iter().next().unwrap();
        assert_eq!(first.object.base(), fresh.base());
    }
}
