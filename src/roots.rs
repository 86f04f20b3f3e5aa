//! Root tracking.
//!
//! A *root range* is a region of non-heap memory that may contain
//! pointers into the managed heap: writable image segments, thread
//! stacks, anything registered explicitly. A *root* is one concrete
//! `(slot, value)` pair found by scanning a range. Ranges and roots come
//! in permanent and temporary flavors; temporary ones (stacks) are
//! rebuilt every collection.
//!
//! Everything here is backed by [`PageVec`] so the collector's own
//! bookkeeping never lands in the heap it is scanning.

use crate::cap::Capability;
use crate::page::PageVec;
use crate::world;

/// A location that held a managed pointer at collection start, plus the
/// snapshot of its value.
#[derive(Clone, Copy, Debug)]
pub struct Root {
    /// Address of the slot itself (so the compactor can rewrite it).
    pub slot: usize,
    /// The pointer value the slot held when scanned.
    pub value: usize,
}

pub struct Roots {
    /// Ranges that persist for the process lifetime (writable globals).
    permanent_ranges: PageVec<Capability>,
    /// Ranges rebuilt each cycle (stacks).
    temporary_ranges: PageVec<Capability>,
    permanent_roots: PageVec<Root>,
    temporary_roots: PageVec<Root>,
    /// Roots seeded once from read-only segments; the permanent vector is
    /// truncated back to this length before each re-scan so repeated
    /// collections don't accumulate duplicates.
    seeded_permanent: usize,
}

impl Roots {
    pub fn new() -> Self {
        Self {
            permanent_ranges: PageVec::with_capacity(64),
            temporary_ranges: PageVec::with_capacity(64),
            permanent_roots: PageVec::with_capacity(4096),
            temporary_roots: PageVec::with_capacity(4096),
            seeded_permanent: 0,
        }
    }

    /// Scan `range` and push every plausible pointer-valued slot.
    fn add_range_to_roots(roots: &mut PageVec<Root>, range: &Capability) {
        let word = std::mem::size_of::<usize>();
        let start = (range.base() + word - 1) & !(word - 1);
        let end = range.base() + range.length();
        let mut addr = start;
        while addr + word <= end {
            // safety: the range was registered as readable memory
            let value = unsafe { (addr as *const usize).read_volatile() };
            if Capability::from_word(value).is_valid() {
                roots.push(Root { slot: addr, value });
            }
            addr += word;
        }
    }

    /// Enumerate loaded image segments: writable ones become permanent
    /// ranges (pointers may appear there at any time); read-only ones are
    /// scanned once right now.
    pub fn register_global_roots(&mut self) {
        unsafe extern "C" fn callback(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut libc::c_void,
        ) -> libc::c_int {
            let roots = &mut *(data as *mut Roots);
            let info = &*info;
            for i in 0..info.dlpi_phnum {
                let phdr = &*info.dlpi_phdr.add(i as usize);
                if phdr.p_type != libc::PT_LOAD {
                    continue;
                }
                let addr = info.dlpi_addr as usize + phdr.p_vaddr as usize;
                let len = phdr.p_memsz as usize;
                if len == 0 {
                    continue;
                }
                let segment = Capability::from_raw_parts(addr, len);
                if phdr.p_flags & libc::PF_W != 0 {
                    roots.permanent_ranges.push(segment);
                } else {
                    Roots::add_range_to_roots(&mut roots.permanent_roots, &segment);
                }
            }
            0
        }
        // safety: the callback only reads mapped segments and writes self
        unsafe {
            libc::dl_iterate_phdr(Some(callback), self as *mut Roots as *mut libc::c_void);
        }
        self.seeded_permanent = self.permanent_roots.len();
    }

    /// Register a thread's stack as a temporary range.
    pub fn add_thread(&mut self, stack: Capability) {
        self.temporary_ranges.push(stack);
    }

    /// Register an arbitrary region to scan permanently.
    pub fn add_permanent_range(&mut self, range: Capability) {
        self.permanent_ranges.push(range);
    }

    /// Materialize roots from every registered range.
    pub fn collect_roots_from_ranges(&mut self) {
        // re-derive the permanent roots from the permanent ranges on top
        // of the seeded (read-only) ones
        while self.permanent_roots.len() > self.seeded_permanent {
            let _ = self.permanent_roots.pop();
        }
        for range in self.permanent_ranges.iter() {
            Self::add_range_to_roots(&mut self.permanent_roots, range);
        }
        for range in self.temporary_ranges.iter() {
            Self::add_range_to_roots(&mut self.temporary_roots, range);
        }
    }

    /// Drop the temporary roots and ranges and hand their pages back.
    /// Run at the start of each collection.
    pub fn clear_temporary_roots(&mut self) {
        self.temporary_roots.clear_and_release();
        self.temporary_ranges.clear_and_release();
    }

    /// Temporary roots first, then permanent ones.
    pub fn iter(&self) -> impl Iterator<Item = &Root> {
        self.temporary_roots.iter().chain(self.permanent_roots.iter())
    }

    /// Suspend every other registered mutator thread.
    pub fn stop_the_world(&self) {
        world::stop_the_world();
    }

    /// Resume the world after collection.
    pub fn start_the_world(&self) {
        world::start_the_world();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_registered_range() {
        let mut roots = Roots::new();
        let target: Box<u64> = Box::new(7);
        let target_addr = &*target as *const u64 as usize;
        // a fake "global" region holding one pointer and some noise
        let slots: Vec<usize> = vec![0, target_addr, 3, usize::MAX & !7];
        let range = Capability::from_raw_parts(
            slots.as_ptr() as usize,
            slots.len() * std::mem::size_of::<usize>(),
        );
        roots.add_thread(range);
        roots.collect_roots_from_ranges();
        let found: Vec<_> = roots.iter().map(|r| r.value).collect();
        assert!(found.contains(&target_addr));
        // null and misaligned words are filtered
        assert!(!found.contains(&0));
        assert!(!found.contains(&3));
    }

    #[test]
    fn temporary_roots_reset() {
        let mut roots = Roots::new();
        let slots: Vec<usize> = vec![8, 16, 24];
        let range = Capability::from_raw_parts(
            slots.as_ptr() as usize,
            slots.len() * std::mem::size_of::<usize>(),
        );
        roots.add_thread(range);
        roots.collect_roots_from_ranges();
        assert_eq!(roots.iter().count(), 3);
        roots.clear_temporary_roots();
        assert_eq!(roots.iter().count(), 0);
        // re-collecting with no ranges finds nothing
        roots.collect_roots_from_ranges();
        assert_eq!(roots.iter().count(), 0);
    }

    #[test]
    fn global_registration_finds_writable_segments() {
        use std::sync::atomic::AtomicUsize;
        // interior mutability keeps this in a writable segment
        static SOME_GLOBAL: AtomicUsize = AtomicUsize::new(0);
        let mut roots = Roots::new();
        roots.register_global_roots();
        // the data segment of the test binary must be covered by some
        // permanent range
        let addr = &SOME_GLOBAL as *const _ as usize;
        assert!(roots.permanent_ranges.iter().any(|r| r.contains_addr(addr)));
    }
}
