//! Page-granularity virtual memory provider.
//!
//! Thin wrapper over anonymous `mmap`: chunk-aligned mappings for the slab
//! allocator, plain mappings for GC-private storage, `madvise` release
//! hints for folios whose contents are dead, and [`PageVec`], a vector
//! backed directly by pages so collector bookkeeping never goes through
//! the allocator it is collecting.

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::config::PAGE_SIZE;
use crate::util::roundto;

/// Mapping failure, carrying the OS error. `alloc` paths convert this to a
/// null return without mutating any allocator state.
#[derive(Debug, Error)]
#[error("page mapping failed: {0}")]
pub struct MapError(#[from] io::Error);

/// Process-wide count of release hints issued. Diagnostic only; tests use
/// it to observe folio-empty transitions.
pub static RELEASE_HINTS: AtomicU64 = AtomicU64::new(0);

/// Map `len` bytes of zeroed anonymous memory with no particular alignment
/// beyond the page size.
pub fn map_pages(len: usize) -> Result<NonNull<u8>, MapError> {
    let len = roundto(len, PAGE_SIZE);
    // safety: anonymous mapping, no fd, checked result
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { NonNull::new_unchecked(p as *mut u8) })
}

/// Map `len` bytes aligned to `1 << align_bits`.
///
/// Portable over-map-and-trim: MAP_ALIGNED is not available everywhere, so
/// we map `len + align`, then unmap the misaligned head and tail.
pub fn map_chunk_aligned(len: usize, align_bits: usize) -> Result<NonNull<u8>, MapError> {
    let len = roundto(len, PAGE_SIZE);
    let align = 1usize << align_bits;
    debug_assert!(align >= PAGE_SIZE);
    let over = len + align;
    // safety: anonymous mapping, no fd, checked result
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            over,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    let raw = p as usize;
    let aligned = roundto(raw, align);
    let head = aligned - raw;
    let tail = over - len - head;
    // safety: trimming subranges of the mapping we just created
    unsafe {
        if head != 0 {
            libc::munmap(raw as *mut libc::c_void, head);
        }
        if tail != 0 {
            libc::munmap((aligned + len) as *mut libc::c_void, tail);
        }
    }
    Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

/// Map a huge, lazily-populated region. Used for the chunk index, which is
/// virtually enormous but relies on demand-paged zero fill so that
/// unwritten entries read as null without committing physical memory.
pub fn map_lazy(len: usize) -> Result<NonNull<u8>, MapError> {
    // MAP_NORESERVE: we intend to touch a tiny fraction of this
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { NonNull::new_unchecked(p as *mut u8) })
}

/// Unmap a region previously returned by one of the map functions.
///
/// # Safety
/// `ptr..ptr+len` must be a live mapping created by this module and must
/// not be referenced afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    let len = roundto(len, PAGE_SIZE);
    libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
}

/// Tell the OS the physical backing of `ptr..ptr+len` can be reclaimed;
/// the range stays mapped and reads as zeroes once reclaimed.
///
/// # Safety
/// The range must lie within a live mapping and contain no live data.
pub unsafe fn hint_release(ptr: *mut u8, len: usize) {
    debug_assert!(ptr as usize % PAGE_SIZE == 0);
    let len = roundto(len, PAGE_SIZE);
    #[cfg(target_os = "linux")]
    let advice = libc::MADV_FREE;
    #[cfg(not(target_os = "linux"))]
    let advice = libc::MADV_DONTNEED;
    if libc::madvise(ptr as *mut libc::c_void, len, advice) != 0 {
        // MADV_FREE needs 4.5+; fall back for older kernels
        libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    }
    RELEASE_HINTS.fetch_add(1, Ordering::Relaxed);
}

/// A growable array backed directly by page mappings.
///
/// The collector's root vectors and mark stack must not be allocated from
/// the heap being collected, and should not show up in conservative scans
/// of that heap either. Backing them straight with pages keeps them out of
/// both.
pub struct PageVec<T> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    _marker: PhantomData<T>,
}

// safety: PageVec owns its mapping exclusively
unsafe impl<T: Send> Send for PageVec<T> {}

impl<T> PageVec<T> {
    /// Reserve space for at least `cap` items.
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        let bytes = roundto(cap * std::mem::size_of::<T>(), PAGE_SIZE);
        let ptr = map_pages(bytes).expect("failed to map PageVec storage");
        Self {
            ptr: ptr.cast(),
            len: 0,
            cap: bytes / std::mem::size_of::<T>(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        if self.len == self.cap {
            self.grow();
        }
        // safety: len < cap, slot is within our mapping and uninitialized
        unsafe {
            self.ptr.as_ptr().add(self.len).write(value);
        }
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // safety: slot len is initialized, and we just moved it out of range
        Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
    }

    fn grow(&mut self) {
        let new_cap = self.cap * 2;
        let new_bytes = roundto(new_cap * std::mem::size_of::<T>(), PAGE_SIZE);
        let new_ptr: NonNull<T> = map_pages(new_bytes)
            .expect("failed to grow PageVec storage")
            .cast();
        // safety: disjoint mappings, len items initialized in the old one
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
            unmap(self.ptr.cast(), self.cap * std::mem::size_of::<T>());
        }
        self.ptr = new_ptr;
        self.cap = new_bytes / std::mem::size_of::<T>();
    }

    pub fn as_slice(&self) -> &[T] {
        // safety: first len items are initialized
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // safety: first len items are initialized
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Drop all items but keep the mapping.
    pub fn clear(&mut self) {
        // safety: dropping exactly the initialized prefix
        unsafe {
            std::ptr::drop_in_place(self.as_mut_slice() as *mut [T]);
        }
        self.len = 0;
    }

    /// Clear the vector and hint-release its pages back to the OS.
    pub fn clear_and_release(&mut self) {
        self.clear();
        // safety: no live items remain in the mapping
        unsafe {
            hint_release(
                self.ptr.as_ptr() as *mut u8,
                self.cap * std::mem::size_of::<T>(),
            );
        }
    }
}

impl<T> Drop for PageVec<T> {
    fn drop(&mut self) {
        self.clear();
        // safety: unmapping our own storage on the way out
        unsafe {
            unmap(self.ptr.cast(), self.cap * std::mem::size_of::<T>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CHUNK_SIZE, CHUNK_SIZE_BITS};

    #[test]
    fn chunk_aligned_mapping() {
        let p = map_chunk_aligned(CHUNK_SIZE, CHUNK_SIZE_BITS).unwrap();
        assert_eq!(p.as_ptr() as usize % CHUNK_SIZE, 0);
        // mapped memory reads as zero
        unsafe {
            assert_eq!(*p.as_ptr(), 0);
            assert_eq!(*p.as_ptr().add(CHUNK_SIZE - 1), 0);
            unmap(p, CHUNK_SIZE);
        }
    }

    #[test]
    fn release_hint_counts() {
        let p = map_pages(PAGE_SIZE * 4).unwrap();
        let before = RELEASE_HINTS.load(Ordering::Relaxed);
        unsafe {
            hint_release(p.as_ptr(), PAGE_SIZE * 4);
        }
        assert!(RELEASE_HINTS.load(Ordering::Relaxed) > before);
        unsafe { unmap(p, PAGE_SIZE * 4) };
    }

    #[test]
    fn pagevec_push_grow() {
        let mut v: PageVec<usize> = PageVec::with_capacity(4);
        for i in 0..10_000 {
            v.push(i);
        }
        assert_eq!(v.len(), 10_000);
        assert!(v.as_slice().iter().enumerate().all(|(i, &x)| i == x));
        assert_eq!(v.pop(), Some(9999));
        v.clear_and_release();
        assert!(v.is_empty());
        v.push(42);
        assert_eq!(v.as_slice(), &[42]);
    }
}
