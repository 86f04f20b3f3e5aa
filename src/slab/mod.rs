//! Size-segregated slab allocator.
//!
//! Arbitrary-sized requests are routed to a fixed family of size classes
//! (buckets, see [`crate::bucket`]); each bucket is served by a linked
//! list of 2 MiB chunk allocators. Small and medium chunks subdivide into
//! *folios* (the least common multiple of the page size and class size, so
//! no allocation straddles a page unnecessarily) and keep one doubly
//! linked folio list per possible free count, so allocation can always
//! pick the most-full folio that still has space. Large chunks hold one
//! slot per class-sized region. Anything over a quarter chunk takes the
//! huge path: a fresh page mapping described by a small out-of-line
//! record.
//!
//! A sparse chunk index maps `addr >> CHUNK_SIZE_BITS` to the owning
//! chunk, which is what lets `free` and the collector resolve any interior
//! pointer without locks. The bucket-list heads are maintained with CAS
//! publication loops; per-chunk metadata sits behind a spinlock whose
//! critical sections touch only a few fields.
//!
//! The per-allocation header type `H` is stored as a dense array in the
//! chunk header, never contiguous with user data; with `H = ()` the array
//! vanishes and the allocator carries no per-object overhead.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use tracing::Level;

use crate::bitset::{words_for_bits, BitsRef};
use crate::bucket::{bucket_for_size, bucket_size, FIXED_BUCKETS, LARGEST_MEDIUM_BUCKET};
use crate::cap::Capability;
use crate::config::{ADDRESS_SPACE_SIZE_BITS, CHUNK_SIZE, CHUNK_SIZE_BITS, PAGE_SIZE};
use crate::lock::Spinlock;
use crate::loom_testing::*;
use crate::mark::{Allocation, IterableHeap, TraceHeap};
use crate::page;
use crate::util::{_debug_hexdump, divroundup, gcd, roundto, UsizePtr};

/// Iteration pulls this many live slots out of a chunk per lock
/// acquisition.
const ITER_BATCH: usize = 64;

/// Marker for a folio index that is not present in a list.
const FOLIO_NONE: u16 = 0xffff;

// ---------------------------------------------------------------------------
// chunk index

/// What an address resolves to, encoded in the low bits of an index entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkKind {
    Slab = 0b01,
    Large = 0b10,
    Huge = 0b11,
}

const ENTRY_KIND_MASK: usize = 0b11;

const INDEX_ENTRIES: usize = 1 << (ADDRESS_SPACE_SIZE_BITS - CHUNK_SIZE_BITS);

/// Sparse map from chunk id to owning allocator.
///
/// The array is virtually `2^(address_bits - chunk_bits)` entries (1 GiB
/// of address space on the default configuration) but is mapped lazily:
/// untouched entries are demand-zeroed by the VM system and read as null,
/// so only chunks that actually exist cost physical memory.
///
/// Entries here are `std::sync::atomic` even under loom: the whole point
/// of the structure is that unwritten entries *are* zero without anyone
/// having constructed them, which a modeled atomic cannot express.
pub(crate) struct ChunkIndex {
    entries: NonNull<std::sync::atomic::AtomicUsize>,
}

// safety: the index owns its mapping; entries are only accessed atomically
unsafe impl Send for ChunkIndex {}
unsafe impl Sync for ChunkIndex {}

impl ChunkIndex {
    fn create() -> Result<Self, page::MapError> {
        let bytes = INDEX_ENTRIES * mem::size_of::<usize>();
        let entries = page::map_lazy(bytes)?;
        Ok(Self {
            entries: entries.cast(),
        })
    }

    /// The index of a virtual address: discard the unused high bits, then
    /// the offset within the chunk.
    fn index_for_vaddr(addr: usize) -> usize {
        let word_bits = usize::BITS as usize;
        let a = (addr << (word_bits - ADDRESS_SPACE_SIZE_BITS)) >> (word_bits - ADDRESS_SPACE_SIZE_BITS);
        a >> CHUNK_SIZE_BITS
    }

    fn entry(&self, addr: usize) -> &std::sync::atomic::AtomicUsize {
        // safety: index_for_vaddr cannot exceed INDEX_ENTRIES by
        // construction, and the whole range is mapped
        unsafe { &*self.entries.as_ptr().add(Self::index_for_vaddr(addr)) }
    }

    /// Resolve an address to its owning allocator, or `None`.
    pub(crate) fn lookup(&self, addr: usize) -> Option<(NonNull<u8>, ChunkKind)> {
        // order: acquire pairs with the release in `set`, so a reader that
        // observes the entry also observes the chunk's initialized header
        let e = self.entry(addr).load(Ordering::Acquire);
        if e == 0 {
            return None;
        }
        let kind = match e & ENTRY_KIND_MASK {
            0b01 => ChunkKind::Slab,
            0b10 => ChunkKind::Large,
            0b11 => ChunkKind::Huge,
            _ => unreachable!(),
        };
        // safety: non-null by the check above
        Some((
            unsafe { NonNull::new_unchecked((e & !ENTRY_KIND_MASK) as *mut u8) },
            kind,
        ))
    }

    fn set(&self, addr: usize, owner: *mut u8, kind: ChunkKind) {
        debug_assert!(owner as usize & ENTRY_KIND_MASK == 0);
        debug_assert!(self.entry(addr).load(Ordering::Relaxed) == 0);
        self.entry(addr)
            .store(owner as usize | kind as usize, Ordering::Release);
    }

    fn clear(&self, addr: usize) {
        self.entry(addr).store(0, Ordering::Release);
    }
}

impl Drop for ChunkIndex {
    fn drop(&mut self) {
        // safety: unmapping our own lazy mapping
        unsafe {
            page::unmap(self.entries.cast(), INDEX_ENTRIES * mem::size_of::<usize>());
        }
    }
}

// ---------------------------------------------------------------------------
// chunk headers

/// Fields shared by every chunk allocator, at offset 0 of the chunk.
#[repr(C)]
struct ChunkCommon {
    /// Next chunk in this bucket's allocation list.
    next: AtomicUsize,
    /// Chain of every chunk this heap ever created, for teardown.
    next_all: AtomicUsize,
    /// 1 while the chunk is (or is about to be) linked into its bucket
    /// list. Cleared by the detacher; checked on free so a stranded chunk
    /// gets pushed back once it has space again.
    in_list: AtomicU32,
    bucket: u32,
    alloc_size: u32,
}

/// Sentinel bucket for the internal record chunks of the huge path.
const RECORD_BUCKET: u32 = u32::MAX;

/// Folio metadata. Folios with equal free counts form doubly linked
/// lists; the links are indices into the chunk's folio array so they fit
/// in 16 bits on any architecture.
#[repr(C)]
struct FolioMeta {
    prev: u16,
    next: u16,
    /// Number of free slots in this folio (0..=allocs_per_folio).
    free_count: u16,
}

/// Header of a small/medium chunk. The fixed part is followed, at offsets
/// computed during init, by: the free-list head array
/// (`allocs_per_folio + 1` entries), the folio metadata array, the
/// per-folio allocated-bits words, and the per-slot header array (absent
/// when the header type is zero sized).
#[repr(C)]
struct SlabChunkHdr {
    common: ChunkCommon,
    /// Guards everything below plus the folio lists and bitmaps.
    lock: Spinlock,
    /// Read lock-free by `full()`.
    free_allocs_total: AtomicU32,
    folio_size: u32,
    allocs_per_folio: u16,
    folios_per_chunk: u16,
    bitmap_words_per_folio: u16,
    /// Conservative hint: no list with a smaller (non-zero) index than
    /// this is non-empty. The most-full folio with space is always at or
    /// after it.
    free_head: u16,
    /// Slots overlapped by this metadata; they are permanently allocated.
    reserved_slots: u32,
    free_lists_off: u32,
    folios_off: u32,
    bitmap_off: u32,
    headers_off: u32,
    header_size: u32,
}

/// Header of a large chunk: one slot per class-sized region, a single
/// bitmap, no folio subdivision.
#[repr(C)]
struct LargeChunkHdr {
    common: ChunkCommon,
    lock: Spinlock,
    free_allocs_total: AtomicU32,
    allocs_per_chunk: u16,
    bitmap_words: u16,
    reserved_slots: u16,
    _pad: u16,
    bitmap_off: u32,
    headers_off: u32,
    header_size: u32,
}

// fixed headers must leave room for their trailing arrays
const _: () = assert!(mem::size_of::<SlabChunkHdr>() < PAGE_SIZE);
const _: () = assert!(mem::size_of::<LargeChunkHdr>() < PAGE_SIZE);

#[derive(Clone, Copy)]
struct SlabFreeOutcome {
    /// The chunk is not currently on its bucket list; the caller should
    /// push it back now that it has free space.
    needs_relink: bool,
}

// --- slab chunk operations -------------------------------------------------
//
// All of these take the raw chunk base; the header is at offset 0. Access
// goes through raw pointers so that no Rust reference to the (shared,
// concurrently mutated) header region is ever held across an operation.

unsafe fn slab_free_lists(hdr: *mut SlabChunkHdr) -> *mut u16 {
    (hdr as *mut u8).add((*hdr).free_lists_off as usize) as *mut u16
}

unsafe fn slab_folio_meta(hdr: *mut SlabChunkHdr, folio: usize) -> *mut FolioMeta {
    ((hdr as *mut u8).add((*hdr).folios_off as usize) as *mut FolioMeta).add(folio)
}

unsafe fn slab_folio_bits<'a>(hdr: *mut SlabChunkHdr, folio: usize) -> BitsRef<'a> {
    let wpf = (*hdr).bitmap_words_per_folio as usize;
    let words = (hdr as *mut u8)
        .add((*hdr).bitmap_off as usize + folio * wpf * mem::size_of::<AtomicU64>())
        as *const AtomicU64;
    BitsRef::new(
        std::slice::from_raw_parts(words, wpf),
        (*hdr).allocs_per_folio as usize,
    )
}

unsafe fn slab_header_at<H>(base: *mut u8, slot: usize) -> NonNull<H> {
    if mem::size_of::<H>() == 0 {
        return NonNull::dangling();
    }
    let hdr = base as *mut SlabChunkHdr;
    NonNull::new_unchecked(
        base.add((*hdr).headers_off as usize + slot * (*hdr).header_size as usize) as *mut H,
    )
}

/// Remove a folio from whichever list currently holds it.
unsafe fn slab_remove_list_entry(hdr: *mut SlabChunkHdr, folio: u16) {
    let meta = slab_folio_meta(hdr, folio as usize);
    let (prev, next, fc) = ((*meta).prev, (*meta).next, (*meta).free_count);
    if prev == FOLIO_NONE {
        *slab_free_lists(hdr).add(fc as usize) = next;
    } else {
        (*slab_folio_meta(hdr, prev as usize)).next = next;
    }
    if next != FOLIO_NONE {
        (*slab_folio_meta(hdr, next as usize)).prev = prev;
    }
}

/// Insert a folio at the head of the list matching its free count.
///
/// Head insertion makes recently freed slots the first to be reallocated
/// (warm-cache reuse). A use-after-free-hardened build would insert at
/// the tail instead.
unsafe fn slab_insert_list_entry(hdr: *mut SlabChunkHdr, folio: u16) {
    let meta = slab_folio_meta(hdr, folio as usize);
    let fc = (*meta).free_count as usize;
    let head = *slab_free_lists(hdr).add(fc);
    (*meta).prev = FOLIO_NONE;
    (*meta).next = head;
    if head != FOLIO_NONE {
        (*slab_folio_meta(hdr, head as usize)).prev = folio;
    }
    *slab_free_lists(hdr).add(fc) = folio;
}

/// Lay out and initialize a freshly mapped small/medium chunk.
unsafe fn slab_chunk_init<H>(base: *mut u8, bucket: u32, alloc_size: usize) {
    let folio_size = PAGE_SIZE * alloc_size / gcd(PAGE_SIZE, alloc_size);
    let allocs_per_folio = folio_size / alloc_size;
    let folios_per_chunk = CHUNK_SIZE / folio_size;
    let allocs_per_chunk = allocs_per_folio * folios_per_chunk;
    let wpf = words_for_bits(allocs_per_folio);
    debug_assert!(folios_per_chunk < FOLIO_NONE as usize);
    debug_assert!(allocs_per_folio < FOLIO_NONE as usize);

    let mut off = mem::size_of::<SlabChunkHdr>();
    let free_lists_off = roundto(off, mem::align_of::<u16>());
    off = free_lists_off + (allocs_per_folio + 1) * mem::size_of::<u16>();
    let folios_off = roundto(off, mem::align_of::<FolioMeta>());
    off = folios_off + folios_per_chunk * mem::size_of::<FolioMeta>();
    let bitmap_off = roundto(off, mem::align_of::<AtomicU64>());
    off = bitmap_off + folios_per_chunk * wpf * mem::size_of::<AtomicU64>();
    let headers_off = roundto(off, mem::align_of::<H>().max(1));
    off = headers_off + allocs_per_chunk * mem::size_of::<H>();
    assert!(off < CHUNK_SIZE, "chunk metadata larger than chunk");

    let hdr = base as *mut SlabChunkHdr;
    ptr::write(
        hdr,
        SlabChunkHdr {
            common: ChunkCommon {
                next: AtomicUsize::new(0),
                next_all: AtomicUsize::new(0),
                in_list: AtomicU32::new(0),
                bucket,
                alloc_size: alloc_size as u32,
            },
            lock: Spinlock::new(),
            free_allocs_total: AtomicU32::new(0),
            folio_size: folio_size as u32,
            allocs_per_folio: allocs_per_folio as u16,
            folios_per_chunk: folios_per_chunk as u16,
            bitmap_words_per_folio: wpf as u16,
            free_head: allocs_per_folio as u16,
            reserved_slots: 0,
            free_lists_off: free_lists_off as u32,
            folios_off: folios_off as u32,
            bitmap_off: bitmap_off as u32,
            headers_off: headers_off as u32,
            header_size: mem::size_of::<H>() as u32,
        },
    );

    let lists = slab_free_lists(hdr);
    for i in 0..=allocs_per_folio {
        *lists.add(i) = FOLIO_NONE;
    }
    // The bitmap words need real construction (mmap zero fill is not
    // enough for a modeled atomic under loom).
    let words = (base.add(bitmap_off)) as *mut AtomicU64;
    for w in 0..folios_per_chunk * wpf {
        ptr::write(words.add(w), AtomicU64::new(0));
    }

    // Slots overlapped by the metadata we just laid out are permanently
    // allocated. Folios wholly covered go on list 0; a partially covered
    // folio keeps its remaining capacity; the rest are entirely empty.
    let reserved_slots = divroundup(off, alloc_size);
    (*hdr).reserved_slots = reserved_slots as u32;
    for f in 0..folios_per_chunk {
        let first_slot = f * allocs_per_folio;
        let covered = reserved_slots.saturating_sub(first_slot).min(allocs_per_folio);
        let bits = slab_folio_bits(hdr, f);
        for i in 0..covered {
            bits.set_unsync(i);
        }
        let meta = slab_folio_meta(hdr, f);
        (*meta).free_count = (allocs_per_folio - covered) as u16;
        slab_insert_list_entry(hdr, f as u16);
    }
    (*hdr)
        .free_allocs_total
        .store((allocs_per_chunk - reserved_slots) as u32, Ordering::Relaxed);
    // anchor the hint at the lowest non-empty list
    let mut head = allocs_per_folio as u16;
    for i in 1..=allocs_per_folio {
        if *lists.add(i) != FOLIO_NONE {
            head = i as u16;
            break;
        }
    }
    (*hdr).free_head = head;
}

/// Pick a slot from the most-full folio that still has space, mark it
/// allocated, and return its index. `None` means the chunk is full (which
/// can happen even after a `full()` check, when another thread takes the
/// last slot first).
unsafe fn slab_reserve(base: *mut u8) -> Option<usize> {
    let hdr = base as *mut SlabChunkHdr;
    let apf = (*hdr).allocs_per_folio as usize;
    let _guard = (*hdr).lock.lock();

    // Scan upward from the hint: the lowest-indexed non-empty list holds
    // the folios with the least free space, minimizing internal
    // fragmentation.
    let lists = slab_free_lists(hdr);
    let mut i = ((*hdr).free_head as usize).max(1);
    while *lists.add(i) == FOLIO_NONE {
        i += 1;
        if i > apf {
            return None;
        }
    }
    (*hdr).free_head = i as u16;

    let folio = *lists.add(i);
    let meta = slab_folio_meta(hdr, folio as usize);
    debug_assert!((*meta).free_count as usize == i);
    slab_remove_list_entry(hdr, folio);
    (*meta).free_count -= 1;
    slab_insert_list_entry(hdr, folio);
    if (*meta).free_count >= 1 {
        // the folio's new list is now the lowest that can be non-empty
        (*hdr).free_head = (*meta).free_count;
    }

    let bits = slab_folio_bits(hdr, folio as usize);
    let in_folio = bits.first_zero();
    debug_assert!(in_folio < apf, "folio on a non-empty free list is full");
    // writers all hold the chunk lock, so the unconditional store is safe
    bits.set_unsync(in_folio);
    (*hdr).free_allocs_total.fetch_sub(1, Ordering::Relaxed);
    Some(folio as usize * apf + in_folio)
}

/// Mark a slot free. When the folio becomes entirely empty its physical
/// pages are handed back to the OS.
unsafe fn slab_free_slot(base: *mut u8, slot: usize) -> SlabFreeOutcome {
    let hdr = base as *mut SlabChunkHdr;
    let apf = (*hdr).allocs_per_folio as usize;
    let folio = (slot / apf) as u16;
    let in_folio = slot % apf;
    let _guard = (*hdr).lock.lock();

    let bits = slab_folio_bits(hdr, folio as usize);
    debug_assert!(bits.get(in_folio), "double free of slab slot");
    let meta = slab_folio_meta(hdr, folio as usize);
    slab_remove_list_entry(hdr, folio);
    (*meta).free_count += 1;
    bits.clear_unsync(in_folio);
    slab_insert_list_entry(hdr, folio);
    if (*meta).free_count < (*hdr).free_head {
        (*hdr).free_head = (*meta).free_count;
    }
    (*hdr).free_allocs_total.fetch_add(1, Ordering::Relaxed);

    if (*meta).free_count as usize == apf {
        // entirely free: release the folio's physical backing (the lock is
        // held across this advisory call, which is the one OS call the
        // locking discipline permits)
        let folio_bytes = (*hdr).folio_size as usize;
        page::hint_release(base.add(folio as usize * folio_bytes), folio_bytes);
    }

    // in_list transitions are serialized by this lock (the detacher takes
    // it too), so exactly one party claims the relink
    let needs_relink = (*hdr).common.in_list.load(Ordering::Relaxed) == 0;
    if needs_relink {
        (*hdr).common.in_list.store(1, Ordering::Relaxed);
    }
    SlabFreeOutcome { needs_relink }
}

/// Batch up to `out.len()` live slot indices at or after `start`,
/// skipping the reserved metadata slots. Returns the count written.
unsafe fn slab_collect(base: *mut u8, start: usize, out: &mut [u32]) -> usize {
    let hdr = base as *mut SlabChunkHdr;
    let apf = (*hdr).allocs_per_folio as usize;
    let fpc = (*hdr).folios_per_chunk as usize;
    let _guard = (*hdr).lock.lock();

    let mut written = 0;
    let mut slot = start.max((*hdr).reserved_slots as usize);
    while written < out.len() && slot < apf * fpc {
        let f = slot / apf;
        let in_f = slot % apf;
        let meta = slab_folio_meta(hdr, f);
        if (*meta).free_count as usize == apf {
            slot = (f + 1) * apf;
            continue;
        }
        let bits = slab_folio_bits(hdr, f);
        let mut i = if bits.get(in_f) { in_f } else { bits.one_after(in_f) };
        while i < apf && written < out.len() {
            out[written] = (f * apf + i) as u32;
            written += 1;
            i = bits.one_after(i);
        }
        if written == out.len() {
            break;
        }
        slot = (f + 1) * apf;
    }
    written
}

// --- large chunk operations ------------------------------------------------

unsafe fn large_bits<'a>(hdr: *mut LargeChunkHdr) -> BitsRef<'a> {
    let words = (hdr as *mut u8).add((*hdr).bitmap_off as usize) as *const AtomicU64;
    BitsRef::new(
        std::slice::from_raw_parts(words, (*hdr).bitmap_words as usize),
        (*hdr).allocs_per_chunk as usize,
    )
}

unsafe fn large_header_at<H>(base: *mut u8, slot: usize) -> NonNull<H> {
    if mem::size_of::<H>() == 0 {
        return NonNull::dangling();
    }
    let hdr = base as *mut LargeChunkHdr;
    NonNull::new_unchecked(
        base.add((*hdr).headers_off as usize + slot * (*hdr).header_size as usize) as *mut H,
    )
}

unsafe fn large_chunk_init<H>(base: *mut u8, bucket: u32, alloc_size: usize) {
    let allocs_per_chunk = CHUNK_SIZE / alloc_size;
    let words = words_for_bits(allocs_per_chunk);

    let mut off = mem::size_of::<LargeChunkHdr>();
    let bitmap_off = roundto(off, mem::align_of::<AtomicU64>());
    off = bitmap_off + words * mem::size_of::<AtomicU64>();
    let headers_off = roundto(off, mem::align_of::<H>().max(1));
    off = headers_off + allocs_per_chunk * mem::size_of::<H>();
    assert!(off < alloc_size, "large-chunk metadata larger than one slot");

    let hdr = base as *mut LargeChunkHdr;
    ptr::write(
        hdr,
        LargeChunkHdr {
            common: ChunkCommon {
                next: AtomicUsize::new(0),
                next_all: AtomicUsize::new(0),
                in_list: AtomicU32::new(0),
                bucket,
                alloc_size: alloc_size as u32,
            },
            lock: Spinlock::new(),
            free_allocs_total: AtomicU32::new(0),
            allocs_per_chunk: allocs_per_chunk as u16,
            bitmap_words: words as u16,
            reserved_slots: 0,
            _pad: 0,
            bitmap_off: bitmap_off as u32,
            headers_off: headers_off as u32,
            header_size: mem::size_of::<H>() as u32,
        },
    );
    let word_ptr = base.add(bitmap_off) as *mut AtomicU64;
    for w in 0..words {
        ptr::write(word_ptr.add(w), AtomicU64::new(0));
    }
    // metadata always fits in the first slot
    let reserved = divroundup(off, alloc_size);
    (*hdr).reserved_slots = reserved as u16;
    let bits = large_bits(hdr);
    for i in 0..reserved {
        bits.set_unsync(i);
    }
    (*hdr)
        .free_allocs_total
        .store((allocs_per_chunk - reserved) as u32, Ordering::Relaxed);
}

unsafe fn large_reserve(base: *mut u8) -> Option<usize> {
    let hdr = base as *mut LargeChunkHdr;
    let _guard = (*hdr).lock.lock();
    if (*hdr).free_allocs_total.load(Ordering::Relaxed) == 0 {
        return None;
    }
    let bits = large_bits(hdr);
    let slot = bits.first_zero();
    debug_assert!(slot < (*hdr).allocs_per_chunk as usize);
    bits.set_unsync(slot);
    (*hdr).free_allocs_total.fetch_sub(1, Ordering::Relaxed);
    Some(slot)
}

unsafe fn large_free_slot(base: *mut u8, slot: usize) -> SlabFreeOutcome {
    let hdr = base as *mut LargeChunkHdr;
    let alloc_size = (*hdr).common.alloc_size as usize;
    let _guard = (*hdr).lock.lock();
    let bits = large_bits(hdr);
    debug_assert!(bits.get(slot), "double free of large slot");
    bits.clear_unsync(slot);
    (*hdr).free_allocs_total.fetch_add(1, Ordering::Relaxed);
    // a freed slot is whole pages; always return them
    page::hint_release(base.add(slot * alloc_size), alloc_size);
    // in_list transitions are serialized by this lock (the detacher takes
    // it too), so exactly one party claims the relink
    let needs_relink = (*hdr).common.in_list.load(Ordering::Relaxed) == 0;
    if needs_relink {
        (*hdr).common.in_list.store(1, Ordering::Relaxed);
    }
    SlabFreeOutcome { needs_relink }
}

unsafe fn large_collect(base: *mut u8, start: usize, out: &mut [u32]) -> usize {
    let hdr = base as *mut LargeChunkHdr;
    let apc = (*hdr).allocs_per_chunk as usize;
    let _guard = (*hdr).lock.lock();
    let bits = large_bits(hdr);
    let mut written = 0;
    let start = start.max((*hdr).reserved_slots as usize);
    if start >= apc {
        return 0;
    }
    let mut i = if bits.get(start) { start } else { bits.one_after(start) };
    while i < apc && written < out.len() {
        out[written] = i as u32;
        written += 1;
        i = bits.one_after(i);
    }
    written
}

// ---------------------------------------------------------------------------
// huge allocations

/// Out-of-line descriptor of one directly page-mapped huge allocation.
/// The per-allocation header (if any) trails the fixed part. Records live
/// in dedicated (unregistered) slab chunks.
#[repr(C)]
struct HugeRecord {
    /// Base address of the mapping, 0 while unused. The CAS on this field
    /// orders publication: the mapping is registered in the chunk index
    /// only after the successful exchange, and deregistered before the
    /// pages go away.
    allocation: AtomicUsize,
    size: AtomicUsize,
}

struct HugeRecords {
    /// Head of the chain of record chunks.
    chunks: AtomicUsize,
    record_size: u32,
}

impl HugeRecords {
    fn new<H>() -> Self {
        Self {
            chunks: AtomicUsize::new(0),
            record_size: roundto(
                mem::size_of::<HugeRecord>() + mem::size_of::<H>(),
                mem::align_of::<usize>(),
            ) as u32,
        }
    }

    unsafe fn record_header<H>(rec: *mut HugeRecord) -> NonNull<H> {
        if mem::size_of::<H>() == 0 {
            NonNull::dangling()
        } else {
            NonNull::new_unchecked((rec as *mut u8).add(mem::size_of::<HugeRecord>()) as *mut H)
        }
    }

    /// Grab a record slot, growing the record-chunk chain on demand.
    fn alloc_record(&self) -> Option<*mut HugeRecord> {
        loop {
            // order: acquire so a chunk published by another thread is
            // seen fully initialized
            let mut chunk = self.chunks.load(Ordering::Acquire);
            while chunk != 0 {
                // safety: every entry on this chain is an initialized
                // record chunk that is never unmapped while the heap lives
                unsafe {
                    if let Some(slot) = slab_reserve(chunk as *mut u8) {
                        let rec = (chunk as *mut u8)
                            .add(slot * self.record_size as usize)
                            as *mut HugeRecord;
                        ptr::write(rec, HugeRecord {
                            allocation: AtomicUsize::new(0),
                            size: AtomicUsize::new(0),
                        });
                        ptr::write_bytes(
                            (rec as *mut u8).add(mem::size_of::<HugeRecord>()),
                            0,
                            self.record_size as usize - mem::size_of::<HugeRecord>(),
                        );
                        return Some(rec);
                    }
                    chunk = (*(chunk as *mut SlabChunkHdr)).common.next.load(Ordering::Acquire);
                }
            }
            // every chunk full (or none yet): map a new one and publish it
            let base = page::map_chunk_aligned(CHUNK_SIZE, CHUNK_SIZE_BITS).ok()?;
            // safety: fresh exclusive mapping
            unsafe {
                slab_chunk_init::<()>(base.as_ptr(), RECORD_BUCKET, self.record_size as usize);
            }
            let mut old = self.chunks.load(Ordering::Relaxed);
            loop {
                // safety: we still own the chunk until the CAS succeeds
                unsafe {
                    (*(base.as_ptr() as *mut SlabChunkHdr))
                        .common
                        .next
                        .store(old, Ordering::Relaxed);
                }
                // order: release publishes the initialized chunk header
                match self.chunks.compare_exchange_weak(
                    old,
                    base.as_ptr() as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(x) => old = x,
                }
            }
        }
    }

    /// Return a record slot to its chunk.
    unsafe fn free_record(&self, rec: *mut HugeRecord) {
        let chunk = (rec as usize & !(CHUNK_SIZE - 1)) as *mut u8;
        let slot = (rec as usize - chunk as usize) / self.record_size as usize;
        slab_free_slot(chunk, slot);
    }
}

// ---------------------------------------------------------------------------
// the heap

/// A complete slab heap: bucket lists, chunk index, huge path.
///
/// `H` is the per-allocation header type; `()` means no headers (and no
/// space overhead). The GC instantiates this with its own header to get
/// every hook it needs: interior-pointer resolution, header storage, and
/// exactly-once iteration.
pub struct SlabHeap<H> {
    index: ChunkIndex,
    /// Head of the chunk list for each fixed bucket.
    buckets: [AtomicUsize; FIXED_BUCKETS],
    huge: HugeRecords,
    /// Every chunk ever mapped, for teardown.
    all_chunks: AtomicUsize,
    _marker: PhantomData<H>,
}

// safety: all shared state is protected by atomics and per-chunk locks;
// headers are plain data owned by whoever owns the allocation
unsafe impl<H: Send + Sync> Send for SlabHeap<H> {}
unsafe impl<H: Send + Sync> Sync for SlabHeap<H> {}

impl<H> SlabHeap<H> {
    /// Create an empty heap. Fails only if the chunk index cannot be
    /// mapped.
    pub fn new() -> Result<Self, page::MapError> {
        // headers are addressed with byte offsets; keep them word-sized
        // or smaller in alignment
        const { assert!(mem::align_of::<H>() <= mem::align_of::<usize>()) };
        Ok(Self {
            index: ChunkIndex::create()?,
            buckets: std::array::from_fn(|_| AtomicUsize::new(0)),
            huge: HugeRecords::new::<H>(),
            all_chunks: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    fn is_slab_bucket(bucket: usize) -> bool {
        bucket <= LARGEST_MEDIUM_BUCKET
    }

    /// Map and initialize a chunk for `bucket`, register it in the index,
    /// and thread it onto the teardown chain. Does not publish it to the
    /// bucket list.
    fn create_chunk(&self, bucket: usize) -> Option<NonNull<u8>> {
        let base = match page::map_chunk_aligned(CHUNK_SIZE, CHUNK_SIZE_BITS) {
            Ok(p) => p,
            Err(e) => {
                tracing::event!(Level::WARN, bucket, error = %e, "chunk mapping failed");
                return None;
            }
        };
        let size = bucket_size(bucket);
        // safety: fresh exclusive mapping of CHUNK_SIZE bytes
        unsafe {
            if Self::is_slab_bucket(bucket) {
                slab_chunk_init::<H>(base.as_ptr(), bucket as u32, size);
                self.index.set(base.as_ptr() as usize, base.as_ptr(), ChunkKind::Slab);
            } else {
                large_chunk_init::<H>(base.as_ptr(), bucket as u32, size);
                self.index.set(base.as_ptr() as usize, base.as_ptr(), ChunkKind::Large);
            }
        }
        // thread onto the all-chunks chain (teardown only, never walked
        // on hot paths)
        let mut old = self.all_chunks.load(Ordering::Relaxed);
        loop {
            // safety: chunk is ours until the bucket-list publish below
            unsafe {
                (*(base.as_ptr() as *mut ChunkCommon))
                    .next_all
                    .store(old, Ordering::Relaxed);
            }
            match self.all_chunks.compare_exchange_weak(
                old,
                base.as_ptr() as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
        tracing::event!(Level::TRACE, bucket, ptr = ?UsizePtr::from(base.as_ptr()), "new chunk");
        Some(base)
    }

    /// Push a chunk onto its bucket list head.
    fn push_chunk(&self, bucket: usize, base: *mut u8) {
        let head = &self.buckets[bucket];
        let mut old = head.load(Ordering::Relaxed);
        loop {
            // safety: the common header outlives the heap
            unsafe {
                (*(base as *mut ChunkCommon)).next.store(old, Ordering::Relaxed);
            }
            // order: release publishes the chunk's initialized metadata to
            // any thread that loads it from the bucket head
            match head.compare_exchange_weak(
                old,
                base as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }

    /// Allocate at least `size` bytes. The observable length of the
    /// returned capability is the full bucket size (or the page-rounded
    /// size for huge requests). Returns `None` only for zero-sized
    /// requests and OS mapping failure.
    pub fn alloc(&self, size: usize) -> Option<Capability> {
        let trace_span = tracing::span!(Level::TRACE, "slab::alloc", size);
        let _span_enter = trace_span.enter();

        if size == 0 {
            return None;
        }
        let Some(bucket) = bucket_for_size(size) else {
            return self.alloc_huge(size);
        };
        let is_slab = Self::is_slab_bucket(bucket);
        let class_size = bucket_size(bucket);
        loop {
            // order: acquire pairs with the release publication in
            // push_chunk so the chunk header is visible
            let head = self.buckets[bucket].load(Ordering::Acquire);
            if head == 0 {
                let chunk = self.create_chunk(bucket)?;
                // safety: chunk is initialized and unpublished
                unsafe {
                    (*(chunk.as_ptr() as *mut ChunkCommon))
                        .in_list
                        .store(1, Ordering::Relaxed);
                }
                self.push_chunk(bucket, chunk.as_ptr());
                continue;
            }
            let base = head as *mut u8;
            // safety: anything reachable from a bucket head is an
            // initialized chunk that lives as long as the heap
            unsafe {
                let full = if is_slab {
                    (*(base as *mut SlabChunkHdr)).free_allocs_total.load(Ordering::Relaxed) == 0
                } else {
                    (*(base as *mut LargeChunkHdr)).free_allocs_total.load(Ordering::Relaxed) == 0
                };
                if full {
                    // detach the full chunk so allocation stops queuing
                    // behind it; a later free pushes it back
                    let next = (*(base as *mut ChunkCommon)).next.load(Ordering::Relaxed);
                    if self.buckets[bucket]
                        .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        // Decide the off-list state under the chunk lock,
                        // serialized with frees. A free that landed since
                        // the fullness check saw in_list == 1 and skipped
                        // its relink, so the chunk has space and nobody
                        // else will push it: it goes straight back on the
                        // list (in_list stays 1). Only a still-full chunk
                        // is marked off-list; the eventual free sees the 0
                        // and claims the relink itself.
                        let relink = {
                            let _guard = if is_slab {
                                (*(base as *mut SlabChunkHdr)).lock.lock()
                            } else {
                                (*(base as *mut LargeChunkHdr)).lock.lock()
                            };
                            let total = if is_slab {
                                (*(base as *mut SlabChunkHdr))
                                    .free_allocs_total
                                    .load(Ordering::Relaxed)
                            } else {
                                (*(base as *mut LargeChunkHdr))
                                    .free_allocs_total
                                    .load(Ordering::Relaxed)
                            };
                            if total > 0 {
                                true
                            } else {
                                (*(base as *mut ChunkCommon)).in_list.store(0, Ordering::Relaxed);
                                false
                            }
                        };
                        if relink {
                            self.push_chunk(bucket, base);
                        }
                    }
                    continue;
                }
                let slot = if is_slab {
                    slab_reserve(base)
                } else {
                    large_reserve(base)
                };
                match slot {
                    Some(slot) => {
                        let addr = base as usize + slot * class_size;
                        tracing::event!(
                            Level::TRACE,
                            bucket,
                            ptr = ?UsizePtr(addr),
                        );
                        return Some(Capability::from_raw_parts(addr, class_size));
                    }
                    // lost the race for the last slot
                    None => continue,
                }
            }
        }
    }

    fn alloc_huge(&self, size: usize) -> Option<Capability> {
        let trace_span = tracing::span!(Level::TRACE, "slab::alloc_huge", size);
        let _span_enter = trace_span.enter();

        let rec = self.huge.alloc_record()?;
        let len = roundto(size, PAGE_SIZE);
        // Map whole chunks so no other mapping can ever share a chunk id
        // with this allocation; the accessible length stays page-rounded.
        let map_len = roundto(len, CHUNK_SIZE);
        let base = match page::map_chunk_aligned(map_len, CHUNK_SIZE_BITS) {
            Ok(p) => p,
            Err(e) => {
                tracing::event!(Level::WARN, size, error = %e, "huge mapping failed");
                // safety: the record is ours and unpublished
                unsafe { self.huge.free_record(rec) };
                return None;
            }
        };
        let addr = base.as_ptr() as usize;
        // safety: record is initialized by alloc_record
        unsafe {
            (*rec).size.store(len, Ordering::Relaxed);
            // order: release, so that a lookup that wins the race below
            // sees the size; publication to the index follows the CAS
            let cas = (*rec)
                .allocation
                .compare_exchange(0, addr, Ordering::Release, Ordering::Relaxed);
            debug_assert!(cas.is_ok());
        }
        let mut off = 0;
        while off < map_len {
            self.index.set(addr + off, rec as *mut u8, ChunkKind::Huge);
            off += CHUNK_SIZE;
        }
        tracing::event!(Level::TRACE, len, ptr = ?UsizePtr(addr));
        Some(Capability::from_raw_parts(addr, len))
    }

    /// Free a pointer previously returned by [`alloc`](Self::alloc).
    /// Per-allocation headers are left untouched so a collector can still
    /// inspect them. Freeing a pointer this heap does not own is an
    /// assertion failure in debug builds and undefined otherwise.
    pub fn free(&self, addr: usize) {
        let trace_span = tracing::span!(Level::TRACE, "slab::free", ptr = ?UsizePtr(addr));
        let _span_enter = trace_span.enter();

        let Some((owner, kind)) = self.index.lookup(addr) else {
            debug_assert!(false, "free of unmanaged pointer {:#x}", addr);
            return;
        };
        if tracing::event_enabled!(Level::TRACE) {
            // dump the head of the region while it is still allocated,
            // for chasing use-after-free reports
            if let Some(size) = self.object_size(addr) {
                // safety: the allocation is live until the free below
                if let Ok(dump) = unsafe { _debug_hexdump(addr as *const u8, size.min(32)) } {
                    tracing::event!(Level::TRACE, contents = %dump.trim_end());
                }
            }
        }
        match kind {
            ChunkKind::Slab | ChunkKind::Large => {
                let base = (addr & !(CHUNK_SIZE - 1)) as *mut u8;
                debug_assert_eq!(base, owner.as_ptr());
                // safety: the chunk header is initialized and outlives us
                unsafe {
                    let common = base as *mut ChunkCommon;
                    let class_size = (*common).alloc_size as usize;
                    let slot = (addr - base as usize) / class_size;
                    debug_assert_eq!((addr - base as usize) % class_size, 0);
                    let outcome = match kind {
                        ChunkKind::Slab => {
                            debug_assert!(slot >= (*(base as *mut SlabChunkHdr)).reserved_slots as usize);
                            slab_free_slot(base, slot)
                        }
                        _ => {
                            debug_assert!(slot >= (*(base as *mut LargeChunkHdr)).reserved_slots as usize);
                            large_free_slot(base, slot)
                        }
                    };
                    if outcome.needs_relink {
                        self.push_chunk((*common).bucket as usize, base);
                    }
                }
            }
            ChunkKind::Huge => {
                // safety: index entries of kind Huge always point at a
                // live record
                unsafe { self.free_huge(owner.as_ptr() as *mut HugeRecord) };
            }
        }
    }

    /// Free a huge allocation: deregister, then unmap, then release the
    /// record. A concurrent lookup observes either the mapping (and
    /// succeeds) or null (and fails cleanly), never unmapped memory.
    unsafe fn free_huge(&self, rec: *mut HugeRecord) {
        let addr = (*rec).allocation.load(Ordering::Acquire);
        if addr == 0 {
            debug_assert!(false, "double free of huge allocation");
            return;
        }
        if (*rec)
            .allocation
            .compare_exchange(addr, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // raced with another free; that one owns the teardown
            return;
        }
        let len = (*rec).size.load(Ordering::Relaxed);
        let map_len = roundto(len, CHUNK_SIZE);
        let mut off = 0;
        while off < map_len {
            self.index.clear(addr + off);
            off += CHUNK_SIZE;
        }
        page::unmap(NonNull::new_unchecked(addr as *mut u8), map_len);
        self.huge.free_record(rec);
    }

    /// The fixed class size (or page-rounded huge size) backing `addr`.
    pub fn object_size(&self, addr: usize) -> Option<usize> {
        let (owner, kind) = self.index.lookup(addr)?;
        match kind {
            ChunkKind::Slab | ChunkKind::Large => {
                let base = (addr & !(CHUNK_SIZE - 1)) as *mut u8;
                debug_assert_eq!(base, owner.as_ptr());
                // safety: chunk header outlives the heap
                Some(unsafe { (*(base as *mut ChunkCommon)).alloc_size as usize })
            }
            ChunkKind::Huge => {
                let rec = owner.as_ptr() as *mut HugeRecord;
                // safety: huge entries point at live records
                unsafe {
                    if (*rec).allocation.load(Ordering::Acquire) == 0 {
                        return None;
                    }
                    Some((*rec).size.load(Ordering::Relaxed))
                }
            }
        }
    }

    fn lookup_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        let (owner, kind) = self.index.lookup(addr)?;
        match kind {
            ChunkKind::Slab => {
                let base = (addr & !(CHUNK_SIZE - 1)) as *mut u8;
                // safety: chunk header outlives the heap
                unsafe {
                    let hdr = base as *mut SlabChunkHdr;
                    let class_size = (*hdr).common.alloc_size as usize;
                    let apf = (*hdr).allocs_per_folio as usize;
                    let slot = (addr - base as usize) / class_size;
                    if slot < (*hdr).reserved_slots as usize
                        || slot >= apf * (*hdr).folios_per_chunk as usize
                    {
                        return None;
                    }
                    if !slab_folio_bits(hdr, slot / apf).get(slot % apf) {
                        return None;
                    }
                    Some(Allocation {
                        object: Capability::from_raw_parts(
                            base as usize + slot * class_size,
                            class_size,
                        ),
                        header: slab_header_at(base, slot),
                    })
                }
            }
            ChunkKind::Large => {
                let base = (addr & !(CHUNK_SIZE - 1)) as *mut u8;
                // safety: as above
                unsafe {
                    let hdr = base as *mut LargeChunkHdr;
                    let class_size = (*hdr).common.alloc_size as usize;
                    let slot = (addr - base as usize) / class_size;
                    if slot < (*hdr).reserved_slots as usize
                        || slot >= (*hdr).allocs_per_chunk as usize
                    {
                        return None;
                    }
                    if !large_bits(hdr).get(slot) {
                        return None;
                    }
                    Some(Allocation {
                        object: Capability::from_raw_parts(
                            base as usize + slot * class_size,
                            class_size,
                        ),
                        header: large_header_at(base, slot),
                    })
                }
            }
            ChunkKind::Huge => {
                let rec = owner.as_ptr() as *mut HugeRecord;
                // safety: huge entries point at live records
                unsafe {
                    // order: pairs with the release CAS in alloc_huge
                    let a = (*rec).allocation.load(Ordering::Acquire);
                    if a == 0 {
                        return None;
                    }
                    let len = (*rec).size.load(Ordering::Relaxed);
                    if addr < a || addr >= a + len {
                        return None;
                    }
                    Some(Allocation {
                        object: Capability::from_raw_parts(a, len),
                        header: HugeRecords::record_header(rec),
                    })
                }
            }
        }
    }

    /// Iterate every live allocation, each exactly once, as
    /// `(header, object)` pairs. Walks the all-chunks chain rather than
    /// the bucket lists, so chunks that were detached while full are
    /// still enumerated. The heap must not gain or lose chunks while
    /// iterating (the collector runs stopped-world; tests are
    /// single-threaded); freeing slots behind the cursor is fine.
    pub fn allocations(&self) -> Allocations<'_, H> {
        Allocations {
            heap: self,
            phase: IterPhase::Start,
            chunk: 0,
            chunk_is_slab: true,
            next_slot: 0,
            buf: [0; ITER_BATCH],
            buf_len: 0,
            buf_idx: 0,
        }
    }
}

impl<H> TraceHeap for SlabHeap<H> {
    type Header = H;

    fn object_for_allocation(&self, addr: usize) -> Option<Allocation<H>> {
        self.lookup_allocation(addr)
    }
}

impl<H> IterableHeap for SlabHeap<H> {
    type Iter<'a>
        = Allocations<'a, H>
    where
        Self: 'a;

    fn allocations(&self) -> Allocations<'_, H> {
        SlabHeap::allocations(self)
    }
}

impl<H> Drop for SlabHeap<H> {
    fn drop(&mut self) {
        // unmap every huge mapping still live, then every chunk (bucket
        // chunks and record chunks both sit on the all/record chains)
        let mut chunk = self.huge.chunks.load(Ordering::Acquire);
        while chunk != 0 {
            let base = chunk as *mut u8;
            // safety: record chunks are initialized and exclusively ours
            // during drop
            unsafe {
                let mut buf = [0u32; ITER_BATCH];
                let mut start = 0;
                loop {
                    let n = slab_collect(base, start, &mut buf);
                    if n == 0 {
                        break;
                    }
                    for &slot in &buf[..n] {
                        let rec = base.add(slot as usize * self.huge.record_size as usize)
                            as *mut HugeRecord;
                        let addr = (*rec).allocation.load(Ordering::Relaxed);
                        if addr != 0 {
                            let len = (*rec).size.load(Ordering::Relaxed);
                            page::unmap(
                                NonNull::new_unchecked(addr as *mut u8),
                                roundto(len, CHUNK_SIZE),
                            );
                        }
                    }
                    start = buf[n - 1] as usize + 1;
                }
                let next = (*(base as *mut SlabChunkHdr)).common.next.load(Ordering::Relaxed);
                page::unmap(NonNull::new_unchecked(base), CHUNK_SIZE);
                chunk = next;
            }
        }
        let mut chunk = self.all_chunks.load(Ordering::Acquire);
        while chunk != 0 {
            // safety: as above
            unsafe {
                let next = (*(chunk as *mut ChunkCommon)).next_all.load(Ordering::Relaxed);
                page::unmap(NonNull::new_unchecked(chunk as *mut u8), CHUNK_SIZE);
                chunk = next;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// iteration

enum IterPhase {
    Start,
    Fixed,
    Huge,
    Done,
}

/// Iterator over every live allocation in a [`SlabHeap`].
///
/// Walks the all-chunks chain, batching [`ITER_BATCH`] slots per lock
/// acquisition, then splices in the huge allocations by walking the
/// record chunks (skipping records whose mapping is currently null).
pub struct Allocations<'a, H> {
    heap: &'a SlabHeap<H>,
    phase: IterPhase,
    /// Current chunk base address; 0 means "advance to the next chunk".
    chunk: usize,
    chunk_is_slab: bool,
    next_slot: usize,
    buf: [u32; ITER_BATCH],
    buf_len: usize,
    buf_idx: usize,
}

impl<'a, H> Allocations<'a, H> {
    /// Move `self.chunk` to the next chunk to scan, or return false when
    /// everything is exhausted.
    fn advance_chunk(&mut self) -> bool {
        loop {
            match self.phase {
                IterPhase::Start => {
                    self.phase = IterPhase::Fixed;
                    self.chunk = self.heap.all_chunks.load(Ordering::Acquire);
                }
                IterPhase::Fixed => {
                    if self.chunk != 0 {
                        // safety: chunks on the all-chain outlive the heap
                        // borrow
                        self.chunk = unsafe {
                            (*(self.chunk as *mut ChunkCommon)).next_all.load(Ordering::Acquire)
                        };
                    }
                    if self.chunk == 0 {
                        self.phase = IterPhase::Huge;
                        self.chunk = self.heap.huge.chunks.load(Ordering::Acquire);
                    }
                }
                IterPhase::Huge => {
                    if self.chunk != 0 {
                        // safety: record chunks live as long as the heap
                        self.chunk = unsafe {
                            (*(self.chunk as *mut ChunkCommon)).next.load(Ordering::Acquire)
                        };
                    }
                    if self.chunk == 0 {
                        self.phase = IterPhase::Done;
                    }
                }
                IterPhase::Done => return false,
            }
            self.next_slot = 0;
            if self.chunk != 0 {
                // record chunks are slab-shaped; bucket chunks dispatch on
                // their bucket
                // safety: initialized chunk header
                let bucket = unsafe { (*(self.chunk as *mut ChunkCommon)).bucket };
                self.chunk_is_slab =
                    bucket == RECORD_BUCKET || SlabHeap::<H>::is_slab_bucket(bucket as usize);
                return true;
            }
        }
    }

    fn refill(&mut self) -> bool {
        loop {
            if self.chunk == 0 || matches!(self.phase, IterPhase::Start) {
                if !self.advance_chunk() {
                    return false;
                }
            }
            let base = self.chunk as *mut u8;
            // safety: live chunk; batching takes the chunk lock internally
            let n = unsafe {
                if self.chunk_is_slab {
                    slab_collect(base, self.next_slot, &mut self.buf)
                } else {
                    large_collect(base, self.next_slot, &mut self.buf)
                }
            };
            if n == 0 {
                if !self.advance_chunk() {
                    return false;
                }
                continue;
            }
            self.next_slot = self.buf[n - 1] as usize + 1;
            self.buf_len = n;
            self.buf_idx = 0;
            return true;
        }
    }
}

impl<'a, H> Iterator for Allocations<'a, H> {
    type Item = Allocation<H>;

    fn next(&mut self) -> Option<Allocation<H>> {
        loop {
            if self.buf_idx >= self.buf_len {
                if !self.refill() {
                    return None;
                }
            }
            let slot = self.buf[self.buf_idx] as usize;
            self.buf_idx += 1;
            let base = self.chunk as *mut u8;
            match self.phase {
                IterPhase::Fixed => {
                    // safety: slot indices came out of the chunk's own bitmap
                    unsafe {
                        let class_size = (*(base as *mut ChunkCommon)).alloc_size as usize;
                        let header = if self.chunk_is_slab {
                            slab_header_at(base, slot)
                        } else {
                            large_header_at(base, slot)
                        };
                        return Some(Allocation {
                            object: Capability::from_raw_parts(
                                base as usize + slot * class_size,
                                class_size,
                            ),
                            header,
                        });
                    }
                }
                IterPhase::Huge => {
                    // safety: record slots come from the record chunk bitmap
                    unsafe {
                        let rec = base.add(slot * self.heap.huge.record_size as usize)
                            as *mut HugeRecord;
                        // order: pairs with the release CAS publishing the
                        // mapping
                        let addr = (*rec).allocation.load(Ordering::Acquire);
                        if addr == 0 {
                            // record exists but its mapping is gone or not
                            // yet published; skip it
                            continue;
                        }
                        let len = (*rec).size.load(Ordering::Relaxed);
                        return Some(Allocation {
                            object: Capability::from_raw_parts(addr, len),
                            header: HugeRecords::record_header(rec),
                        });
                    }
                }
                IterPhase::Start | IterPhase::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests;
