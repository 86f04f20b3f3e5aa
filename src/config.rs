//! Compile-time configuration for the allocator and collector.
//!
//! These mirror the tunables a port would want to change: the effective
//! virtual address width, the chunk granule that the slab allocator carves
//! the address space into, and the OS page size.

/// The number of valid non-zero bits that we expect to see in a virtual
/// address. Anything above this is treated as tag/metadata bits and masked
/// off before indexing the chunk table.
pub const ADDRESS_SPACE_SIZE_BITS: usize = 48;

/// Size of a cache line. This doesn't have to be accurate for every
/// microarchitecture; it defines the step used for medium bucket sizes and
/// the alignment of contended locks.
pub const CACHE_LINE_SIZE: usize = 64;

/// The size of a chunk. Every non-huge allocation lives inside a
/// naturally-aligned region of this size owned by exactly one allocator.
/// Must be a power of two and should be a multiple of the platform's
/// superpage size.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// The base two logarithm of the size of a chunk.
pub const CHUNK_SIZE_BITS: usize = crate::util::log2_usize(CHUNK_SIZE);

/// The number of bytes in a page. 'Page' here means the smallest
/// granularity at which page table management operations work, not the
/// optimal superpage size for TLB usage.
pub const PAGE_SIZE: usize = 4096;

/// The maximum number of cores that we support.
pub const MAX_CORES: usize = 128;

/// Allocations above this threshold bypass the fixed buckets entirely and
/// are served as directly page-mapped huge allocations.
pub const HUGE_THRESHOLD: usize = CHUNK_SIZE / 4;

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(CHUNK_SIZE % PAGE_SIZE == 0);
const _: () = assert!(ADDRESS_SPACE_SIZE_BITS > CHUNK_SIZE_BITS);
