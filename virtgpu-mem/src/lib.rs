//!
//! Client-side device-memory allocator of a virtualized GPU driver.
//!
//! Sits between a local API consumer requesting GPU-addressable memory and
//! a remote renderer process that owns the actual GPU resources, reachable
//! only through an asynchronous call transport. Per request it decides
//! whether to forward a full remote allocation, import an externally
//! supplied shared handle, or carve the request out of a pool of larger
//! remote allocations, and it tracks the lifetime of the shared backing
//! objects by reference counting.
//!

mod allocator;
mod error;
mod memory;
mod pool;

pub use {
    self::{allocator::*, error::*, memory::*},
    virtgpu_mem_types::*,
};

/// Largest request served by pool suballocation.
///
/// Each backing object consumes a scarce slot in the host/guest transport,
/// so requests up to this size share pooled 16 MiB allocations instead of
/// taking a slot each.
pub const SUBALLOCATION_CEILING: u64 = 64 * 1024;

/// Size of one pool backing allocation.
pub const POOL_CAPACITY: u64 = 16 * 1024 * 1024;

/// Alignment of suballocation base offsets within a pool allocation.
pub const POOL_ALIGN: u64 = 4096;

pub(crate) const POOL_ALIGN_MASK: u64 = POOL_ALIGN - 1;

/// Shared handle supplied to [`DeviceAllocator::allocate`] to alias
/// externally provided memory instead of allocating fresh memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImportHandle {
    /// Kind of the shared handle. Only `OPAQUE_FD` and `DMA_BUF` are
    /// supported.
    pub handle_type: ExternalHandleTypes,

    /// The handle itself.
    pub fd: RawFd,
}

/// Memory request for the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocateRequest {
    /// Requested size in bytes.
    pub size: u64,

    /// Index of the memory-type class to allocate from.
    pub memory_type: u32,

    /// Externally supplied shared handle to alias.
    pub import: Option<ImportHandle>,

    /// Handle types the allocation must be exportable as afterwards.
    /// Empty if export is not requested.
    pub export: ExternalHandleTypes,

    /// Set when extra allocation-info metadata is attached upstream and
    /// the allocation must be backed by its own remote allocation.
    pub dedicated: bool,
}

impl AllocateRequest {
    /// Plain request: no import, no export, no extra metadata.
    pub fn new(size: u64, memory_type: u32) -> Self {
        AllocateRequest {
            size,
            memory_type,
            import: None,
            export: ExternalHandleTypes::empty(),
            dedicated: false,
        }
    }
}

/// Aligns `value` up by `align_mask`.
/// Returns smallest integer not lesser than `value` with the mask bits
/// clear. Returns `None` on overflow.
pub(crate) fn align_up(value: u64, align_mask: u64) -> Option<u64> {
    Some(value.checked_add(align_mask)? & !align_mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_pool_alignment() {
        assert_eq!(align_up(0, POOL_ALIGN_MASK), Some(0));
        assert_eq!(align_up(1, POOL_ALIGN_MASK), Some(4096));
        assert_eq!(align_up(4096, POOL_ALIGN_MASK), Some(4096));
        assert_eq!(align_up(4097, POOL_ALIGN_MASK), Some(8192));
        assert_eq!(align_up(u64::MAX, POOL_ALIGN_MASK), None);
    }
}
