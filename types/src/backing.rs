use {
    crate::{ExternalHandleTypes, MemoryPropertyFlags, ObjectId, RawFd, ResourceId},
    core::ptr::NonNull,
    thiserror::Error,
};

/// Failure to create or export a backing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum BackingError {
    #[error("device memory exhausted")]
    OutOfDeviceMemory,

    #[error("host memory exhausted")]
    OutOfHostMemory,

    #[error("backing object or handle slots exhausted")]
    TooManyObjects,
}

/// Physical backing-object primitives.
///
/// `B` is an opaque, reference-counted handle to a block of
/// GPU-addressable memory. The count is maintained by the implementation
/// and must be atomic: the allocator core mutates it outside of any lock.
///
/// One backing object may be shared between a pool entry holding it as the
/// active allocation and any number of live suballocations carved from it;
/// the implementation destroys the object exactly when the count reaches
/// zero, and [`unref_bo`] reports that transition so the caller can release
/// the corresponding remote allocation.
///
/// [`unref_bo`]: BackingDevice::unref_bo
pub trait BackingDevice<B> {
    /// Creates a backing object from scratch for the remote allocation
    /// identified by `owner`. The new object has one reference.
    fn create_bo(
        &self,
        size: u64,
        owner: ObjectId,
        props: MemoryPropertyFlags,
        export_types: ExternalHandleTypes,
    ) -> Result<B, BackingError>;

    /// Creates a backing object aliasing an externally supplied shared
    /// handle. The new object has one reference.
    fn import_bo(
        &self,
        size: u64,
        fd: RawFd,
        props: MemoryPropertyFlags,
        export_types: ExternalHandleTypes,
    ) -> Result<B, BackingError>;

    /// Host resource id of the object, for remote-side registration and
    /// property queries.
    fn resource_id(&self, bo: &B) -> ResourceId;

    /// Increments the reference count and returns another handle to the
    /// same object.
    fn ref_bo(&self, bo: &B) -> B;

    /// Decrements the reference count. Returns `true` if the count reached
    /// zero and the object was destroyed.
    fn unref_bo(&self, bo: B) -> bool;

    /// Returns the base host pointer of the object. Idempotent: the
    /// object is mapped at most once for its whole lifetime and the
    /// pointer is cached. `None` if the object cannot be mapped.
    fn map_bo(&self, bo: &B) -> Option<NonNull<u8>>;

    /// Flushes host writes in `[offset, offset + size)` of the object's
    /// mapping. Purely local cache maintenance.
    fn flush_bo(&self, bo: &B, offset: u64, size: u64);

    /// Invalidates host caches for `[offset, offset + size)` of the
    /// object's mapping. Purely local cache maintenance.
    fn invalidate_bo(&self, bo: &B, offset: u64, size: u64);

    /// Exports the object as a shared handle.
    fn export_bo(&self, bo: &B) -> Result<RawFd, BackingError>;
}
