use {
    crate::{ObjectId, ResourceId},
    thiserror::Error,
};

/// Failure of a synchronous remote call, propagated verbatim from the
/// remote side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum RemoteCallError {
    #[error("remote device memory exhausted")]
    OutOfDeviceMemory,

    #[error("remote host memory exhausted")]
    OutOfHostMemory,

    #[error("remote side does not know the resource")]
    UnknownResourceType,
}

/// Asynchronous call transport to the remote renderer process.
///
/// Synchronous calls block the calling thread until the remote side
/// replies. Asynchronous calls enqueue a message without waiting; they may
/// be observed by the remote side arbitrarily later. [`roundtrip`] is the
/// only ordering primitive: it blocks until everything enqueued before it
/// has been observed.
///
/// [`roundtrip`]: RemoteTransport::roundtrip
pub trait RemoteTransport {
    /// Returns the next id from the monotonically assigned remote
    /// object-id space.
    fn next_object_id(&self) -> ObjectId;

    /// Performs the logical remote allocation for object `id`.
    /// Synchronous.
    ///
    /// When `import` is set, the call additionally registers the imported
    /// host resource with the remote side, so no separate registration
    /// step (and no roundtrip) is needed afterwards.
    fn call_allocate(
        &self,
        id: ObjectId,
        memory_type: u32,
        size: u64,
        import: Option<ResourceId>,
    ) -> Result<(), RemoteCallError>;

    /// Releases the remote allocation for object `id`. Fire-and-forget;
    /// nothing local depends on its completion.
    fn async_free(&self, id: ObjectId);

    /// Blocks until all previously enqueued asynchronous messages have
    /// been observed by the remote side.
    fn roundtrip(&self);

    /// Queries which memory-type classes the given host resource is
    /// compatible with, as a bitset over class indices. Synchronous.
    fn call_query_resource_properties(&self, res: ResourceId) -> Result<u32, RemoteCallError>;

    /// Queries the committed size in bytes of the remote allocation for
    /// object `id`. Synchronous.
    fn call_query_commitment(&self, id: ObjectId) -> Result<u64, RemoteCallError>;
}
