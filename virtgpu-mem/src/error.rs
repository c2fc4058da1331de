use {
    thiserror::Error,
    virtgpu_mem_types::{BackingError, RemoteCallError},
};

/// Failure of an allocation request.
///
/// Host-memory exhaustion and device/transport exhaustion are distinct so
/// callers can apply distinct fallback strategies (shrink the request vs.
/// free other allocations).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum AllocationError {
    #[error("device memory exhausted")]
    OutOfDeviceMemory,

    #[error("host memory exhausted")]
    OutOfHostMemory,

    #[error("reached limit on backing object count")]
    TooManyObjects,

    #[error("unsupported external handle type")]
    InvalidExternalHandle,
}

impl From<RemoteCallError> for AllocationError {
    fn from(err: RemoteCallError) -> Self {
        match err {
            RemoteCallError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            RemoteCallError::OutOfHostMemory => AllocationError::OutOfHostMemory,
            // Only reachable when registering an imported resource the
            // remote side does not recognize.
            RemoteCallError::UnknownResourceType => AllocationError::InvalidExternalHandle,
        }
    }
}

impl From<BackingError> for AllocationError {
    fn from(err: BackingError) -> Self {
        match err {
            BackingError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            BackingError::OutOfHostMemory => AllocationError::OutOfHostMemory,
            BackingError::TooManyObjects => AllocationError::TooManyObjects,
        }
    }
}

/// Failure to map a memory object into host address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum MapError {
    #[error("backing object cannot produce a host pointer")]
    MapFailed,

    #[error("memory object has no host-mappable backing object")]
    NonHostVisible,
}

/// Failure to export a memory object as a shared handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum ExportError {
    /// The object is pool-suballocated or has no backing object. A
    /// suballocated range cannot be exported because the shared handle
    /// would expose the whole pool allocation, not just the caller's
    /// slice.
    #[error("memory object is not exportable")]
    NotExportable,

    #[error("shared handle slots exhausted")]
    TooManyObjects,
}

/// Failure of the import-probe query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum PropertyQueryError {
    #[error("unsupported external handle type")]
    InvalidExternalHandle,

    #[error("resource type unknown to the remote side")]
    UnknownResourceType,

    #[error("device memory exhausted")]
    OutOfDeviceMemory,

    #[error("host memory exhausted")]
    OutOfHostMemory,
}

impl From<RemoteCallError> for PropertyQueryError {
    fn from(err: RemoteCallError) -> Self {
        match err {
            RemoteCallError::OutOfDeviceMemory => PropertyQueryError::OutOfDeviceMemory,
            RemoteCallError::OutOfHostMemory => PropertyQueryError::OutOfHostMemory,
            RemoteCallError::UnknownResourceType => PropertyQueryError::UnknownResourceType,
        }
    }
}

impl From<BackingError> for PropertyQueryError {
    fn from(err: BackingError) -> Self {
        match err {
            BackingError::OutOfDeviceMemory => PropertyQueryError::OutOfDeviceMemory,
            BackingError::OutOfHostMemory | BackingError::TooManyObjects => {
                PropertyQueryError::OutOfHostMemory
            }
        }
    }
}
