//!
//! Core types and collaborator traits of the `virtgpu-mem` crate.
//!
//! The allocator core is implementation agnostic: the remote renderer and
//! the backing-object primitives are reached exclusively through the
//! [`RemoteTransport`] and [`BackingDevice`] traits defined here.
//!

mod backing;
mod transport;

pub use self::{backing::*, transport::*};

/// Identity of an object in the remote side's object-id space.
///
/// Ids are handed out monotonically by the transport and are never reused
/// within the lifetime of a connection.
pub type ObjectId = u64;

/// Host resource id of a backing object, assigned by the backing-object
/// collaborator when the object is created.
pub type ResourceId = u32;

/// File-descriptor-like shared handle usable for cross-process
/// import/export of backing objects.
pub type RawFd = i32;

bitflags::bitflags! {
    /// Properties of a memory-type class.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Fastest for device access.
        const DEVICE_LOCAL = 0x01;

        /// Memory that can be mapped into host address space.
        const HOST_VISIBLE = 0x02;

        /// Host coherent, no flush/invalidate required around host access.
        const HOST_COHERENT = 0x04;

        /// Cached on the host side.
        const HOST_CACHED = 0x08;

        /// Backed by actual device memory only as needed.
        const LAZILY_ALLOCATED = 0x10;
    }
}

bitflags::bitflags! {
    /// Kinds of shared handles a backing object can be exported as or
    /// imported from.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ExternalHandleTypes: u32 {
        const OPAQUE_FD = 0x01;
        const DMA_BUF = 0x02;
    }
}

/// Description of one memory-type class served by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// Properties of memory of this class.
    pub props: MemoryPropertyFlags,
}
