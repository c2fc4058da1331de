use {
    crate::{
        error::{AllocationError, PropertyQueryError},
        memory::{DeviceMemory, MemoryFlavor},
        pool::{release_backing, MemoryPool},
        AllocateRequest, ImportHandle, SUBALLOCATION_CEILING,
    },
    virtgpu_mem_types::{
        BackingDevice, ExternalHandleTypes, MemoryPropertyFlags, MemoryType, RawFd,
        RemoteTransport,
    },
};

#[cfg(feature = "tracing")]
use core::fmt::Debug as MemoryBounds;

#[cfg(not(feature = "tracing"))]
use core::any::Any as MemoryBounds;

/// Device-memory allocator for one device.
///
/// Runs the allocation policy once per request, selecting among direct
/// remote allocation, import of a shared handle, and pool suballocation.
/// Methods take the collaborators by reference; the same transport and
/// backing-object device must be used for all interactions with one
/// allocator instance and the memory objects allocated from it.
///
/// All methods take `&self` and may be called from multiple threads
/// concurrently; pool state is protected by one mutex per memory-type
/// class, so requests on different classes never contend.
#[derive(Debug)]
pub struct DeviceAllocator<B> {
    memory_types: Box<[MemoryType]>,
    pools: Box<[MemoryPool<B>]>,
}

impl<B> DeviceAllocator<B>
where
    B: MemoryBounds + 'static,
{
    /// Creates a new allocator serving the given memory-type classes.
    ///
    /// Pool state is scoped to this value's lifetime; it is initialized
    /// empty and torn down by [`shutdown`].
    ///
    /// [`shutdown`]: DeviceAllocator::shutdown
    pub fn new(memory_types: &[MemoryType]) -> Self {
        DeviceAllocator {
            memory_types: memory_types.iter().copied().collect(),
            pools: memory_types.iter().map(|_| MemoryPool::new()).collect(),
        }
    }

    /// Allocates a memory object according to `request`.
    ///
    /// A request carrying an import handle aliases the imported memory.
    /// Small host-visible requests without extra metadata are carved out
    /// of a shared pool allocation. Everything else is forwarded as a
    /// direct remote allocation of exactly the requested size.
    ///
    /// A failed allocation never leaks a remote-visible resource: any
    /// backing object or remote allocation created before the failing step
    /// is released before the error is returned.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip(self, transport, device))
    )]
    pub fn allocate(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        request: &AllocateRequest,
    ) -> Result<DeviceMemory<B>, AllocationError> {
        let memory_type = &self.memory_types[request.memory_type as usize];
        let props = memory_type.props;

        if let Some(import) = request.import {
            return self.allocate_import(transport, device, request, props, import);
        }

        let need_bo =
            props.contains(MemoryPropertyFlags::HOST_VISIBLE) || !request.export.is_empty();

        // An export request must never be pooled: the exported handle
        // would expose the whole pool allocation.
        let suballocate = need_bo
            && !request.dedicated
            && request.export.is_empty()
            && !props.contains(MemoryPropertyFlags::LAZILY_ALLOCATED)
            && request.size <= SUBALLOCATION_CEILING;

        if suballocate {
            let sub = self.pools[request.memory_type as usize].acquire(
                transport,
                device,
                request.memory_type,
                props,
                request.size,
            )?;

            return Ok(DeviceMemory {
                size: request.size,
                memory_type: request.memory_type,
                map_end: 0,
                bo: Some(sub.bo),
                flavor: MemoryFlavor::Suballocated {
                    base_id: sub.base_id,
                    base_offset: sub.offset,
                },
            });
        }

        let id = transport.next_object_id();
        transport.call_allocate(id, request.memory_type, request.size, None)?;

        let bo = if need_bo {
            match device.create_bo(request.size, id, props, request.export) {
                Ok(bo) => Some(bo),
                Err(err) => {
                    transport.async_free(id);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        if bo.is_some() {
            // The backing object was registered administratively separate
            // from the allocation call; a map issued by the caller must
            // not race ahead of the remote side observing it.
            transport.roundtrip();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(id, size = request.size, "memory object allocated");

        Ok(DeviceMemory {
            size: request.size,
            memory_type: request.memory_type,
            map_end: 0,
            bo,
            flavor: MemoryFlavor::Private { id },
        })
    }

    fn allocate_import(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        request: &AllocateRequest,
        props: MemoryPropertyFlags,
        import: ImportHandle,
    ) -> Result<DeviceMemory<B>, AllocationError> {
        let supported = ExternalHandleTypes::OPAQUE_FD | ExternalHandleTypes::DMA_BUF;
        if import.handle_type.is_empty() || !supported.contains(import.handle_type) {
            return Err(AllocationError::InvalidExternalHandle);
        }

        let bo = device.import_bo(request.size, import.fd, props, request.export)?;

        // The synchronous call carries the resource id, so the remote side
        // knows the backing resource before this returns; no roundtrip.
        let id = transport.next_object_id();
        if let Err(err) = transport.call_allocate(
            id,
            request.memory_type,
            request.size,
            Some(device.resource_id(&bo)),
        ) {
            device.unref_bo(bo);
            return Err(err.into());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(id, fd = import.fd, "memory object imported");

        Ok(DeviceMemory {
            size: request.size,
            memory_type: request.memory_type,
            map_end: 0,
            bo: Some(bo),
            flavor: MemoryFlavor::Private { id },
        })
    }

    /// Frees a memory object previously allocated from this allocator.
    ///
    /// Releases exactly one reference to the backing object. For private
    /// objects the remote allocation is released asynchronously; for
    /// suballocated objects the pool generation's remote allocation is
    /// released once its last reference drops.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip(self, transport, device))
    )]
    pub fn free(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        memory: DeviceMemory<B>,
    ) {
        match memory.flavor {
            MemoryFlavor::Suballocated { base_id, .. } => {
                let bo = memory
                    .bo
                    .expect("suballocated memory always has a backing object");
                release_backing(transport, device, bo, base_id);
            }
            MemoryFlavor::Private { id } => {
                if let Some(bo) = memory.bo {
                    device.unref_bo(bo);
                }
                transport.async_free(id);
            }
        }
    }

    /// Queries which memory-type classes a foreign shared handle is
    /// compatible with, as a bitset over class indices.
    ///
    /// A side-channel query: a throwaway zero-size backing object is
    /// created from the handle solely for the query and released again on
    /// every path. Nothing is registered with the remote side beyond the
    /// query call itself.
    pub fn query_import_properties(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        handle_type: ExternalHandleTypes,
        fd: RawFd,
    ) -> Result<u32, PropertyQueryError> {
        if handle_type != ExternalHandleTypes::DMA_BUF {
            return Err(PropertyQueryError::InvalidExternalHandle);
        }

        let bo = device.import_bo(0, fd, MemoryPropertyFlags::empty(), handle_type)?;
        let result = transport.call_query_resource_properties(device.resource_id(&bo));
        device.unref_bo(bo);

        result.map_err(Into::into)
    }

    /// Releases the pools' references to their active generations.
    ///
    /// Must be called at device shutdown, after all memory objects have
    /// been freed.
    pub fn shutdown(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
    ) {
        for pool in self.pools.iter() {
            pool.shutdown(transport, device);
        }
    }
}
