use {
    crate::error::{ExportError, MapError},
    core::ptr::NonNull,
    virtgpu_mem_types::{
        BackingDevice, ObjectId, RawFd, RemoteCallError, RemoteTransport,
    },
};

/// Client-visible device-memory allocation unit.
///
/// Either owns a private backing object and its own remote allocation, or
/// references a byte range of a shared backing object obtained from the
/// pool. Created by [`DeviceAllocator::allocate`], destroyed by
/// [`DeviceAllocator::free`]; freeing releases exactly one reference to
/// the backing object.
///
/// [`DeviceAllocator::allocate`]: crate::DeviceAllocator::allocate
/// [`DeviceAllocator::free`]: crate::DeviceAllocator::free
#[derive(Debug)]
pub struct DeviceMemory<B> {
    pub(crate) size: u64,
    pub(crate) memory_type: u32,
    pub(crate) map_end: u64,
    pub(crate) bo: Option<B>,
    pub(crate) flavor: MemoryFlavor,
}

#[derive(Debug)]
pub(crate) enum MemoryFlavor {
    /// Owns the remote allocation identified by `id`.
    Private { id: ObjectId },

    /// Borrowed refcounted reference to the pool generation identified by
    /// `base_id`, at `base_offset` bytes into its backing object.
    /// Always carries a backing object.
    Suballocated { base_id: ObjectId, base_offset: u64 },
}

impl<B> DeviceMemory<B> {
    /// Returns the requested size of this memory object in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the index of the memory-type class this object was
    /// allocated from.
    #[inline(always)]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Returns whether this object was carved out of a shared pool
    /// allocation.
    #[inline(always)]
    pub fn is_suballocated(&self) -> bool {
        matches!(self.flavor, MemoryFlavor::Suballocated { .. })
    }

    /// Returns the byte offset of this object within its backing object.
    /// Zero unless pool-suballocated.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        match self.flavor {
            MemoryFlavor::Private { .. } => 0,
            MemoryFlavor::Suballocated { base_offset, .. } => base_offset,
        }
    }

    /// Maps `[offset, offset + size)` of this object into host address
    /// space and returns a pointer to the start of the range. `size` of
    /// `None` maps the entire allocation.
    ///
    /// The backing object is mapped at most once for its whole lifetime;
    /// repeated maps return pointers into the same mapping.
    pub fn map<D>(
        &mut self,
        device: &D,
        offset: u64,
        size: Option<u64>,
    ) -> Result<NonNull<u8>, MapError>
    where
        D: BackingDevice<B>,
    {
        let bo = self.bo.as_ref().ok_or(MapError::NonHostVisible)?;
        let ptr = device.map_bo(bo).ok_or(MapError::MapFailed)?;

        self.map_end = match size {
            None => self.size,
            Some(size) => offset + size,
        };

        let shift = usize::try_from(self.offset() + offset)
            .expect("mapping offset must fit host address space");
        // Pointer into the collaborator's cached base mapping.
        Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(shift)) })
    }

    /// Unmaps this object.
    ///
    /// A no-op at this layer: the backing object retains its mapping for
    /// its whole lifetime. This is an API-contract bookkeeping point, not
    /// a resource release.
    pub fn unmap<D>(&mut self, _device: &D)
    where
        D: BackingDevice<B>,
    {
    }

    /// Flushes host writes in `[offset, offset + size)` of the current
    /// mapping. `size` of `None` means up to the end of the mapping set by
    /// the last [`map`].
    ///
    /// Never touches the remote side; cache coherence is a backing-object
    /// concern.
    ///
    /// [`map`]: DeviceMemory::map
    pub fn flush<D>(&self, device: &D, offset: u64, size: Option<u64>)
    where
        D: BackingDevice<B>,
    {
        debug_assert!(self.bo.is_some(), "flush of memory without backing object");
        if let Some(bo) = &self.bo {
            let size = size.unwrap_or(self.map_end - offset);
            device.flush_bo(bo, self.offset() + offset, size);
        }
    }

    /// Invalidates host caches for `[offset, offset + size)` of the
    /// current mapping. `size` of `None` means up to the end of the
    /// mapping set by the last [`map`].
    ///
    /// [`map`]: DeviceMemory::map
    pub fn invalidate<D>(&self, device: &D, offset: u64, size: Option<u64>)
    where
        D: BackingDevice<B>,
    {
        debug_assert!(
            self.bo.is_some(),
            "invalidate of memory without backing object"
        );
        if let Some(bo) = &self.bo {
            let size = size.unwrap_or(self.map_end - offset);
            device.invalidate_bo(bo, self.offset() + offset, size);
        }
    }

    /// Exports this object's backing object as a shared handle.
    ///
    /// Only privately owned objects with a backing object are exportable:
    /// a suballocated range would expose the whole pool allocation through
    /// the handle.
    pub fn export_fd<D>(&self, device: &D) -> Result<RawFd, ExportError>
    where
        D: BackingDevice<B>,
    {
        if self.is_suballocated() {
            return Err(ExportError::NotExportable);
        }
        let bo = self.bo.as_ref().ok_or(ExportError::NotExportable)?;
        device.export_bo(bo).map_err(|_| ExportError::TooManyObjects)
    }

    /// Queries the committed size of this object's remote allocation.
    /// Forwarded synchronously to the remote side.
    ///
    /// # Panics
    ///
    /// Panics if this object is pool-suballocated; commitment is undefined
    /// for suballocated objects.
    pub fn commitment<T>(&self, transport: &T) -> Result<u64, RemoteCallError>
    where
        T: RemoteTransport,
    {
        match self.flavor {
            MemoryFlavor::Private { id } => transport.call_query_commitment(id),
            MemoryFlavor::Suballocated { .. } => {
                panic!("commitment query on pool-suballocated memory")
            }
        }
    }
}

/// One entry of a [`flush_ranges`]/[`invalidate_ranges`] batch.
#[derive(Debug)]
pub struct MappedRange<'a, B> {
    pub memory: &'a DeviceMemory<B>,
    pub offset: u64,

    /// `None` means up to the end of the memory object's current mapping.
    pub size: Option<u64>,
}

/// Flushes a batch of mapped ranges.
pub fn flush_ranges<B, D>(device: &D, ranges: &[MappedRange<'_, B>])
where
    D: BackingDevice<B>,
{
    for range in ranges {
        range.memory.flush(device, range.offset, range.size);
    }
}

/// Invalidates a batch of mapped ranges.
pub fn invalidate_ranges<B, D>(device: &D, ranges: &[MappedRange<'_, B>])
where
    D: BackingDevice<B>,
{
    for range in ranges {
        range.memory.invalidate(device, range.offset, range.size);
    }
}
