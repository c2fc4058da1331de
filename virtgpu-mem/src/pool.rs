use {
    crate::{align_up, error::AllocationError, POOL_ALIGN_MASK, POOL_CAPACITY},
    std::sync::Mutex,
    virtgpu_mem_types::{
        BackingDevice, ExternalHandleTypes, MemoryPropertyFlags, ObjectId, RemoteTransport,
    },
};

#[cfg(feature = "tracing")]
use core::fmt::Debug as MemoryBounds;

#[cfg(not(feature = "tracing"))]
use core::any::Any as MemoryBounds;

/// Byte range carved out of a pool generation.
///
/// `bo` is a refcount-incremented handle to the generation's backing
/// object; it keeps the generation alive independent of the pool's own
/// reference.
#[derive(Debug)]
pub(crate) struct Suballocation<B> {
    pub bo: B,
    pub base_id: ObjectId,
    pub offset: u64,
}

#[derive(Debug)]
struct PoolBacking<B> {
    bo: B,
    id: ObjectId,
}

#[derive(Debug)]
struct PoolState<B> {
    active: Option<PoolBacking<B>>,
    used: u64,
}

/// Suballocation pool for one memory-type class.
///
/// Owns at most one active 16 MiB backing allocation and hands out
/// 4 KiB-aligned byte ranges from it. When exhausted it grows by replacing
/// the active allocation; the superseded generation stays alive via the
/// backing-object refcount until its last suballocation is released, so
/// growth never blocks on outstanding suballocations.
///
/// Suballocations within a generation are never compacted or reused.
#[derive(Debug)]
pub(crate) struct MemoryPool<B> {
    state: Mutex<PoolState<B>>,
}

impl<B> MemoryPool<B>
where
    B: MemoryBounds + 'static,
{
    pub fn new() -> Self {
        MemoryPool {
            state: Mutex::new(PoolState {
                active: None,
                used: 0,
            }),
        }
    }

    /// Carves `size` bytes out of the active generation, growing first if
    /// it does not fit. Bookkeeping is atomic with respect to concurrent
    /// acquires on the same class.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip(self, transport, device))
    )]
    pub fn acquire(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        memory_type: u32,
        props: MemoryPropertyFlags,
        size: u64,
    ) -> Result<Suballocation<B>, AllocationError> {
        assert!(size <= POOL_CAPACITY, "request exceeds pool capacity");

        let mut state = self.state.lock().unwrap();

        if state.active.is_none() || state.used + size > POOL_CAPACITY {
            Self::grow_locked(&mut state, transport, device, memory_type, props)?;
        }

        let active = state.active.as_ref().unwrap();
        let suballocation = Suballocation {
            bo: device.ref_bo(&active.bo),
            base_id: active.id,
            offset: state.used,
        };

        state.used += align_up(size, POOL_ALIGN_MASK)
            .expect("aligned suballocation size must fit pool capacity");

        Ok(suballocation)
    }

    /// Replaces the active generation with a fresh 16 MiB backing
    /// allocation. On failure the previous generation is left untouched
    /// and still valid.
    fn grow_locked(
        state: &mut PoolState<B>,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
        memory_type: u32,
        props: MemoryPropertyFlags,
    ) -> Result<(), AllocationError> {
        let id = transport.next_object_id();
        transport.call_allocate(id, memory_type, POOL_CAPACITY, None)?;

        let bo = match device.create_bo(
            POOL_CAPACITY,
            id,
            props,
            ExternalHandleTypes::empty(),
        ) {
            Ok(bo) => bo,
            Err(err) => {
                transport.async_free(id);
                return Err(err.into());
            }
        };

        // The backing object is registered separately from the remote
        // allocation; suballocations will map it right away.
        transport.roundtrip();

        #[cfg(feature = "tracing")]
        tracing::debug!(memory_type, id, "pool generation allocated");

        if let Some(old) = state.active.take() {
            // Outstanding suballocations may still reference the
            // superseded generation; the remote allocation is released
            // only once the last of them drops it.
            release_backing(transport, device, old.bo, old.id);
        }

        state.active = Some(PoolBacking { bo, id });
        state.used = 0;

        Ok(())
    }

    /// Drops the pool's own reference to the active generation.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip(self, transport, device))
    )]
    pub fn shutdown(
        &self,
        transport: &impl RemoteTransport,
        device: &impl BackingDevice<B>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.take() {
            release_backing(transport, device, active.bo, active.id);
        }
        state.used = 0;
    }
}

/// Releases one reference to a pool generation's backing object. When the
/// count reaches zero the generation's remote allocation is released as
/// well; this is the sole reclamation path for superseded generations.
pub(crate) fn release_backing<B>(
    transport: &impl RemoteTransport,
    device: &impl BackingDevice<B>,
    bo: B,
    base_id: ObjectId,
) {
    if device.unref_bo(bo) {
        transport.async_free(base_id);

        #[cfg(feature = "tracing")]
        tracing::debug!(id = base_id, "pool generation released");
    }
}
