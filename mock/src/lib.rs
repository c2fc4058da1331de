//!
//! In-process mock of the remote renderer and the backing-object
//! primitives, for tests.
//!
//! Backing-object handles are `usize` keys into a slab. The mock checks
//! protocol invariants with assertions (ids used before allocation,
//! double frees, flushes out of bounds) and counts remote calls so tests
//! can assert how many allocations, frees and roundtrips a scenario
//! produced.
//!

use {
    slab::Slab,
    std::{
        cell::UnsafeCell,
        collections::HashMap,
        mem::transmute,
        ptr::NonNull,
        sync::{
            atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
            Mutex,
        },
    },
    virtgpu_mem_types::{
        BackingDevice, BackingError, ExternalHandleTypes, MemoryPropertyFlags, ObjectId, RawFd,
        RemoteCallError, RemoteTransport, ResourceId,
    },
};

/// Memory-type bitset the mock reports for any known resource in
/// [`RemoteTransport::call_query_resource_properties`].
pub const MOCK_IMPORT_TYPE_BITS: u32 = 0b0001;

struct MockBo {
    refs: u32,
    size: u64,
    res_id: ResourceId,
    host_visible: bool,
    content: Box<UnsafeCell<[u8]>>,
}

// The content pointer is only dereferenced by test code that owns the
// mapping exclusively.
unsafe impl Send for MockBo {}

struct RemoteAllocation {
    size: u64,
    freed: bool,
}

struct RemoteState {
    allocations: HashMap<ObjectId, RemoteAllocation>,
}

pub struct MockRenderer {
    bos: Mutex<Slab<MockBo>>,
    remote: Mutex<RemoteState>,
    flushes: Mutex<Vec<(ResourceId, u64, u64)>>,
    invalidates: Mutex<Vec<(ResourceId, u64, u64)>>,

    next_object_id: AtomicU64,
    next_resource_id: AtomicU32,
    next_fd: AtomicI32,

    remote_allocation_counter: AtomicU64,
    remote_free_counter: AtomicU64,
    roundtrip_counter: AtomicU64,
    bo_created_counter: AtomicU64,
    bo_destroyed_counter: AtomicU64,

    fail_next_allocate: AtomicBool,
    fail_next_bo_create: AtomicBool,
    fail_exports: AtomicBool,
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRenderer {
    pub fn new() -> Self {
        MockRenderer {
            bos: Mutex::new(Slab::new()),
            remote: Mutex::new(RemoteState {
                allocations: HashMap::new(),
            }),
            flushes: Mutex::new(Vec::new()),
            invalidates: Mutex::new(Vec::new()),

            next_object_id: AtomicU64::new(1),
            next_resource_id: AtomicU32::new(1),
            next_fd: AtomicI32::new(100),

            remote_allocation_counter: AtomicU64::new(0),
            remote_free_counter: AtomicU64::new(0),
            roundtrip_counter: AtomicU64::new(0),
            bo_created_counter: AtomicU64::new(0),
            bo_destroyed_counter: AtomicU64::new(0),

            fail_next_allocate: AtomicBool::new(false),
            fail_next_bo_create: AtomicBool::new(false),
            fail_exports: AtomicBool::new(false),
        }
    }

    /// Number of synchronous remote allocation calls that succeeded.
    pub fn remote_allocations(&self) -> u64 {
        self.remote_allocation_counter.load(Ordering::Relaxed)
    }

    /// Number of asynchronous remote free messages enqueued.
    pub fn remote_frees(&self) -> u64 {
        self.remote_free_counter.load(Ordering::Relaxed)
    }

    pub fn roundtrips(&self) -> u64 {
        self.roundtrip_counter.load(Ordering::Relaxed)
    }

    pub fn bos_created(&self) -> u64 {
        self.bo_created_counter.load(Ordering::Relaxed)
    }

    pub fn bos_destroyed(&self) -> u64 {
        self.bo_destroyed_counter.load(Ordering::Relaxed)
    }

    pub fn live_bos(&self) -> usize {
        self.bos.lock().unwrap().len()
    }

    /// `(resource id, offset, size)` of every flush issued so far.
    pub fn flushes(&self) -> Vec<(ResourceId, u64, u64)> {
        self.flushes.lock().unwrap().clone()
    }

    /// `(resource id, offset, size)` of every invalidate issued so far.
    pub fn invalidates(&self) -> Vec<(ResourceId, u64, u64)> {
        self.invalidates.lock().unwrap().clone()
    }

    /// Makes the next `call_allocate` fail with `OutOfDeviceMemory`.
    pub fn fail_next_allocate(&self) {
        self.fail_next_allocate.store(true, Ordering::Relaxed);
    }

    /// Makes the next `create_bo`/`import_bo` fail with `TooManyObjects`.
    pub fn fail_next_bo_create(&self) {
        self.fail_next_bo_create.store(true, Ordering::Relaxed);
    }

    /// Makes every `export_bo` fail with `TooManyObjects`.
    pub fn fail_exports(&self) {
        self.fail_exports.store(true, Ordering::Relaxed);
    }

    fn new_bo(&self, size: u64, host_visible: bool) -> usize {
        let res_id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
        let content_len = usize::try_from(size.max(1)).expect("mock bo size fits host memory");
        self.bo_created_counter.fetch_add(1, Ordering::Relaxed);

        self.bos.lock().unwrap().insert(MockBo {
            refs: 1,
            size,
            res_id,
            host_visible,
            content: unsafe { transmute(vec![0u8; content_len].into_boxed_slice()) },
        })
    }
}

impl RemoteTransport for MockRenderer {
    fn next_object_id(&self) -> ObjectId {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    #[tracing::instrument(skip(self))]
    fn call_allocate(
        &self,
        id: ObjectId,
        memory_type: u32,
        size: u64,
        import: Option<ResourceId>,
    ) -> Result<(), RemoteCallError> {
        if self.fail_next_allocate.swap(false, Ordering::Relaxed) {
            return Err(RemoteCallError::OutOfDeviceMemory);
        }

        if let Some(res) = import {
            let bos = self.bos.lock().unwrap();
            assert!(
                bos.iter().any(|(_, bo)| bo.res_id == res),
                "imported resource registered before its backing object exists"
            );
        }

        let mut remote = self.remote.lock().unwrap();
        let prev = remote
            .allocations
            .insert(id, RemoteAllocation { size, freed: false });
        assert!(prev.is_none(), "object id allocated twice");

        self.remote_allocation_counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(id, size, "remote allocation");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn async_free(&self, id: ObjectId) {
        let mut remote = self.remote.lock().unwrap();
        let allocation = remote
            .allocations
            .get_mut(&id)
            .expect("free of unknown object id");
        assert!(!allocation.freed, "object id freed twice");
        allocation.freed = true;

        self.remote_free_counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(id, "remote free");
    }

    fn roundtrip(&self) {
        self.roundtrip_counter.fetch_add(1, Ordering::Relaxed);
    }

    fn call_query_resource_properties(&self, res: ResourceId) -> Result<u32, RemoteCallError> {
        let bos = self.bos.lock().unwrap();
        if bos.iter().any(|(_, bo)| bo.res_id == res) {
            Ok(MOCK_IMPORT_TYPE_BITS)
        } else {
            Err(RemoteCallError::UnknownResourceType)
        }
    }

    fn call_query_commitment(&self, id: ObjectId) -> Result<u64, RemoteCallError> {
        let remote = self.remote.lock().unwrap();
        let allocation = remote
            .allocations
            .get(&id)
            .expect("commitment query for unknown object id");
        assert!(!allocation.freed, "commitment query for freed object id");
        Ok(allocation.size)
    }
}

impl BackingDevice<usize> for MockRenderer {
    #[tracing::instrument(skip(self))]
    fn create_bo(
        &self,
        size: u64,
        owner: ObjectId,
        props: MemoryPropertyFlags,
        export_types: ExternalHandleTypes,
    ) -> Result<usize, BackingError> {
        if self.fail_next_bo_create.swap(false, Ordering::Relaxed) {
            return Err(BackingError::TooManyObjects);
        }

        {
            let remote = self.remote.lock().unwrap();
            let allocation = remote
                .allocations
                .get(&owner)
                .expect("backing object created before its remote allocation");
            assert!(!allocation.freed, "backing object created for freed allocation");
        }

        let key = self.new_bo(size, props.contains(MemoryPropertyFlags::HOST_VISIBLE));
        tracing::info!(key, owner, size, "backing object created");
        Ok(key)
    }

    #[tracing::instrument(skip(self))]
    fn import_bo(
        &self,
        size: u64,
        fd: RawFd,
        props: MemoryPropertyFlags,
        export_types: ExternalHandleTypes,
    ) -> Result<usize, BackingError> {
        if self.fail_next_bo_create.swap(false, Ordering::Relaxed) {
            return Err(BackingError::TooManyObjects);
        }

        let key = self.new_bo(size, props.contains(MemoryPropertyFlags::HOST_VISIBLE));
        tracing::info!(key, fd, size, "backing object imported");
        Ok(key)
    }

    fn resource_id(&self, bo: &usize) -> ResourceId {
        self.bos.lock().unwrap()[*bo].res_id
    }

    fn ref_bo(&self, bo: &usize) -> usize {
        let mut bos = self.bos.lock().unwrap();
        bos[*bo].refs += 1;
        *bo
    }

    fn unref_bo(&self, bo: usize) -> bool {
        let mut bos = self.bos.lock().unwrap();
        let entry = bos.get_mut(bo).expect("unref of destroyed backing object");
        entry.refs -= 1;

        if entry.refs == 0 {
            bos.remove(bo);
            self.bo_destroyed_counter.fetch_add(1, Ordering::Relaxed);
            tracing::info!(key = bo, "backing object destroyed");
            true
        } else {
            false
        }
    }

    fn map_bo(&self, bo: &usize) -> Option<NonNull<u8>> {
        let bos = self.bos.lock().unwrap();
        let entry = &bos[*bo];
        if !entry.host_visible {
            return None;
        }
        // The content box is heap-allocated; the pointer stays valid while
        // the backing object is alive even if the slab reallocates.
        NonNull::new(entry.content.get() as *mut u8)
    }

    fn flush_bo(&self, bo: &usize, offset: u64, size: u64) {
        let bos = self.bos.lock().unwrap();
        let entry = &bos[*bo];
        assert!(
            offset + size <= entry.size,
            "flush range out of backing object bounds"
        );
        self.flushes.lock().unwrap().push((entry.res_id, offset, size));
    }

    fn invalidate_bo(&self, bo: &usize, offset: u64, size: u64) {
        let bos = self.bos.lock().unwrap();
        let entry = &bos[*bo];
        assert!(
            offset + size <= entry.size,
            "invalidate range out of backing object bounds"
        );
        self.invalidates
            .lock()
            .unwrap()
            .push((entry.res_id, offset, size));
    }

    fn export_bo(&self, bo: &usize) -> Result<RawFd, BackingError> {
        if self.fail_exports.load(Ordering::Relaxed) {
            return Err(BackingError::TooManyObjects);
        }
        let bos = self.bos.lock().unwrap();
        assert!(bos.contains(*bo), "export of destroyed backing object");
        Ok(self.next_fd.fetch_add(1, Ordering::Relaxed))
    }
}
