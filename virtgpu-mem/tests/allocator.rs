use {
    std::sync::Mutex,
    virtgpu_mem::{
        AllocateRequest, AllocationError, DeviceAllocator, ExportError, ExternalHandleTypes,
        ImportHandle, MapError, MappedRange, MemoryPropertyFlags, MemoryType,
        PropertyQueryError, POOL_CAPACITY,
    },
    virtgpu_mem_mock::{MockRenderer, MOCK_IMPORT_TYPE_BITS},
};

const HOST_VISIBLE: u32 = 0;
const DEVICE_LOCAL: u32 = 1;
const LAZY: u32 = 2;

fn setup() -> (MockRenderer, DeviceAllocator<usize>) {
    let memory_types = [
        MemoryType {
            props: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        },
        MemoryType {
            props: MemoryPropertyFlags::DEVICE_LOCAL,
        },
        MemoryType {
            props: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::LAZILY_ALLOCATED,
        },
    ];
    (MockRenderer::new(), DeviceAllocator::new(&memory_types))
}

#[test]
fn pool_hands_out_aligned_offsets() {
    let (renderer, allocator) = setup();

    let mems: Vec<_> = (0..4)
        .map(|_| {
            allocator
                .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
                .unwrap()
        })
        .collect();

    let offsets: Vec<_> = mems.iter().map(|m| m.offset()).collect();
    assert_eq!(offsets, [0, 4096, 8192, 12288]);
    assert!(mems.iter().all(|m| m.is_suballocated()));

    // One 16 MiB generation serves all four requests.
    assert_eq!(renderer.remote_allocations(), 1);
    assert_eq!(renderer.bos_created(), 1);
    assert_eq!(renderer.roundtrips(), 1);

    let next = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert_eq!(next.offset(), 16384);
}

#[test]
fn pool_grows_when_exhausted_and_frees_superseded_generation_once() {
    let (renderer, allocator) = setup();

    // 256 * 64 KiB fills the 16 MiB generation exactly.
    let first_generation: Vec<_> = (0..256)
        .map(|_| {
            allocator
                .allocate(
                    &renderer,
                    &renderer,
                    &AllocateRequest::new(64 * 1024, HOST_VISIBLE),
                )
                .unwrap()
        })
        .collect();
    assert_eq!(renderer.remote_allocations(), 1);

    // The next request does not fit; the pool grows.
    let after_growth = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert_eq!(after_growth.offset(), 0);
    assert_eq!(renderer.remote_allocations(), 2);
    assert_eq!(renderer.bos_created(), 2);

    // The superseded generation still has outstanding suballocations.
    assert_eq!(renderer.bos_destroyed(), 0);
    assert_eq!(renderer.remote_frees(), 0);

    // Freeing them all drives its refcount to zero: exactly one remote
    // deallocation for the whole generation.
    for mem in first_generation {
        allocator.free(&renderer, &renderer, mem);
    }
    assert_eq!(renderer.bos_destroyed(), 1);
    assert_eq!(renderer.remote_frees(), 1);
    assert_eq!(renderer.live_bos(), 1);
}

#[test]
fn pool_growth_failure_leaves_previous_generation_valid() {
    let (renderer, allocator) = setup();

    // Fresh class: a failed first growth leaves the pool empty but usable.
    renderer.fail_next_allocate();
    let err = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap_err();
    assert_eq!(err, AllocationError::OutOfDeviceMemory);

    let first = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert_eq!(first.offset(), 0);

    // Fill until less than 64 KiB remains.
    for _ in 0..255 {
        allocator
            .allocate(
                &renderer,
                &renderer,
                &AllocateRequest::new(64 * 1024, HOST_VISIBLE),
            )
            .unwrap();
    }
    let used = 4096 + 255 * 64 * 1024;
    assert!(POOL_CAPACITY - used < 64 * 1024);

    // Growth fails; the active generation is untouched and keeps serving
    // requests that still fit.
    renderer.fail_next_allocate();
    let err = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest::new(64 * 1024, HOST_VISIBLE),
        )
        .unwrap_err();
    assert_eq!(err, AllocationError::OutOfDeviceMemory);

    let still_fits = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert_eq!(still_fits.offset(), used);
    assert_eq!(renderer.remote_allocations(), 1);
}

#[test]
fn imported_memory_is_never_suballocated() {
    let (renderer, allocator) = setup();

    let exported = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest {
                export: ExternalHandleTypes::OPAQUE_FD,
                ..AllocateRequest::new(1024, HOST_VISIBLE)
            },
        )
        .unwrap();
    let fd = exported.export_fd(&renderer).unwrap();
    let roundtrips_before = renderer.roundtrips();

    let imported = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest {
                import: Some(ImportHandle {
                    handle_type: ExternalHandleTypes::OPAQUE_FD,
                    fd,
                }),
                ..AllocateRequest::new(1024, HOST_VISIBLE)
            },
        )
        .unwrap();

    assert!(!imported.is_suballocated());
    assert_eq!(imported.offset(), 0);
    // The synchronous registration call makes a roundtrip unnecessary.
    assert_eq!(renderer.roundtrips(), roundtrips_before);
}

#[test]
fn unsupported_import_handle_type_is_rejected_without_side_effects() {
    let (renderer, allocator) = setup();

    let err = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest {
                import: Some(ImportHandle {
                    handle_type: ExternalHandleTypes::from_bits_retain(0x80),
                    fd: 42,
                }),
                ..AllocateRequest::new(1024, HOST_VISIBLE)
            },
        )
        .unwrap_err();

    assert_eq!(err, AllocationError::InvalidExternalHandle);
    assert_eq!(renderer.remote_allocations(), 0);
    assert_eq!(renderer.bos_created(), 0);
}

#[test]
fn direct_allocation_without_backing_object() {
    let (renderer, allocator) = setup();

    let mut mem = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest::new(1024 * 1024, DEVICE_LOCAL),
        )
        .unwrap();

    assert!(!mem.is_suballocated());
    assert_eq!(renderer.remote_allocations(), 1);
    assert_eq!(renderer.bos_created(), 0);
    // No administratively separate backing object, so no barrier needed.
    assert_eq!(renderer.roundtrips(), 0);

    assert_eq!(mem.map(&renderer, 0, None).unwrap_err(), MapError::NonHostVisible);
}

#[test]
fn large_host_visible_allocation_goes_direct_with_barrier() {
    let (renderer, allocator) = setup();

    let mut mem = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest::new(1024 * 1024, HOST_VISIBLE),
        )
        .unwrap();

    assert!(!mem.is_suballocated());
    assert_eq!(renderer.bos_created(), 1);
    assert_eq!(renderer.roundtrips(), 1);
    mem.map(&renderer, 0, None).unwrap();
}

#[test]
fn lazily_allocated_memory_is_not_pooled() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, LAZY))
        .unwrap();
    assert!(!mem.is_suballocated());
}

#[test]
fn export_requested_allocation_is_private_and_exportable() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest {
                export: ExternalHandleTypes::DMA_BUF,
                ..AllocateRequest::new(1024, HOST_VISIBLE)
            },
        )
        .unwrap();

    assert!(!mem.is_suballocated());
    mem.export_fd(&renderer).unwrap();

    renderer.fail_exports();
    assert_eq!(mem.export_fd(&renderer).unwrap_err(), ExportError::TooManyObjects);
}

#[test]
fn suballocated_memory_cannot_be_exported() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert!(mem.is_suballocated());
    assert_eq!(mem.export_fd(&renderer).unwrap_err(), ExportError::NotExportable);
}

#[test]
fn map_and_whole_range_flush_cover_the_suballocated_window() {
    let (renderer, allocator) = setup();

    let mut first = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    let mut second = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    assert_eq!(second.offset(), 4096);

    let base = first.map(&renderer, 0, None).unwrap();
    let ptr = second.map(&renderer, 0, None).unwrap();
    assert_eq!(ptr.as_ptr() as usize - base.as_ptr() as usize, 4096);

    // Whole-mapping flush operates on [base_offset, base_offset + map_end).
    second.flush(&renderer, 0, None);
    assert_eq!(renderer.flushes().last().copied().unwrap().1, 4096);
    assert_eq!(renderer.flushes().last().copied().unwrap().2, 1024);

    second.invalidate(&renderer, 16, Some(32));
    assert_eq!(
        renderer.invalidates().last().copied().unwrap(),
        (renderer.flushes().last().unwrap().0, 4096 + 16, 32)
    );
}

#[test]
fn partial_map_sets_the_mapping_end() {
    let (renderer, allocator) = setup();

    let mut mem = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(8192, HOST_VISIBLE))
        .unwrap();

    mem.map(&renderer, 1024, Some(2048)).unwrap();

    // Whole-size flush from a smaller offset reaches exactly map_end.
    mem.flush(&renderer, 512, None);
    let (_, offset, size) = renderer.flushes().last().copied().unwrap();
    assert_eq!(offset, mem.offset() + 512);
    assert_eq!(size, (1024 + 2048) - 512);
}

#[test]
fn freeing_private_memory_releases_backing_object_and_remote_allocation() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest::new(1024 * 1024, HOST_VISIBLE),
        )
        .unwrap();

    allocator.free(&renderer, &renderer, mem);
    assert_eq!(renderer.bos_destroyed(), 1);
    assert_eq!(renderer.remote_frees(), 1);
    assert_eq!(renderer.live_bos(), 0);
}

#[test]
fn failed_backing_object_creation_unwinds_the_remote_allocation() {
    let (renderer, allocator) = setup();

    renderer.fail_next_bo_create();
    let err = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest::new(1024 * 1024, HOST_VISIBLE),
        )
        .unwrap_err();

    assert_eq!(err, AllocationError::TooManyObjects);
    assert_eq!(renderer.remote_allocations(), 1);
    assert_eq!(renderer.remote_frees(), 1);
    assert_eq!(renderer.bos_created(), 0);
    assert_eq!(renderer.roundtrips(), 0);
}

#[test]
fn failed_import_registration_releases_the_imported_backing_object() {
    let (renderer, allocator) = setup();

    renderer.fail_next_allocate();
    let err = allocator
        .allocate(
            &renderer,
            &renderer,
            &AllocateRequest {
                import: Some(ImportHandle {
                    handle_type: ExternalHandleTypes::DMA_BUF,
                    fd: 42,
                }),
                ..AllocateRequest::new(1024, HOST_VISIBLE)
            },
        )
        .unwrap_err();

    assert_eq!(err, AllocationError::OutOfDeviceMemory);
    assert_eq!(renderer.bos_created(), 1);
    assert_eq!(renderer.bos_destroyed(), 1);
    assert_eq!(renderer.live_bos(), 0);
}

#[test]
fn commitment_query_is_forwarded() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(8192, LAZY))
        .unwrap();
    assert_eq!(mem.commitment(&renderer).unwrap(), 8192);
}

#[test]
fn import_probe_is_side_effect_free() {
    let (renderer, allocator) = setup();

    let bits = allocator
        .query_import_properties(&renderer, &renderer, ExternalHandleTypes::DMA_BUF, 42)
        .unwrap();
    assert_eq!(bits, MOCK_IMPORT_TYPE_BITS);

    // The throwaway backing object is gone and nothing was registered.
    assert_eq!(renderer.live_bos(), 0);
    assert_eq!(renderer.remote_allocations(), 0);

    let err = allocator
        .query_import_properties(&renderer, &renderer, ExternalHandleTypes::OPAQUE_FD, 42)
        .unwrap_err();
    assert_eq!(err, PropertyQueryError::InvalidExternalHandle);
}

#[test]
fn shutdown_releases_the_active_generation() {
    let (renderer, allocator) = setup();

    let mem = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    allocator.free(&renderer, &renderer, mem);

    // The pool's own reference still keeps the generation alive.
    assert_eq!(renderer.bos_destroyed(), 0);

    allocator.shutdown(&renderer, &renderer);
    assert_eq!(renderer.bos_destroyed(), 1);
    assert_eq!(renderer.remote_frees(), 1);
}

#[test]
fn range_batches_forward_each_entry() {
    let (renderer, allocator) = setup();

    let mut first = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    let mut second = allocator
        .allocate(&renderer, &renderer, &AllocateRequest::new(1024, HOST_VISIBLE))
        .unwrap();
    first.map(&renderer, 0, None).unwrap();
    second.map(&renderer, 0, None).unwrap();

    virtgpu_mem::flush_ranges(
        &renderer,
        &[
            MappedRange {
                memory: &first,
                offset: 0,
                size: Some(512),
            },
            MappedRange {
                memory: &second,
                offset: 128,
                size: None,
            },
        ],
    );

    let flushes = renderer.flushes();
    assert_eq!(flushes.len(), 2);
    assert_eq!((flushes[0].1, flushes[0].2), (0, 512));
    assert_eq!((flushes[1].1, flushes[1].2), (4096 + 128, 1024 - 128));

    virtgpu_mem::invalidate_ranges(
        &renderer,
        &[MappedRange {
            memory: &first,
            offset: 0,
            size: None,
        }],
    );
    assert_eq!(renderer.invalidates().len(), 1);

    // Unmap is a bookkeeping point only; the mapping stays usable.
    first.unmap(&renderer);
    first.map(&renderer, 0, None).unwrap();
}

#[test]
fn concurrent_suballocations_do_not_overlap() {
    let (renderer, allocator) = setup();
    let ranges = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for thread in 0..8u64 {
            let renderer = &renderer;
            let allocator = &allocator;
            let ranges = &ranges;
            scope.spawn(move || {
                for i in 0..32u64 {
                    let size = 1024 + (thread * 32 + i) * 61 % (16 * 1024);
                    let mem = allocator
                        .allocate(
                            renderer,
                            renderer,
                            &AllocateRequest::new(size, HOST_VISIBLE),
                        )
                        .unwrap();
                    ranges.lock().unwrap().push((mem.offset(), size));
                }
            });
        }
    });

    // 8 * 32 requests of at most 16 KiB fit in one generation.
    assert_eq!(renderer.remote_allocations(), 1);

    let mut ranges = ranges.into_inner().unwrap();
    ranges.sort_unstable();
    assert_eq!(ranges.len(), 256);

    let mut end = 0;
    for (offset, size) in ranges {
        assert!(offset >= end, "suballocations overlap");
        end = offset + size;
    }
    assert!(end <= POOL_CAPACITY);
}
