//! Managed memory conformance
//!
//! The fault-driven fill protocol between a frontal consumer and a backing
//! pager, lock-memory completion, and manage-record accounting.

use core_types::{Handle, KernelError, PAGE_SIZE};
use kernel_api::records::parse_batch;
use kernel_api::{flags, Action, CompletionRecord, RecordKind};
use tests_conformance::{drain_queue, setup_queue, test_bootstrap, wait_until};

const CAPACITY: u64 = 1024;

#[test]
fn test_fault_fill_resume_round_trip() {
    let (kernel, pager) = test_bootstrap();
    let queue = setup_queue(&kernel, &pager, CAPACITY);

    let (backing, frontal) = kernel
        .create_managed_memory(&pager, 4 * PAGE_SIZE)
        .unwrap();
    let backing_map = kernel
        .map_memory(
            &pager,
            backing,
            Handle::NULL,
            None,
            0,
            4 * PAGE_SIZE,
            flags::MAP_READ_WRITE,
        )
        .unwrap();

    // The consumer runs in its own address space with the frontal view.
    let consumer_space = kernel.create_space(&pager).unwrap();
    let consumer_handle = kernel
        .create_thread(&pager, Handle::NULL, consumer_space, 0, 0, 0)
        .unwrap();
    let consumer = tests_conformance::thread_object(&pager, consumer_handle);
    let frontal_map = kernel
        .map_memory(
            &pager,
            frontal,
            consumer_space,
            None,
            0,
            4 * PAGE_SIZE,
            flags::MAP_READ_ONLY,
        )
        .unwrap();

    kernel
        .submit_manage_memory(&pager, backing, queue, 100)
        .unwrap();

    // The consumer reads page zero and blocks on the absent page.
    let reader_kernel = kernel.clone();
    let reader = std::thread::spawn(move || {
        reader_kernel
            .read_memory(&consumer, frontal_map, 12)
            .unwrap()
    });

    // The pager sees exactly one manage record for the faulted page.
    let kernel_for_wait = kernel.clone();
    let pager_for_wait = pager.clone();
    wait_until(move || {
        !drain_queue(&kernel_for_wait, &pager_for_wait, queue, CAPACITY).is_empty()
    });
    let elements = drain_queue(&kernel, &pager, queue, CAPACITY);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].context, 100);
    let records = parse_batch(&[RecordKind::Manage], &elements[0].payload).unwrap();
    assert!(matches!(
        records[0],
        CompletionRecord::Manage { error: 0, offset: 0, length } if length == PAGE_SIZE
    ));

    // Fill the page through the backing mapping and declare it loaded.
    kernel
        .write_memory(&pager, backing_map, b"filled by pager")
        .unwrap();
    kernel.complete_load(&pager, backing, 0, PAGE_SIZE).unwrap();

    let bytes = reader.join().unwrap();
    assert_eq!(&bytes, b"filled by pa");
}

#[test]
fn test_lock_memory_completes_when_range_present() {
    let (kernel, pager) = test_bootstrap();
    let queue = setup_queue(&kernel, &pager, CAPACITY);

    let (backing, frontal) = kernel
        .create_managed_memory(&pager, 2 * PAGE_SIZE)
        .unwrap();
    kernel
        .submit_lock_memory(&pager, frontal, 0, 2 * PAGE_SIZE, queue, 7)
        .unwrap();
    assert!(drain_queue(&kernel, &pager, queue, CAPACITY).is_empty());

    kernel.complete_load(&pager, backing, 0, PAGE_SIZE).unwrap();
    assert!(drain_queue(&kernel, &pager, queue, CAPACITY).is_empty());

    kernel
        .complete_load(&pager, backing, PAGE_SIZE, PAGE_SIZE)
        .unwrap();
    let elements = drain_queue(&kernel, &pager, queue, CAPACITY);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].context, 7);
    let records = parse_batch(&[RecordKind::Simple], &elements[0].payload).unwrap();
    assert_eq!(records[0].error(), 0);
}

#[test]
fn test_lock_memory_requests_missing_pages() {
    let (kernel, pager) = test_bootstrap();
    let queue = setup_queue(&kernel, &pager, CAPACITY);

    let (backing, frontal) = kernel
        .create_managed_memory(&pager, 2 * PAGE_SIZE)
        .unwrap();
    kernel
        .submit_manage_memory(&pager, backing, queue, 1)
        .unwrap();
    kernel
        .submit_lock_memory(&pager, frontal, 0, 2 * PAGE_SIZE, queue, 2)
        .unwrap();

    // The lock submission itself files the load request.
    let elements = drain_queue(&kernel, &pager, queue, CAPACITY);
    assert_eq!(elements.len(), 1);
    let records = parse_batch(&[RecordKind::Manage], &elements[0].payload).unwrap();
    assert!(matches!(
        records[0],
        CompletionRecord::Manage { error: 0, offset: 0, length } if length == 2 * PAGE_SIZE
    ));
}

#[test]
fn test_manage_records_match_distinct_unsatisfied_ranges() {
    let (kernel, pager) = test_bootstrap();
    let queue = setup_queue(&kernel, &pager, CAPACITY);

    let (backing, frontal) = kernel
        .create_managed_memory(&pager, 8 * PAGE_SIZE)
        .unwrap();

    // Two distinct ranges requested before any manage submission.
    kernel.loadahead(&pager, frontal, 0, PAGE_SIZE).unwrap();
    kernel
        .loadahead(&pager, frontal, 4 * PAGE_SIZE, 2 * PAGE_SIZE)
        .unwrap();
    // Overlapping re-requests do not add records.
    kernel.loadahead(&pager, frontal, 0, PAGE_SIZE).unwrap();
    kernel
        .loadahead(&pager, frontal, 4 * PAGE_SIZE, PAGE_SIZE)
        .unwrap();

    for context in [1u64, 2, 3] {
        kernel
            .submit_manage_memory(&pager, backing, queue, context)
            .unwrap();
    }

    let elements = drain_queue(&kernel, &pager, queue, CAPACITY);
    // Exactly two manage records: one per distinct unsatisfied range; the
    // third submission stays parked.
    assert_eq!(elements.len(), 2);
    let mut ranges = Vec::new();
    for element in &elements {
        let records = parse_batch(&[RecordKind::Manage], &element.payload).unwrap();
        if let CompletionRecord::Manage { offset, length, .. } = records[0] {
            ranges.push((offset, length));
        }
    }
    ranges.sort_unstable();
    assert_eq!(
        ranges,
        vec![(0, PAGE_SIZE), (4 * PAGE_SIZE, 2 * PAGE_SIZE)]
    );

    // A fresh request on an untouched range reaches the parked submission.
    kernel
        .loadahead(&pager, frontal, 7 * PAGE_SIZE, PAGE_SIZE)
        .unwrap();
    let elements = drain_queue(&kernel, &pager, queue, CAPACITY);
    assert_eq!(elements.len(), 3);
}

#[test]
fn test_complete_load_validation_and_idempotence() {
    let (kernel, pager) = test_bootstrap();
    let (backing, _frontal) = kernel.create_managed_memory(&pager, PAGE_SIZE).unwrap();

    assert_eq!(
        kernel.complete_load(&pager, backing, 1, PAGE_SIZE),
        Err(KernelError::IllegalArgs)
    );
    assert_eq!(
        kernel.complete_load(&pager, backing, 0, PAGE_SIZE + 8),
        Err(KernelError::IllegalArgs)
    );
    kernel.complete_load(&pager, backing, 0, PAGE_SIZE).unwrap();
    // Re-loading an already present range is not an error.
    kernel.complete_load(&pager, backing, 0, PAGE_SIZE).unwrap();
}

#[test]
fn test_manage_ops_require_managed_memory() {
    let (kernel, caller) = test_bootstrap();
    let queue = setup_queue(&kernel, &caller, CAPACITY);
    let plain = kernel.allocate_memory(&caller, PAGE_SIZE, 0).unwrap();

    assert_eq!(
        kernel.submit_manage_memory(&caller, plain, queue, 1),
        Err(KernelError::IllegalArgs)
    );
    assert_eq!(
        kernel.complete_load(&caller, plain, 0, PAGE_SIZE),
        Err(KernelError::IllegalArgs)
    );
}

#[test]
fn test_frontal_queue_mapping_does_not_require_backing() {
    let (kernel, caller) = test_bootstrap();

    // A frontal view mapped with the no-backing flag is usable before any
    // pager exists; reads see zeroes instead of faulting into the
    // protocol.
    let (_backing, frontal) = kernel
        .create_managed_memory(&caller, PAGE_SIZE)
        .unwrap();
    let map = kernel
        .map_memory(
            &caller,
            frontal,
            Handle::NULL,
            None,
            0,
            PAGE_SIZE,
            flags::MAP_READ_WRITE | flags::MAP_DONT_REQUIRE_BACKING,
        )
        .unwrap();
    let bytes = kernel.read_memory(&caller, map, 8).unwrap();
    assert_eq!(bytes, vec![0u8; 8]);

    // A stream submission can deliver into a queue placed there.
    let header = kernel_api::QueueHeader::with_capacity(512);
    kernel.write_memory(&caller, map, &header.encode()).unwrap();
    let (left, right) = kernel.create_stream(&caller).unwrap();
    kernel
        .submit_async(&caller, left, vec![Action::send(b"q".to_vec())], map, 9)
        .unwrap();
    kernel
        .submit_async(&caller, right, vec![Action::recv_inline()], map, 10)
        .unwrap();
    let elements = drain_queue(&kernel, &caller, map, 512);
    assert_eq!(elements.len(), 2);
}
