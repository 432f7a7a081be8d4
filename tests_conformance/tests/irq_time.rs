//! IRQ, clock, and syscall-gate conformance

use core_types::{Handle, KernelError};
use kernel_api::records::parse_batch;
use kernel_api::RecordKind;
use kernel_core::{GateEvent, Syscall, SyscallGate, SyscallReply};
use tests_conformance::{drain_queue, setup_queue, test_bootstrap};

const CAPACITY: u64 = 512;

#[test]
fn test_irq_wait_fire_acknowledge_cycle() {
    let (kernel, caller) = test_bootstrap();
    let queue = setup_queue(&kernel, &caller, CAPACITY);
    let irq = kernel.access_irq(&caller, 5).unwrap();

    // First wait: the edge completes it and masks the pin.
    kernel
        .submit_wait_for_irq(&caller, irq, queue, 1)
        .unwrap();
    assert_eq!(kernel.fire_irq(5).unwrap(), 1);

    let elements = drain_queue(&kernel, &caller, queue, CAPACITY);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].context, 1);
    let records = parse_batch(&[RecordKind::Simple], &elements[0].payload).unwrap();
    assert_eq!(records[0].error(), 0);

    // Masked: an edge before acknowledge is lost.
    kernel
        .submit_wait_for_irq(&caller, irq, queue, 2)
        .unwrap();
    assert_eq!(kernel.fire_irq(5).unwrap(), 0);
    assert_eq!(drain_queue(&kernel, &caller, queue, CAPACITY).len(), 1);

    // Acknowledge re-arms; the next edge produces the second record.
    kernel.acknowledge_irq(&caller, irq).unwrap();
    assert_eq!(kernel.fire_irq(5).unwrap(), 1);
    let elements = drain_queue(&kernel, &caller, queue, CAPACITY);
    assert_eq!(elements.len(), 2);
    assert_eq!(elements[1].context, 2);
}

#[test]
fn test_irq_edges_before_submission_are_lost() {
    let (kernel, caller) = test_bootstrap();
    let queue = setup_queue(&kernel, &caller, CAPACITY);
    let irq = kernel.access_irq(&caller, 9).unwrap();

    assert_eq!(kernel.fire_irq(9).unwrap(), 0);
    kernel
        .submit_wait_for_irq(&caller, irq, queue, 1)
        .unwrap();
    // Nothing was queued from the earlier edge.
    assert!(drain_queue(&kernel, &caller, queue, CAPACITY).is_empty());
}

#[test]
fn test_irq_broadcast_to_multiple_waiters() {
    let (kernel, caller) = test_bootstrap();
    let queue = setup_queue(&kernel, &caller, CAPACITY);
    let irq = kernel.access_irq(&caller, 0).unwrap();

    kernel.submit_wait_for_irq(&caller, irq, queue, 1).unwrap();
    kernel.submit_wait_for_irq(&caller, irq, queue, 2).unwrap();
    assert_eq!(kernel.fire_irq(0).unwrap(), 2);

    let elements = drain_queue(&kernel, &caller, queue, CAPACITY);
    let mut contexts: Vec<u64> = elements.iter().map(|element| element.context).collect();
    contexts.sort_unstable();
    assert_eq!(contexts, vec![1, 2]);
}

#[test]
fn test_await_clock_fires_on_advance() {
    let (kernel, caller) = test_bootstrap();
    let queue = setup_queue(&kernel, &caller, CAPACITY);

    assert_eq!(kernel.get_clock(), 0);
    kernel
        .submit_await_clock(&caller, 1_000, queue, 11)
        .unwrap();

    kernel.advance_clock(500);
    assert!(drain_queue(&kernel, &caller, queue, CAPACITY).is_empty());

    kernel.advance_clock(600);
    assert_eq!(kernel.get_clock(), 1_100);
    let elements = drain_queue(&kernel, &caller, queue, CAPACITY);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].context, 11);
}

#[test]
fn test_io_port_enablement() {
    let (kernel, caller) = test_bootstrap();
    let io = kernel.access_io(&caller, &[0x3f8, 0x3f9]).unwrap();

    assert!(!caller.can_use_port(0x3f8));
    kernel.enable_io(&caller, io).unwrap();
    assert!(caller.can_use_port(0x3f8));
    assert!(caller.can_use_port(0x3f9));
    assert!(!caller.can_use_port(0x60));

    kernel.enable_full_io(&caller).unwrap();
    assert!(caller.can_use_port(0x60));
}

#[test]
fn test_gate_drives_full_syscall_flow() {
    let (kernel, caller) = test_bootstrap();
    let gate = SyscallGate::new();

    let memory = match gate
        .dispatch(
            &kernel,
            &caller,
            Syscall::AllocateMemory {
                size: core_types::PAGE_SIZE,
                flags: 0,
            },
        )
        .unwrap()
    {
        SyscallReply::Handle(handle) => handle,
        other => panic!("unexpected reply: {:?}", other),
    };

    let address = match gate
        .dispatch(
            &kernel,
            &caller,
            Syscall::MapMemory {
                memory,
                space: Handle::NULL,
                hint: None,
                offset: 0,
                length: core_types::PAGE_SIZE,
                flags: kernel_api::flags::MAP_READ_WRITE,
            },
        )
        .unwrap()
    {
        SyscallReply::Address(address) => address,
        other => panic!("unexpected reply: {:?}", other),
    };

    match gate
        .dispatch(&kernel, &caller, Syscall::PointerPhysical { address })
        .unwrap()
    {
        SyscallReply::Physical(_) => {}
        other => panic!("unexpected reply: {:?}", other),
    }

    gate.dispatch(
        &kernel,
        &caller,
        Syscall::UnmapMemory {
            space: Handle::NULL,
            address,
            length: core_types::PAGE_SIZE,
        },
    )
    .unwrap();

    // Unmap round-trip left the space empty again: the address no longer
    // resolves.
    let result = gate.dispatch(&kernel, &caller, Syscall::PointerPhysical { address });
    assert_eq!(result.err(), Some(KernelError::IllegalArgs));

    assert_eq!(
        gate.count_events(|event| matches!(event, GateEvent::Completed { .. })),
        4
    );
    assert_eq!(
        gate.count_events(|event| matches!(event, GateEvent::Rejected { .. })),
        1
    );
}

#[test]
fn test_gate_log_reaches_kernel_log() {
    let (kernel, caller) = test_bootstrap();
    let gate = SyscallGate::new();
    gate.dispatch(
        &kernel,
        &caller,
        Syscall::Log {
            message: b"driver online".to_vec(),
        },
    )
    .unwrap();
    assert!(kernel
        .kernel_log()
        .has_entry(|entry| entry.message == "driver online"));
}
