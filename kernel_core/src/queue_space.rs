//! Completion-queue posting
//!
//! Each address space keeps a registry of the completion queues living in
//! it, keyed by the queue's base address. The first submission against a
//! queue reads its shared header and validates the capacity; after that the
//! kernel tracks the producer cursor itself and mirrors it into the header.
//!
//! Delivery reserves a contiguous chunk, renders the record batch into it,
//! and only then publishes the new producer cursor, with a release fence
//! between payload and cursor so a consumer that observes the cursor also
//! observes the payload.

use core_types::{KernelError, KernelResult, VirtAddr};
use kernel_api::queue::{
    ELEMENT_HEADER_SIZE, ELEMENT_KIND_BATCH, ELEMENT_KIND_PADDING, QUEUE_HEADER_SIZE,
};
use kernel_api::QueueHeader;
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use crate::address_space::AddressSpace;
use crate::writer::EventWriter;

struct QueueState {
    capacity: u64,
    producer: u64,
}

/// Registry of queues within one address space.
pub(crate) struct QueueSpace {
    queues: Mutex<HashMap<u64, QueueState>>,
}

impl QueueSpace {
    pub fn new() -> QueueSpace {
        QueueSpace {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Appends one element holding the rendered batch.
    pub fn post(
        &self,
        space: &Arc<AddressSpace>,
        queue: VirtAddr,
        context: u64,
        writers: Vec<EventWriter>,
    ) -> KernelResult<()> {
        let mut registry = self.queues.lock().expect("queue registry lock");
        if !registry.contains_key(&queue.value()) {
            let mut header_bytes = [0u8; QUEUE_HEADER_SIZE as usize];
            space.read(queue, &mut header_bytes)?;
            let header =
                QueueHeader::decode(&header_bytes).ok_or(KernelError::IllegalArgs)?;
            if header.capacity == 0 || header.capacity % 8 != 0 {
                return Err(KernelError::IllegalArgs);
            }
            registry.insert(
                queue.value(),
                QueueState {
                    capacity: header.capacity,
                    producer: header.producer,
                },
            );
        }
        let state = registry.get_mut(&queue.value()).expect("registered queue");

        let payload: u64 = writers.iter().map(EventWriter::size).sum();
        let element = ELEMENT_HEADER_SIZE + payload;
        if element > state.capacity {
            return Err(KernelError::IllegalArgs);
        }

        let data_base = queue.value() + QUEUE_HEADER_SIZE;
        let mut producer = state.producer;
        let position = producer % state.capacity;
        let tail = state.capacity - position;
        if tail < element {
            if tail >= ELEMENT_HEADER_SIZE {
                let mut padding = Vec::with_capacity(ELEMENT_HEADER_SIZE as usize);
                padding.extend_from_slice(&((tail - ELEMENT_HEADER_SIZE) as u32).to_le_bytes());
                padding.extend_from_slice(&ELEMENT_KIND_PADDING.to_le_bytes());
                padding.extend_from_slice(&0u64.to_le_bytes());
                space.write(VirtAddr::new(data_base + position), &padding)?;
            }
            producer += tail;
        }

        let position = producer % state.capacity;
        let mut cursor = data_base + position + ELEMENT_HEADER_SIZE;
        for writer in writers {
            let bytes = writer.render();
            space.write(VirtAddr::new(cursor), &bytes)?;
            cursor += bytes.len() as u64;
        }

        let mut element_header = Vec::with_capacity(ELEMENT_HEADER_SIZE as usize);
        element_header.extend_from_slice(&(payload as u32).to_le_bytes());
        element_header.extend_from_slice(&ELEMENT_KIND_BATCH.to_le_bytes());
        element_header.extend_from_slice(&context.to_le_bytes());
        space.write(VirtAddr::new(data_base + position), &element_header)?;

        producer += element;

        // Publish the cursor only after the element bytes are visible.
        fence(Ordering::Release);
        space.write(
            VirtAddr::new(queue.value() + 8),
            &producer.to_le_bytes(),
        )?;
        state.producer = producer;
        Ok(())
    }
}
