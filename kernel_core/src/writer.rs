//! Completion writers
//!
//! Every asynchronous operation ends by writing records into the
//! submitter's completion queue. A writer is one record's worth of pending
//! output: it knows its encoded size up front and renders itself when the
//! queue chunk is reserved. Handle-carrying writers attach their descriptor
//! to the destination universe at render time, so a handle only becomes
//! visible together with its record.

use core_types::{error::CODE_NONE, Handle, KernelError, VirtAddr};
use kernel_api::records;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::address_space::AddressSpace;
use crate::klog::{KernelLog, LogLevel};
use crate::universe::{Descriptor, Universe};

/// One pending completion record.
pub enum EventWriter {
    Simple {
        error: u32,
    },
    Handle {
        error: u32,
        universe: Weak<Universe>,
        descriptor: Option<Descriptor>,
    },
    Length {
        error: u32,
        length: u64,
    },
    Inline {
        error: u32,
        data: Vec<u8>,
    },
    Observe {
        error: u32,
        observation: u32,
    },
    Manage {
        error: u32,
        offset: u64,
        length: u64,
    },
}

impl EventWriter {
    pub fn ok() -> Self {
        EventWriter::Simple { error: CODE_NONE }
    }

    pub fn failed(error: KernelError) -> Self {
        EventWriter::Simple {
            error: error.code(),
        }
    }

    /// Encoded size in bytes, padded to record alignment.
    pub fn size(&self) -> u64 {
        match self {
            EventWriter::Simple { .. } => 8,
            EventWriter::Handle { .. } => 16,
            EventWriter::Length { .. } => 16,
            EventWriter::Inline { data, .. } => records::align_up(16 + data.len()) as u64,
            EventWriter::Observe { .. } => 16,
            EventWriter::Manage { .. } => 24,
        }
    }

    /// Renders the record bytes. For handle records this is the point where
    /// the descriptor is attached to the destination universe; if that
    /// universe is gone the descriptor is dropped and the record carries the
    /// null handle.
    pub fn render(self) -> Vec<u8> {
        match self {
            EventWriter::Simple { error } => records::encode_simple(error),
            EventWriter::Handle {
                error,
                universe,
                descriptor,
            } => {
                let handle = match (universe.upgrade(), descriptor) {
                    (Some(universe), Some(descriptor)) => universe.attach(descriptor),
                    _ => Handle::NULL,
                };
                records::encode_handle(error, handle)
            }
            EventWriter::Length { error, length } => records::encode_length(error, length),
            EventWriter::Inline { error, data } => records::encode_inline(error, &data),
            EventWriter::Observe { error, observation } => {
                records::encode_observe(error, observation)
            }
            EventWriter::Manage {
                error,
                offset,
                length,
            } => records::encode_manage(error, offset, length),
        }
    }
}

/// The queue a submission's completions are delivered to.
#[derive(Clone)]
pub struct QueueTarget {
    pub space: Arc<AddressSpace>,
    pub queue: VirtAddr,
    pub context: u64,
    pub log: Arc<KernelLog>,
}

impl QueueTarget {
    /// Posts one batch of writers; an undeliverable batch is logged and
    /// dropped.
    pub fn post(&self, writers: Vec<EventWriter>) {
        if let Err(error) = self.space.post_completion(self.queue, self.context, writers) {
            self.log.append(
                LogLevel::Error,
                format!(
                    "dropped completion batch for queue {}: {}",
                    self.queue, error
                ),
            );
        }
    }
}

/// Accumulates the per-action records of one multi-action submission and
/// flushes them as a single batch once every action has completed.
pub struct Batch {
    target: QueueTarget,
    slots: Mutex<Vec<Option<EventWriter>>>,
    remaining: AtomicUsize,
}

impl Batch {
    pub fn new(target: QueueTarget, count: usize) -> Arc<Batch> {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || None);
        Arc::new(Batch {
            target,
            slots: Mutex::new(slots),
            remaining: AtomicUsize::new(count),
        })
    }

    fn set_result(&self, index: usize, writer: EventWriter) {
        {
            let mut slots = self.slots.lock().expect("batch lock");
            debug_assert!(slots[index].is_none());
            slots[index] = Some(writer);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let writers: Vec<EventWriter> = {
                let mut slots = self.slots.lock().expect("batch lock");
                slots.drain(..).map(|slot| slot.expect("batch slot")).collect()
            };
            self.target.post(writers);
        }
    }
}

/// Where one operation delivers its single completion.
pub enum Completer {
    /// Slot `index` of a multi-action batch.
    Batched { batch: Arc<Batch>, index: usize },
    /// A standalone submission with its own queue element.
    Direct(QueueTarget),
    /// Captures the writer for inspection (unit tests).
    Collect(Arc<Mutex<Vec<EventWriter>>>),
}

impl Completer {
    pub fn complete(self, writer: EventWriter) {
        match self {
            Completer::Batched { batch, index } => batch.set_result(index, writer),
            Completer::Direct(target) => target.post(vec![writer]),
            Completer::Collect(sink) => {
                sink.lock().expect("collect sink lock").push(writer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_sizes_are_aligned() {
        let writers = [
            EventWriter::ok(),
            EventWriter::Length { error: 0, length: 5 },
            EventWriter::Inline {
                error: 0,
                data: b"abc".to_vec(),
            },
            EventWriter::Observe {
                error: 0,
                observation: 1,
            },
            EventWriter::Manage {
                error: 0,
                offset: 0,
                length: 4096,
            },
        ];
        for writer in &writers {
            assert_eq!(writer.size() % 8, 0);
        }
    }

    #[test]
    fn test_render_matches_size() {
        let writer = EventWriter::Inline {
            error: 0,
            data: b"hello".to_vec(),
        };
        let size = writer.size();
        assert_eq!(writer.render().len() as u64, size);
    }

    #[test]
    fn test_failed_carries_code() {
        let writer = EventWriter::failed(KernelError::ClosedRemotely);
        let bytes = writer.render();
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            KernelError::ClosedRemotely.code()
        );
    }

    #[test]
    fn test_collect_completer() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        Completer::Collect(sink.clone()).complete(EventWriter::ok());
        assert_eq!(sink.lock().unwrap().len(), 1);
    }
}
