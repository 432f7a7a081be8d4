//! Completion-queue memory layout
//!
//! A completion queue is a ring the user owns in their own address space.
//! The layout is a fixed header followed by `capacity` bytes of data:
//!
//! ```text
//! offset 0   capacity   u64   set once by the owner before first use
//! offset 8   producer   u64   monotonically increasing, written by kernel
//! offset 16  consumer   u64   monotonically increasing, written by owner
//! offset 24  data[capacity]
//! ```
//!
//! The kernel appends *elements*. Each element is a 16-byte header
//! `{length, kind, context}` followed by `length` payload bytes padded to
//! eight. Elements never straddle the ring end: when the tail of the ring
//! cannot hold an element contiguously, the kernel emits a padding element
//! (or, if fewer than 16 bytes remain, skips them implicitly) and wraps.
//! The producer cursor is published only after the element bytes are
//! visible.

use serde::{Deserialize, Serialize};

/// Size of the shared queue header.
pub const QUEUE_HEADER_SIZE: u64 = 24;

/// Size of each element header.
pub const ELEMENT_HEADER_SIZE: u64 = 16;

/// Element kind: a completion batch.
pub const ELEMENT_KIND_BATCH: u32 = 0;

/// Element kind: padding emitted at ring wrap; consumers skip it.
pub const ELEMENT_KIND_PADDING: u32 = 1;

/// The shared queue header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHeader {
    pub capacity: u64,
    pub producer: u64,
    pub consumer: u64,
}

impl QueueHeader {
    /// A fresh header for a ring of `capacity` data bytes.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            producer: 0,
            consumer: 0,
        }
    }

    /// Serializes the header into its 24-byte layout.
    pub fn encode(&self) -> [u8; QUEUE_HEADER_SIZE as usize] {
        let mut out = [0u8; QUEUE_HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        out[8..16].copy_from_slice(&self.producer.to_le_bytes());
        out[16..24].copy_from_slice(&self.consumer.to_le_bytes());
        out
    }

    /// Reads a header from the start of queue memory.
    pub fn decode(bytes: &[u8]) -> Option<QueueHeader> {
        if bytes.len() < QUEUE_HEADER_SIZE as usize {
            return None;
        }
        let word = |at: usize| {
            u64::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
                bytes[at + 4],
                bytes[at + 5],
                bytes[at + 6],
                bytes[at + 7],
            ])
        };
        Some(QueueHeader {
            capacity: word(0),
            producer: word(8),
            consumer: word(16),
        })
    }
}

/// One element drained from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueElement {
    /// The context supplied at submission time.
    pub context: u64,
    /// The record batch, back-to-back in submission order.
    pub payload: Vec<u8>,
}

/// Reads elements out of a snapshot of queue memory.
///
/// The reader tracks its own consumer position; it starts at the position
/// recorded in the snapshot's header.
#[derive(Debug)]
pub struct RingReader {
    memory: Vec<u8>,
    consumer: u64,
}

impl RingReader {
    /// Wraps a snapshot of the whole queue memory (header plus data).
    pub fn new(memory: Vec<u8>) -> Option<RingReader> {
        let header = QueueHeader::decode(&memory)?;
        Some(RingReader {
            memory,
            consumer: header.consumer,
        })
    }

    fn header(&self) -> QueueHeader {
        QueueHeader::decode(&self.memory).unwrap_or(QueueHeader {
            capacity: 0,
            producer: 0,
            consumer: 0,
        })
    }

    /// The reader's consumer cursor, to be stored back by the owner.
    pub fn consumer(&self) -> u64 {
        self.consumer
    }

    fn data_at(&self, cursor: u64) -> usize {
        let header = self.header();
        (QUEUE_HEADER_SIZE + cursor % header.capacity) as usize
    }

    fn read_u32(&self, at: usize) -> Option<u32> {
        self.memory
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&self, at: usize) -> Option<u64> {
        self.memory.get(at..at + 8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    /// Drains the next element, skipping padding, or returns `None` when the
    /// reader has caught up with the producer.
    pub fn next(&mut self) -> Option<QueueElement> {
        loop {
            let header = self.header();
            if header.capacity == 0 || self.consumer >= header.producer {
                return None;
            }

            // Implicit skip: too little room at the tail for a header.
            let tail = header.capacity - self.consumer % header.capacity;
            if tail < ELEMENT_HEADER_SIZE {
                self.consumer += tail;
                continue;
            }

            let at = self.data_at(self.consumer);
            let length = self.read_u32(at)? as u64;
            let kind = self.read_u32(at + 4)?;
            let context = self.read_u64(at + 8)?;

            let padded = (length + 7) & !7;
            self.consumer += ELEMENT_HEADER_SIZE + padded;

            if kind == ELEMENT_KIND_PADDING {
                continue;
            }

            let start = at + ELEMENT_HEADER_SIZE as usize;
            let payload = self.memory.get(start..start + length as usize)?.to_vec();
            return Some(QueueElement { context, payload });
        }
    }

    /// Drains every available element.
    pub fn drain(&mut self) -> Vec<QueueElement> {
        let mut elements = Vec::new();
        while let Some(element) = self.next() {
            elements.push(element);
        }
        elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_queue(capacity: u64) -> Vec<u8> {
        let mut memory = vec![0u8; (QUEUE_HEADER_SIZE + capacity) as usize];
        memory[0..QUEUE_HEADER_SIZE as usize]
            .copy_from_slice(&QueueHeader::with_capacity(capacity).encode());
        memory
    }

    fn append(memory: &mut [u8], kind: u32, context: u64, payload: &[u8]) {
        let mut header = QueueHeader::decode(memory).unwrap();
        let at = (QUEUE_HEADER_SIZE + header.producer % header.capacity) as usize;
        memory[at..at + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        memory[at + 4..at + 8].copy_from_slice(&kind.to_le_bytes());
        memory[at + 8..at + 16].copy_from_slice(&context.to_le_bytes());
        memory[at + 16..at + 16 + payload.len()].copy_from_slice(payload);
        let padded = (payload.len() as u64 + 7) & !7;
        header.producer += ELEMENT_HEADER_SIZE + padded;
        let encoded = header.encode();
        memory[..QUEUE_HEADER_SIZE as usize].copy_from_slice(&encoded);
    }

    #[test]
    fn test_header_round_trip() {
        let header = QueueHeader {
            capacity: 256,
            producer: 48,
            consumer: 16,
        };
        assert_eq!(QueueHeader::decode(&header.encode()), Some(header));
    }

    #[test]
    fn test_empty_queue_yields_nothing() {
        let memory = build_queue(128);
        let mut reader = RingReader::new(memory).unwrap();
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reads_elements_in_order() {
        let mut memory = build_queue(256);
        append(&mut memory, ELEMENT_KIND_BATCH, 11, b"first!!!");
        append(&mut memory, ELEMENT_KIND_BATCH, 22, b"second!!");

        let mut reader = RingReader::new(memory).unwrap();
        let first = reader.next().unwrap();
        assert_eq!(first.context, 11);
        assert_eq!(first.payload, b"first!!!");
        let second = reader.next().unwrap();
        assert_eq!(second.context, 22);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_padding_elements_are_skipped() {
        let mut memory = build_queue(256);
        append(&mut memory, ELEMENT_KIND_PADDING, 0, &[0u8; 8]);
        append(&mut memory, ELEMENT_KIND_BATCH, 5, b"payload!");

        let mut reader = RingReader::new(memory).unwrap();
        let element = reader.next().unwrap();
        assert_eq!(element.context, 5);
    }

    #[test]
    fn test_drain_collects_everything() {
        let mut memory = build_queue(512);
        for context in 0..4u64 {
            append(&mut memory, ELEMENT_KIND_BATCH, context, b"x.......");
        }
        let mut reader = RingReader::new(memory).unwrap();
        let elements = reader.drain();
        assert_eq!(elements.len(), 4);
        assert_eq!(elements[3].context, 3);
    }
}
