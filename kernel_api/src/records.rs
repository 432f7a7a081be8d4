//! Completion-record layouts
//!
//! Every asynchronous operation completes by writing one or more records
//! into the submitter's completion queue. All records start with an
//! `(error, _)` pair of 32-bit words, use little-endian fields, and occupy a
//! multiple of eight bytes. A multi-action submission concatenates its
//! records into one batch, in submission order.
//!
//! Records are not self-describing: the consumer knows what it submitted and
//! parses with the matching [`RecordKind`] sequence.

use core_types::Handle;
use serde::{Deserialize, Serialize};

/// Alignment of every record within a batch.
pub const RECORD_ALIGN: usize = 8;

/// Rounds a byte count up to record alignment.
pub fn align_up(size: usize) -> usize {
    (size + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// The wire shape of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// `{err, _}`
    Simple,
    /// `{err, _, handle}`
    Handle,
    /// `{err, _, length}`
    Length,
    /// `{err, _, length, payload[length]}`, padded
    Inline,
    /// `{err, observation, _}`
    Observe,
    /// `{err, _, offset, length}`
    Manage,
}

/// A decoded completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionRecord {
    Simple { error: u32 },
    Handle { error: u32, handle: Handle },
    Length { error: u32, length: u64 },
    Inline { error: u32, data: Vec<u8> },
    Observe { error: u32, observation: u32 },
    Manage { error: u32, offset: u64, length: u64 },
}

impl CompletionRecord {
    /// The error code carried in the record's leading field.
    pub fn error(&self) -> u32 {
        match self {
            CompletionRecord::Simple { error }
            | CompletionRecord::Handle { error, .. }
            | CompletionRecord::Length { error, .. }
            | CompletionRecord::Inline { error, .. }
            | CompletionRecord::Observe { error, .. }
            | CompletionRecord::Manage { error, .. } => *error,
        }
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Encodes a simple record.
pub fn encode_simple(error: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u32(&mut out, error);
    put_u32(&mut out, 0);
    out
}

/// Encodes a handle record.
pub fn encode_handle(error: u32, handle: Handle) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_u32(&mut out, error);
    put_u32(&mut out, 0);
    out.extend_from_slice(&handle.raw().to_le_bytes());
    out
}

/// Encodes a length record.
pub fn encode_length(error: u32, length: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_u32(&mut out, error);
    put_u32(&mut out, 0);
    put_u64(&mut out, length);
    out
}

/// Encodes an inline record; the payload follows the length field and the
/// record is padded to alignment.
pub fn encode_inline(error: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(align_up(16 + data.len()));
    put_u32(&mut out, error);
    put_u32(&mut out, 0);
    put_u64(&mut out, data.len() as u64);
    out.extend_from_slice(data);
    out.resize(align_up(out.len()), 0);
    out
}

/// Encodes an observe record.
pub fn encode_observe(error: u32, observation: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_u32(&mut out, error);
    put_u32(&mut out, observation);
    put_u64(&mut out, 0);
    out
}

/// Encodes a manage record.
pub fn encode_manage(error: u32, offset: u64, length: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    put_u32(&mut out, error);
    put_u32(&mut out, 0);
    put_u64(&mut out, offset);
    put_u64(&mut out, length);
    out
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    bytes.get(at..at + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Decodes one record of the given kind; returns the record and the number
/// of bytes consumed (always a multiple of the alignment).
pub fn parse_record(kind: RecordKind, bytes: &[u8]) -> Option<(CompletionRecord, usize)> {
    let error = read_u32(bytes, 0)?;
    match kind {
        RecordKind::Simple => Some((CompletionRecord::Simple { error }, 8)),
        RecordKind::Handle => {
            let raw = read_u64(bytes, 8)? as i64;
            Some((
                CompletionRecord::Handle {
                    error,
                    handle: Handle::from_raw(raw),
                },
                16,
            ))
        }
        RecordKind::Length => {
            let length = read_u64(bytes, 8)?;
            Some((CompletionRecord::Length { error, length }, 16))
        }
        RecordKind::Inline => {
            let length = read_u64(bytes, 8)? as usize;
            let data = bytes.get(16..16 + length)?.to_vec();
            Some((
                CompletionRecord::Inline { error, data },
                align_up(16 + length),
            ))
        }
        RecordKind::Observe => {
            let observation = read_u32(bytes, 4)?;
            Some((CompletionRecord::Observe { error, observation }, 16))
        }
        RecordKind::Manage => {
            let offset = read_u64(bytes, 8)?;
            let length = read_u64(bytes, 16)?;
            Some((
                CompletionRecord::Manage {
                    error,
                    offset,
                    length,
                },
                24,
            ))
        }
    }
}

/// Decodes a batch of records written back-to-back in submission order.
pub fn parse_batch(kinds: &[RecordKind], bytes: &[u8]) -> Option<Vec<CompletionRecord>> {
    let mut records = Vec::with_capacity(kinds.len());
    let mut at = 0;
    for &kind in kinds {
        let (record, consumed) = parse_record(kind, &bytes[at..])?;
        records.push(record);
        at += consumed;
    }
    Some(records)
}
