//! Packet fragmentation for size-limited message transports.
//!
//! The transport carries opaque messages with a hard length ceiling, so
//! packets above the ceiling travel as numbered chunks:
//!
//! ```text
//! [total_chunks: u8][chunk_index: u8][payload...]
//! ```
//!
//! The header is two bytes on every message, single-chunk packets
//! included. Delivery is assumed ordered per sender but individual
//! messages may be lost.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::WireError;
use crate::{WireResult, CHUNK_HEADER_LEN, MAX_CHUNKS};

/// Split a packet into transport messages of at most `max_message_len`
/// bytes each, header included.
pub fn chunk_packet(packet: &[u8], max_message_len: usize) -> WireResult<Vec<Bytes>> {
    if max_message_len <= CHUNK_HEADER_LEN {
        return Err(WireError::LimitTooSmall(max_message_len));
    }
    let payload_per_chunk = max_message_len - CHUNK_HEADER_LEN;

    let total = if packet.is_empty() {
        1
    } else {
        packet.len().div_ceil(payload_per_chunk)
    };
    if total > MAX_CHUNKS {
        return Err(WireError::PacketTooLarge {
            len: packet.len(),
            max_chunks: MAX_CHUNKS,
        });
    }

    let mut messages = Vec::with_capacity(total);
    if packet.is_empty() {
        let mut msg = BytesMut::with_capacity(CHUNK_HEADER_LEN);
        msg.put_u8(1);
        msg.put_u8(0);
        messages.push(msg.freeze());
    } else {
        for (index, part) in packet.chunks(payload_per_chunk).enumerate() {
            let mut msg = BytesMut::with_capacity(CHUNK_HEADER_LEN + part.len());
            msg.put_u8(total as u8);
            msg.put_u8(index as u8);
            msg.put_slice(part);
            messages.push(msg.freeze());
        }
    }

    Ok(messages)
}

/// Reassembles chunked packets from an ordered message stream.
///
/// Assemblies are keyed by the declared chunk count alone: a chunk whose
/// total differs from the active assembly discards that assembly and
/// starts a new one. Two packets with the same chunk count interleaved
/// by a reordering transport would corrupt each other; the transport
/// contract is ordered delivery per sender.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: usize,
    received: usize,
    parts: Vec<Option<Bytes>>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a multi-chunk assembly is in progress.
    pub fn in_progress(&self) -> bool {
        self.expected != 0
    }

    /// Feed one transport message. Returns the reassembled packet once
    /// all of its chunks have arrived.
    pub fn feed(&mut self, message: &[u8]) -> WireResult<Option<Bytes>> {
        if message.len() < CHUNK_HEADER_LEN {
            self.clear();
            return Err(WireError::Truncated {
                needed: CHUNK_HEADER_LEN,
                actual: message.len(),
            });
        }

        let total = message[0] as usize;
        let index = message[1] as usize;
        let payload = &message[CHUNK_HEADER_LEN..];

        if total == 0 {
            self.clear();
            return Err(WireError::MalformedChunk("zero chunk count".into()));
        }
        if index >= total {
            self.clear();
            return Err(WireError::MalformedChunk(format!(
                "chunk index {index} out of range for {total}"
            )));
        }

        // Single-chunk packets bypass assembly state entirely.
        if total == 1 {
            return Ok(Some(Bytes::copy_from_slice(payload)));
        }

        if total != self.expected {
            if self.in_progress() {
                trace!(
                    received = self.received,
                    expected = self.expected,
                    new_total = total,
                    "Abandoning partial assembly"
                );
            }
            self.restart(total);
        }

        let slot = &mut self.parts[index];
        if slot.is_some() {
            trace!(index, "Duplicate chunk ignored");
            return Ok(None);
        }
        *slot = Some(Bytes::copy_from_slice(payload));
        self.received += 1;

        if self.received < self.expected {
            return Ok(None);
        }

        let len: usize = self
            .parts
            .iter()
            .map(|part| part.as_ref().map_or(0, |b| b.len()))
            .sum();
        let mut packet = BytesMut::with_capacity(len);
        for part in self.parts.drain(..) {
            if let Some(part) = part {
                packet.put_slice(&part);
            }
        }
        self.expected = 0;
        self.received = 0;
        Ok(Some(packet.freeze()))
    }

    fn restart(&mut self, total: usize) {
        self.expected = total;
        self.received = 0;
        self.parts.clear();
        self.parts.resize(total, None);
    }

    fn clear(&mut self) {
        self.expected = 0;
        self.received = 0;
        self.parts.clear();
    }
}
