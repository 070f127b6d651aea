//! # Legacy ingest conversion
//!
//! UDP/TCP input plugins run every datagram through a [`LegacyConverter`]
//! before it reaches the preprocessor. NetFlow v5 and v9 datagrams are
//! rewritten into IPFIX wire form; IPFIX passes through untouched. sFlow is
//! accepted when the `sflow` feature is enabled and rejected otherwise.
//!
//! The converter rebuilds the datagram into a fresh bounded buffer rather
//! than shifting bytes in place; the result never exceeds the configured
//! `max_len` and any malformed input fails the whole datagram, which the
//! caller then drops.

mod v5;
mod v9;
#[cfg(feature = "sflow")]
mod sflow;

use crate::input::{InputInfo, Transport};
use crate::CollectorError;

use crate::message::IPFIX_VERSION;

use std::collections::HashMap;
use std::net::SocketAddr;

const NETFLOW_V5_VERSION: u16 = 5;
const NETFLOW_V9_VERSION: u16 = 9;

/// Per-source conversion state, keyed by the remote endpoint so sources
/// never interfere with each other: v5 template refresh bookkeeping, v9
/// template dimensions, and the collector-side sequence counter of each
/// legacy stream kind. A rewritten datagram carries its own source's
/// record count, which downstream gap detection treats as the exporter
/// sequence number.
#[derive(Debug, Default)]
struct SourceState {
    v5: v5::RefreshState,
    v9: v9::TemplateDims,
    sequences: [u32; 3],
}

/// Stream kinds with independent collector-side sequence counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    V5,
    V9,
    #[cfg_attr(not(feature = "sflow"), allow(dead_code))]
    Sflow,
}

/// One converter instance per input plugin.
pub struct LegacyConverter {
    transport: Transport,
    max_len: usize,
    sources: HashMap<SocketAddr, SourceState>,
}

impl LegacyConverter {
    /// `max_len` bounds the rewritten datagram (the input plugin's buffer
    /// size).
    pub fn new(transport: Transport, max_len: usize) -> Self {
        LegacyConverter {
            transport,
            max_len,
            sources: HashMap::new(),
        }
    }

    /// Convert `packet` in place to IPFIX wire form. Version 10 input is
    /// returned unchanged; v5/v9 (and sFlow with the feature) are
    /// rewritten. On error the packet must be dropped by the caller.
    pub fn convert_packet(
        &mut self,
        packet: &mut Vec<u8>,
        source: SocketAddr,
        info: &InputInfo,
    ) -> Result<(), CollectorError> {
        if packet.len() < 2 {
            return Err(CollectorError::Conversion("datagram shorter than a version field"));
        }
        let version = u16::from_be_bytes([packet[0], packet[1]]);

        match version {
            IPFIX_VERSION => Ok(()),
            NETFLOW_V5_VERSION => {
                let state = self.sources.entry(source).or_default();
                let sequence = state.sequences[StreamKind::V5 as usize];
                let out = v5::convert(
                    packet,
                    &mut state.v5,
                    info,
                    self.transport,
                    self.max_len,
                    sequence,
                )?;
                state.sequences[StreamKind::V5 as usize] = out.next_sequence;
                *packet = out.bytes;
                Ok(())
            }
            NETFLOW_V9_VERSION => {
                let state = self.sources.entry(source).or_default();
                let sequence = state.sequences[StreamKind::V9 as usize];
                let out = v9::convert(packet, &mut state.v9, self.max_len, sequence)?;
                state.sequences[StreamKind::V9 as usize] = out.next_sequence;
                *packet = out.bytes;
                Ok(())
            }
            #[cfg(feature = "sflow")]
            _ => {
                let state = self.sources.entry(source).or_default();
                let sequence = state.sequences[StreamKind::Sflow as usize];
                let out = sflow::convert(
                    packet,
                    &mut state.v5,
                    info,
                    self.transport,
                    self.max_len,
                    sequence,
                )?;
                state.sequences[StreamKind::Sflow as usize] = out.next_sequence;
                *packet = out.bytes;
                Ok(())
            }
            #[cfg(not(feature = "sflow"))]
            other => {
                let _ = other;
                Err(CollectorError::Conversion(
                    "unconvertible datagram (not IPFIX, NetFlow v5 or v9)",
                ))
            }
        }
    }
}

/// Result of one legacy rewrite.
pub(crate) struct Converted {
    pub bytes: Vec<u8>,
    pub next_sequence: u32,
}

/// Append-only writer over a bounded buffer; refuses to grow past the cap.
pub(crate) struct BoundedBuf {
    bytes: Vec<u8>,
    max_len: usize,
}

impl BoundedBuf {
    pub fn new(max_len: usize) -> Self {
        BoundedBuf {
            bytes: Vec::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    pub fn put(&mut self, chunk: &[u8]) -> Result<(), CollectorError> {
        if self.bytes.len() + chunk.len() > self.max_len {
            return Err(CollectorError::Conversion("converted packet exceeds buffer bound"));
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), CollectorError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), CollectorError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), CollectorError> {
        self.put(&value.to_be_bytes())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Overwrite a previously written big-endian u16 (length backpatches).
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Write the 16-byte IPFIX header; length is backpatched by the caller.
pub(crate) fn put_ipfix_header(
    out: &mut BoundedBuf,
    export_time: u32,
    sequence: u32,
    odid: u32,
) -> Result<(), CollectorError> {
    out.put_u16(IPFIX_VERSION)?;
    out.put_u16(0)?; // length, patched once known
    out.put_u32(export_time)?;
    out.put_u32(sequence)?;
    out.put_u32(odid)
}
