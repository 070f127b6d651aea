//! # IPFIX message model
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//!
//! A parsed view of one datagram. The message owns the raw wire bytes and
//! addresses template sets, data sets and individual records by offsets
//! into that buffer, so the pipeline never copies flow data. Template
//! references are [`Arc`]s handed out by the template manager; a template
//! stays alive for as long as any in-flight message points at it.

use crate::input::{InputInfo, SourceStatus};
use crate::template_manager::Template;
use crate::CollectorError;

use log::warn;
use nom_derive::{Nom, Parse};
use serde::Serialize;

use std::sync::Arc;

/// IPFIX protocol version.
pub const IPFIX_VERSION: u16 = 10;
/// Length of the fixed message header.
pub const IPFIX_HEADER_LENGTH: usize = 16;
/// Length of a set header.
pub const SET_HEADER_LENGTH: usize = 4;
/// Set ID of a template set.
pub const TEMPLATE_SET_ID: u16 = 2;
/// Set ID of an options template set.
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
/// Lowest set ID usable for data sets; lower IDs (except 2 and 3) are
/// reserved.
pub const MIN_DATA_SET_ID: u16 = 256;

/// Upper bound of template sets tracked per message.
pub const MAX_TEMPLATE_SETS: usize = 1024;
/// Upper bound of data couples tracked per message.
pub const MAX_DATA_COUPLES: usize = 1023;

/// Fixed 16-byte message header.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct MessageHeader {
    /// 0x000a for IPFIX.
    pub version: u16,
    /// Total message length in octets including this header.
    pub length: u16,
    /// Export timestamp, seconds since the UNIX epoch.
    pub export_time: u32,
    /// Count of data records sent before this message, modulo 2^32.
    pub sequence_number: u32,
    /// Observation Domain ID of the exporting process.
    pub observation_domain_id: u32,
}

impl MessageHeader {
    /// Serialise the header back to wire form.
    pub fn to_be_bytes(&self) -> [u8; IPFIX_HEADER_LENGTH] {
        let mut out = [0u8; IPFIX_HEADER_LENGTH];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.export_time.to_be_bytes());
        out[8..12].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[12..16].copy_from_slice(&self.observation_domain_id.to_be_bytes());
        out
    }
}

/// Set header common to template, options template and data sets.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct SetHeader {
    pub set_id: u16,
    /// Total set length in octets including this header.
    pub length: u16,
}

/// Location of one set inside the raw buffer. `length` includes the set
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetRef {
    pub offset: usize,
    pub length: usize,
}

impl SetRef {
    /// Offset of the first record, past the set header.
    pub fn records_offset(&self) -> usize {
        self.offset + SET_HEADER_LENGTH
    }

    /// End offset of the set (exclusive).
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// A data set paired with the template needed to decode it. The template is
/// resolved by the preprocessor; `None` means the template was unknown at
/// ingest time and the set is carried opaque.
#[derive(Debug, Clone)]
pub struct DataCouple {
    pub set: SetRef,
    pub template: Option<Arc<Template>>,
}

/// Per-record metadata filled by the preprocessor: one entry per data
/// record, in message order.
#[derive(Debug, Clone)]
pub struct RecordRef {
    pub offset: usize,
    pub length: usize,
    pub template: Arc<Template>,
    /// Opaque profile tag assigned by the configurator, if any.
    pub profile: Option<Arc<str>>,
}

/// One parsed datagram moving through the pipeline.
#[derive(Debug)]
pub struct IpfixMessage {
    raw: Vec<u8>,
    pub header: MessageHeader,
    pub input_info: Arc<InputInfo>,
    pub source_status: SourceStatus,
    pub templ_sets: Vec<SetRef>,
    pub opt_templ_sets: Vec<SetRef>,
    pub data_couples: Vec<DataCouple>,
    pub data_records_count: u32,
    pub templ_records_count: u32,
    pub opt_templ_records_count: u32,
    pub metadata: Vec<RecordRef>,
}

impl IpfixMessage {
    /// Parse the raw datagram into a message, taking ownership of the
    /// buffer.
    ///
    /// Validates the header (version 10, declared length within the buffer)
    /// and walks the sets. Unknown set IDs are logged and skipped; a set
    /// that would run past the declared message length fails with
    /// [`CollectorError::BadPacket`].
    pub fn from_bytes(
        raw: Vec<u8>,
        input_info: Arc<InputInfo>,
        source_status: SourceStatus,
    ) -> Result<IpfixMessage, CollectorError> {
        if raw.len() < IPFIX_HEADER_LENGTH {
            return Err(CollectorError::BadPacket(format!(
                "message too short for IPFIX header: {} bytes",
                raw.len()
            )));
        }

        let (_, header) = MessageHeader::parse(&raw)
            .map_err(|e| CollectorError::BadPacket(format!("unparseable header: {e}")))?;

        if header.version != IPFIX_VERSION {
            return Err(CollectorError::BadPacket(format!(
                "unexpected version {} (want {})",
                header.version, IPFIX_VERSION
            )));
        }

        let declared = header.length as usize;
        if declared < IPFIX_HEADER_LENGTH || declared > raw.len() {
            return Err(CollectorError::BadPacket(format!(
                "declared length {} outside [{}, {}]",
                declared,
                IPFIX_HEADER_LENGTH,
                raw.len()
            )));
        }

        let mut msg = IpfixMessage {
            raw,
            header,
            input_info,
            source_status,
            templ_sets: Vec::new(),
            opt_templ_sets: Vec::new(),
            data_couples: Vec::new(),
            data_records_count: 0,
            templ_records_count: 0,
            opt_templ_records_count: 0,
            metadata: Vec::new(),
        };

        let mut offset = IPFIX_HEADER_LENGTH;
        while offset + SET_HEADER_LENGTH <= declared {
            let (_, set) = SetHeader::parse(&msg.raw[offset..])
                .map_err(|e| CollectorError::BadPacket(format!("unparseable set header: {e}")))?;

            if set.length == 0 {
                // Zero-length set terminates the walk.
                break;
            }
            let set_len = set.length as usize;
            if set_len < SET_HEADER_LENGTH || offset + set_len > declared {
                return Err(CollectorError::BadPacket(format!(
                    "set at offset {offset} with length {set_len} exceeds message bounds"
                )));
            }

            let set_ref = SetRef {
                offset,
                length: set_len,
            };
            match set.set_id {
                TEMPLATE_SET_ID => {
                    if msg.templ_sets.len() < MAX_TEMPLATE_SETS {
                        msg.templ_sets.push(set_ref);
                    } else {
                        warn!(
                            "[{}] too many template sets in message; ignoring set at offset {}",
                            header.observation_domain_id, offset
                        );
                    }
                }
                OPTIONS_TEMPLATE_SET_ID => {
                    if msg.opt_templ_sets.len() < MAX_TEMPLATE_SETS {
                        msg.opt_templ_sets.push(set_ref);
                    } else {
                        warn!(
                            "[{}] too many options template sets in message; ignoring set at offset {}",
                            header.observation_domain_id, offset
                        );
                    }
                }
                id if id >= MIN_DATA_SET_ID => {
                    if msg.data_couples.len() < MAX_DATA_COUPLES {
                        msg.data_couples.push(DataCouple {
                            set: set_ref,
                            template: None,
                        });
                    } else {
                        warn!(
                            "[{}] too many data sets in message; ignoring set {} at offset {}",
                            header.observation_domain_id, id, offset
                        );
                    }
                }
                id => {
                    warn!(
                        "[{}] unknown set ID {} at offset {}; skipping",
                        header.observation_domain_id, id, offset
                    );
                }
            }

            offset += set_len;
        }

        Ok(msg)
    }

    /// Build a header-only message carrying a source lifecycle event
    /// (typically [`SourceStatus::Closed`]).
    pub fn source_event(input_info: Arc<InputInfo>, source_status: SourceStatus) -> IpfixMessage {
        let header = MessageHeader {
            version: IPFIX_VERSION,
            length: IPFIX_HEADER_LENGTH as u16,
            export_time: 0,
            sequence_number: 0,
            observation_domain_id: input_info.current_odid(),
        };
        IpfixMessage {
            raw: Vec::new(),
            header,
            input_info,
            source_status,
            templ_sets: Vec::new(),
            opt_templ_sets: Vec::new(),
            data_couples: Vec::new(),
            data_records_count: 0,
            templ_records_count: 0,
            opt_templ_records_count: 0,
            metadata: Vec::new(),
        }
    }

    pub fn odid(&self) -> u32 {
        self.header.observation_domain_id
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn set_bytes(&self, set: &SetRef) -> &[u8] {
        &self.raw[set.offset..set.end()]
    }

    /// Bytes of a set's records, past the set header.
    pub fn set_records(&self, set: &SetRef) -> &[u8] {
        &self.raw[set.records_offset()..set.end()]
    }

    /// Rewrite the collector-side sequence number in both the parsed header
    /// and the wire bytes, so re-serialisation reflects the collector's
    /// counter.
    pub(crate) fn set_sequence_number(&mut self, seq: u32) {
        self.header.sequence_number = seq;
        if self.raw.len() >= IPFIX_HEADER_LENGTH {
            self.raw[8..12].copy_from_slice(&seq.to_be_bytes());
        }
    }

    /// Patch a big-endian u16 in the raw buffer (template ID rewrites).
    pub(crate) fn rewrite_u16(&mut self, offset: usize, value: u16) {
        self.raw[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }
}
