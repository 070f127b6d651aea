//! # Preprocessor
//!
//! First pipeline stage, driven by the input threads. For every datagram it
//! wraps the raw bytes in a parsed [`IpfixMessage`], registers template and
//! options-template records with the shared [`TemplateManager`] (renumbering
//! exporter IDs to collector-unique ones in the wire bytes), resolves data
//! couples, fills per-record metadata, reconciles sequence numbers per
//! observation domain and publishes the message to the first stage's queue.

use crate::elements::ElementDictionary;
use crate::input::{InputInfo, SourceStatus, Transport};
use crate::message::{IpfixMessage, RecordRef, SetRef};
use crate::ring_buffer::RingBuffer;
use crate::template_manager::{
    TemplateKey, TemplateKind, TemplateManager, MIN_TEMPLATE_ID, TEMPLATE_WITHDRAW_LEN,
    WITHDRAW_ALL_DATA, WITHDRAW_ALL_OPTIONS,
};
use crate::CollectorError;

use log::{debug, info, warn};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Default UDP template lifetime in seconds when the source does not
/// configure one (RFC 7011 §10.3.7 suggests 3 times the refresh interval).
const UDP_TEMPLATE_TIMEOUT: u64 = 1800;

#[derive(Debug, Default)]
struct OdidInfo {
    sequence_number: u32,
    sources: u32,
}

/// Per-collector preprocessor state. One instance exists per process,
/// shared by all input threads; the mutual exclusion lives in the caller
/// (each input thread locks the preprocessor around a packet).
pub struct Preprocessor {
    templates: Arc<TemplateManager>,
    out_queue: Arc<RingBuffer>,
    elements: Arc<ElementDictionary>,
    odids: HashMap<u32, OdidInfo>,
    skip_seq_errors: bool,
}

impl Preprocessor {
    pub fn new(
        templates: Arc<TemplateManager>,
        out_queue: Arc<RingBuffer>,
        elements: Arc<ElementDictionary>,
        skip_seq_errors: bool,
    ) -> Self {
        Preprocessor {
            templates,
            out_queue,
            elements,
            odids: HashMap::new(),
            skip_seq_errors,
        }
    }

    /// The queue the first intermediate stage (or the output manager) reads
    /// from. Fixed for the lifetime of the collector; reconfiguration
    /// rewires consumers, not this queue.
    pub fn output_queue(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.out_queue)
    }

    /// Sequence counter of an observation domain, for tests and statistics.
    pub fn odid_sequence(&self, odid: u32) -> u32 {
        self.odids.get(&odid).map_or(0, |i| i.sequence_number)
    }

    /// Ingest one datagram (already in IPFIX wire form) from `info`.
    ///
    /// A `Closed` status publishes a header-only sentinel carrying the
    /// closed state so downstream managers can release per-source
    /// resources.
    pub fn process_packet(
        &mut self,
        packet: Vec<u8>,
        info: Arc<InputInfo>,
        status: SourceStatus,
    ) -> Result<(), CollectorError> {
        if status == SourceStatus::Closed {
            let odid = info.current_odid();
            if let Some(entry) = self.odids.get_mut(&odid) {
                entry.sources = entry.sources.saturating_sub(1);
                if entry.sources == 0 {
                    entry.sequence_number = 0;
                }
            }
            let msg = IpfixMessage::source_event(info, status);
            return self.publish(msg);
        }

        let mut msg = IpfixMessage::from_bytes(packet, Arc::clone(&info), status)?;
        let odid = msg.odid();
        info.odid.store(odid, Ordering::Relaxed);

        if status == SourceStatus::New {
            let entry = self.odids.entry(odid).or_default();
            entry.sources += 1;
            if entry.sources > 1 {
                info!(
                    "[{}] accepted data from source #{} with this ODID",
                    odid, entry.sources
                );
            }
            // Baseline for gap detection; the first message cannot be late.
            info.sequence_number
                .store(msg.header.sequence_number, Ordering::Relaxed);
        }

        let msg_counter = info.packets.fetch_add(1, Ordering::Relaxed) as u32 + 1;
        let key = TemplateKey::new(odid, info.source_crc(), 0);

        self.process_template_sets(&mut msg, &key, msg_counter);
        self.resolve_data_couples(&mut msg, &key, msg_counter);
        self.reconcile_sequence(&mut msg, &info);

        info.data_records
            .fetch_add(u64::from(msg.data_records_count), Ordering::Relaxed);

        self.publish(msg)
    }

    fn publish(&self, msg: IpfixMessage) -> Result<(), CollectorError> {
        let odid = msg.odid();
        if let Err(e) = self.out_queue.write(Some(Arc::new(msg)), 1) {
            warn!("[{odid}] unable to write into the pipeline queue; skipping data ({e})");
            return Err(e);
        }
        Ok(())
    }

    fn process_template_sets(&self, msg: &mut IpfixMessage, key: &TemplateKey, msg_counter: u32) {
        for (sets, kind) in [
            (msg.templ_sets.clone(), TemplateKind::Data),
            (msg.opt_templ_sets.clone(), TemplateKind::Options),
        ] {
            for set in sets {
                let mut offset = set.records_offset();
                while offset + TEMPLATE_WITHDRAW_LEN <= set.end() {
                    let consumed = self.process_one_template(msg, offset, set.end(), kind, key, msg_counter);
                    if consumed == 0 {
                        break;
                    }
                    match kind {
                        TemplateKind::Data => msg.templ_records_count += 1,
                        TemplateKind::Options => msg.opt_templ_records_count += 1,
                    }
                    offset += consumed;
                }
            }
        }
    }

    /// Handle one template record at `offset`; returns the record's wire
    /// length, or 0 when the rest of the set must be discarded (length of a
    /// malformed record is unknowable).
    fn process_one_template(
        &self,
        msg: &mut IpfixMessage,
        offset: usize,
        end: usize,
        kind: TemplateKind,
        key: &TemplateKey,
        msg_counter: u32,
    ) -> usize {
        let raw = msg.raw();
        let original_id = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let count = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]);
        let key = TemplateKey::new(key.odid, key.source_crc, original_id);
        let udp = msg.input_info.transport == Transport::Udp;
        let label = match kind {
            TemplateKind::Data => "template",
            TemplateKind::Options => "options template",
        };

        if count == 0 {
            if udp {
                // RFC 7011 §10.3.6: withdrawals are illegal over UDP.
                warn!(
                    "[{}] received {label} withdrawal message over UDP; ignoring",
                    key.odid
                );
            } else if original_id == WITHDRAW_ALL_DATA || original_id == WITHDRAW_ALL_OPTIONS {
                let withdraw_kind = if original_id == WITHDRAW_ALL_DATA {
                    TemplateKind::Data
                } else {
                    TemplateKind::Options
                };
                let scope = TemplateKey::new(key.odid, key.source_crc, 0);
                let removed = self.templates.remove(&scope, Some(withdraw_kind));
                info!(
                    "[{}] withdrew all {withdraw_kind:?} templates of this source ({removed})",
                    key.odid
                );
            } else {
                info!("[{}] received {label} withdrawal message", key.odid);
                if self.templates.remove(&key, None) == 0 {
                    warn!(
                        "[{}] {label} withdrawal received for unknown template ID {}",
                        key.odid, original_id
                    );
                }
            }
            return TEMPLATE_WITHDRAW_LEN;
        }

        if original_id < MIN_TEMPLATE_ID {
            warn!(
                "[{}] {label} ID {} is reserved and not valid for a data set",
                key.odid, original_id
            );
            return TEMPLATE_WITHDRAW_LEN;
        }

        let rec = &raw[offset..end];
        let result = if self.templates.get(&key).is_none() {
            info!("[{}] new {label} ID {}", key.odid, original_id);
            self.templates.add(rec, kind, &key)
        } else {
            debug!(
                "[{}] {label} ID {} already exists; rewriting",
                key.odid, original_id
            );
            self.templates.update(rec, kind, &key)
        };

        match result {
            Ok((template, consumed)) => {
                if log::log_enabled!(log::Level::Debug) {
                    let fields: Vec<String> = template
                        .fields
                        .iter()
                        .map(|f| {
                            self.elements
                                .name(f.enterprise_number.unwrap_or(0), f.element_id)
                                .into_owned()
                        })
                        .collect();
                    debug!(
                        "[{}] {label} {} fields: [{}]",
                        key.odid,
                        template.template_id,
                        fields.join(", ")
                    );
                }
                if udp {
                    template.stamp(msg_counter);
                }
                // Exporter-chosen ID -> collector-unique ID, in the wire
                // bytes downstream consumers will re-serialise.
                msg.rewrite_u16(offset, template.template_id);
                consumed
            }
            Err(e) => {
                warn!(
                    "[{}] cannot parse {label} set; skipping to next set ({e})",
                    key.odid
                );
                0
            }
        }
    }

    fn resolve_data_couples(&self, msg: &mut IpfixMessage, key: &TemplateKey, msg_counter: u32) {
        let udp = msg.input_info.transport == Transport::Udp;
        let life = msg.input_info.udp_life.clone();

        let couples = std::mem::take(&mut msg.data_couples);
        let mut resolved = Vec::with_capacity(couples.len());
        let mut metadata = Vec::new();

        for mut couple in couples {
            let raw = msg.raw();
            let flowset_id = u16::from_be_bytes([
                raw[couple.set.offset],
                raw[couple.set.offset + 1],
            ]);
            let key = TemplateKey::new(key.odid, key.source_crc, flowset_id);

            match self.templates.get(&key) {
                None => {
                    warn!("[{}] data template with ID {} not found", key.odid, flowset_id);
                }
                Some(template) => {
                    msg.rewrite_u16(couple.set.offset, template.template_id);

                    if udp {
                        let life_time = life.template_life_time.unwrap_or(UDP_TEMPLATE_TIMEOUT);
                        let stale_time = template.seconds_since_transmission() > life_time;
                        let stale_packets = life.template_life_packet.is_some_and(|bound| {
                            msg_counter
                                .wrapping_sub(template.last_message.load(Ordering::Relaxed))
                                > bound
                        });
                        if stale_time || stale_packets {
                            warn!(
                                "[{}] data template with ID {} has expired; using old template",
                                key.odid, template.template_id
                            );
                        }
                    }

                    Self::collect_records(msg, &couple.set, &template, &mut metadata);
                    couple.template = Some(template);
                }
            }
            resolved.push(couple);
        }

        msg.data_couples = resolved;
        msg.data_records_count = metadata.len() as u32;
        msg.metadata = metadata;
    }

    fn collect_records(
        msg: &IpfixMessage,
        set: &SetRef,
        template: &Arc<crate::template_manager::Template>,
        metadata: &mut Vec<RecordRef>,
    ) {
        let data = msg.set_records(set);
        let mut offset = 0usize;
        while offset < data.len() {
            let Some(len) = template.record_length(&data[offset..]) else {
                break;
            };
            if len == 0 {
                break;
            }
            metadata.push(RecordRef {
                offset: set.records_offset() + offset,
                length: len,
                template: Arc::clone(template),
                profile: None,
            });
            offset += len;
        }
    }

    /// Restamp the message with the collector's per-ODID counter, which
    /// advances by exactly the data records forwarded downstream. Exporter
    /// gaps are reported and accounted as lost records; they never inflate
    /// the collector counter.
    fn reconcile_sequence(&mut self, msg: &mut IpfixMessage, info: &InputInfo) {
        let odid = msg.odid();
        let entry = self.odids.entry(odid).or_default();

        let exporter_seq = msg.header.sequence_number;
        let expected = info.sequence_number.load(Ordering::Relaxed);
        if exporter_seq != expected && msg.data_records_count > 0 {
            if !self.skip_seq_errors {
                warn!(
                    "[{odid}] sequence number error; expected {expected}, got {exporter_seq}"
                );
            }
            // The expected value only ever advances by accepted records, so
            // the positive gap is the cumulative loss from this source.
            let gap = exporter_seq.wrapping_sub(expected);
            if (gap as i32) > 0 {
                let gap = u64::from(gap);
                if gap > info.lost_records.load(Ordering::Relaxed) {
                    info.lost_records.store(gap, Ordering::Relaxed);
                }
            }
        }

        msg.set_sequence_number(entry.sequence_number);

        info.sequence_number
            .fetch_add(msg.data_records_count, Ordering::Relaxed);
        entry.sequence_number = entry
            .sequence_number
            .wrapping_add(msg.data_records_count);
    }
}
