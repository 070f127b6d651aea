//! # Template manager
//!
//! Shared registry of (options) templates keyed by
//! `(ODID, source fingerprint, template ID)`.
//!
//! The manager is the single piece of state shared across pipeline stages.
//! Entries are handed out as [`Arc<Template>`]: a data couple that resolves
//! its template clones the `Arc`, and the clone is dropped when the carrying
//! message is released, so an entry removed or replaced in the registry
//! stays alive until the last in-flight message lets go of it. Updates
//! never mutate a stored template; they replace the entry with a fresh
//! allocation.
//!
//! Exporter-chosen template IDs are renumbered on add: every new entry gets
//! a collector-unique ID allocated per ODID, monotonically from 256, so
//! that two sources reusing the same wire ID remain distinguishable
//! downstream.

use crate::CollectorError;

use log::debug;
use nom::combinator::cond;
use nom::number::complete::{be_u16, be_u32};
use nom::IResult;
use serde::Serialize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Field length sentinel meaning "variable, encoded per record".
pub const VARIABLE_LENGTH: u16 = 0xffff;
/// Flag bit set in [`Template::data_length`] when the template contains
/// variable-length elements; the remaining bits then hold the minimum
/// possible record length.
pub const DATA_LENGTH_VARIABLE: u32 = 0x8000_0000;
/// Lowest valid template ID; smaller values are reserved for set IDs.
pub const MIN_TEMPLATE_ID: u16 = 256;
/// Wire length of a withdrawal record (template ID + zero count).
pub const TEMPLATE_WITHDRAW_LEN: usize = 4;
/// Withdrawal sentinel: all data templates of the source.
pub const WITHDRAW_ALL_DATA: u16 = 2;
/// Withdrawal sentinel: all options templates of the source.
pub const WITHDRAW_ALL_OPTIONS: u16 = 3;

/// Template flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateKind {
    Data,
    Options,
}

/// Registry key. `template_id == 0` addresses every template within the
/// `(odid, source_crc)` scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TemplateKey {
    pub odid: u32,
    pub source_crc: u32,
    pub template_id: u16,
}

impl TemplateKey {
    pub fn new(odid: u32, source_crc: u32, template_id: u16) -> Self {
        TemplateKey {
            odid,
            source_crc,
            template_id,
        }
    }
}

/// One field specifier of a template record. `element_id` has the
/// enterprise bit stripped; the enterprise number, when present, is carried
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpecifier {
    pub element_id: u16,
    pub length: u16,
    pub enterprise_number: Option<u32>,
}

impl FieldSpecifier {
    /// Wire length of this specifier (4 bytes, 8 with enterprise number).
    pub fn wire_length(&self) -> usize {
        if self.enterprise_number.is_some() {
            8
        } else {
            4
        }
    }

    pub fn is_variable(&self) -> bool {
        self.length == VARIABLE_LENGTH
    }
}

fn parse_field_specifier(i: &[u8]) -> IResult<&[u8], FieldSpecifier> {
    let (i, raw_id) = be_u16(i)?;
    let (i, length) = be_u16(i)?;
    let (i, enterprise_number) = cond(raw_id & 0x8000 != 0, be_u32)(i)?;
    Ok((
        i,
        FieldSpecifier {
            element_id: raw_id & 0x7fff,
            length,
            enterprise_number,
        },
    ))
}

/// A stored template.
#[derive(Debug)]
pub struct Template {
    /// Collector-unique ID (renumbered; what downstream consumers see).
    pub template_id: u16,
    /// ID as received from the exporter.
    pub original_id: u16,
    pub kind: TemplateKind,
    /// Scope fields of an options template; 0 for data templates.
    pub scope_field_count: u16,
    pub fields: Vec<FieldSpecifier>,
    /// Fixed data-record length, or minimum length with
    /// [`DATA_LENGTH_VARIABLE`] set when any field is variable-length.
    pub data_length: u32,
    /// Message counter at the last (re)transmission; UDP expiry input.
    pub last_message: AtomicU32,
    /// Unix timestamp of the last (re)transmission; UDP expiry input.
    pub last_transmission: AtomicU64,
}

impl Template {
    pub fn has_variable_fields(&self) -> bool {
        self.data_length & DATA_LENGTH_VARIABLE != 0
    }

    /// Minimum possible record length for this template.
    pub fn min_record_length(&self) -> usize {
        (self.data_length & !DATA_LENGTH_VARIABLE) as usize
    }

    /// Length of the record starting at `data[0]`, resolving per-record
    /// variable-length encodings. Returns `None` when `data` is too short
    /// to hold a complete record.
    pub fn record_length(&self, data: &[u8]) -> Option<usize> {
        if !self.has_variable_fields() {
            let len = self.min_record_length();
            return (len > 0 && data.len() >= len).then_some(len);
        }

        let mut offset = 0usize;
        for field in &self.fields {
            if !field.is_variable() {
                offset += field.length as usize;
                continue;
            }
            let first = *data.get(offset)?;
            if first < 255 {
                offset += 1 + first as usize;
            } else {
                let hi = *data.get(offset + 1)?;
                let lo = *data.get(offset + 2)?;
                offset += 3 + u16::from_be_bytes([hi, lo]) as usize;
            }
        }
        (data.len() >= offset).then_some(offset)
    }

    /// Record a (re)transmission over UDP for the expiry policy.
    pub fn stamp(&self, msg_counter: u32) {
        self.last_message.store(msg_counter, Ordering::Relaxed);
        self.last_transmission
            .store(unix_now(), Ordering::Relaxed);
    }

    pub fn seconds_since_transmission(&self) -> u64 {
        unix_now().saturating_sub(self.last_transmission.load(Ordering::Relaxed))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parsed form of one template record, before it is stored.
struct ParsedRecord {
    original_id: u16,
    scope_field_count: u16,
    fields: Vec<FieldSpecifier>,
    /// Bytes the record occupied on the wire.
    consumed: usize,
}

fn parse_template_record(
    rec: &[u8],
    kind: TemplateKind,
) -> Result<ParsedRecord, CollectorError> {
    let bad = |what: &str| CollectorError::BadPacket(format!("template record: {what}"));

    let (mut rest, original_id) =
        be_u16::<_, nom::error::Error<&[u8]>>(rec).map_err(|_| bad("truncated id"))?;
    let (r, field_count) =
        be_u16::<_, nom::error::Error<&[u8]>>(rest).map_err(|_| bad("truncated count"))?;
    rest = r;

    let scope_field_count = match kind {
        TemplateKind::Data => 0,
        TemplateKind::Options => {
            let (r, scope) =
                be_u16::<_, nom::error::Error<&[u8]>>(rest).map_err(|_| bad("truncated scope count"))?;
            rest = r;
            if scope == 0 {
                return Err(bad("options template with zero scope fields"));
            }
            scope
        }
    };

    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let (r, field) = parse_field_specifier(rest).map_err(|_| bad("truncated field"))?;
        rest = r;
        fields.push(field);
    }

    Ok(ParsedRecord {
        original_id,
        scope_field_count,
        fields,
        consumed: rec.len() - rest.len(),
    })
}

fn compute_data_length(fields: &[FieldSpecifier]) -> u32 {
    let mut length = 0u32;
    let mut variable = false;
    for field in fields {
        if field.is_variable() {
            // A variable field occupies at least its one-byte length prefix.
            length += 1;
            variable = true;
        } else {
            length += u32::from(field.length);
        }
    }
    if variable {
        length | DATA_LENGTH_VARIABLE
    } else {
        length
    }
}

/// The shared registry. All mutation is serialised internally; lifetimes of
/// handed-out entries are governed by their `Arc` reference counts.
#[derive(Debug, Default)]
pub struct TemplateManager {
    entries: Mutex<HashMap<TemplateKey, Arc<Template>>>,
    next_id: Mutex<HashMap<u32, u16>>,
}

impl TemplateManager {
    pub fn new() -> Self {
        TemplateManager::default()
    }

    /// Allocate the next collector-unique template ID for `odid`.
    fn allocate_id(&self, odid: u32) -> u16 {
        let mut next = self.next_id.lock().unwrap();
        let slot = next.entry(odid).or_insert(MIN_TEMPLATE_ID);
        let id = *slot;
        *slot = slot.wrapping_add(1).max(MIN_TEMPLATE_ID);
        id
    }

    /// Parse `rec` (one template record) and store it under `key`,
    /// assigning a collector-unique template ID. Returns the new entry and
    /// the number of wire bytes the record occupied.
    pub fn add(
        &self,
        rec: &[u8],
        kind: TemplateKind,
        key: &TemplateKey,
    ) -> Result<(Arc<Template>, usize), CollectorError> {
        let parsed = parse_template_record(rec, kind)?;
        let template = Arc::new(Template {
            template_id: self.allocate_id(key.odid),
            original_id: parsed.original_id,
            kind,
            scope_field_count: parsed.scope_field_count,
            data_length: compute_data_length(&parsed.fields),
            fields: parsed.fields,
            last_message: AtomicU32::new(0),
            last_transmission: AtomicU64::new(unix_now()),
        });

        debug!(
            "[{}] stored {:?} template {} (exporter ID {}) with {} fields",
            key.odid,
            kind,
            template.template_id,
            template.original_id,
            template.fields.len()
        );

        self.entries
            .lock()
            .unwrap()
            .insert(*key, Arc::clone(&template));
        Ok((template, parsed.consumed))
    }

    /// Replace the entry under `key` with a fresh parse of `rec`. The
    /// collector-unique ID of the previous entry is preserved; the old
    /// allocation is dropped once the last in-flight message releases it.
    pub fn update(
        &self,
        rec: &[u8],
        kind: TemplateKind,
        key: &TemplateKey,
    ) -> Result<(Arc<Template>, usize), CollectorError> {
        let parsed = parse_template_record(rec, kind)?;
        let mut entries = self.entries.lock().unwrap();
        let assigned_id = match entries.get(key) {
            Some(existing) => existing.template_id,
            None => {
                drop(entries);
                return self.add(rec, kind, key);
            }
        };

        let template = Arc::new(Template {
            template_id: assigned_id,
            original_id: parsed.original_id,
            kind,
            scope_field_count: parsed.scope_field_count,
            data_length: compute_data_length(&parsed.fields),
            fields: parsed.fields,
            last_message: AtomicU32::new(0),
            last_transmission: AtomicU64::new(unix_now()),
        });
        entries.insert(*key, Arc::clone(&template));
        Ok((template, parsed.consumed))
    }

    /// Current entry under `key`, if any.
    pub fn get(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Drop the entry under `key`. With `key.template_id == 0` and a kind,
    /// drops every entry of that kind within the `(odid, source_crc)`
    /// scope. Returns the number of entries removed.
    pub fn remove(&self, key: &TemplateKey, kind: Option<TemplateKind>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        if key.template_id != 0 {
            return usize::from(entries.remove(key).is_some());
        }
        let Some(kind) = kind else { return 0 };
        let before = entries.len();
        entries.retain(|k, v| {
            !(k.odid == key.odid && k.source_crc == key.source_crc && v.kind == kind)
        });
        before - entries.len()
    }

    /// Drop every entry belonging to `odid`, regardless of source.
    pub fn remove_all_for_odid(&self, odid: u32) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|k, _| k.odid != odid);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently present, for diagnostics.
    pub fn keys(&self) -> Vec<TemplateKey> {
        self.entries.lock().unwrap().keys().copied().collect()
    }
}
