//! NetFlow v9 to IPFIX rewrite.
//!
//! v9 is almost IPFIX already: the header loses its `sysUpTime` word, set
//! IDs 0/1 become 2/3, and `sysUpTime`-relative 32-bit timestamps (elements
//! 21/22) are promoted to absolute 64-bit milliseconds (elements 153/152)
//! in both the template definitions and every data record. Fields with the
//! enterprise bit set gain a placeholder enterprise number so the record
//! shape matches IPFIX encoding. Rewritten data sets are padded to a
//! multiple of four octets.

use super::{put_ipfix_header, BoundedBuf, Converted};
use crate::message::{SetHeader, OPTIONS_TEMPLATE_SET_ID, SET_HEADER_LENGTH, TEMPLATE_SET_ID};
use crate::CollectorError;

use nom::bytes::complete::take;
use nom::multi::count;
use nom::number::complete::{be_u16, be_u32};
use nom::sequence::{pair, tuple};
use nom::IResult;
use nom_derive::Parse;

use std::collections::HashMap;

const V9_HEADER_LEN: usize = 20;
const V9_TEMPLATE_SET_ID: u16 = 0;
const V9_OPTIONS_TEMPLATE_SET_ID: u16 = 1;

/// v9 element IDs of the sysUpTime-relative timestamps.
const V9_END_ELEM: u16 = 21;
const V9_START_ELEM: u16 = 22;
/// Their absolute-milliseconds IPFIX replacements.
const FLOW_END_MS: u16 = 153;
const FLOW_START_MS: u16 = 152;

const ENTERPRISE_BIT: u16 = 0x8000;
/// Placeholder enterprise number inserted for enterprise-bit fields.
const DEFAULT_ENTERPRISE_NUMBER: u32 = u32::MAX;

/// Per-source dimensions of known v9 templates, needed to slice and widen
/// data records.
#[derive(Debug, Default)]
pub(crate) struct TemplateDims {
    map: HashMap<u16, RecordDims>,
}

#[derive(Debug, Clone, Copy)]
struct RecordDims {
    /// Record length in the ORIGINAL v9 layout.
    record_len: usize,
    /// Offset of the adjacent 32-bit timestamp pair in the original
    /// layout, when the template carries one.
    ts_offset: Option<usize>,
}

struct V9Header {
    sys_uptime: u32,
    unix_secs: u32,
    source_id: u32,
}

fn parse_header(i: &[u8]) -> IResult<&[u8], V9Header> {
    let (i, _version) = be_u16(i)?;
    let (i, _count) = be_u16(i)?;
    let (i, sys_uptime) = be_u32(i)?;
    let (i, unix_secs) = be_u32(i)?;
    let (i, _sequence) = be_u32(i)?;
    let (i, source_id) = be_u32(i)?;
    Ok((
        i,
        V9Header {
            sys_uptime,
            unix_secs,
            source_id,
        },
    ))
}

/// One v9 template record: exporter template ID plus `(id, length)` field
/// specifiers.
fn parse_template_record(i: &[u8]) -> IResult<&[u8], (u16, Vec<(u16, u16)>)> {
    let (i, (template_id, field_count)) = pair(be_u16, be_u16)(i)?;
    let (i, fields) = parse_field_list(i, field_count as usize)?;
    Ok((i, (template_id, fields)))
}

fn parse_field_list(i: &[u8], field_count: usize) -> IResult<&[u8], Vec<(u16, u16)>> {
    count(pair(be_u16, be_u16), field_count)(i)
}

/// Options template record header: template ID, scope and option sizes in
/// octets.
fn parse_options_record_header(i: &[u8]) -> IResult<&[u8], (u16, u16, u16)> {
    tuple((be_u16, be_u16, be_u16))(i)
}

fn split_bytes(i: &[u8], len: usize) -> IResult<&[u8], &[u8]> {
    take(len)(i)
}

/// Split a data record at its timestamp pair.
fn parse_widened(rec: &[u8], ts: usize) -> IResult<&[u8], (&[u8], u32, u32)> {
    let (rest, prefix) = take(ts)(rec)?;
    let (rest, first) = be_u32(rest)?;
    let (rest, last) = be_u32(rest)?;
    Ok((rest, (prefix, first, last)))
}

pub(crate) fn convert(
    packet: &[u8],
    dims: &mut TemplateDims,
    max_len: usize,
    sequence: u32,
) -> Result<Converted, CollectorError> {
    if packet.len() < V9_HEADER_LEN {
        return Err(CollectorError::Conversion("truncated NetFlow v9 header"));
    }
    let (mut rest, header) = parse_header(packet)
        .map_err(|_| CollectorError::Conversion("truncated NetFlow v9 header"))?;
    let time_header =
        (u64::from(header.unix_secs) * 1000).wrapping_sub(u64::from(header.sys_uptime));

    let mut out = BoundedBuf::new(max_len);
    put_ipfix_header(&mut out, header.unix_secs, sequence, header.source_id)?;

    let mut records_seen = 0u32;
    while rest.len() >= SET_HEADER_LENGTH {
        let (after_header, set) = SetHeader::parse(rest)
            .map_err(|_| CollectorError::Conversion("truncated v9 set header"))?;
        let set_len = set.length as usize;
        if set_len < SET_HEADER_LENGTH {
            break;
        }
        let (after_set, content) = split_bytes(after_header, set_len - SET_HEADER_LENGTH)
            .map_err(|_| CollectorError::Conversion("v9 set runs past the datagram"))?;

        match set.set_id {
            V9_TEMPLATE_SET_ID => convert_template_set(content, dims, &mut out)?,
            V9_OPTIONS_TEMPLATE_SET_ID => convert_options_template_set(content, dims, &mut out)?,
            id => {
                records_seen += convert_data_set(id, content, dims, time_header, &mut out)?;
            }
        }

        rest = after_set;
    }

    let total = out.len();
    if total > u16::MAX as usize {
        return Err(CollectorError::Conversion("converted v9 packet too long"));
    }
    out.patch_u16(2, total as u16);

    Ok(Converted {
        bytes: out.into_bytes(),
        next_sequence: sequence.wrapping_add(records_seen),
    })
}

/// Rewrite one field specifier; returns its contribution to the original
/// record length and updates the timestamp offset tracking.
fn convert_field(
    id: u16,
    declared_len: u16,
    original_offset: &mut usize,
    ts_offset: &mut Option<usize>,
    out: &mut BoundedBuf,
) -> Result<(), CollectorError> {
    if id == V9_END_ELEM || id == V9_START_ELEM {
        if ts_offset.is_none() {
            *ts_offset = Some(*original_offset);
        }
        out.put_u16(if id == V9_END_ELEM { FLOW_END_MS } else { FLOW_START_MS })?;
        out.put_u16(8)?;
        *original_offset += 4;
        return Ok(());
    }

    out.put_u16(id)?;
    out.put_u16(declared_len)?;
    if id & ENTERPRISE_BIT != 0 {
        out.put_u32(DEFAULT_ENTERPRISE_NUMBER)?;
    }
    *original_offset += declared_len as usize;
    Ok(())
}

fn convert_template_set(
    content: &[u8],
    dims: &mut TemplateDims,
    out: &mut BoundedBuf,
) -> Result<(), CollectorError> {
    let set_start = out.len();
    out.put_u16(TEMPLATE_SET_ID)?;
    out.put_u16(0)?; // backpatched

    let mut rest = content;
    while rest.len() >= 4 {
        let (after, (template_id, fields)) = parse_template_record(rest)
            .map_err(|_| CollectorError::Conversion("v9 template record runs past its set"))?;
        rest = after;

        out.put_u16(template_id)?;
        out.put_u16(fields.len() as u16)?;

        let mut original_offset = 0usize;
        let mut ts_offset = None;
        for (id, len) in fields {
            convert_field(id, len, &mut original_offset, &mut ts_offset, out)?;
        }

        dims.map.insert(
            template_id,
            RecordDims {
                record_len: original_offset,
                ts_offset: ts_offset.filter(|&o| o + 8 <= original_offset),
            },
        );
    }

    let set_len = out.len() - set_start;
    out.patch_u16(set_start + 2, set_len as u16);
    Ok(())
}

fn convert_options_template_set(
    content: &[u8],
    dims: &mut TemplateDims,
    out: &mut BoundedBuf,
) -> Result<(), CollectorError> {
    let set_start = out.len();
    out.put_u16(OPTIONS_TEMPLATE_SET_ID)?;
    out.put_u16(0)?;

    let mut rest = content;
    // Anything shorter than a record header is set padding.
    while rest.len() >= 6 {
        let (after, (template_id, scope_len, option_len)) = parse_options_record_header(rest)
            .map_err(|_| {
                CollectorError::Conversion("v9 options template record runs past its set")
            })?;
        if template_id == 0 {
            break;
        }
        // v9 carries scope/options sizes in OCTETS; IPFIX wants counts.
        if scope_len % 4 != 0 || option_len % 4 != 0 {
            return Err(CollectorError::Conversion("v9 options template sizes not field-aligned"));
        }
        let field_count = (usize::from(scope_len) + usize::from(option_len)) / 4;
        let (after, fields) = parse_field_list(after, field_count)
            .map_err(|_| CollectorError::Conversion("v9 options template runs past its set"))?;
        rest = after;

        out.put_u16(template_id)?;
        out.put_u16(field_count as u16)?;
        out.put_u16(scope_len / 4)?;

        let mut original_offset = 0usize;
        let mut ts_offset = None;
        for (id, len) in fields {
            convert_field(id, len, &mut original_offset, &mut ts_offset, out)?;
        }

        dims.map.insert(
            template_id,
            RecordDims {
                record_len: original_offset,
                ts_offset: ts_offset.filter(|&o| o + 8 <= original_offset),
            },
        );
    }

    let set_len = out.len() - set_start;
    out.patch_u16(set_start + 2, set_len as u16);
    Ok(())
}

/// Rewrite one data set; returns the number of records it held (0 when the
/// backing template is unknown, in which case the set is copied opaque).
fn convert_data_set(
    set_id: u16,
    content: &[u8],
    dims: &TemplateDims,
    time_header: u64,
    out: &mut BoundedBuf,
) -> Result<u32, CollectorError> {
    let set_start = out.len();
    out.put_u16(set_id)?;
    out.put_u16(0)?;

    let known = dims.map.get(&set_id).copied().filter(|d| d.record_len > 0);
    let records = match known {
        None => {
            out.put(content)?;
            0
        }
        Some(d) => {
            let mut rest = content;
            let mut num = 0u32;
            while rest.len() >= d.record_len {
                let (after, rec) = split_bytes(rest, d.record_len)
                    .map_err(|_| CollectorError::Conversion("v9 data record slicing failed"))?;
                rest = after;
                num += 1;

                match d.ts_offset {
                    None => out.put(rec)?,
                    Some(ts) => {
                        let (suffix, (prefix, first, last)) = parse_widened(rec, ts)
                            .map_err(|_| {
                                CollectorError::Conversion("v9 data record shorter than its timestamps")
                            })?;
                        out.put(prefix)?;
                        out.put_u64(time_header.wrapping_add(u64::from(first)))?;
                        out.put_u64(time_header.wrapping_add(u64::from(last)))?;
                        out.put(suffix)?;
                    }
                }
            }
            // Trailing padding of the original set.
            out.put(rest)?;
            num
        }
    };

    let mut set_len = out.len() - set_start;
    while set_len % 4 != 0 {
        out.put(&[0])?;
        set_len += 1;
    }
    out.patch_u16(set_start + 2, set_len as u16);
    Ok(records)
}
