//! NetFlow v5 to IPFIX rewrite.
//!
//! v5 carries no templates, so a statically known template set describing
//! the 17 IPFIX elements backing the fixed 48-byte record is prepended on
//! the first datagram of a source and refreshed per the source's UDP
//! template lifetime policy. Record timestamps are promoted from 32-bit
//! `sysUpTime`-relative offsets to absolute 64-bit milliseconds.

use super::{put_ipfix_header, BoundedBuf, Converted};
use crate::input::{InputInfo, Transport};
use crate::CollectorError;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, u8};
use nom::IResult;

pub(crate) const V5_HEADER_LEN: usize = 24;
pub(crate) const V5_RECORD_LEN: usize = 48;
/// v5 exporters never pack more than 30 records into one datagram.
pub(crate) const V5_MAX_RECORD_COUNT: usize = 30;

/// Converted record length: two 4-byte timestamps widened to 8 bytes, the
/// trailing mask/padding bytes (not covered by the template) dropped.
const IPFIX_RECORD_LEN: usize = V5_RECORD_LEN + 8 - 4;
/// Offset of the timestamp pair inside a v5 record.
const FIRST_OFFSET: usize = 24;

const TEMPLATE_SET_LEN: usize = 76;
const DATA_TEMPLATE_ID: u16 = 256;

/// The 17 `(element_id, length)` pairs corresponding to v5 record fields.
const V5_TEMPLATE_FIELDS: [(u16, u16); 17] = [
    (8, 4),   // sourceIPv4Address
    (12, 4),  // destinationIPv4Address
    (15, 4),  // ipNextHopIPv4Address
    (10, 2),  // ingressInterface
    (14, 2),  // egressInterface
    (2, 4),   // packetDeltaCount
    (1, 4),   // octetDeltaCount
    (152, 8), // flowStartMilliseconds
    (153, 8), // flowEndMilliseconds
    (7, 2),   // sourceTransportPort
    (11, 2),  // destinationTransportPort
    (210, 1), // paddingOctets
    (6, 1),   // tcpControlBits
    (4, 1),   // protocolIdentifier
    (5, 1),   // ipClassOfService
    (16, 2),  // bgpSourceAsNumber
    (17, 2),  // bgpDestinationAsNumber
];

/// Template refresh bookkeeping, one per source.
#[derive(Debug, Default)]
pub(crate) struct RefreshState {
    inserted: bool,
    last_sent: u32,
    packets_since: u32,
}

impl RefreshState {
    /// Whether the template set is due in this datagram. Over TCP/SCTP the
    /// template goes out exactly once; over UDP it is refreshed on the
    /// per-source packet-count or wall-clock bound.
    fn template_due(&self, transport: Transport, info: &InputInfo, export_time: u32) -> bool {
        if !self.inserted {
            return true;
        }
        if transport != Transport::Udp {
            return false;
        }
        let life = &info.udp_life;
        if let Some(bound) = life.template_life_packet {
            if bound > 0 && self.packets_since >= bound {
                return true;
            }
        }
        if let Some(seconds) = life.template_life_time {
            if export_time.saturating_sub(self.last_sent) >= seconds as u32 {
                return true;
            }
        }
        false
    }

    fn mark_sent(&mut self, export_time: u32) {
        self.inserted = true;
        self.last_sent = export_time;
        self.packets_since = 1;
    }
}

struct V5Header {
    count: u16,
    sys_uptime: u32,
    unix_secs: u32,
    unix_nsecs: u32,
    engine_type: u8,
    engine_id: u8,
}

fn parse_header(i: &[u8]) -> IResult<&[u8], V5Header> {
    let (i, _version) = be_u16(i)?;
    let (i, count) = be_u16(i)?;
    let (i, sys_uptime) = be_u32(i)?;
    let (i, unix_secs) = be_u32(i)?;
    let (i, unix_nsecs) = be_u32(i)?;
    let (i, _flow_sequence) = be_u32(i)?;
    let (i, engine_type) = u8(i)?;
    let (i, engine_id) = u8(i)?;
    let (i, _sampling_interval) = be_u16(i)?;
    Ok((
        i,
        V5Header {
            count,
            sys_uptime,
            unix_secs,
            unix_nsecs,
            engine_type,
            engine_id,
        },
    ))
}

/// One v5 record, split around the timestamp pair: the fields before it,
/// the two sysUpTime-relative stamps, the fields through the AS numbers,
/// and the mask/padding tail the template does not cover (dropped).
struct RawRecord<'a> {
    prefix: &'a [u8],
    first: u32,
    last: u32,
    suffix: &'a [u8],
}

fn parse_record(i: &[u8]) -> IResult<&[u8], RawRecord<'_>> {
    let (i, prefix) = take(FIRST_OFFSET)(i)?;
    let (i, first) = be_u32(i)?;
    let (i, last) = be_u32(i)?;
    let (i, suffix) = take(12usize)(i)?;
    let (i, _tail) = take(4usize)(i)?;
    Ok((
        i,
        RawRecord {
            prefix,
            first,
            last,
            suffix,
        },
    ))
}

pub(crate) fn convert(
    packet: &[u8],
    state: &mut RefreshState,
    info: &InputInfo,
    transport: Transport,
    max_len: usize,
    sequence: u32,
) -> Result<Converted, CollectorError> {
    if packet.len() < V5_HEADER_LEN {
        return Err(CollectorError::Conversion("truncated NetFlow v5 header"));
    }
    let (record_bytes, header) = parse_header(packet)
        .map_err(|_| CollectorError::Conversion("truncated NetFlow v5 header"))?;

    let available = record_bytes.len() / V5_RECORD_LEN;
    let records = (header.count as usize)
        .min(V5_MAX_RECORD_COUNT)
        .min(available);

    let sys_uptime = u64::from(header.sys_uptime);
    let time_header =
        u64::from(header.unix_secs) * 1000 + u64::from(header.unix_nsecs) / 1_000_000;
    let export_time = header.unix_secs;
    let odid = u32::from_be_bytes([0, 0, header.engine_type, header.engine_id]);

    let insert_template = state.template_due(transport, info, export_time);

    let mut out = BoundedBuf::new(max_len);
    put_ipfix_header(&mut out, export_time, sequence, odid)?;

    if insert_template {
        put_template_set(&mut out)?;
        state.mark_sent(export_time);
    } else if records > 0 {
        state.packets_since += 1;
    }

    if records > 0 {
        out.put_u16(DATA_TEMPLATE_ID)?;
        out.put_u16((4 + records * IPFIX_RECORD_LEN) as u16)?;

        let mut rest = record_bytes;
        for _ in 0..records {
            let (after, rec) = parse_record(rest)
                .map_err(|_| CollectorError::Conversion("truncated NetFlow v5 record"))?;
            rest = after;

            out.put(rec.prefix)?;
            out.put_u64(
                time_header
                    .wrapping_add(u64::from(rec.first))
                    .wrapping_sub(sys_uptime),
            )?;
            out.put_u64(
                time_header
                    .wrapping_add(u64::from(rec.last))
                    .wrapping_sub(sys_uptime),
            )?;
            out.put(rec.suffix)?;
        }
    }

    let total = out.len();
    if total > u16::MAX as usize {
        return Err(CollectorError::Conversion("converted v5 packet too long"));
    }
    out.patch_u16(2, total as u16);

    Ok(Converted {
        bytes: out.into_bytes(),
        next_sequence: sequence.wrapping_add(records as u32),
    })
}

fn put_template_set(out: &mut BoundedBuf) -> Result<(), CollectorError> {
    out.put_u16(crate::message::TEMPLATE_SET_ID)?;
    out.put_u16(TEMPLATE_SET_LEN as u16)?;
    out.put_u16(DATA_TEMPLATE_ID)?;
    out.put_u16(V5_TEMPLATE_FIELDS.len() as u16)?;
    for (id, len) in V5_TEMPLATE_FIELDS {
        out.put_u16(id)?;
        out.put_u16(len)?;
    }
    Ok(())
}
