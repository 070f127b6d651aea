//! sFlow v5 ingest (feature `sflow`).
//!
//! Flow samples carrying raw Ethernet/IPv4 packet headers are rewritten
//! into NetFlow-v5-shaped records and then run through the regular v5
//! conversion, so downstream the stream is indistinguishable from a v5
//! exporter. Counter samples and non-IPv4 flow samples are skipped. The
//! observation domain of sFlow traffic is unknown and stays 0.

use super::v5::{self, RefreshState, V5_HEADER_LEN, V5_MAX_RECORD_COUNT, V5_RECORD_LEN};
use super::Converted;
use crate::input::{InputInfo, Transport};
use crate::CollectorError;

use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::length_data;
use nom::number::complete::{be_u16, be_u32, u8};
use nom::sequence::pair;
use nom::Err as NomErr;
use nom::IResult;

use std::time::{SystemTime, UNIX_EPOCH};

const SFLOW_VERSION: u32 = 5;
const SAMPLE_FLOW: u32 = 1;
const RECORD_RAW_PACKET_HEADER: u32 = 1;
const HEADER_PROTO_ETHERNET: u32 = 1;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

struct DatagramHeader {
    version: u32,
    uptime: u32,
    num_samples: u32,
}

fn parse_datagram_header(i: &[u8]) -> IResult<&[u8], DatagramHeader> {
    let (i, version) = be_u32(i)?;
    let (i, agent_addr_type) = be_u32(i)?;
    let (i, _agent_addr) = take(if agent_addr_type == 2 { 16usize } else { 4 })(i)?;
    let (i, _sub_agent_id) = be_u32(i)?;
    let (i, _sequence) = be_u32(i)?;
    let (i, uptime) = be_u32(i)?;
    let (i, num_samples) = be_u32(i)?;
    Ok((
        i,
        DatagramHeader {
            version,
            uptime,
            num_samples,
        },
    ))
}

/// A sample or flow record: type/format word plus its length-prefixed body.
fn parse_tagged_block(i: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
    pair(be_u32, length_data(be_u32))(i)
}

struct FlowSampleHeader {
    sampling_rate: u32,
    input: u32,
    output: u32,
    num_records: u32,
}

fn parse_flow_sample_header(i: &[u8]) -> IResult<&[u8], FlowSampleHeader> {
    let (i, _sequence) = be_u32(i)?;
    let (i, _source_id) = be_u32(i)?;
    let (i, sampling_rate) = be_u32(i)?;
    let (i, _sample_pool) = be_u32(i)?;
    let (i, _drops) = be_u32(i)?;
    let (i, input) = be_u32(i)?;
    let (i, output) = be_u32(i)?;
    let (i, num_records) = be_u32(i)?;
    Ok((
        i,
        FlowSampleHeader {
            sampling_rate,
            input,
            output,
            num_records,
        },
    ))
}

/// Raw-packet-header record: header protocol, original frame length and
/// the sampled header bytes (clamped to what the record actually carries).
fn parse_raw_header_record(i: &[u8]) -> IResult<&[u8], (u32, u32, &[u8])> {
    let (i, header_protocol) = be_u32(i)?;
    let (i, frame_length) = be_u32(i)?;
    let (i, _stripped) = be_u32(i)?;
    let (i, header_len) = be_u32(i)?;
    let (i, header) = take((header_len as usize).min(i.len()))(i)?;
    Ok((i, (header_protocol, frame_length, header)))
}

/// The flow fields extracted from a sampled Ethernet/IPv4 frame.
struct SampledIpv4 {
    src: [u8; 4],
    dst: [u8; 4],
    tos: u8,
    protocol: u8,
    src_port: u16,
    dst_port: u16,
    tcp_flags: u8,
}

fn unconvertible<T>(i: &[u8]) -> IResult<&[u8], T> {
    Err(NomErr::Error(NomError::new(i, ErrorKind::Fail)))
}

fn parse_sampled_frame(i: &[u8]) -> IResult<&[u8], SampledIpv4> {
    let (i, _macs) = take(12usize)(i)?;
    let (i, outer_type) = be_u16(i)?;
    let (i, ethertype) = if outer_type == ETHERTYPE_VLAN {
        let (i, _tci) = be_u16(i)?;
        be_u16(i)?
    } else {
        (i, outer_type)
    };
    if ethertype != ETHERTYPE_IPV4 {
        return unconvertible(i);
    }

    let (i, ver_ihl) = u8(i)?;
    let ihl = usize::from(ver_ihl & 0x0f) * 4;
    if ihl < 20 {
        return unconvertible(i);
    }
    let (i, tos) = u8(i)?;
    let (i, _len_id_frag_ttl) = take(7usize)(i)?;
    let (i, protocol) = u8(i)?;
    let (i, _checksum) = take(2usize)(i)?;
    let (i, src) = be_u32(i)?;
    let (i, dst) = be_u32(i)?;
    let (i, _options) = take(ihl - 20)(i)?;

    let mut frame = SampledIpv4 {
        src: src.to_be_bytes(),
        dst: dst.to_be_bytes(),
        tos,
        protocol,
        src_port: 0,
        dst_port: 0,
        tcp_flags: 0,
    };

    if (protocol == 6 || protocol == 17) && i.len() >= 4 {
        let (l4, (src_port, dst_port)) = pair(be_u16, be_u16)(i)?;
        frame.src_port = src_port;
        frame.dst_port = dst_port;
        // TCP flags live at byte 13 of the TCP header, 9 past the ports.
        if protocol == 6 && l4.len() >= 10 {
            let (l4, _seq_ack_offset) = take(9usize)(l4)?;
            let (_, flags) = u8(l4)?;
            frame.tcp_flags = flags;
        }
    }

    Ok((i, frame))
}

struct FlowRecord {
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    tcp_flags: u8,
    protocol: u8,
    tos: u8,
    input: u16,
    output: u16,
    packets: u32,
    octets: u32,
}

pub(crate) fn convert(
    packet: &[u8],
    state: &mut RefreshState,
    info: &InputInfo,
    transport: Transport,
    max_len: usize,
    sequence: u32,
) -> Result<Converted, CollectorError> {
    let (mut rest, header) = parse_datagram_header(packet)
        .map_err(|_| CollectorError::Conversion("truncated sFlow datagram"))?;
    if header.version != SFLOW_VERSION {
        return Err(CollectorError::Conversion("unconvertible datagram (not sFlow v5)"));
    }

    let mut flows = Vec::new();
    for _ in 0..header.num_samples {
        let (after, (sample_type, body)) = parse_tagged_block(rest)
            .map_err(|_| CollectorError::Conversion("truncated sFlow sample"))?;
        rest = after;
        if sample_type & 0xfff == SAMPLE_FLOW && sample_type >> 12 == 0 {
            collect_flow_sample(body, &mut flows)?;
        }
        if flows.len() >= V5_MAX_RECORD_COUNT {
            break;
        }
    }

    let v5_packet = build_v5(&flows, header.uptime);
    v5::convert(&v5_packet, state, info, transport, max_len, sequence)
}

fn collect_flow_sample(body: &[u8], flows: &mut Vec<FlowRecord>) -> Result<(), CollectorError> {
    let (mut rest, sample) = parse_flow_sample_header(body)
        .map_err(|_| CollectorError::Conversion("truncated sFlow flow sample"))?;

    for _ in 0..sample.num_records {
        let (after, (format, record)) = parse_tagged_block(rest)
            .map_err(|_| CollectorError::Conversion("truncated sFlow flow record"))?;
        rest = after;
        if format & 0xfff != RECORD_RAW_PACKET_HEADER || format >> 12 != 0 {
            continue;
        }

        let Ok((_, (header_protocol, frame_length, header))) = parse_raw_header_record(record)
        else {
            continue;
        };
        if header_protocol != HEADER_PROTO_ETHERNET {
            continue;
        }
        let Ok((_, frame)) = parse_sampled_frame(header) else {
            continue;
        };

        let scale = sample.sampling_rate.max(1);
        flows.push(FlowRecord {
            src: frame.src,
            dst: frame.dst,
            src_port: frame.src_port,
            dst_port: frame.dst_port,
            tcp_flags: frame.tcp_flags,
            protocol: frame.protocol,
            tos: frame.tos,
            input: sample.input as u16,
            output: sample.output as u16,
            packets: scale,
            octets: frame_length.saturating_mul(scale),
        });
        if flows.len() >= V5_MAX_RECORD_COUNT {
            break;
        }
    }
    Ok(())
}

fn build_v5(flows: &[FlowRecord], uptime: u32) -> Vec<u8> {
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut pkt = Vec::with_capacity(V5_HEADER_LEN + flows.len() * V5_RECORD_LEN);
    pkt.extend_from_slice(&5u16.to_be_bytes());
    pkt.extend_from_slice(&(flows.len() as u16).to_be_bytes());
    pkt.extend_from_slice(&uptime.to_be_bytes());
    pkt.extend_from_slice(&unix_secs.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes()); // unix_nsecs
    pkt.extend_from_slice(&0u32.to_be_bytes()); // flow_sequence
    pkt.extend_from_slice(&[0, 0]); // engine type/id: ODID stays 0
    pkt.extend_from_slice(&0u16.to_be_bytes());

    for flow in flows {
        let mut rec = [0u8; V5_RECORD_LEN];
        rec[0..4].copy_from_slice(&flow.src);
        rec[4..8].copy_from_slice(&flow.dst);
        rec[12..14].copy_from_slice(&flow.input.to_be_bytes());
        rec[14..16].copy_from_slice(&flow.output.to_be_bytes());
        rec[16..20].copy_from_slice(&flow.packets.to_be_bytes());
        rec[20..24].copy_from_slice(&flow.octets.to_be_bytes());
        rec[24..28].copy_from_slice(&uptime.to_be_bytes());
        rec[28..32].copy_from_slice(&uptime.to_be_bytes());
        rec[32..34].copy_from_slice(&flow.src_port.to_be_bytes());
        rec[34..36].copy_from_slice(&flow.dst_port.to_be_bytes());
        rec[37] = flow.tcp_flags;
        rec[38] = flow.protocol;
        rec[39] = flow.tos;
        pkt.extend_from_slice(&rec);
    }
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_datagram() -> Vec<u8> {
        // Ethernet + IPv4 + UDP header of a sampled frame.
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = 17; // UDP
        frame[26..30].copy_from_slice(&[192, 0, 2, 1]);
        frame[30..34].copy_from_slice(&[198, 51, 100, 2]);
        frame[34..36].copy_from_slice(&53u16.to_be_bytes());
        frame[36..38].copy_from_slice(&5353u16.to_be_bytes());

        let mut raw_record = Vec::new();
        raw_record.extend_from_slice(&HEADER_PROTO_ETHERNET.to_be_bytes());
        raw_record.extend_from_slice(&1500u32.to_be_bytes()); // frame length
        raw_record.extend_from_slice(&0u32.to_be_bytes()); // stripped
        raw_record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        raw_record.extend_from_slice(&frame);

        let mut sample = Vec::new();
        sample.extend_from_slice(&1u32.to_be_bytes()); // sample sequence
        sample.extend_from_slice(&0u32.to_be_bytes()); // source id
        sample.extend_from_slice(&100u32.to_be_bytes()); // sampling rate
        sample.extend_from_slice(&100u32.to_be_bytes()); // pool
        sample.extend_from_slice(&0u32.to_be_bytes()); // drops
        sample.extend_from_slice(&1u32.to_be_bytes()); // input
        sample.extend_from_slice(&2u32.to_be_bytes()); // output
        sample.extend_from_slice(&1u32.to_be_bytes()); // record count
        sample.extend_from_slice(&RECORD_RAW_PACKET_HEADER.to_be_bytes());
        sample.extend_from_slice(&(raw_record.len() as u32).to_be_bytes());
        sample.extend_from_slice(&raw_record);

        let mut dgram = Vec::new();
        dgram.extend_from_slice(&SFLOW_VERSION.to_be_bytes());
        dgram.extend_from_slice(&1u32.to_be_bytes()); // IPv4 agent
        dgram.extend_from_slice(&[203, 0, 113, 1]);
        dgram.extend_from_slice(&0u32.to_be_bytes()); // sub agent
        dgram.extend_from_slice(&7u32.to_be_bytes()); // sequence
        dgram.extend_from_slice(&60_000u32.to_be_bytes()); // uptime
        dgram.extend_from_slice(&1u32.to_be_bytes()); // samples
        dgram.extend_from_slice(&SAMPLE_FLOW.to_be_bytes());
        dgram.extend_from_slice(&(sample.len() as u32).to_be_bytes());
        dgram.extend_from_slice(&sample);
        dgram
    }

    #[test]
    fn flow_sample_becomes_ipfix_with_odid_zero() {
        let dgram = sample_datagram();
        let mut state = RefreshState::default();
        let info = InputInfo::network(Transport::Udp, "192.0.2.9:6343".parse().unwrap());

        let out = convert(&dgram, &mut state, &info, Transport::Udp, 4096, 0).unwrap();
        assert_eq!(out.next_sequence, 1);
        let bytes = &out.bytes;
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 10);
        // ODID of sFlow-converted traffic is 0.
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn sampled_frame_extracts_the_five_tuple() {
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[14] = 0x45;
        frame[15] = 0xb8; // tos
        frame[23] = 6; // TCP
        frame[26..30].copy_from_slice(&[192, 0, 2, 7]);
        frame[30..34].copy_from_slice(&[198, 51, 100, 9]);
        frame[34..36].copy_from_slice(&443u16.to_be_bytes());
        frame[36..38].copy_from_slice(&55_000u16.to_be_bytes());

        let (_, parsed) = parse_sampled_frame(&frame).unwrap();
        assert_eq!(parsed.src, [192, 0, 2, 7]);
        assert_eq!(parsed.dst, [198, 51, 100, 9]);
        assert_eq!(parsed.src_port, 443);
        assert_eq!(parsed.dst_port, 55_000);
        assert_eq!(parsed.protocol, 6);
        assert_eq!(parsed.tos, 0xb8);
    }

    #[test]
    fn non_ipv4_frames_are_skipped() {
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes()); // IPv6
        assert!(parse_sampled_frame(&frame).is_err());
    }

    #[test]
    fn non_sflow_is_rejected() {
        let mut state = RefreshState::default();
        let info = InputInfo::network(Transport::Udp, "192.0.2.9:6343".parse().unwrap());
        assert!(convert(&[0u8; 8], &mut state, &info, Transport::Udp, 4096, 0).is_err());
    }
}
