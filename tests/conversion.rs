//! Legacy ingest conversion, exercised through the public converter the
//! UDP/TCP input plugins use.

use ipfix_collector::convert::LegacyConverter;
use ipfix_collector::elements::ElementDictionary;
use ipfix_collector::input::{InputInfo, SourceStatus, Transport};
use ipfix_collector::preprocessor::Preprocessor;
use ipfix_collector::ring_buffer::{ReadCursor, RingBuffer};
use ipfix_collector::template_manager::TemplateManager;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

const V5_TEMPLATE_SET_LEN: usize = 76;
const V5_IPFIX_RECORD_LEN: usize = 52;

fn source_addr(port: u16) -> SocketAddr {
    format!("198.51.100.10:{port}").parse().unwrap()
}

fn udp_info(port: u16) -> Arc<InputInfo> {
    Arc::new(InputInfo::network(Transport::Udp, source_addr(port)))
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn v5_datagram(records: &[(u32, u32)], sys_uptime: u32, unix_secs: u32, unix_nsecs: u32) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&5u16.to_be_bytes());
    pkt.extend_from_slice(&(records.len() as u16).to_be_bytes());
    pkt.extend_from_slice(&sys_uptime.to_be_bytes());
    pkt.extend_from_slice(&unix_secs.to_be_bytes());
    pkt.extend_from_slice(&unix_nsecs.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0]);
    for &(first, last) in records {
        let mut rec = [0u8; 48];
        rec[0..4].copy_from_slice(&[10, 0, 0, 1]);
        rec[24..28].copy_from_slice(&first.to_be_bytes());
        rec[28..32].copy_from_slice(&last.to_be_bytes());
        rec[38] = 6;
        pkt.extend_from_slice(&rec);
    }
    pkt
}

#[test]
fn netflow_v5_replay_matches_the_time_formula() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let info = udp_info(2055);

    let mut packet = v5_datagram(&[(800, 900), (600, 950)], 1_000, 1_700_000_000, 500_000_000);
    converter
        .convert_packet(&mut packet, source_addr(2055), &info)
        .unwrap();

    assert_eq!(u16_at(&packet, 0), 10);
    assert_eq!(u16_at(&packet, 2) as usize, packet.len());

    // Template set prepended on the first datagram.
    assert_eq!(u16_at(&packet, 16), 2);
    assert_eq!(u16_at(&packet, 18) as usize, V5_TEMPLATE_SET_LEN);

    // Two widened records behind the data set header.
    let data_off = 16 + V5_TEMPLATE_SET_LEN;
    assert_eq!(u16_at(&packet, data_off), 256);
    assert_eq!(
        u16_at(&packet, data_off + 2) as usize,
        4 + 2 * V5_IPFIX_RECORD_LEN
    );

    let time_header = 1_700_000_000u64 * 1000 + 500_000_000 / 1_000_000;
    let rec0 = data_off + 4;
    assert_eq!(u64_at(&packet, rec0 + 24), time_header - (1_000 - 800));
    assert_eq!(u64_at(&packet, rec0 + 32), time_header - (1_000 - 900));
    let rec1 = rec0 + V5_IPFIX_RECORD_LEN;
    assert_eq!(u64_at(&packet, rec1 + 24), time_header - (1_000 - 600));
    assert_eq!(u64_at(&packet, rec1 + 32), time_header - (1_000 - 950));

    // Within the refresh interval the template set is not repeated.
    let mut second = v5_datagram(&[(700, 800)], 2_000, 1_700_000_100, 0);
    converter
        .convert_packet(&mut second, source_addr(2055), &info)
        .unwrap();
    assert_eq!(u16_at(&second, 16), 256);
    assert_eq!(second.len(), 16 + 4 + V5_IPFIX_RECORD_LEN);

    // The collector keeps its own v5 sequence numbering.
    assert_eq!(u16_at(&second, 8), 0);
    assert_eq!(u16_at(&second, 10), 2);
}

#[test]
fn v5_template_state_is_per_source() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);

    let mut first = v5_datagram(&[(1, 2)], 10, 1_700_000_000, 0);
    converter
        .convert_packet(&mut first, source_addr(1001), &udp_info(1001))
        .unwrap();
    assert_eq!(u16_at(&first, 16), 2);

    // A different exporter still gets its own template.
    let mut other = v5_datagram(&[(1, 2)], 10, 1_700_000_000, 0);
    converter
        .convert_packet(&mut other, source_addr(1002), &udp_info(1002))
        .unwrap();
    assert_eq!(u16_at(&other, 16), 2);
}

#[test]
fn converted_v5_parses_and_flows_through_the_preprocessor() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let info = udp_info(3001);
    let mut packet = v5_datagram(&[(800, 900), (600, 950)], 1_000, 1_700_000_000, 500_000_000);
    converter
        .convert_packet(&mut packet, source_addr(3001), &info)
        .unwrap();

    let templates = Arc::new(TemplateManager::new());
    let queue = RingBuffer::new(16).unwrap();
    let preprocessor = Mutex::new(Preprocessor::new(
        Arc::clone(&templates),
        Arc::clone(&queue),
        Arc::new(ElementDictionary::new()),
        false,
    ));

    preprocessor
        .lock()
        .unwrap()
        .process_packet(packet, Arc::clone(&info), SourceStatus::New)
        .unwrap();

    let mut cursor = ReadCursor::new();
    let msg = queue.read(&mut cursor).expect("message published");
    assert_eq!(msg.data_records_count, 2);
    assert_eq!(msg.templ_records_count, 1);
    assert_eq!(msg.metadata.len(), 2);
    assert_eq!(msg.metadata[0].length, V5_IPFIX_RECORD_LEN);
    assert_eq!(templates.len(), 1);
    queue.release(&mut cursor).unwrap();
}

fn v9_datagram(sys_uptime: u32, unix_secs: u32, seq: u32, odid: u32) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&9u16.to_be_bytes());
    pkt.extend_from_slice(&2u16.to_be_bytes());
    pkt.extend_from_slice(&sys_uptime.to_be_bytes());
    pkt.extend_from_slice(&unix_secs.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&odid.to_be_bytes());

    // Template set (v9 set id 0): template 270 with IE 8 (4), 21 (4), 22 (4).
    pkt.extend_from_slice(&0u16.to_be_bytes());
    pkt.extend_from_slice(&20u16.to_be_bytes());
    pkt.extend_from_slice(&270u16.to_be_bytes());
    pkt.extend_from_slice(&3u16.to_be_bytes());
    for (id, len) in [(8u16, 4u16), (21, 4), (22, 4)] {
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&len.to_be_bytes());
    }

    // Data set: one 12-byte record.
    pkt.extend_from_slice(&270u16.to_be_bytes());
    pkt.extend_from_slice(&16u16.to_be_bytes());
    pkt.extend_from_slice(&[10, 1, 1, 1]);
    pkt.extend_from_slice(&3_000u32.to_be_bytes());
    pkt.extend_from_slice(&2_000u32.to_be_bytes());
    pkt
}

#[test]
fn netflow_v9_timestamps_and_padding() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let info = udp_info(4001);

    let mut packet = v9_datagram(5_000, 1_700_000_000, 42, 11);
    converter
        .convert_packet(&mut packet, source_addr(4001), &info)
        .unwrap();

    assert_eq!(u16_at(&packet, 0), 10);
    assert_eq!(packet.len() % 2, 0);
    assert_eq!(u16_at(&packet, 2) as usize, packet.len());
    // ODID preserved from the v9 source id.
    assert_eq!(&packet[12..16], &11u32.to_be_bytes());

    // Template set id 0 -> 2; IE 21 -> 153 and 22 -> 152 with length 8.
    assert_eq!(u16_at(&packet, 16), 2);
    let fields = &packet[24..];
    assert_eq!(u16_at(fields, 0), 8);
    assert_eq!(u16_at(fields, 4), 153);
    assert_eq!(u16_at(fields, 6), 8);
    assert_eq!(u16_at(fields, 8), 152);
    assert_eq!(u16_at(fields, 10), 8);

    // The data set is padded to a multiple of four.
    let data_off = 16 + u16_at(&packet, 18) as usize;
    assert_eq!(u16_at(&packet, data_off), 270);
    assert_eq!(u16_at(&packet, data_off + 2) % 4, 0);

    // Absolute milliseconds in the widened record.
    let time_header = 1_700_000_000u64 * 1000 - 5_000;
    let rec = data_off + 4;
    assert_eq!(u64_at(&packet, rec + 4), time_header + 3_000);
    assert_eq!(u64_at(&packet, rec + 12), time_header + 2_000);

    // The rewritten sequence number is the collector's v9 record counter.
    assert_eq!(&packet[8..12], &0u32.to_be_bytes());
    let mut second = v9_datagram(5_000, 1_700_000_001, 43, 11);
    converter
        .convert_packet(&mut second, source_addr(4001), &info)
        .unwrap();
    assert_eq!(&second[8..12], &1u32.to_be_bytes());
}

#[test]
fn sequence_counters_are_kept_per_source() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let first = source_addr(8001);
    let first_info = udp_info(8001);
    let second = source_addr(8002);
    let second_info = udp_info(8002);

    // Two v9 datagrams from the first exporter, each carrying one record.
    let mut a1 = v9_datagram(0, 1, 10, 1);
    converter.convert_packet(&mut a1, first, &first_info).unwrap();
    assert_eq!(&a1[8..12], &0u32.to_be_bytes());
    let mut a2 = v9_datagram(0, 1, 11, 1);
    converter.convert_packet(&mut a2, first, &first_info).unwrap();
    assert_eq!(&a2[8..12], &1u32.to_be_bytes());

    // A second exporter interleaved on the same socket starts at zero.
    let mut b1 = v9_datagram(0, 1, 20, 2);
    converter.convert_packet(&mut b1, second, &second_info).unwrap();
    assert_eq!(&b1[8..12], &0u32.to_be_bytes());

    // Same for v5: the second source's records never advance the first's
    // counter.
    let mut v5_a = v5_datagram(&[(1, 2)], 10, 1, 0);
    converter.convert_packet(&mut v5_a, first, &first_info).unwrap();
    assert_eq!(&v5_a[8..12], &0u32.to_be_bytes());
    let mut v5_b = v5_datagram(&[(1, 2), (3, 4)], 10, 1, 0);
    converter.convert_packet(&mut v5_b, second, &second_info).unwrap();
    assert_eq!(&v5_b[8..12], &0u32.to_be_bytes());
    let mut v5_a2 = v5_datagram(&[(5, 6)], 10, 1, 0);
    converter.convert_packet(&mut v5_a2, first, &first_info).unwrap();
    assert_eq!(&v5_a2[8..12], &1u32.to_be_bytes());
}

#[test]
fn ipfix_passes_through_untouched() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let info = udp_info(5001);

    let mut packet = Vec::new();
    packet.extend_from_slice(&10u16.to_be_bytes());
    packet.extend_from_slice(&16u16.to_be_bytes());
    packet.extend_from_slice(&[0; 12]);
    let before = packet.clone();

    converter
        .convert_packet(&mut packet, source_addr(5001), &info)
        .unwrap();
    assert_eq!(packet, before);
}

#[cfg(not(feature = "sflow"))]
#[test]
fn unknown_versions_are_unconvertible() {
    let mut converter = LegacyConverter::new(Transport::Udp, 8192);
    let info = udp_info(6001);
    let mut packet = vec![0u8, 7, 0, 0, 0, 0];
    assert!(converter
        .convert_packet(&mut packet, source_addr(6001), &info)
        .is_err());
}

#[test]
fn oversized_conversions_are_refused() {
    let mut converter = LegacyConverter::new(Transport::Udp, 80);
    let info = udp_info(7001);
    let mut packet = v5_datagram(&[(1, 2), (3, 4), (5, 6)], 10, 1_700_000_000, 0);
    assert!(converter
        .convert_packet(&mut packet, source_addr(7001), &info)
        .is_err());
}
