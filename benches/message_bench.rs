use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ipfix_collector::convert::LegacyConverter;
use ipfix_collector::input::{InputInfo, SourceStatus, Transport};
use ipfix_collector::message::IpfixMessage;

use std::sync::Arc;

fn ipfix_datagram(records: usize) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&10u16.to_be_bytes());
    pkt.extend_from_slice(&0u16.to_be_bytes());
    pkt.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.extend_from_slice(&1u32.to_be_bytes());

    pkt.extend_from_slice(&300u16.to_be_bytes());
    pkt.extend_from_slice(&((4 + records * 13) as u16).to_be_bytes());
    for _ in 0..records {
        pkt.extend_from_slice(&[0u8; 13]);
    }

    let len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&len.to_be_bytes());
    pkt
}

fn v5_datagram(records: usize) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&5u16.to_be_bytes());
    pkt.extend_from_slice(&(records as u16).to_be_bytes());
    pkt.extend_from_slice(&1_000u32.to_be_bytes());
    pkt.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0]);
    for _ in 0..records {
        pkt.extend_from_slice(&[0u8; 48]);
    }
    pkt
}

fn message_parse_benchmark(c: &mut Criterion) {
    let info = Arc::new(InputInfo::network(
        Transport::Udp,
        "192.0.2.1:4739".parse().unwrap(),
    ));
    let datagram = ipfix_datagram(30);

    c.bench_function("parse ipfix message (30 records)", |b| {
        b.iter(|| {
            IpfixMessage::from_bytes(
                black_box(datagram.clone()),
                Arc::clone(&info),
                SourceStatus::Opened,
            )
            .unwrap()
        })
    });
}

fn v5_conversion_benchmark(c: &mut Criterion) {
    let info = InputInfo::network(Transport::Udp, "192.0.2.1:2055".parse().unwrap());
    let source = "192.0.2.1:2055".parse().unwrap();
    let datagram = v5_datagram(30);

    c.bench_function("convert netflow v5 (30 records)", |b| {
        let mut converter = LegacyConverter::new(Transport::Udp, 8192);
        b.iter(|| {
            let mut packet = black_box(datagram.clone());
            converter.convert_packet(&mut packet, source, &info).unwrap();
            packet
        })
    });
}

criterion_group!(benches, message_parse_benchmark, v5_conversion_benchmark);
criterion_main!(benches);
