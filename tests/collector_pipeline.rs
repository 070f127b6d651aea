//! End-to-end pipeline tests: preprocessor -> (stages) -> output manager ->
//! data manager -> capturing sink.

use ipfix_collector::configurator::{Configurator, PluginSpec, StartupConfig};
use ipfix_collector::data_manager::StorageDescriptor;
use ipfix_collector::elements::ElementDictionary;
use ipfix_collector::input::{InputInfo, SourceStatus, Transport};
use ipfix_collector::message::IpfixMessage;
use ipfix_collector::output_manager::OutputManager;
use ipfix_collector::plugins::StoragePlugin;
use ipfix_collector::preprocessor::Preprocessor;
use ipfix_collector::ring_buffer::RingBuffer;
use ipfix_collector::stats::QueueDirectory;
use ipfix_collector::template_manager::{TemplateManager, MIN_TEMPLATE_ID};
use ipfix_collector::CollectorError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the sink observed for one stored message.
#[derive(Debug, Clone)]
struct Stored {
    odid: u32,
    sequence: u32,
    records: u32,
}

#[derive(Clone, Default)]
struct Capture {
    seen: Arc<Mutex<Vec<Stored>>>,
}

impl Capture {
    fn records(&self) -> u64 {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| u64::from(s.records))
            .sum()
    }

    fn messages(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn descriptor(&self, id: u32) -> StorageDescriptor {
        let capture = self.clone();
        StorageDescriptor {
            id,
            name: format!("capture-{id}"),
            odid_filter: None,
            require_single_manager: false,
            factory: Arc::new(move || {
                Ok(Box::new(CaptureSink(capture.clone())) as Box<dyn StoragePlugin>)
            }),
        }
    }
}

struct CaptureSink(Capture);

impl StoragePlugin for CaptureSink {
    fn store(
        &mut self,
        msg: &IpfixMessage,
        _templates: &TemplateManager,
    ) -> Result<(), CollectorError> {
        self.0.seen.lock().unwrap().push(Stored {
            odid: msg.odid(),
            sequence: msg.header.sequence_number,
            records: msg.data_records_count,
        });
        Ok(())
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn udp_source(port: u16) -> Arc<InputInfo> {
    Arc::new(InputInfo::network(
        Transport::Udp,
        format!("192.0.2.1:{port}").parse().unwrap(),
    ))
}

/// Template set declaring exporter template `tid` with the classic
/// five-tuple elements {8, 12, 7, 11, 4} (13-byte records).
fn template_set(tid: u16) -> Vec<u8> {
    let mut set = Vec::new();
    set.extend_from_slice(&2u16.to_be_bytes());
    set.extend_from_slice(&28u16.to_be_bytes());
    set.extend_from_slice(&tid.to_be_bytes());
    set.extend_from_slice(&5u16.to_be_bytes());
    for (id, len) in [(8u16, 4u16), (12, 4), (7, 2), (11, 2), (4, 1)] {
        set.extend_from_slice(&id.to_be_bytes());
        set.extend_from_slice(&len.to_be_bytes());
    }
    set
}

fn data_set(tid: u16, records: usize) -> Vec<u8> {
    let mut set = Vec::new();
    set.extend_from_slice(&tid.to_be_bytes());
    set.extend_from_slice(&((4 + records * 13) as u16).to_be_bytes());
    for i in 0..records {
        let mut rec = [0u8; 13];
        rec[0] = 10;
        rec[3] = i as u8;
        rec[12] = 17;
        set.extend_from_slice(&rec);
    }
    set
}

fn datagram(odid: u32, seq: u32, sets: &[Vec<u8>]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&10u16.to_be_bytes());
    pkt.extend_from_slice(&0u16.to_be_bytes());
    pkt.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&odid.to_be_bytes());
    for set in sets {
        pkt.extend_from_slice(set);
    }
    let len = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&len.to_be_bytes());
    pkt
}

struct Harness {
    templates: Arc<TemplateManager>,
    preprocessor: Arc<Mutex<Preprocessor>>,
    output: OutputManager,
    capture: Capture,
}

impl Harness {
    fn start() -> Harness {
        let templates = Arc::new(TemplateManager::new());
        let queue = RingBuffer::new(64).unwrap();
        let preprocessor = Arc::new(Mutex::new(Preprocessor::new(
            Arc::clone(&templates),
            Arc::clone(&queue),
            Arc::new(ElementDictionary::new()),
            false,
        )));

        let mut output = OutputManager::new(Arc::clone(&templates), queue, 64);
        output.start(None, QueueDirectory::new()).unwrap();

        let capture = Capture::default();
        output.handle().add_storage(capture.descriptor(0)).unwrap();

        Harness {
            templates,
            preprocessor,
            output,
            capture,
        }
    }

    fn feed(&self, pkt: Vec<u8>, info: &Arc<InputInfo>, status: SourceStatus) {
        self.preprocessor
            .lock()
            .unwrap()
            .process_packet(pkt, Arc::clone(info), status)
            .unwrap();
    }

    fn close(self) {
        self.output.close().unwrap();
    }
}

#[test]
fn steady_state_delivers_all_records() {
    let harness = Harness::start();
    let source = udp_source(4739);

    let pkt = datagram(7, 0, &[template_set(999), data_set(999, 3)]);
    harness.feed(pkt, &source, SourceStatus::New);

    wait_until("sink to receive 3 records", || harness.capture.records() == 3);

    // One template under the collector-assigned ID.
    assert_eq!(harness.templates.len(), 1);
    let keys = harness.templates.keys();
    assert_eq!(keys[0].odid, 7);
    assert_eq!(keys[0].template_id, 999);
    let stored = harness.templates.get(&keys[0]).unwrap();
    assert_eq!(stored.template_id, MIN_TEMPLATE_ID);

    // Collector sequence counter ends at the record count.
    assert_eq!(harness.preprocessor.lock().unwrap().odid_sequence(7), 3);

    // The stored message was restamped with the collector counter.
    let seen = harness.capture.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].odid, 7);
    assert_eq!(seen[0].sequence, 0);
    assert_eq!(seen[0].records, 3);
    drop(seen);

    harness.close();
}

#[test]
fn withdrawal_over_udp_keeps_the_template() {
    let harness = Harness::start();
    let source = udp_source(4740);

    harness.feed(
        datagram(3, 0, &[template_set(256)]),
        &source,
        SourceStatus::New,
    );
    wait_until("template to land", || harness.templates.len() == 1);

    // Withdrawal record: template 256, count 0 inside a template set.
    let mut withdraw = Vec::new();
    withdraw.extend_from_slice(&2u16.to_be_bytes());
    withdraw.extend_from_slice(&8u16.to_be_bytes());
    withdraw.extend_from_slice(&256u16.to_be_bytes());
    withdraw.extend_from_slice(&0u16.to_be_bytes());
    harness.feed(datagram(3, 0, &[withdraw]), &source, SourceStatus::Opened);

    // Illegal over UDP: warned about and ignored.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.templates.len(), 1);

    harness.close();
}

#[test]
fn last_source_closing_tears_down_the_domain() {
    let harness = Harness::start();
    let first = udp_source(5001);
    let second = udp_source(5002);

    harness.feed(
        datagram(42, 0, &[template_set(300), data_set(300, 1)]),
        &first,
        SourceStatus::New,
    );
    harness.feed(
        datagram(42, 0, &[template_set(300), data_set(300, 1)]),
        &second,
        SourceStatus::New,
    );

    wait_until("both messages stored", || harness.capture.messages() == 2);
    assert_eq!(harness.templates.len(), 2);
    assert_eq!(harness.output.handle().data_manager_count(), 1);

    // First source closes: the domain survives with its templates.
    harness.feed(Vec::new(), &first, SourceStatus::Closed);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.output.handle().data_manager_count(), 1);
    assert_eq!(harness.templates.len(), 2);

    // Second source closes: manager destroyed, templates dropped.
    harness.feed(Vec::new(), &second, SourceStatus::Closed);
    wait_until("data manager teardown", || {
        harness.output.handle().data_manager_count() == 0
    });
    assert_eq!(harness.templates.len(), 0);

    harness.close();
}

#[test]
fn sequence_gaps_warn_but_only_records_advance_the_counter() {
    let harness = Harness::start();
    let source = udp_source(6001);

    // Exporter numbering: 100, 110, 115 while records say 100, 103, 108.
    harness.feed(
        datagram(9, 100, &[template_set(400), data_set(400, 3)]),
        &source,
        SourceStatus::New,
    );
    harness.feed(
        datagram(9, 110, &[data_set(400, 5)]),
        &source,
        SourceStatus::Opened,
    );
    harness.feed(
        datagram(9, 115, &[data_set(400, 2)]),
        &source,
        SourceStatus::Opened,
    );

    wait_until("all records stored", || harness.capture.records() == 10);

    // The collector counter advanced by records forwarded, not by gaps.
    assert_eq!(harness.preprocessor.lock().unwrap().odid_sequence(9), 10);
    assert_eq!(source.lost_records.load(Ordering::Relaxed), 7);

    // Downstream saw the collector numbering 0, 3, 8.
    let sequences: Vec<u32> = harness
        .capture
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.sequence)
        .collect();
    assert_eq!(sequences, vec![0, 3, 8]);

    harness.close();
}

fn stage_spec(name: &str) -> PluginSpec {
    PluginSpec {
        name: name.to_string(),
        plugin: "odid_filter".to_string(),
        odid: None,
        options: serde_yaml::from_str(&format!("{{mode: drop, odids: [{}]}}", name.len()))
            .unwrap(),
    }
}

#[test]
fn reconfiguration_inserts_a_stage_without_losing_messages() {
    let harness = Harness::start();
    let source = udp_source(7001);

    let terminating = Arc::new(AtomicBool::new(false));
    let mut configurator = Configurator::new(
        None,
        64,
        Arc::clone(&harness.preprocessor),
        harness.output.handle(),
        QueueDirectory::new(),
        terminating,
    );

    // Chain [x, y].
    let mut config = StartupConfig {
        intermediates: vec![stage_spec("x"), stage_spec("yy")],
        ..StartupConfig::default()
    };
    configurator.apply(&config).unwrap();
    assert_eq!(configurator.stage_names(), vec!["x", "yy"]);

    harness.feed(
        datagram(7, 0, &[template_set(500), data_set(500, 2)]),
        &source,
        SourceStatus::New,
    );
    for seq in [2u32, 4] {
        harness.feed(
            datagram(7, seq, &[data_set(500, 2)]),
            &source,
            SourceStatus::Opened,
        );
    }

    // Replace [x, y] with [x, z, y] while messages may still be in flight.
    config.intermediates = vec![stage_spec("x"), stage_spec("zzz"), stage_spec("yy")];
    configurator.apply(&config).unwrap();
    assert_eq!(configurator.stage_names(), vec!["x", "zzz", "yy"]);

    for seq in [6u32, 8, 10] {
        harness.feed(
            datagram(7, seq, &[data_set(500, 2)]),
            &source,
            SourceStatus::Opened,
        );
    }

    wait_until("all 12 records stored", || harness.capture.records() == 12);
    assert_eq!(harness.capture.messages(), 6);

    // Remove the first stage; the rest keeps flowing.
    config.intermediates = vec![stage_spec("zzz"), stage_spec("yy")];
    configurator.apply(&config).unwrap();
    assert_eq!(configurator.stage_names(), vec!["zzz", "yy"]);

    harness.feed(
        datagram(7, 12, &[data_set(500, 2)]),
        &source,
        SourceStatus::Opened,
    );
    wait_until("post-removal records stored", || {
        harness.capture.records() == 14
    });

    configurator.shutdown();
    harness.close();
}
