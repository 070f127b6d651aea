//! Input-side contract between transport plugins and the collector core.
//!
//! An input plugin hands the core raw datagrams together with an
//! [`InputInfo`] describing the originating source. The same `InputInfo`
//! instance is attached to every message from that source, so the per-source
//! counters on it are shared between the input thread, the preprocessor and
//! the statistics reporter.

use serde::Serialize;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Transport a source arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    Udp,
    Tcp,
    Sctp,
    File,
}

/// Lifecycle state of a source, reported with every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceStatus {
    /// First packet from this source.
    New,
    /// Source already known.
    Opened,
    /// Source disconnected; flush its pipeline state.
    Closed,
}

/// Template lifetime parameters for UDP sources (RFC 7011 §10.3 collector
/// side). `None` disables the corresponding bound.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UdpTemplateLife {
    pub template_life_time: Option<u64>,
    pub template_life_packet: Option<u32>,
    pub options_template_life_time: Option<u64>,
    pub options_template_life_packet: Option<u32>,
}

/// Description of one exporting source.
///
/// Counters are atomics: the input thread and the preprocessor update them,
/// the statistics thread reads them concurrently.
#[derive(Debug)]
pub struct InputInfo {
    pub transport: Transport,
    /// Remote endpoint for network sources.
    pub source: Option<SocketAddr>,
    /// Path for file sources.
    pub path: Option<PathBuf>,
    pub udp_life: UdpTemplateLife,

    /// ODID seen in the most recent message from this source.
    pub odid: AtomicU32,
    /// Expected next exporter sequence number.
    pub sequence_number: AtomicU32,
    /// Packets accepted from this source.
    pub packets: AtomicU64,
    /// Data records accepted from this source.
    pub data_records: AtomicU64,
    /// Data records lost upstream, derived from exporter sequence jumps.
    pub lost_records: AtomicU64,
}

impl InputInfo {
    pub fn network(transport: Transport, source: SocketAddr) -> Self {
        InputInfo {
            transport,
            source: Some(source),
            path: None,
            udp_life: UdpTemplateLife::default(),
            odid: AtomicU32::new(0),
            sequence_number: AtomicU32::new(0),
            packets: AtomicU64::new(0),
            data_records: AtomicU64::new(0),
            lost_records: AtomicU64::new(0),
        }
    }

    pub fn file(path: PathBuf) -> Self {
        InputInfo {
            transport: Transport::File,
            source: None,
            path: Some(path),
            udp_life: UdpTemplateLife::default(),
            odid: AtomicU32::new(0),
            sequence_number: AtomicU32::new(0),
            packets: AtomicU64::new(0),
            data_records: AtomicU64::new(0),
            lost_records: AtomicU64::new(0),
        }
    }

    pub fn with_udp_life(mut self, life: UdpTemplateLife) -> Self {
        self.udp_life = life;
        self
    }

    /// Canonical fingerprint of the source endpoint, used in template keys.
    ///
    /// Network sources hash the printable address concatenated with the
    /// decimal port; file sources hash the path. Two exporters reusing a
    /// template ID on the same ODID therefore stay disjoint in the template
    /// manager as long as their endpoints differ.
    pub fn source_crc(&self) -> u32 {
        match (&self.source, &self.path) {
            (Some(addr), _) => {
                let rendered = format!("{}{}", addr.ip(), addr.port());
                crc32(rendered.as_bytes())
            }
            (None, Some(path)) => crc32(path.to_string_lossy().as_bytes()),
            (None, None) => 0,
        }
    }

    pub fn current_odid(&self) -> u32 {
        self.odid.load(Ordering::Relaxed)
    }
}

/// Outcome of one `get_packet` call on an input plugin.
pub enum PacketRead {
    /// A raw datagram, already converted to IPFIX wire form if the source
    /// speaks a legacy protocol.
    Packet {
        buf: Vec<u8>,
        info: std::sync::Arc<InputInfo>,
        status: SourceStatus,
    },
    /// A source disconnected without delivering data.
    SourceClosed(std::sync::Arc<InputInfo>),
    /// No data available right now (timeout or signal); caller may check
    /// its termination flags and retry.
    Interrupted,
    /// The input is exhausted (file fully replayed); the collector should
    /// begin an orderly shutdown once the pipeline drains.
    EndOfInput,
}

const CRC32_POLY: u32 = 0xedb8_8320;

/// CRC-32 (IEEE, reflected) over `buf`.
pub(crate) fn crc32(buf: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &octet in buf {
        crc ^= u32::from(octet);
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb != 0 {
                crc ^= CRC32_POLY;
            }
        }
    }
    !crc
}
