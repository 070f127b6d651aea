//! UDP input plugin.
//!
//! One socket, many exporters: every distinct remote endpoint is a source
//! with its own `InputInfo` and legacy-conversion state. Datagrams are run
//! through the NetFlow/sFlow converter before they are handed to the
//! preprocessor. The receive call times out periodically so the input
//! thread can observe stop and reload flags.

use crate::convert::LegacyConverter;
use crate::input::{InputInfo, PacketRead, SourceStatus, Transport, UdpTemplateLife};
use crate::plugins::InputPlugin;
use crate::CollectorError;

use log::{debug, trace};
use serde::Deserialize;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(400);
const DEFAULT_BUFFER: usize = 65_536;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UdpOptions {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    template_life_time: Option<u64>,
    #[serde(default)]
    template_life_packet: Option<u32>,
    #[serde(default)]
    options_template_life_time: Option<u64>,
    #[serde(default)]
    options_template_life_packet: Option<u32>,
    #[serde(default = "default_buffer")]
    buffer_size: usize,
}

fn default_listen() -> String {
    "0.0.0.0:4739".to_string()
}

fn default_buffer() -> usize {
    DEFAULT_BUFFER
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn InputPlugin>, CollectorError> {
    let options: UdpOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("udp input: {e}")))?;
    Ok(Box::new(UdpInput::bind(options)?))
}

struct UdpInput {
    socket: UdpSocket,
    buf: Vec<u8>,
    converter: LegacyConverter,
    sources: HashMap<SocketAddr, Arc<InputInfo>>,
    life: UdpTemplateLife,
}

impl UdpInput {
    fn bind(options: UdpOptions) -> Result<UdpInput, CollectorError> {
        let socket = UdpSocket::bind(&options.listen)
            .map_err(|e| CollectorError::Fatal(format!("cannot bind UDP {}: {e}", options.listen)))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        debug!("listening for UDP packets on {}", options.listen);

        Ok(UdpInput {
            socket,
            buf: vec![0u8; options.buffer_size],
            converter: LegacyConverter::new(Transport::Udp, options.buffer_size),
            sources: HashMap::new(),
            life: UdpTemplateLife {
                template_life_time: options.template_life_time,
                template_life_packet: options.template_life_packet,
                options_template_life_time: options.options_template_life_time,
                options_template_life_packet: options.options_template_life_packet,
            },
        })
    }
}

impl InputPlugin for UdpInput {
    fn get_packet(&mut self) -> Result<PacketRead, CollectorError> {
        let (len, from) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                return Ok(PacketRead::Interrupted);
            }
            Err(e) => return Err(e.into()),
        };
        trace!("received {len} bytes from {from}");

        let (info, status) = match self.sources.get(&from) {
            Some(info) => (Arc::clone(info), SourceStatus::Opened),
            None => {
                let info = Arc::new(
                    InputInfo::network(Transport::Udp, from).with_udp_life(self.life.clone()),
                );
                self.sources.insert(from, Arc::clone(&info));
                (info, SourceStatus::New)
            }
        };

        let mut packet = self.buf[..len].to_vec();
        self.converter.convert_packet(&mut packet, from, &info)?;

        Ok(PacketRead::Packet {
            buf: packet,
            info,
            status,
        })
    }
}
