//! TCP input plugin.
//!
//! Accepts exporter connections and reassembles IPFIX messages from the
//! byte stream using the length field of the 16-byte message header. Each
//! connection is one source: the first complete message reports `New`, a
//! disconnect reports `Closed` so the pipeline can flush per-source state.

use crate::input::{InputInfo, PacketRead, SourceStatus, Transport};
use crate::message::{IPFIX_HEADER_LENGTH, IPFIX_VERSION};
use crate::plugins::InputPlugin;
use crate::CollectorError;

use log::{debug, warn};
use serde::Deserialize;

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const POLL_SLEEP: Duration = Duration::from_millis(50);
const MAX_MESSAGE: usize = u16::MAX as usize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TcpOptions {
    #[serde(default = "default_listen")]
    listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:4739".to_string()
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn InputPlugin>, CollectorError> {
    let options: TcpOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("tcp input: {e}")))?;
    Ok(Box::new(TcpInput::bind(options)?))
}

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    info: Arc<InputInfo>,
    buf: Vec<u8>,
    fresh: bool,
}

struct TcpInput {
    listener: TcpListener,
    peers: Vec<Peer>,
    next_peer: usize,
}

impl TcpInput {
    fn bind(options: TcpOptions) -> Result<TcpInput, CollectorError> {
        let listener = TcpListener::bind(&options.listen)
            .map_err(|e| CollectorError::Fatal(format!("cannot bind TCP {}: {e}", options.listen)))?;
        listener.set_nonblocking(true)?;
        debug!("listening for TCP connections on {}", options.listen);

        Ok(TcpInput {
            listener,
            peers: Vec::new(),
            next_peer: 0,
        })
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    debug!("accepted exporter connection from {addr}");
                    self.peers.push(Peer {
                        stream,
                        addr,
                        info: Arc::new(InputInfo::network(Transport::Tcp, addr)),
                        buf: Vec::new(),
                        fresh: true,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Extract one complete message from a peer's buffer, if present.
    fn take_message(peer: &mut Peer) -> Result<Option<Vec<u8>>, CollectorError> {
        if peer.buf.len() < IPFIX_HEADER_LENGTH {
            return Ok(None);
        }
        let version = u16::from_be_bytes([peer.buf[0], peer.buf[1]]);
        if version != IPFIX_VERSION {
            return Err(CollectorError::BadPacket(format!(
                "unexpected stream content from {} (version {version})",
                peer.addr
            )));
        }
        let length = u16::from_be_bytes([peer.buf[2], peer.buf[3]]) as usize;
        if length < IPFIX_HEADER_LENGTH || length > MAX_MESSAGE {
            return Err(CollectorError::BadPacket(format!(
                "nonsense message length {length} from {}",
                peer.addr
            )));
        }
        if peer.buf.len() < length {
            return Ok(None);
        }
        let rest = peer.buf.split_off(length);
        let message = std::mem::replace(&mut peer.buf, rest);
        Ok(Some(message))
    }
}

impl InputPlugin for TcpInput {
    fn get_packet(&mut self) -> Result<PacketRead, CollectorError> {
        self.accept_pending();

        let peer_count = self.peers.len();
        if peer_count == 0 {
            std::thread::sleep(POLL_SLEEP);
            return Ok(PacketRead::Interrupted);
        }
        let mut scratch = [0u8; 8192];
        for step in 0..peer_count {
            let index = (self.next_peer + step) % peer_count;

            let closed = {
                let peer = &mut self.peers[index];
                match peer.stream.read(&mut scratch) {
                    Ok(0) => true,
                    Ok(n) => {
                        peer.buf.extend_from_slice(&scratch[..n]);
                        false
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                    Err(e) => {
                        warn!("read from {} failed: {e}", peer.addr);
                        true
                    }
                }
            };

            if closed {
                let peer = self.peers.remove(index);
                self.next_peer = 0;
                debug!("exporter {} disconnected", peer.addr);
                return Ok(PacketRead::SourceClosed(peer.info));
            }

            let peer = &mut self.peers[index];
            match Self::take_message(peer) {
                Ok(Some(message)) => {
                    let status = if peer.fresh {
                        peer.fresh = false;
                        SourceStatus::New
                    } else {
                        SourceStatus::Opened
                    };
                    self.next_peer = (index + 1) % peer_count;
                    return Ok(PacketRead::Packet {
                        buf: message,
                        info: Arc::clone(&peer.info),
                        status,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{e}; dropping connection");
                    let peer = self.peers.remove(index);
                    self.next_peer = 0;
                    return Ok(PacketRead::SourceClosed(peer.info));
                }
            }
        }

        std::thread::sleep(POLL_SLEEP);
        Ok(PacketRead::Interrupted)
    }

    fn close(&mut self) {
        for peer in &self.peers {
            let _ = peer.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
