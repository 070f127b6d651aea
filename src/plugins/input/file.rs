//! IPFIX file input plugin.
//!
//! Replays a capture file message by message. The file is one source; the
//! first message reports `New`, exhaustion reports `Closed` followed by an
//! end-of-input signal that shuts the collector down once the pipeline
//! drains.

use crate::input::{InputInfo, PacketRead, SourceStatus};
use crate::message::{IPFIX_HEADER_LENGTH, IPFIX_VERSION};
use crate::plugins::InputPlugin;
use crate::CollectorError;

use log::{debug, warn};
use serde::Deserialize;

use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOptions {
    path: PathBuf,
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn InputPlugin>, CollectorError> {
    let options: FileOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("ipfix_file input: {e}")))?;
    FileInput::open(options.path).map(|input| Box::new(input) as Box<dyn InputPlugin>)
}

struct FileInput {
    data: Vec<u8>,
    pos: usize,
    info: Arc<InputInfo>,
    started: bool,
    closed: bool,
}

impl FileInput {
    fn open(path: PathBuf) -> Result<FileInput, CollectorError> {
        let data = std::fs::read(&path)
            .map_err(|e| CollectorError::Fatal(format!("cannot read {}: {e}", path.display())))?;
        debug!("replaying {} ({} bytes)", path.display(), data.len());
        Ok(FileInput {
            data,
            pos: 0,
            info: Arc::new(InputInfo::file(path)),
            started: false,
            closed: false,
        })
    }
}

impl InputPlugin for FileInput {
    fn get_packet(&mut self) -> Result<PacketRead, CollectorError> {
        if self.pos + IPFIX_HEADER_LENGTH > self.data.len() {
            if self.pos < self.data.len() {
                warn!("{} trailing bytes at end of file", self.data.len() - self.pos);
                self.pos = self.data.len();
            }
            if self.started && !self.closed {
                self.closed = true;
                return Ok(PacketRead::SourceClosed(Arc::clone(&self.info)));
            }
            return Ok(PacketRead::EndOfInput);
        }

        let version = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let length = u16::from_be_bytes([self.data[self.pos + 2], self.data[self.pos + 3]]) as usize;
        if version != IPFIX_VERSION
            || length < IPFIX_HEADER_LENGTH
            || self.pos + length > self.data.len()
        {
            warn!("malformed message at offset {}; stopping replay", self.pos);
            self.pos = self.data.len();
            return self.get_packet();
        }

        let buf = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;

        let status = if self.started {
            SourceStatus::Opened
        } else {
            self.started = true;
            SourceStatus::New
        };

        Ok(PacketRead::Packet {
            buf,
            info: Arc::clone(&self.info),
            status,
        })
    }
}
