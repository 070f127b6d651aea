//! Observation-domain filter stage.
//!
//! Passes or drops whole messages by ODID membership. `mode: pass` keeps
//! only the listed ODIDs, `mode: drop` discards them; an empty list with
//! `mode: drop` is a transparent stage.

use crate::intermediate::StageHandle;
use crate::message::IpfixMessage;
use crate::plugins::IntermediatePlugin;
use crate::CollectorError;

use log::info;
use serde::Deserialize;

use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Pass,
    Drop,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterOptions {
    mode: Mode,
    #[serde(default)]
    odids: Vec<u32>,
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn IntermediatePlugin>, CollectorError> {
    let options: FilterOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("odid_filter: {e}")))?;
    Ok(Box::new(OdidFilter {
        mode: options.mode,
        odids: options.odids.into_iter().collect(),
        passed: 0,
        dropped: 0,
    }))
}

struct OdidFilter {
    mode: Mode,
    odids: HashSet<u32>,
    passed: u64,
    dropped: u64,
}

impl IntermediatePlugin for OdidFilter {
    fn process_message(
        &mut self,
        msg: Arc<IpfixMessage>,
        stage: &StageHandle,
    ) -> Result<(), CollectorError> {
        let listed = self.odids.contains(&msg.odid());
        let keep = match self.mode {
            Mode::Pass => listed,
            Mode::Drop => !listed,
        };

        // Source lifecycle sentinels always travel through, or downstream
        // managers would never release per-source state.
        if keep || msg.source_status == crate::input::SourceStatus::Closed {
            self.passed += 1;
            stage.pass_message(msg)
        } else {
            self.dropped += 1;
            stage.drop_message(msg);
            Ok(())
        }
    }

    fn close(&mut self) {
        info!(
            "odid filter closing; {} passed, {} dropped",
            self.passed, self.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputInfo, SourceStatus, Transport};
    use crate::ring_buffer::{ReadCursor, RingBuffer};

    fn message(odid: u32, status: SourceStatus) -> Arc<IpfixMessage> {
        let info = Arc::new(InputInfo::network(
            Transport::Udp,
            "127.0.0.1:4739".parse().unwrap(),
        ));
        info.odid.store(odid, std::sync::atomic::Ordering::Relaxed);
        Arc::new(IpfixMessage::source_event(info, status))
    }

    #[test]
    fn pass_mode_keeps_only_listed_odids() {
        let options = serde_yaml::from_str("{mode: pass, odids: [5]}").unwrap();
        let mut filter = create(&options).unwrap();
        let out = RingBuffer::new(8).unwrap();
        let stage = StageHandle::for_queue(Arc::clone(&out));

        filter
            .process_message(message(5, SourceStatus::Opened), &stage)
            .unwrap();
        filter
            .process_message(message(6, SourceStatus::Opened), &stage)
            .unwrap();
        assert_eq!(out.len(), 1);

        let mut cursor = ReadCursor::new();
        assert_eq!(out.read(&mut cursor).unwrap().odid(), 5);
    }

    #[test]
    fn closed_sentinels_always_pass() {
        let options = serde_yaml::from_str("{mode: pass, odids: []}").unwrap();
        let mut filter = create(&options).unwrap();
        let out = RingBuffer::new(8).unwrap();
        let stage = StageHandle::for_queue(Arc::clone(&out));

        filter
            .process_message(message(9, SourceStatus::Closed), &stage)
            .unwrap();
        assert_eq!(out.len(), 1);
    }
}
