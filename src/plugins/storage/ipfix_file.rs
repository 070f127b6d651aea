//! IPFIX file storage plugin.
//!
//! Re-serialises accepted messages into a capture file (header bytes as
//! rewritten by the preprocessor, so template IDs and sequence numbers are
//! the collector's). Maintains the cumulative per-ODID `flowsStats.txt`
//! ledger next to the output file: received, stored and lost record counts.

use crate::message::IpfixMessage;
use crate::plugins::StoragePlugin;
use crate::template_manager::TemplateManager;
use crate::CollectorError;

use log::{info, warn};
use serde::Deserialize;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStorageOptions {
    path: PathBuf,
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn StoragePlugin>, CollectorError> {
    let options: FileStorageOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("ipfix_file storage: {e}")))?;
    Ok(Box::new(IpfixFileStorage {
        path: options.path,
        file: None,
        counters: BTreeMap::new(),
    }))
}

#[derive(Debug, Default, Clone, Copy)]
struct OdidCounters {
    received: u64,
    stored: u64,
    lost: u64,
}

struct IpfixFileStorage {
    path: PathBuf,
    file: Option<File>,
    counters: BTreeMap<u32, OdidCounters>,
}

impl IpfixFileStorage {
    fn file(&mut self) -> Result<&mut File, CollectorError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
            info!("storing IPFIX messages to {}", self.path.display());
        }
        Ok(self.file.as_mut().expect("just opened"))
    }

    fn write_flows_stats(&self) {
        let Some(dir) = self.path.parent() else { return };
        let mut out = String::new();
        for (odid, counters) in &self.counters {
            let _ = writeln!(
                out,
                "ODID {odid}: received {} stored {} lost {}",
                counters.received, counters.stored, counters.lost
            );
        }
        if let Err(e) = std::fs::write(dir.join("flowsStats.txt"), out) {
            warn!("cannot update flowsStats.txt: {e}");
        }
    }
}

impl StoragePlugin for IpfixFileStorage {
    fn store(
        &mut self,
        msg: &IpfixMessage,
        _templates: &TemplateManager,
    ) -> Result<(), CollectorError> {
        let records = u64::from(msg.data_records_count);
        let odid = msg.odid();

        let write_result = if msg.raw().is_empty() {
            Ok(())
        } else {
            self.file().and_then(|f| {
                f.write_all(msg.raw()).map_err(CollectorError::from)
            })
        };

        let upstream_lost = msg
            .input_info
            .lost_records
            .load(std::sync::atomic::Ordering::Relaxed);
        let counters = self.counters.entry(odid).or_default();
        counters.received += records;
        counters.lost = counters.lost.max(upstream_lost);

        match write_result {
            Ok(()) => {
                counters.stored += records;
                Ok(())
            }
            Err(e) => {
                warn!("[{odid}] failed to persist message: {e}");
                Err(e)
            }
        }
    }

    fn store_now(&mut self) -> Result<(), CollectorError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        self.write_flows_stats();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        self.write_flows_stats();
        info!("ipfix_file storage closed ({})", self.path.display());
    }
}
