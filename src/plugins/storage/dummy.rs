//! Dummy storage plugin: counts what it would have stored and optionally
//! sleeps per message to emulate a slow sink (useful for exercising queue
//! back-pressure).

use crate::message::IpfixMessage;
use crate::plugins::StoragePlugin;
use crate::template_manager::TemplateManager;
use crate::CollectorError;

use log::{debug, info};
use serde::Deserialize;

use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DummyOptions {
    /// Artificial per-message delay in microseconds.
    #[serde(default)]
    delay: u64,
}

pub(crate) fn create(
    options: &serde_yaml::Value,
) -> Result<Box<dyn StoragePlugin>, CollectorError> {
    let options: DummyOptions = serde_yaml::from_value(options.clone())
        .map_err(|e| CollectorError::ConfigInvalid(format!("dummy storage: {e}")))?;
    Ok(Box::new(DummyStorage {
        delay: Duration::from_micros(options.delay),
        messages: 0,
        records: 0,
    }))
}

struct DummyStorage {
    delay: Duration,
    messages: u64,
    records: u64,
}

impl StoragePlugin for DummyStorage {
    fn store(
        &mut self,
        msg: &IpfixMessage,
        _templates: &TemplateManager,
    ) -> Result<(), CollectorError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.messages += 1;
        self.records += u64::from(msg.data_records_count);
        debug!(
            "[{}] dummy: message with {} data records",
            msg.odid(),
            msg.data_records_count
        );
        Ok(())
    }

    fn store_now(&mut self) -> Result<(), CollectorError> {
        info!("dummy: {} messages, {} records so far", self.messages, self.records);
        Ok(())
    }

    fn close(&mut self) {
        info!(
            "dummy storage closing; stored {} messages with {} records",
            self.messages, self.records
        );
    }
}
