//! # Plugin surface
//!
//! Statically typed plugin traits and the registry of built-in plugins.
//! The three plugin flavours mirror the pipeline: inputs produce raw
//! datagrams, intermediates transform messages between queues, storages
//! sink messages inside a data manager's worker pool.
//!
//! Every factory carries an API version; instantiation fails on a mismatch
//! with [`PLUGIN_API_VERSION`], the moral equivalent of the version symbol
//! a dynamically loaded plugin would export.

pub mod input;
pub mod intermediate;
pub mod storage;

use crate::input::PacketRead;
use crate::intermediate::StageHandle;
use crate::message::IpfixMessage;
use crate::template_manager::TemplateManager;
use crate::CollectorError;

use serde_yaml::Value;

use std::sync::Arc;

/// Version of the plugin contract this core expects.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Transport-side plugin: owns its sockets or files and yields datagrams
/// already converted to IPFIX wire form.
pub trait InputPlugin: Send {
    /// Block (bounded by an internal timeout) for the next datagram.
    fn get_packet(&mut self) -> Result<PacketRead, CollectorError>;

    fn close(&mut self) {}
}

/// In-flight transformation stage.
pub trait IntermediatePlugin: Send {
    /// Handle one message; must call exactly one of
    /// [`StageHandle::pass_message`] or [`StageHandle::drop_message`].
    fn process_message(
        &mut self,
        msg: Arc<IpfixMessage>,
        stage: &StageHandle,
    ) -> Result<(), CollectorError>;

    fn close(&mut self) {}
}

/// Storage sink, driven by a data manager worker thread.
pub trait StoragePlugin: Send {
    fn store(
        &mut self,
        msg: &IpfixMessage,
        templates: &TemplateManager,
    ) -> Result<(), CollectorError>;

    /// Flush request.
    fn store_now(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn close(&mut self) {}
}

struct InputFactory {
    name: &'static str,
    api_version: u32,
    create: fn(&Value) -> Result<Box<dyn InputPlugin>, CollectorError>,
}

struct IntermediateFactory {
    name: &'static str,
    api_version: u32,
    create: fn(&Value) -> Result<Box<dyn IntermediatePlugin>, CollectorError>,
}

struct StorageFactory {
    name: &'static str,
    api_version: u32,
    require_single_manager: bool,
    create: fn(&Value) -> Result<Box<dyn StoragePlugin>, CollectorError>,
}

static INPUT_FACTORIES: &[InputFactory] = &[
    InputFactory {
        name: "udp",
        api_version: PLUGIN_API_VERSION,
        create: input::udp::create,
    },
    InputFactory {
        name: "tcp",
        api_version: PLUGIN_API_VERSION,
        create: input::tcp::create,
    },
    InputFactory {
        name: "ipfix_file",
        api_version: PLUGIN_API_VERSION,
        create: input::file::create,
    },
];

static INTERMEDIATE_FACTORIES: &[IntermediateFactory] = &[IntermediateFactory {
    name: "odid_filter",
    api_version: PLUGIN_API_VERSION,
    create: intermediate::odid_filter::create,
}];

static STORAGE_FACTORIES: &[StorageFactory] = &[
    StorageFactory {
        name: "dummy",
        api_version: PLUGIN_API_VERSION,
        require_single_manager: false,
        create: storage::dummy::create,
    },
    StorageFactory {
        name: "ipfix_file",
        api_version: PLUGIN_API_VERSION,
        require_single_manager: false,
        create: storage::ipfix_file::create,
    },
];

fn version_check(name: &str, found: u32) -> Result<(), CollectorError> {
    if found != PLUGIN_API_VERSION {
        return Err(CollectorError::PluginVersionMismatch {
            name: name.to_string(),
            found,
            expected: PLUGIN_API_VERSION,
        });
    }
    Ok(())
}

/// Instantiate a built-in input plugin by registry key.
pub fn create_input(kind: &str, options: &Value) -> Result<Box<dyn InputPlugin>, CollectorError> {
    let factory = INPUT_FACTORIES
        .iter()
        .find(|f| f.name == kind)
        .ok_or_else(|| CollectorError::PluginMissing(kind.to_string()))?;
    version_check(factory.name, factory.api_version)?;
    (factory.create)(options)
}

/// Instantiate a built-in intermediate plugin by registry key.
pub fn create_intermediate(
    kind: &str,
    options: &Value,
) -> Result<Box<dyn IntermediatePlugin>, CollectorError> {
    let factory = INTERMEDIATE_FACTORIES
        .iter()
        .find(|f| f.name == kind)
        .ok_or_else(|| CollectorError::PluginMissing(kind.to_string()))?;
    version_check(factory.name, factory.api_version)?;
    (factory.create)(options)
}

/// Whether a built-in storage plugin pins the output manager into
/// single-data-manager mode.
pub fn storage_requires_single_manager(kind: &str) -> Result<bool, CollectorError> {
    STORAGE_FACTORIES
        .iter()
        .find(|f| f.name == kind)
        .map(|f| f.require_single_manager)
        .ok_or_else(|| CollectorError::PluginMissing(kind.to_string()))
}

/// Build a closure instantiating a built-in storage plugin with the given
/// options; data managers call it once per worker they spawn.
pub fn storage_factory(
    kind: &str,
    options: &Value,
) -> Result<Arc<dyn Fn() -> Result<Box<dyn StoragePlugin>, CollectorError> + Send + Sync>, CollectorError>
{
    let factory = STORAGE_FACTORIES
        .iter()
        .find(|f| f.name == kind)
        .ok_or_else(|| CollectorError::PluginMissing(kind.to_string()))?;
    version_check(factory.name, factory.api_version)?;
    let create = factory.create;
    let options = options.clone();
    Ok(Arc::new(move || create(&options)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugins_are_reported_missing() {
        let options = Value::Null;
        assert!(matches!(
            create_input("carrier-pigeon", &options),
            Err(CollectorError::PluginMissing(_))
        ));
        assert!(matches!(
            create_intermediate("carrier-pigeon", &options),
            Err(CollectorError::PluginMissing(_))
        ));
        assert!(matches!(
            storage_factory("carrier-pigeon", &options),
            Err(CollectorError::PluginMissing(_))
        ));
    }

    #[test]
    fn builtin_storage_plugins_instantiate() {
        let options = serde_yaml::from_str("{}").unwrap();
        let factory = storage_factory("dummy", &options).unwrap();
        assert!(factory().is_ok());
    }
}
