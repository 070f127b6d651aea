#![doc = include_str!("../README.md")]

pub mod configurator;
pub mod convert;
pub mod data_manager;
pub mod elements;
pub mod input;
pub mod intermediate;
pub mod message;
pub mod output_manager;
pub mod plugins;
pub mod preprocessor;
pub mod ring_buffer;
pub mod stats;
pub mod template_manager;


use thiserror::Error;

// Re-export the types embedders touch most.
pub use configurator::{Configurator, PluginSpec, StartupConfig};
pub use convert::LegacyConverter;
pub use data_manager::{DataManager, StorageDescriptor};
pub use input::{InputInfo, PacketRead, SourceStatus, Transport};
pub use intermediate::{IntermediateStage, StageHandle};
pub use message::IpfixMessage;
pub use output_manager::{OutputManager, OutputManagerHandle};
pub use plugins::{InputPlugin, IntermediatePlugin, StoragePlugin, PLUGIN_API_VERSION};
pub use preprocessor::Preprocessor;
pub use ring_buffer::{ReadCursor, RingBuffer};
pub use template_manager::{Template, TemplateKey, TemplateKind, TemplateManager};

/// Collector-wide error type. Most variants are caught and logged at the
/// stage that can continue; [`CollectorError::Fatal`] is the only one that
/// takes the process down.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Header or set walk of a datagram failed; the packet is dropped.
    #[error("malformed packet: {0}")]
    BadPacket(String),

    /// A data set referenced a template the manager does not know.
    #[error("[{odid}] unknown template {template_id}")]
    UnknownTemplate { odid: u32, template_id: u16 },

    /// Legacy datagram could not be rewritten to IPFIX.
    #[error("conversion failed: {0}")]
    Conversion(&'static str),

    /// A plugin's initialisation refused the configuration.
    #[error("plugin {name} initialization failed: {reason}")]
    PluginInitFailed { name: String, reason: String },

    /// No such plugin in the registry.
    #[error("unknown plugin {0}")]
    PluginMissing(String),

    /// Plugin was built against a different plugin API.
    #[error("plugin {name} has API version {found}, expected {expected}")]
    PluginVersionMismatch {
        name: String,
        found: u32,
        expected: u32,
    },

    /// A pipeline queue rejected a message; the message is dropped.
    #[error("queue write failed: {0}")]
    QueueWriteFailed(&'static str),

    /// The configurator could not apply a (re)configuration; the live
    /// pipeline stays unchanged.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-recoverable; the process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}
