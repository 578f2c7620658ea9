pub mod config;
pub mod contracts;
pub mod error;
pub mod manager;
pub mod plugin;
pub mod process;
pub mod registry;
pub mod wire;

pub use config::{Capabilities, Config, ConfigEntry, ConnectionType, PluginDescriptor, TypeInfo};
pub use contracts::{
    DataProcessorClient, DataProcessorRequest, DataProcessorResponse, TransformRequest,
    TransformResponse, TransformerClient,
};
pub use error::{ErrorEnvelope, ManagerError, RegistryError, WireError};
pub use manager::{Manager, RegistrationOptions};
pub use plugin::PluginBase;
pub use registry::{ExternalPlugin, Provider, Registry};
pub use wire::{CallOptions, WireClient};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
