use std::any::Any;

use async_trait::async_trait;

use crate::error::WireError;

/// Minimal contract every provider satisfies, in-process or external.
///
/// Capability-specific behavior lives on the concrete type; callers reach it
/// through [`PluginBase::as_any`] for internal providers or through
/// [`crate::registry::ExternalPlugin::call`] for external ones.
#[async_trait]
pub trait PluginBase: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), WireError>;

    fn as_any(&self) -> &dyn Any;
}
