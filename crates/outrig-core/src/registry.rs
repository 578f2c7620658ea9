use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt,
    process::ExitStatus,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use tokio::{
    io::BufReader,
    sync::{watch, RwLock},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConnectionType, PluginDescriptor},
    error::{ProviderKind, RegistryError, ShutdownFailure, WireError},
    plugin::PluginBase,
    process,
    wire::{self, CallOptions, WireClient, SHUTDOWN_ENDPOINT},
};

/// A running external plugin together with its wire handle.
#[derive(Debug)]
pub struct ExternalPlugin {
    descriptor: PluginDescriptor,
    client: WireClient,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl ExternalPlugin {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn location(&self) -> &str {
        self.client.location()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.client.connection_type()
    }

    pub fn client(&self) -> &WireClient {
        &self.client
    }

    pub async fn call(
        &self,
        endpoint: &str,
        method: Method,
        options: CallOptions,
    ) -> Result<Bytes, WireError> {
        self.client.call(endpoint, method, options).await
    }

    pub async fn call_json<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: Method,
        options: CallOptions,
    ) -> Result<R, WireError> {
        self.client.call_json(endpoint, method, options).await
    }

    /// Asks the plugin to tear itself down through `POST /shutdown`.
    pub async fn request_shutdown(&self) -> Result<(), WireError> {
        self.client
            .call(SHUTDOWN_ENDPOINT, Method::POST, CallOptions::new())
            .await
            .map(|_| ())
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves once the process has exited; `None` if its status was lost.
    pub async fn wait_for_exit(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(Option::is_some).await.ok().and_then(|s| *s);
        status
    }

    fn interrupt(&self) -> Result<(), String> {
        let pid = self
            .pid
            .ok_or_else(|| "process id unavailable".to_string())?;
        process::interrupt(pid)
    }
}

#[async_trait]
impl PluginBase for ExternalPlugin {
    async fn ping(&self) -> Result<(), WireError> {
        self.client.ping().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Provider resolved for a capability type.
#[derive(Clone)]
pub enum Provider {
    Internal(Arc<dyn PluginBase>),
    External(Arc<ExternalPlugin>),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Internal(_) => ProviderKind::Internal,
            Provider::External(_) => ProviderKind::External,
        }
    }

    pub async fn ping(&self) -> Result<(), WireError> {
        match self {
            Provider::Internal(plugin) => plugin.ping().await,
            Provider::External(plugin) => plugin.ping().await,
        }
    }

    pub fn as_external(&self) -> Option<&Arc<ExternalPlugin>> {
        match self {
            Provider::External(plugin) => Some(plugin),
            Provider::Internal(_) => None,
        }
    }

    /// Downcasts an internal provider to its concrete type.
    pub fn downcast_internal<T: PluginBase>(&self) -> Option<&T> {
        match self {
            Provider::Internal(plugin) => plugin.as_any().downcast_ref::<T>(),
            Provider::External(_) => None,
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Internal(_) => f.write_str("Internal(..)"),
            Provider::External(plugin) => f.debug_tuple("External").field(&plugin.id()).finish(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    internal: HashMap<String, Arc<dyn PluginBase>>,
    external: HashMap<String, Arc<ExternalPlugin>>,
}

impl RegistryState {
    fn claimed_by(&self, capability: &str) -> Option<ProviderKind> {
        if self.internal.contains_key(capability) {
            Some(ProviderKind::Internal)
        } else if self.external.contains_key(capability) {
            Some(ProviderKind::External)
        } else {
            None
        }
    }

    fn ensure_unclaimed(&self, capability: &str) -> Result<(), RegistryError> {
        match self.claimed_by(capability) {
            Some(existing) => Err(RegistryError::Conflict {
                capability: capability.to_string(),
                existing,
            }),
            None => Ok(()),
        }
    }
}

/// Capability-type table shared by the manager and the host.
///
/// Every write (registration, external spawn plus handshake, shutdown) holds
/// the write lock for its whole duration, so readers never observe a plugin
/// published under only some of its types.
pub struct Registry {
    state: RwLock<RegistryState>,
    cancel: CancellationToken,
}

impl Registry {
    /// `cancel` governs spawned children: once cancelled they are killed outright.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            cancel,
        }
    }

    pub async fn register_internal(
        &self,
        capability: impl Into<String>,
        plugin: Arc<dyn PluginBase>,
    ) -> Result<(), RegistryError> {
        let capability = capability.into();
        let mut state = self.state.write().await;
        state.ensure_unclaimed(&capability)?;
        tracing::debug!(%capability, "registered internal plugin");
        state.internal.insert(capability, plugin);
        Ok(())
    }

    /// Spawns the described plugin, performs the handshake and publishes it
    /// under every declared capability type.
    pub async fn add_external(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<Arc<ExternalPlugin>, RegistryError> {
        // A plugin published under no key could never be signalled at shutdown.
        if descriptor.types.is_empty() {
            return Err(RegistryError::NoCapabilities(descriptor.id));
        }
        let mut state = self.state.write().await;
        for capability in descriptor.types.keys() {
            state.ensure_unclaimed(capability)?;
        }

        let id = descriptor.id.clone();
        let mut command = process::serve_command(&descriptor).map_err(|err| RegistryError::Spawn {
            id: id.clone(),
            source: std::io::Error::other(err),
        })?;
        let mut child = command.spawn().map_err(|source| RegistryError::Spawn {
            id: id.clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            process::forward_output(id.clone(), "stderr", BufReader::new(stderr));
        }
        let Some(stdout) = child.stdout.take() else {
            process::discard(child, &id);
            return Err(RegistryError::Handshake {
                id,
                source: WireError::Handshake("plugin stdout was not captured".to_string()),
            });
        };
        let mut stdout = BufReader::new(stdout);

        let location = match wire::await_location(&mut stdout, &self.cancel).await {
            Ok(location) => location,
            Err(source) => {
                process::discard(child, &id);
                return Err(RegistryError::Handshake { id, source });
            }
        };
        // Keep the pipe drained while readiness is polled.
        process::forward_output(id.clone(), "stdout", stdout);
        let client = match wire::connect(descriptor.config.connection_type, &location, &self.cancel).await {
            Ok(client) => client,
            Err(source) => {
                process::discard(child, &id);
                return Err(RegistryError::Handshake { id, source });
            }
        };
        let exit = process::supervise(child, id.clone(), self.cancel.clone());

        tracing::info!(
            plugin = %id,
            location = client.location(),
            connection_type = %client.connection_type(),
            "plugin ready"
        );
        let plugin = Arc::new(ExternalPlugin {
            descriptor,
            client,
            pid,
            exit,
        });
        for capability in plugin.descriptor.types.keys() {
            state.external.insert(capability.clone(), plugin.clone());
        }
        Ok(plugin)
    }

    /// Internal providers win over external ones for the same type.
    pub async fn get_plugin(&self, capability: &str) -> Result<Provider, RegistryError> {
        let state = self.state.read().await;
        if let Some(plugin) = state.internal.get(capability) {
            return Ok(Provider::Internal(plugin.clone()));
        }
        if let Some(plugin) = state.external.get(capability) {
            return Ok(Provider::External(plugin.clone()));
        }
        Err(RegistryError::NotFound(capability.to_string()))
    }

    /// Claimed capability types, sorted by name.
    pub async fn capability_types(&self) -> Vec<(String, ProviderKind)> {
        let state = self.state.read().await;
        let mut types: Vec<_> = state
            .internal
            .keys()
            .map(|name| (name.clone(), ProviderKind::Internal))
            .chain(
                state
                    .external
                    .keys()
                    .filter(|name| !state.internal.contains_key(*name))
                    .map(|name| (name.clone(), ProviderKind::External)),
            )
            .collect();
        types.sort();
        types
    }

    /// Signals every external plugin once and drops all of its aliases.
    /// Every plugin is attempted; failures are joined into one error.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let mut signalled = HashSet::new();
        let mut failures = Vec::new();

        for (_, plugin) in state.external.drain() {
            if !signalled.insert(plugin.id().to_string()) {
                continue;
            }
            if plugin.has_exited() {
                tracing::debug!(plugin = plugin.id(), "plugin already exited; nothing to signal");
                continue;
            }
            match plugin.interrupt() {
                Ok(()) => tracing::info!(plugin = plugin.id(), "sent interrupt to plugin"),
                Err(reason) => failures.push(ShutdownFailure {
                    plugin: plugin.id().to_string(),
                    reason,
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Shutdown(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::PathBuf};

    use super::*;
    use crate::{
        config::{Config, TypeInfo},
        error::CandidateError,
    };

    struct MockPlugin {
        name: &'static str,
    }

    #[async_trait]
    impl PluginBase for MockPlugin {
        async fn ping(&self) -> Result<(), WireError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn descriptor(id: &str, types: &[&str]) -> PluginDescriptor {
        PluginDescriptor {
            id: id.into(),
            path: PathBuf::from("/nonexistent/outrig-plugin"),
            config: Config::new(id, ConnectionType::Tcp),
            types: types
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        vec![TypeInfo {
                            type_name: format!("{id}-impl"),
                            json_schema: Vec::new(),
                        }],
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    async fn insert_detached(registry: &Registry, id: &str, types: &[&str]) -> Arc<ExternalPlugin> {
        let plugin = Arc::new(ExternalPlugin {
            descriptor: descriptor(id, types),
            client: WireClient::new(ConnectionType::Tcp, "127.0.0.1:1").unwrap(),
            pid: None,
            exit: watch::channel(None).1,
        });
        let mut state = registry.state.write().await;
        for name in types {
            state.external.insert(name.to_string(), plugin.clone());
        }
        plugin
    }

    #[tokio::test]
    async fn internal_registration_rejects_duplicates() {
        let registry = Registry::new(CancellationToken::new());
        registry
            .register_internal("test-type", Arc::new(MockPlugin { name: "first" }))
            .await
            .unwrap();

        let err = registry
            .register_internal("test-type", Arc::new(MockPlugin { name: "second" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert!(matches!(
            err,
            RegistryError::Conflict { existing: ProviderKind::Internal, .. }
        ));

        let provider = registry.get_plugin("test-type").await.unwrap();
        assert_eq!(provider.downcast_internal::<MockPlugin>().unwrap().name, "first");
        provider.ping().await.unwrap();
    }

    #[tokio::test]
    async fn missing_type_is_not_found_by_name() {
        let registry = Registry::new(CancellationToken::new());
        let err = registry.get_plugin("non-existent").await.unwrap_err();
        assert!(matches!(&err, RegistryError::NotFound(name) if name == "non-existent"));
        assert!(err.to_string().contains("no plugin found for type \"non-existent\""));
    }

    #[tokio::test]
    async fn internal_provider_takes_precedence() {
        let registry = Registry::new(CancellationToken::new());
        insert_detached(&registry, "ext", &["shared"]).await;
        registry
            .state
            .write()
            .await
            .internal
            .insert("shared".into(), Arc::new(MockPlugin { name: "inproc" }));

        let provider = registry.get_plugin("shared").await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Internal);
        assert_eq!(
            registry.capability_types().await,
            vec![("shared".to_string(), ProviderKind::Internal)]
        );
    }

    #[tokio::test]
    async fn internal_registration_conflicts_with_external() {
        let registry = Registry::new(CancellationToken::new());
        insert_detached(&registry, "ext", &["dataProcessor"]).await;
        let err = registry
            .register_internal("dataProcessor", Arc::new(MockPlugin { name: "late" }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Conflict { existing: ProviderKind::External, .. }
        ));
        assert_eq!(
            registry.get_plugin("dataProcessor").await.unwrap().kind(),
            ProviderKind::External
        );
    }

    #[tokio::test]
    async fn external_conflict_is_detected_before_spawning() {
        let registry = Registry::new(CancellationToken::new());
        registry
            .register_internal("transformer", Arc::new(MockPlugin { name: "inproc" }))
            .await
            .unwrap();

        // The executable does not exist, so reaching the spawn would yield `Spawn`.
        let err = registry
            .add_external(descriptor("late", &["other", "transformer"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { ref capability, .. } if capability == "transformer"));
        assert!(registry.get_plugin("other").await.is_err());
    }

    #[tokio::test]
    async fn capability_types_are_sorted_by_name() {
        let registry = Registry::new(CancellationToken::new());
        insert_detached(&registry, "ext", &["transformer", "dataProcessor"]).await;
        registry
            .register_internal("cache", Arc::new(MockPlugin { name: "inproc" }))
            .await
            .unwrap();

        assert_eq!(
            registry.capability_types().await,
            vec![
                ("cache".to_string(), ProviderKind::Internal),
                ("dataProcessor".to_string(), ProviderKind::External),
                ("transformer".to_string(), ProviderKind::External),
            ]
        );
    }

    #[tokio::test]
    async fn plugin_without_types_is_never_spawned() {
        let registry = Registry::new(CancellationToken::new());
        // Reaching the spawn would yield `Spawn` for the nonexistent executable.
        let err = registry.add_external(descriptor("untyped", &[])).await.unwrap_err();
        assert!(matches!(&err, RegistryError::NoCapabilities(id) if id == "untyped"));
        assert_eq!(CandidateError::from(err).reason(), "capabilities");
        assert!(registry.capability_types().await.is_empty());
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let registry = Registry::new(CancellationToken::new());
        let err = registry
            .add_external(descriptor("ghost", &["dataProcessor"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Spawn { ref id, .. } if id == "ghost"));
        assert!(registry.capability_types().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_with_only_internal_plugins_succeeds() {
        let registry = Registry::new(CancellationToken::new());
        registry
            .register_internal("test-type", Arc::new(MockPlugin { name: "only" }))
            .await
            .unwrap();
        registry.shutdown().await.unwrap();
        assert!(registry.get_plugin("test-type").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_handles_multi_type_plugins_once() {
        let registry = Registry::new(CancellationToken::new());
        insert_detached(&registry, "multi", &["a", "b", "c"]).await;
        insert_detached(&registry, "single", &["d"]).await;

        let err = registry.shutdown().await.unwrap_err();
        match err {
            RegistryError::Shutdown(failures) => {
                let mut plugins: Vec<_> = failures.iter().map(|f| f.plugin.as_str()).collect();
                plugins.sort();
                assert_eq!(plugins, vec!["multi", "single"]);
            }
            other => panic!("expected shutdown error, got {other:?}"),
        }
        assert!(registry.capability_types().await.is_empty());
    }
}
