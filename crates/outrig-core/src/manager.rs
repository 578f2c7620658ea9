use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::{
    config::{Capabilities, Config, ConfigEntry, ConnectionType, PluginDescriptor},
    error::{CandidateError, ManagerError, RegistryError},
    plugin::PluginBase,
    process,
    registry::{Provider, Registry},
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

type NameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Knobs for one `register_plugins` batch.
#[derive(Clone)]
pub struct RegistrationOptions {
    pub idle_timeout: Option<Duration>,
    pub config_entries: Vec<ConfigEntry>,
    filter: Option<NameFilter>,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            config_entries: Vec::new(),
            filter: None,
        }
    }
}

impl fmt::Debug for RegistrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("config_entries", &self.config_entries.len())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl RegistrationOptions {
    /// `None` lets plugins run until signalled.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_config_entries(mut self, entries: Vec<ConfigEntry>) -> Self {
        self.config_entries = entries;
        self
    }

    /// Candidates whose base name fails `filter` are never executed.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, name: &str) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(name))
    }
}

/// An executable found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct RegistrationSummary {
    pub connection_type: Option<ConnectionType>,
    pub registered: Vec<String>,
    pub skipped: Vec<(String, CandidateError)>,
}

/// Discovers plugin executables, spawns them and publishes them into a [`Registry`].
pub struct Manager {
    registry: Arc<Registry>,
    lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Manager {
    /// Cancelling `cancel` aborts pending handshakes and kills every child.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            registry: Arc::new(Registry::new(cancel.clone())),
            lock: Mutex::new(()),
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Registers every usable plugin under `dir`. Calls are serialized.
    ///
    /// Fails only when discovery fails or finds nothing; individual candidates
    /// that misbehave are logged and listed in the summary.
    pub async fn register_plugins(
        &self,
        dir: &Path,
        options: RegistrationOptions,
    ) -> Result<RegistrationSummary, ManagerError> {
        let _guard = self.lock.lock().await;

        let connection_type = determine_connection_type()?;
        tracing::debug!(%connection_type, "selected plugin connection type");

        let candidates = discover(dir, &options)?;
        if candidates.is_empty() {
            return Err(ManagerError::NoPluginsFound(dir.to_path_buf()));
        }

        let mut summary = RegistrationSummary {
            connection_type: Some(connection_type),
            ..RegistrationSummary::default()
        };
        for candidate in candidates {
            match self.register_candidate(&candidate, connection_type, &options).await {
                Ok(()) => {
                    metrics::counter!("outrig_plugins_registered_total").increment(1);
                    summary.registered.push(candidate.id);
                }
                Err(err) => {
                    tracing::warn!(plugin = %candidate.id, error = %err, "failed to add plugin, skipping");
                    metrics::counter!("outrig_plugins_skipped_total", "reason" => err.reason()).increment(1);
                    summary.skipped.push((candidate.id, err));
                }
            }
        }
        Ok(summary)
    }

    async fn register_candidate(
        &self,
        candidate: &Candidate,
        connection_type: ConnectionType,
        options: &RegistrationOptions,
    ) -> Result<(), CandidateError> {
        let capabilities = query_capabilities(&candidate.path, &self.cancel).await?;
        let descriptor = PluginDescriptor {
            id: candidate.id.clone(),
            path: candidate.path.clone(),
            config: Config {
                id: candidate.id.clone(),
                connection_type,
                idle_timeout: options.idle_timeout,
                config_types: options.config_entries.clone(),
            },
            types: capabilities.types,
        };
        self.registry.add_external(descriptor).await?;
        Ok(())
    }

    pub async fn register_internal(
        &self,
        capability: impl Into<String>,
        plugin: Arc<dyn PluginBase>,
    ) -> Result<(), RegistryError> {
        self.registry.register_internal(capability, plugin).await
    }

    pub async fn get_plugin(&self, capability: &str) -> Result<Provider, RegistryError> {
        self.registry.get_plugin(capability).await
    }

    /// Gracefully signals every external plugin.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        self.registry.shutdown().await
    }
}

/// Unix sockets when this host can bind one, TCP otherwise.
pub fn determine_connection_type() -> Result<ConnectionType, ManagerError> {
    #[cfg(unix)]
    {
        let scratch = tempfile::tempdir().map_err(ManagerError::ConnectionProbe)?;
        let probe = scratch.path().join("plugin.sock");
        match std::os::unix::net::UnixListener::bind(&probe) {
            Ok(listener) => {
                drop(listener);
                Ok(ConnectionType::UnixSocket)
            }
            Err(err) => {
                tracing::debug!(error = %err, "unix sockets unavailable, falling back to tcp");
                Ok(ConnectionType::Tcp)
            }
        }
    }
    #[cfg(not(unix))]
    {
        Ok(ConnectionType::Tcp)
    }
}

/// Walks `dir` for regular files without an extension that pass the filter.
pub fn discover(dir: &Path, options: &RegistrationOptions) -> Result<Vec<Candidate>, ManagerError> {
    if !dir.exists() {
        return Err(ManagerError::NoPluginsFound(dir.to_path_buf()));
    }

    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|source| ManagerError::Discovery {
            dir: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(id) = entry.file_name().to_str() else {
            continue;
        };
        if id.contains('.') {
            continue;
        }
        if !options.accepts(id) {
            tracing::debug!(id, path = %entry.path().display(), "skipping plugin due to filter");
            continue;
        }
        tracing::debug!(id, path = %entry.path().display(), "discovered plugin");
        candidates.push(Candidate {
            id: id.to_string(),
            path: entry.path().to_path_buf(),
        });
    }
    Ok(candidates)
}

/// Runs `<path> capabilities` once and parses what it prints.
pub async fn query_capabilities(
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Capabilities, CandidateError> {
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(CandidateError::Capabilities("cancelled".to_string()));
        }
        output = process::capabilities_command(path).output() => output
            .map_err(|err| CandidateError::Capabilities(format!("failed to run: {err}")))?,
    };
    if !output.status.success() {
        return Err(CandidateError::Capabilities(format!(
            "exited with {}",
            output.status
        )));
    }
    let capabilities: Capabilities = serde_json::from_slice(&output.stdout)
        .map_err(|err| CandidateError::Capabilities(format!("malformed capabilities: {err}")))?;
    if capabilities.types.is_empty() {
        return Err(CandidateError::Capabilities(
            "declares no capability types".to_string(),
        ));
    }
    Ok(capabilities)
}
