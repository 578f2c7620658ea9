use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use outrig_core::{
    config::{duration_string, ConfigEntry},
    manager::{self, Manager, RegistrationOptions, DEFAULT_IDLE_TIMEOUT},
    registry::Provider,
};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

const EXAMPLE_CONFIG: &str = include_str!("../../../demos/outrig.toml");

#[derive(Parser, Debug)]
#[command(name = "outrig", author, version, about = "Host for out-of-process plugins")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register every plugin in a directory and keep them running until Ctrl+C.
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Overrides `plugin_dir` from the configuration file.
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
    /// Interact with host configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugin executables without starting them.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists plugin candidates and the capabilities they declare.
    List {
        #[arg(long, value_name = "DIR", default_value = "plugins")]
        dir: PathBuf,
    },
}

/// Host settings read from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostConfig {
    #[serde(default = "default_plugin_dir")]
    plugin_dir: PathBuf,
    /// Duration string such as `5m`; `"off"` disables idle shutdown.
    idle_timeout: Option<String>,
    /// Only executables whose name starts with this prefix are loaded.
    name_prefix: Option<String>,
    #[serde(default)]
    config: Vec<HostConfigEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostConfigEntry {
    #[serde(rename = "type")]
    type_name: String,
    data: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            idle_timeout: None,
            name_prefix: None,
            config: Vec::new(),
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

impl HostConfig {
    fn idle_timeout(&self) -> Result<Option<Duration>> {
        match self.idle_timeout.as_deref() {
            None => Ok(Some(DEFAULT_IDLE_TIMEOUT)),
            Some("off") => Ok(None),
            Some(raw) => {
                let timeout = duration_string::parse(raw).map_err(anyhow::Error::msg)?;
                if timeout.is_zero() {
                    bail!("idle_timeout must be greater than zero (use \"off\" to disable)");
                }
                Ok(Some(timeout))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.idle_timeout()?;
        let mut seen = HashSet::new();
        for entry in &self.config {
            if entry.type_name.trim().is_empty() {
                bail!("config entry has an empty type");
            }
            if !seen.insert(entry.type_name.as_str()) {
                bail!("duplicate config entry for type `{}`", entry.type_name);
            }
        }
        Ok(())
    }

    fn registration_options(&self) -> Result<RegistrationOptions> {
        let entries = self
            .config
            .iter()
            .map(|entry| ConfigEntry::new(entry.type_name.clone(), entry.data.clone().into_bytes()))
            .collect();
        let mut options = RegistrationOptions::default()
            .with_idle_timeout(self.idle_timeout()?)
            .with_config_entries(entries);
        if let Some(prefix) = self.name_prefix.clone() {
            options = options.with_filter(move |name| name.starts_with(&prefix));
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run { config, dir } => handle_run(config, dir).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command).await,
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_run(config_path: Option<PathBuf>, dir: Option<PathBuf>) -> Result<()> {
    let host = match &config_path {
        Some(path) => load_config(path)?,
        None => HostConfig::default(),
    };
    host.validate()?;
    let plugin_dir = dir.unwrap_or_else(|| host.plugin_dir.clone());

    let cancel = CancellationToken::new();
    let manager = Manager::new(cancel.clone());
    let summary = manager
        .register_plugins(&plugin_dir, host.registration_options()?)
        .await
        .with_context(|| format!("failed to register plugins from {}", plugin_dir.display()))?;

    for (id, err) in &summary.skipped {
        println!("skipped {id}: {err}");
    }
    let mut pinged = HashSet::new();
    for (capability, kind) in manager.registry().capability_types().await {
        let provider = manager.get_plugin(&capability).await?;
        let name = match &provider {
            Provider::External(plugin) => plugin.id().to_string(),
            Provider::Internal(_) => capability.clone(),
        };
        if !pinged.insert(name.clone()) {
            println!("- {capability} ({kind}) -> {name}");
            continue;
        }
        match provider.ping().await {
            Ok(()) => println!("- {capability} ({kind}) -> {name}"),
            Err(err) => {
                tracing::warn!(plugin = %name, error = %err, "plugin did not answer ping");
                println!("- {capability} ({kind}) -> {name} [unreachable: {err}]");
            }
        }
    }
    println!(
        "{} plugin(s) running; press Ctrl+C to stop",
        summary.registered.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("shutting down plugins");
    let result = manager.shutdown().await;
    cancel.cancel();
    result?;
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{EXAMPLE_CONFIG}");
        }
    }
    Ok(())
}

async fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir } => {
            let candidates = match manager::discover(&dir, &RegistrationOptions::default()) {
                Ok(candidates) => candidates,
                Err(err) => {
                    println!("{err}");
                    return Ok(());
                }
            };
            let cancel = CancellationToken::new();
            for candidate in candidates {
                match manager::query_capabilities(&candidate.path, &cancel).await {
                    Ok(capabilities) => {
                        let names: Vec<&str> = capabilities.capability_names().collect();
                        println!("- {}: {}", candidate.id, names.join(", "));
                    }
                    Err(err) => println!("- {}: unusable ({err})", candidate.id),
                }
            }
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<HostConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_config(raw: &str) -> Result<HostConfig> {
    let expanded = interpolate_env(raw)?;
    Ok(toml::from_str::<HostConfig>(&expanded)?)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = match RE.get() {
        Some(regex) => regex,
        None => {
            let compiled = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}")?;
            RE.get_or_init(|| compiled)
        }
    };
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_example_parses_and_validates() {
        let cfg = parse_config(EXAMPLE_CONFIG).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.idle_timeout().unwrap(), Some(Duration::from_secs(300)));
        assert_eq!(cfg.name_prefix.as_deref(), Some("simple-"));
        assert_eq!(cfg.config.len(), 1);
    }

    #[test]
    fn interpolation_uses_defaults_for_unset_variables() {
        let out = interpolate_env("dir = \"${OUTRIG_TEST_SURELY_UNSET:fallback}\"").unwrap();
        assert_eq!(out, "dir = \"fallback\"");
        let empty = interpolate_env("x = \"${OUTRIG_TEST_SURELY_UNSET}\"").unwrap();
        assert_eq!(empty, "x = \"\"");
    }

    #[test]
    fn idle_timeout_accepts_off_and_rejects_zero() {
        let off = parse_config("idle_timeout = \"off\"").unwrap();
        assert_eq!(off.idle_timeout().unwrap(), None);

        let zero = parse_config("idle_timeout = \"0s\"").unwrap();
        assert!(zero.validate().is_err());

        let default = parse_config("").unwrap();
        assert_eq!(default.idle_timeout().unwrap(), Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(default.plugin_dir, PathBuf::from("plugins"));
    }

    #[test]
    fn duplicate_config_types_are_rejected() {
        let cfg = parse_config(
            r#"
            [[config]]
            type = "credentials"
            data = "a"

            [[config]]
            type = "credentials"
            data = "b"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn prefix_becomes_a_name_filter() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["simple-processor", "other-plugin"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let cfg = parse_config("name_prefix = \"simple-\"").unwrap();
        let candidates = manager::discover(dir.path(), &cfg.registration_options().unwrap()).unwrap();
        let ids: Vec<_> = candidates.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["simple-processor".to_string()]);
    }
}
