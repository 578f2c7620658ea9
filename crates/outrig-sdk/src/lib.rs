//! Guest-side runtime for outrig plugins.
//!
//! A plugin binary hands its capabilities and endpoints to [`run`], which
//! answers the host's `capabilities` query or serves until shutdown.

pub mod endpoint;
pub mod runtime;
mod server;
pub mod socket;
pub mod work;

use std::{io::Write, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outrig_core::config::{Capabilities, Config};
use tracing_subscriber::{fmt, EnvFilter};

pub use endpoint::{error_response, json_response, Endpoint, HttpRequest, HttpResponse};
pub use runtime::{Phase, Plugin, PluginHandle, ShutdownOutcome, ShutdownReason};
pub use work::{WorkGuard, WorkTracker};

/// Command line every plugin binary accepts from the host.
#[derive(Parser, Debug)]
#[command(author, version, about = "outrig plugin")]
pub struct PluginArgs {
    /// Plugin configuration as JSON, supplied by the host when serving.
    #[arg(long, value_name = "JSON")]
    pub config: Option<String>,

    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<PluginCommand>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCommand {
    /// Prints the capabilities document and exits.
    Capabilities,
}

/// Entry point for plugin binaries. Logs go to stderr; stdout carries only
/// the capabilities document or the location line.
pub async fn run<F>(capabilities: Capabilities, build: F) -> Result<ExitCode>
where
    F: FnOnce(&Config) -> Result<Vec<Endpoint>>,
{
    let args = PluginArgs::parse();
    init_tracing(&args.log_level);
    execute(args, capabilities, build, std::io::stdout()).await
}

/// Like [`run`] with explicit arguments and output.
pub async fn execute<F, W>(
    args: PluginArgs,
    capabilities: Capabilities,
    build: F,
    mut out: W,
) -> Result<ExitCode>
where
    F: FnOnce(&Config) -> Result<Vec<Endpoint>>,
    W: Write,
{
    if args.command == Some(PluginCommand::Capabilities) {
        serde_json::to_writer(&mut out, &capabilities).context("failed to encode capabilities")?;
        writeln!(out)?;
        out.flush()?;
        return Ok(ExitCode::SUCCESS);
    }

    let raw = args
        .config
        .context("missing --config; plugins are started by an outrig host")?;
    let config = Config::from_json(&raw).context("failed to parse --config")?;
    config.validate()?;

    let endpoints = build(&config)?;
    let mut plugin = Plugin::new(config);
    plugin.register_endpoints(endpoints)?;

    let outcome = plugin.start_with_output(out).await?;
    Ok(if outcome.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Installs a stderr subscriber; `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use outrig_core::config::TypeInfo;

    use super::*;

    fn capabilities() -> Capabilities {
        Capabilities::default().with_type(
            "dataProcessor",
            TypeInfo {
                type_name: "external".into(),
                json_schema: b"{}".to_vec(),
            },
        )
    }

    #[test]
    fn parses_host_invocations() {
        let query = PluginArgs::try_parse_from(["plugin", "capabilities"]).unwrap();
        assert_eq!(query.command, Some(PluginCommand::Capabilities));

        let serve = PluginArgs::try_parse_from(["plugin", "--config", r#"{"id":"a","type":"tcp"}"#]).unwrap();
        assert_eq!(serve.command, None);
        assert_eq!(serve.config.as_deref(), Some(r#"{"id":"a","type":"tcp"}"#));
    }

    #[tokio::test]
    async fn capabilities_query_prints_the_document() {
        let args = PluginArgs::try_parse_from(["plugin", "capabilities"]).unwrap();
        let mut out = Vec::new();
        execute(args, capabilities(), |_| Ok(Vec::new()), &mut out)
            .await
            .unwrap();

        let printed: Capabilities = serde_json::from_slice(&out).unwrap();
        assert_eq!(printed, capabilities());
        assert!(out.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn serving_requires_a_valid_config() {
        let args = PluginArgs::try_parse_from(["plugin"]).unwrap();
        assert!(execute(args, capabilities(), |_| Ok(Vec::new()), Vec::new())
            .await
            .is_err());

        let args = PluginArgs::try_parse_from(["plugin", "--config", r#"{"id":"../x","type":"tcp"}"#]).unwrap();
        let err = execute(args, capabilities(), |_| Ok(Vec::new()), Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path separators"), "{err}");
    }
}
