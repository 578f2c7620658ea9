use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    process::{Child, Command},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::config::PluginDescriptor;

/// Characters trimmed from filesystem-derived paths before they reach a command line.
pub const DISALLOWED_PATH_CHARS: &[char] =
    &[',', ';', ':', '\'', '"', '|', '&', '*', '!', '@', '#', '$'];

pub fn clean_path(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().trim_matches(DISALLOWED_PATH_CHARS))
}

/// One-shot `<plugin> capabilities` invocation; stderr goes straight to ours.
pub(crate) fn capabilities_command(path: &Path) -> Command {
    let mut command = Command::new(clean_path(path));
    command
        .arg("capabilities")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command
}

/// Long-running `<plugin> --config <json>` invocation with both streams piped.
pub(crate) fn serve_command(descriptor: &PluginDescriptor) -> Result<Command, serde_json::Error> {
    let config = descriptor.config.to_json()?;
    let mut command = Command::new(clean_path(&descriptor.path));
    command
        .arg("--config")
        .arg(config)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(command)
}

/// Relays free-form plugin output into our logs, line by line.
pub(crate) fn forward_output<R>(plugin: String, stream: &'static str, reader: R)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(plugin = %plugin, stream, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(plugin = %plugin, stream, error = %err, "stopped reading plugin output");
                    break;
                }
            }
        }
    });
}

/// Owns the child until it exits. Cancellation is a hard kill, not a signal.
pub(crate) fn supervise(
    mut child: Child,
    plugin: String,
    cancel: CancellationToken,
) -> watch::Receiver<Option<ExitStatus>> {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                tracing::info!(plugin = %plugin, "killing plugin process because the parent context is cancelled");
                if let Err(err) = child.kill().await {
                    tracing::warn!(plugin = %plugin, error = %err, "failed to kill plugin process");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => {
                tracing::info!(plugin = %plugin, %status, "plugin process exited");
                tx.send_replace(Some(status));
            }
            Err(err) => tracing::warn!(plugin = %plugin, error = %err, "failed to wait for plugin process"),
        }
    });
    rx
}

/// Kills a child that never became usable and reaps it in the background.
pub(crate) fn discard(mut child: Child, plugin: &str) {
    if let Err(err) = child.start_kill() {
        tracing::debug!(plugin, error = %err, "discarded plugin was already gone");
    }
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

#[cfg(unix)]
pub(crate) fn interrupt(pid: u32) -> Result<(), String> {
    use nix::{sys::signal, unistd::Pid};

    let pid = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    signal::kill(Pid::from_raw(pid), signal::Signal::SIGINT).map_err(|errno| errno.to_string())
}

#[cfg(not(unix))]
pub(crate) fn interrupt(_pid: u32) -> Result<(), String> {
    Err("interrupt signals are not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_trims_shell_metacharacters() {
        assert_eq!(
            clean_path(Path::new("\"/opt/plugins/echo;\"")),
            PathBuf::from("/opt/plugins/echo")
        );
        assert_eq!(
            clean_path(Path::new("$!/opt/plugins/echo|&")),
            PathBuf::from("/opt/plugins/echo")
        );
        assert_eq!(clean_path(Path::new("plain")), PathBuf::from("plain"));
    }
}
