use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use outrig_core::config::Config;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    endpoint::{Endpoint, Router},
    server,
    work::WorkTracker,
};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of the runtime. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Starting,
    Ready,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    Endpoint,
    Idle,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean { reason: ShutdownReason },
    /// The grace period expired with work still in flight.
    Forced {
        reason: ShutdownReason,
        in_flight: usize,
    },
}

impl ShutdownOutcome {
    pub fn reason(&self) -> ShutdownReason {
        match self {
            ShutdownOutcome::Clean { reason } | ShutdownOutcome::Forced { reason, .. } => *reason,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ShutdownOutcome::Clean { .. })
    }
}

pub(crate) struct RuntimeState {
    pub router: Router,
    pub tracker: Arc<WorkTracker>,
    control: Arc<Control>,
}

impl RuntimeState {
    pub fn phase(&self) -> Phase {
        *self.control.phase.borrow()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        self.control.trigger(reason);
    }
}

struct Control {
    phase: watch::Sender<Phase>,
    reason: OnceLock<ShutdownReason>,
    requested: CancellationToken,
}

impl Control {
    /// First trigger wins; later ones are no-ops.
    fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(?reason, "shutdown requested");
            self.requested.cancel();
        }
    }

    fn advance(&self, next: Phase) {
        self.phase.send_if_modified(|phase| {
            if next > *phase {
                *phase = next;
                true
            } else {
                false
            }
        });
    }
}

/// Cloneable view of a running plugin: phase, work counter and manual shutdown.
#[derive(Clone)]
pub struct PluginHandle {
    control: Arc<Control>,
    tracker: Arc<WorkTracker>,
}

impl PluginHandle {
    pub fn phase(&self) -> Phase {
        *self.control.phase.borrow()
    }

    pub fn tracker(&self) -> &Arc<WorkTracker> {
        &self.tracker
    }

    pub fn shutdown(&self) {
        self.control.trigger(ShutdownReason::Manual);
    }

    pub async fn wait_for_phase(&self, phase: Phase) {
        let mut rx = self.control.phase.subscribe();
        let _ = rx.wait_for(|current| *current >= phase).await;
    }
}

/// Guest-side runtime: serves endpoints until a signal, `/shutdown` or idle expiry.
pub struct Plugin {
    config: Config,
    router: Router,
    grace_period: Duration,
    socket_dir: PathBuf,
    tracker: Arc<WorkTracker>,
    control: Arc<Control>,
    handle_signals: bool,
}

impl Plugin {
    pub fn new(config: Config) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            config,
            router: Router::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            socket_dir: std::env::temp_dir(),
            tracker: Arc::new(WorkTracker::new()),
            control: Arc::new(Control {
                phase,
                reason: OnceLock::new(),
                requested: CancellationToken::new(),
            }),
            handle_signals: true,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Skips installing SIGINT/SIGTERM handlers, for embedding in a larger process.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn register_endpoint(&mut self, endpoint: Endpoint) -> Result<&mut Self> {
        self.router.insert(endpoint)?;
        Ok(self)
    }

    pub fn register_endpoints(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Result<&mut Self> {
        for endpoint in endpoints {
            self.router.insert(endpoint)?;
        }
        Ok(self)
    }

    pub fn handle(&self) -> PluginHandle {
        PluginHandle {
            control: self.control.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Serves until shutdown, announcing the location on stdout.
    pub async fn start(self) -> Result<ShutdownOutcome> {
        self.start_with_output(std::io::stdout()).await
    }

    /// Serves until shutdown, announcing the location as the first line of `out`.
    pub async fn start_with_output<W: Write>(self, mut out: W) -> Result<ShutdownOutcome> {
        self.config.validate()?;
        let bound = server::bind(&self.config, &self.socket_dir).await?;
        let signal_watch = if self.handle_signals {
            Some(spawn_signal_watch(self.control.clone()).context("failed to install signal handlers")?)
        } else {
            None
        };
        writeln!(out, "{}", bound.location).context("failed to write plugin location")?;
        out.flush().context("failed to flush plugin location")?;
        drop(out);

        tracing::info!(
            plugin = %self.config.id,
            location = %bound.location,
            endpoints = self.router.len(),
            "plugin ready"
        );

        let state = Arc::new(RuntimeState {
            router: self.router,
            tracker: self.tracker.clone(),
            control: self.control.clone(),
        });
        self.control.advance(Phase::Ready);

        let stop = CancellationToken::new();
        let server_task = tokio::spawn(server::serve(bound.listener, state, stop.clone()));
        let mut watchers: Vec<JoinHandle<()>> = signal_watch.into_iter().collect();
        if let Some(timeout) = self.config.idle_timeout {
            watchers.push(spawn_idle_watch(self.tracker.clone(), self.control.clone(), timeout));
        }

        self.control.requested.cancelled().await;
        let reason = self
            .control
            .reason
            .get()
            .copied()
            .unwrap_or(ShutdownReason::Manual);
        for watcher in &watchers {
            watcher.abort();
        }

        let outcome = teardown(
            &self.control,
            &self.tracker,
            server_task,
            stop,
            self.grace_period,
            reason,
        )
        .await;
        drop(bound.lock);
        self.control.advance(Phase::Terminated);

        match outcome {
            ShutdownOutcome::Clean { .. } => {
                tracing::info!(plugin = %self.config.id, ?reason, "plugin shut down cleanly")
            }
            ShutdownOutcome::Forced { in_flight, .. } => tracing::warn!(
                plugin = %self.config.id,
                ?reason,
                in_flight,
                "grace period expired with work in flight; forcing shutdown"
            ),
        }
        Ok(outcome)
    }
}

/// Single teardown path shared by every trigger.
async fn teardown(
    control: &Control,
    tracker: &WorkTracker,
    server_task: JoinHandle<()>,
    stop: CancellationToken,
    grace_period: Duration,
    reason: ShutdownReason,
) -> ShutdownOutcome {
    control.advance(Phase::Draining);
    stop.cancel();

    let deadline = tokio::time::Instant::now() + grace_period;
    let drained = tokio::time::timeout_at(deadline, async {
        if let Err(err) = server_task.await {
            tracing::error!(error = %err, "server task failed");
        }
        while tracker.in_flight() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok();

    let in_flight = tracker.in_flight();
    if drained && in_flight == 0 {
        ShutdownOutcome::Clean { reason }
    } else {
        ShutdownOutcome::Forced { reason, in_flight }
    }
}

fn spawn_idle_watch(tracker: Arc<WorkTracker>, control: Arc<Control>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(timeout);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tracker.idle_expired(timeout, Instant::now()) {
                tracing::info!(?timeout, "idle timeout reached");
                control.trigger(ShutdownReason::Idle);
                return;
            }
        }
    })
}

/// Registers the handlers before returning so no signal is missed once the
/// location has been announced.
fn spawn_signal_watch(control: Arc<Control>) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            control.trigger(ShutdownReason::Signal);
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => control.trigger(ShutdownReason::Signal),
                Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
            }
        }))
    }
}
