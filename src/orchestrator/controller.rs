//! Supervisor lifecycle controller.
//!
//! Runs startup strictly in order (serving, readiness, tunnel, discovery,
//! keep-alive), then blocks until the first of {serving exit, tunnel exit,
//! termination signal}, then tears the process tree down.

use super::shutdown;
use crate::config::{Configuration, ExitPolicy};
use crate::engine::discovery::{self, Discovered, DiscoveryParams};
use crate::engine::keepalive::KeepAliveScheduler;
use crate::engine::readiness::{self, ReadinessParams};
use crate::engine::http_client;
use crate::model::{
    EndpointSummary, Outcome, Phase, ProcessState, Readiness, Role, StopReason, SupervisorEvent,
};
use crate::process::{LaunchSpec, ManagedProcess};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Lines of the serving log echoed when startup fails.
const LOG_TAIL_LINES: usize = 20;

/// Role-indexed registry of supervised processes.
pub(crate) type Registry = BTreeMap<Role, ManagedProcess>;

/// Process-wide root: owns every managed process and the keep-alive task.
pub struct Supervisor {
    cfg: Arc<Configuration>,
    registry: Registry,
    events: Option<UnboundedSender<SupervisorEvent>>,
    phase: Phase,
    endpoint: Option<String>,
    stopped: bool,
}

impl Supervisor {
    pub fn new(cfg: Configuration, events: Option<UnboundedSender<SupervisorEvent>>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            registry: Registry::new(),
            events,
            phase: Phase::Configuring,
            endpoint: None,
            stopped: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Public URL, valid only while the tunnel is running.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn process_state(&self, role: Role) -> ProcessState {
        self.registry
            .get(&role)
            .map_or(ProcessState::NotStarted, ManagedProcess::state)
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
        self.emit(SupervisorEvent::PhaseStarted { phase });
    }

    /// Drive the whole run. `terminate` resolves on an external termination request.
    pub async fn run<F>(mut self, terminate: F) -> Outcome
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(terminate);

        let started = tokio::select! {
            r = self.start_up() => r,
            () = &mut terminate => Err("termination requested during startup".to_string()),
        };

        let outcome = match started {
            Ok(()) => {
                let reason = self.wait_running(terminate).await;
                match &reason {
                    StopReason::Signal => tracing::info!("{reason}, shutting down"),
                    StopReason::ProcessExited { .. } => tracing::error!("{reason}, shutting down"),
                }
                Outcome::Graceful(reason)
            }
            Err(reason) => {
                tracing::error!("startup aborted: {reason}");
                Outcome::Failed(reason)
            }
        };

        self.shutdown().await;
        outcome
    }

    async fn start_up(&mut self) -> Result<(), String> {
        let cfg = self.cfg.clone();

        self.enter(Phase::StartingServing);
        let serving_spec = LaunchSpec::serving(&cfg);
        let serving_log = serving_spec.log_path.clone();
        self.launch(serving_spec).await?;

        self.enter(Phase::ReadinessCheck);
        tracing::info!(
            bind = %cfg.bind_addr(),
            "waiting up to {} for {}",
            humantime::format_duration(cfg.readiness.budget()),
            cfg.health_url()
        );
        match self.await_readiness(&cfg).await? {
            Readiness::Ready { elapsed, attempts } => tracing::info!(
                attempts,
                "serving process ready after {}",
                humantime::format_duration(round_secs(elapsed))
            ),
            Readiness::NotReady {
                elapsed,
                attempts,
                last_error,
            } => {
                let why = format!(
                    "serving process not ready at {} after {} ({attempts} probes, last error: {}); inspect {}",
                    cfg.health_url(),
                    humantime::format_duration(round_secs(elapsed)),
                    last_error.as_deref().unwrap_or("none"),
                    serving_log.display()
                );
                log_tail(&serving_log).await;
                return Err(why);
            }
        }

        self.enter(Phase::StartingTunnel);
        self.launch(LaunchSpec::tunnel(&cfg)).await?;

        self.enter(Phase::Discovering);
        let discovered = self.await_discovery(&cfg).await?;
        // A URL scraped from a dead tunnel's log must not be published.
        self.ensure_alive()?;
        self.publish_endpoint(&cfg, discovered);

        if cfg.keep_alive.enabled {
            self.enter(Phase::StartingKeepAlive);
            self.start_keep_alive(&cfg);
        }

        self.enter(Phase::Running);
        tracing::info!(label = %cfg.tunnel.label, "deployment running");
        Ok(())
    }

    async fn launch(&mut self, spec: LaunchSpec) -> Result<(), String> {
        let role = spec.role;
        let log = spec.log_path.clone();
        match ManagedProcess::start(spec) {
            Ok(process) => {
                if let Some(pid) = process.pid() {
                    self.emit(SupervisorEvent::ProcessStarted { role, pid });
                }
                self.registry.insert(role, process);
                Ok(())
            }
            Err(e) => {
                tracing::error!(role = %role, log = %log.display(), "{e}");
                if role == Role::Serving {
                    log_tail(&log).await;
                }
                Err(e.to_string())
            }
        }
    }

    /// Readiness wait raced against the serving process exiting early.
    async fn await_readiness(&mut self, cfg: &Configuration) -> Result<Readiness, String> {
        let client = http_client(cfg.readiness.probe_timeout)
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        let url = cfg.health_url();
        let Some(serving) = self.registry.get_mut(&Role::Serving) else {
            return Err("serving process is not registered".into());
        };
        let log = serving.log_path().to_path_buf();

        tokio::select! {
            r = readiness::wait_ready(ReadinessParams {
                client: &client,
                url: &url,
                initial_delay: cfg.readiness.initial_delay,
                window: cfg.readiness.window,
                poll_interval: cfg.readiness.poll_interval,
                probe_timeout: cfg.readiness.probe_timeout,
            }) => Ok(r),
            code = serving.wait() => {
                log_tail(&log).await;
                Err(format!(
                    "serving process exited during readiness check ({}); inspect {}",
                    describe_exit(code),
                    log.display()
                ))
            }
        }
    }

    /// Discovery raced against the tunnel process exiting early.
    async fn await_discovery(
        &mut self,
        cfg: &Configuration,
    ) -> Result<Result<Discovered, String>, String> {
        let Some(tunnel) = self.registry.get_mut(&Role::Tunnel) else {
            return Err("tunnel process is not registered".into());
        };
        let log = tunnel.log_path().to_path_buf();

        tokio::select! {
            r = discover_public_url(cfg, &log) => Ok(r),
            code = tunnel.wait() => Err(format!(
                "tunnel process exited during discovery ({}); inspect {}",
                describe_exit(code),
                log.display()
            )),
        }
    }

    /// Fails if any launched process is no longer running.
    fn ensure_alive(&mut self) -> Result<(), String> {
        for (role, process) in self.registry.iter_mut() {
            if !process.is_alive() {
                return Err(format!(
                    "{role} process exited during startup ({}); inspect {}",
                    describe_state(process.state()),
                    process.log_path().display()
                ));
            }
        }
        Ok(())
    }

    fn publish_endpoint(&mut self, cfg: &Configuration, discovered: Result<Discovered, String>) {
        let tunnel_log = cfg.log_path(Role::Tunnel.log_file_name());
        match discovered {
            Ok(found) => {
                tracing::info!(url = %found.url, source = ?found.source, "public endpoint discovered");
                self.endpoint = Some(found.url);
            }
            Err(e) => {
                tracing::error!(log = %tunnel_log.display(), "{e}");
                self.emit(SupervisorEvent::Info(format!(
                    "Public URL unknown; the model is still served locally. Inspect {}",
                    tunnel_log.display()
                )));
            }
        }

        let summary = EndpointSummary {
            label: cfg.tunnel.label.clone(),
            public_url: self.endpoint.clone(),
            local_url: cfg.local_base_url(),
            chat_path: cfg.server.chat_path.clone(),
            model: cfg.active_model().to_string(),
            started_at: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
        };
        self.emit(SupervisorEvent::EndpointDiscovered(Box::new(summary)));
    }

    /// Spawn the keep-alive task; it is never joined and dies with the process.
    fn start_keep_alive(&self, cfg: &Configuration) {
        let base = match (&cfg.keep_alive.endpoint, &self.endpoint) {
            (Some(fixed), _) => fixed.clone(),
            (None, Some(public)) => public.clone(),
            (None, None) => {
                tracing::warn!("no public endpoint known, keep-alive targets the local server");
                cfg.local_base_url()
            }
        };
        match KeepAliveScheduler::new(
            &cfg.keep_alive,
            &base,
            &cfg.server.chat_path,
            cfg.active_model(),
        ) {
            Ok(scheduler) => {
                tracing::info!(url = %scheduler.url(), "keep-alive started");
                drop(scheduler.spawn());
            }
            Err(e) => tracing::warn!("keep-alive disabled, failed to build HTTP client: {e}"),
        }
    }

    /// Block until the first member exit (subject to the exit policy) or `terminate`.
    async fn wait_running<F>(&mut self, mut terminate: std::pin::Pin<&mut F>) -> StopReason
    where
        F: Future<Output = ()>,
    {
        let policy = self.cfg.shutdown.exit_policy;
        let mut watch_tunnel = true;

        loop {
            let mut serving = None;
            let mut tunnel = None;
            for (role, process) in self.registry.iter_mut() {
                match role {
                    Role::Serving => serving = Some(process),
                    Role::Tunnel if watch_tunnel => tunnel = Some(process),
                    Role::Tunnel => {}
                }
            }

            let (role, code) = tokio::select! {
                code = wait_or_pending(serving) => (Role::Serving, code),
                code = wait_or_pending(tunnel) => (Role::Tunnel, code),
                () = &mut terminate => return StopReason::Signal,
            };

            if role == Role::Tunnel {
                if policy == ExitPolicy::Serving {
                    tracing::warn!(
                        log = %self.cfg.log_path(Role::Tunnel.log_file_name()).display(),
                        "tunnel process exited ({}), public endpoint {} invalidated; serving continues",
                        describe_exit(code),
                        self.endpoint().unwrap_or("(unknown)")
                    );
                    self.endpoint = None;
                    watch_tunnel = false;
                    continue;
                }
                self.endpoint = None;
            }
            return StopReason::ProcessExited { role, code };
        }
    }

    /// Ordered, idempotent teardown. A second call is a no-op.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            tracing::debug!("shutdown already completed");
            return;
        }
        self.enter(Phase::ShuttingDown);
        self.endpoint = None;
        shutdown::terminate_all(&self.cfg, &mut self.registry).await;
        tracing::debug!(
            from = ?self.phase(),
            serving = ?self.process_state(Role::Serving),
            tunnel = ?self.process_state(Role::Tunnel),
            "teardown complete"
        );
        self.stopped = true;
        self.enter(Phase::Stopped);
        tracing::info!("stopped");
    }
}

async fn discover_public_url(cfg: &Configuration, tunnel_log: &Path) -> Result<Discovered, String> {
    let local_addr = cfg.local_base_url().trim_start_matches("http://").to_string();
    let client = http_client(cfg.discovery.request_timeout)
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;
    discovery::discover(DiscoveryParams {
        client: &client,
        admin_api: &cfg.tunnel.admin_api,
        log_path: tunnel_log,
        local_addr: &local_addr,
        url_pattern: &cfg.tunnel.url_pattern,
        settle_delay: cfg.discovery.settle_delay,
    })
    .await
    .map_err(|e| e.to_string())
}

async fn wait_or_pending(process: Option<&mut ManagedProcess>) -> Option<i32> {
    match process {
        Some(p) => p.wait().await,
        None => futures::future::pending().await,
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

fn describe_state(state: ProcessState) -> String {
    match state {
        ProcessState::Exited(code) => describe_exit(code),
        other => format!("{other:?}"),
    }
}

fn round_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs())
}

/// Echo the end of a log file into the deployment log.
async fn log_tail(path: &Path) {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return;
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    tracing::error!("last {} lines of {}:", lines.len() - start, path.display());
    for line in &lines[start..] {
        tracing::error!("  | {line}");
    }
}
