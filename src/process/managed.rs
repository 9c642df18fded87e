use crate::config::Configuration;
use crate::model::{ProcessState, Role};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{role}: launch command is empty")]
    EmptyCommand { role: Role },
    #[error("{role}: failed to open log file {}: {source}", path.display())]
    LogFile {
        role: Role,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{role}: failed to spawn `{program}` (see {}): {source}", log.display())]
    Spawn {
        role: Role,
        program: String,
        log: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How to start one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub role: Role,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub log_path: PathBuf,
    /// Argument that identifies this process in a command-line scan.
    pub signature: String,
}

impl LaunchSpec {
    /// Serving process: `<command...> <model> --host H --port P [--trust-remote-code] <mode args>`.
    pub fn serving(cfg: &Configuration) -> Self {
        let (program, prefix) = split_command(&cfg.server.command);
        let mut args = prefix;
        args.push(cfg.active_model().to_string());
        args.extend([
            "--host".to_string(),
            cfg.server.host.clone(),
            "--port".to_string(),
            cfg.server.port.to_string(),
        ]);
        if cfg.server.trust_remote_code {
            args.push("--trust-remote-code".to_string());
        }
        args.extend(cfg.active_args().iter().cloned());

        let cache = cfg.paths.cache_dir.display().to_string();
        Self {
            role: Role::Serving,
            program,
            args,
            env: vec![
                ("HF_HOME".to_string(), cache.clone()),
                ("TRANSFORMERS_CACHE".to_string(), cache),
            ],
            log_path: cfg.log_path(Role::Serving.log_file_name()),
            signature: cfg.active_model().to_string(),
        }
    }

    /// Tunnel process: `<command...> <local addr> --log stdout [--url domain]`.
    pub fn tunnel(cfg: &Configuration) -> Self {
        let (program, prefix) = split_command(&cfg.tunnel.command);
        let forward = forward_addr(cfg);
        let mut args = prefix;
        args.push(forward.clone());
        args.extend([
            "--log".to_string(),
            "stdout".to_string(),
            "--log-format".to_string(),
            "logfmt".to_string(),
        ]);
        if let Some(domain) = cfg.tunnel.domain.as_deref() {
            args.extend(["--url".to_string(), domain.to_string()]);
        }

        Self {
            role: Role::Tunnel,
            program,
            args,
            env: vec![(
                "NGROK_AUTHTOKEN".to_string(),
                cfg.tunnel.authtoken.expose().to_string(),
            )],
            log_path: cfg.log_path(Role::Tunnel.log_file_name()),
            signature: forward,
        }
    }

    /// Shell-like rendering of the command line, for logs and `--check`.
    pub fn display_command(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| {
                if a.is_empty() || a.contains(char::is_whitespace) {
                    format!("'{a}'")
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Base name of the program, as it appears in a process table.
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

fn split_command(command: &[String]) -> (String, Vec<String>) {
    match command.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    }
}

/// Address the tunnel forwards to; wildcard binds are reached over loopback.
fn forward_addr(cfg: &Configuration) -> String {
    cfg.local_base_url().trim_start_matches("http://").to_string()
}

/// Result of a termination attempt on a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotStarted,
    /// Already in a terminal state before this call; nothing was sent.
    AlreadyGone,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// One supervised OS process.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: LaunchSpec,
    child: Option<Child>,
    pid: Option<u32>,
    state: ProcessState,
}

impl ManagedProcess {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            state: ProcessState::NotStarted,
        }
    }

    /// Launch `spec` with output appended to its log file.
    pub fn start(spec: LaunchSpec) -> Result<Self, LaunchError> {
        let mut process = Self::new(spec);
        process.launch()?;
        Ok(process)
    }

    fn launch(&mut self) -> Result<(), LaunchError> {
        let role = self.spec.role;
        if self.spec.program.trim().is_empty() {
            return Err(LaunchError::EmptyCommand { role });
        }
        let log_path = self.spec.log_path.clone();
        let log_err = |source: std::io::Error| LaunchError::LogFile {
            role,
            path: log_path.clone(),
            source,
        };

        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).map_err(log_err)?;
        }
        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(log_err)?;
        let stamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());
        writeln!(
            log_file,
            "=== {stamp} starting {role}: {} ===",
            self.spec.display_command()
        )
        .map_err(log_err)?;
        let stdout = log_file.try_clone().map_err(log_err)?;

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(log_file)
            .kill_on_drop(false);
        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            role,
            program: self.spec.program.clone(),
            log: log_path.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::info!(
            role = %role,
            pid = pid.unwrap_or_default(),
            log = %log_path.display(),
            "Started {}",
            self.spec.display_command()
        );

        self.pid = pid;
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        &self.spec.log_path
    }

    /// Non-blocking liveness check; records the exit if the process is gone.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcessState::Running {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.state = ProcessState::Exited(status.code());
                false
            }
            Err(_) => false,
        }
    }

    /// Send `sig` to the process group if the process is still alive.
    ///
    /// Returns whether a signal was delivered. A process that is already gone
    /// is not an error.
    pub fn signal(&mut self, sig: Signal) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(raw) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return false;
        };
        let pid = Pid::from_raw(raw);
        match signal::killpg(pid, sig).or_else(|_| signal::kill(pid, sig)) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                tracing::warn!(role = %self.spec.role, pid = raw, "failed to send {sig}: {e}");
                false
            }
        }
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// Cancel-safe; returns immediately once the process has been reaped.
    pub async fn wait(&mut self) -> Option<i32> {
        match self.state {
            ProcessState::Exited(code) => return code,
            ProcessState::Killed | ProcessState::NotStarted => return None,
            ProcessState::Running => {}
        }
        let Some(child) = self.child.as_mut() else {
            return None;
        };
        match child.wait().await {
            Ok(status) => {
                self.state = ProcessState::Exited(status.code());
                status.code()
            }
            Err(e) => {
                tracing::warn!(role = %self.spec.role, "failed to wait for process: {e}");
                self.state = ProcessState::Exited(None);
                None
            }
        }
    }

    /// SIGTERM the process group, escalate to SIGKILL after `grace`.
    ///
    /// Idempotent: a process already in a terminal state is left alone.
    pub async fn terminate(&mut self, grace: Duration) -> KillOutcome {
        if self.state == ProcessState::NotStarted {
            return KillOutcome::NotStarted;
        }
        if !self.signal(Signal::SIGTERM) {
            return KillOutcome::AlreadyGone;
        }
        let outcome = match tokio::time::timeout(grace, self.wait()).await {
            Ok(_) => KillOutcome::Terminated,
            Err(_) => {
                tracing::warn!(
                    role = %self.spec.role,
                    pid = self.pid.unwrap_or_default(),
                    "did not exit within {}, sending SIGKILL",
                    humantime::format_duration(grace)
                );
                self.signal(Signal::SIGKILL);
                self.wait().await;
                KillOutcome::Killed
            }
        };
        self.state = ProcessState::Killed;
        outcome
    }
}
