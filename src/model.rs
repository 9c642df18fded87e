use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Supervised roles. Exactly one managed process exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Serving,
    Tunnel,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Serving => "serving",
            Role::Tunnel => "tunnel",
        }
    }

    /// File name of the role's output log under the log directory.
    pub fn log_file_name(self) -> &'static str {
        match self {
            Role::Serving => "serving.log",
            Role::Tunnel => "tunnel.log",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one supervised OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(Option<i32>),
    Killed,
}

/// Supervisor state machine over the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Configuring,
    StartingServing,
    ReadinessCheck,
    StartingTunnel,
    Discovering,
    StartingKeepAlive,
    Running,
    ShuttingDown,
    Stopped,
}

/// Result of waiting for the serving process to answer health probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready {
        elapsed: Duration,
        attempts: u32,
    },
    NotReady {
        elapsed: Duration,
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Why the supervisor left the `Running` phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ProcessExited { role: Role, code: Option<i32> },
    Signal,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ProcessExited { role, code: Some(code) } => {
                write!(f, "{role} process exited with code {code}")
            }
            StopReason::ProcessExited { role, code: None } => {
                write!(f, "{role} process was terminated by a signal")
            }
            StopReason::Signal => f.write_str("termination signal received"),
        }
    }
}

/// Final verdict of a supervisor run, mapped to the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Reached `Running` and shut down afterwards.
    Graceful(StopReason),
    /// A fatal startup condition aborted the run.
    Failed(String),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Graceful(_) => 0,
            Outcome::Failed(_) => 1,
        }
    }
}

/// Events emitted by the supervisor and consumed by the CLI layer.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    PhaseStarted { phase: Phase },
    ProcessStarted { role: Role, pid: u32 },
    EndpointDiscovered(Box<EndpointSummary>),
    Info(String),
}

/// Everything the operator needs to call the deployed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSummary {
    pub label: String,
    pub public_url: Option<String>,
    pub local_url: String,
    pub chat_path: String,
    pub model: String,
    pub started_at: String,
}
