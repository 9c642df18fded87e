//! Fallback sweeps run after the tracked handles have been signalled.
//!
//! Each sweep is best-effort. The supervisor's own PID is never a candidate.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Ordered strategies tried during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStrategy {
    /// Signal the tracked process group, escalating after the grace period.
    ProcessGroup,
    /// Scan the process table for the role's command line.
    CommandPattern,
    /// Signal whatever still holds the supervised port.
    PortBinding,
}

impl TerminationStrategy {
    pub const ORDER: [TerminationStrategy; 3] = [
        TerminationStrategy::ProcessGroup,
        TerminationStrategy::CommandPattern,
        TerminationStrategy::PortBinding,
    ];
}

/// PIDs whose command line mentions both `program` and `signature`.
pub(crate) async fn pids_matching_command(program: &str, signature: &str) -> Vec<u32> {
    let program = program.to_string();
    let signature = signature.to_string();
    tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own = std::process::id();

        let mut pids: Vec<u32> = sys
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own)
            .filter(|(_, proc_)| {
                let cmd: Vec<String> = proc_
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                command_matches(&cmd, &program, &signature)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    })
    .await
    .unwrap_or_default()
}

fn command_matches(cmd: &[String], program: &str, signature: &str) -> bool {
    if cmd.is_empty() || program.is_empty() || signature.is_empty() {
        return false;
    }
    let has_program = cmd.iter().any(|a| {
        a == program || std::path::Path::new(a).file_name().and_then(|n| n.to_str()) == Some(program)
    });
    let has_signature = cmd.iter().any(|a| a.split_whitespace().any(|w| w == signature) || a == signature);
    has_program && has_signature
}

/// PIDs listening on or connected through `port`, via `lsof`, then `fuser`.
pub(crate) async fn pids_on_port(port: u16) -> Vec<u32> {
    let own = std::process::id();
    let lsof = tokio::process::Command::new("lsof")
        .args(["-t", "-i", &format!("tcp:{port}"), "-s", "TCP:LISTEN"])
        .output()
        .await;
    let text = match lsof {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        _ => {
            let fuser = tokio::process::Command::new("fuser")
                .arg(format!("{port}/tcp"))
                .output()
                .await;
            match fuser {
                // fuser prints PIDs on stdout and the port label on stderr.
                Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
                Err(_) => String::new(),
            }
        }
    };
    parse_pid_list(&text)
        .into_iter()
        .filter(|pid| *pid != own)
        .collect()
}

fn parse_pid_list(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text
        .split_whitespace()
        .filter_map(|tok| tok.trim_end_matches(|c: char| c.is_ascii_alphabetic()).parse().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Send `sig`; a missing process counts as success.
pub(crate) fn send(pid: u32, sig: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(e) => {
            tracing::debug!(pid, "failed to send {sig}: {e}");
            false
        }
    }
}

fn alive(pid: u32) -> bool {
    i32::try_from(pid)
        .map(|raw| signal::kill(Pid::from_raw(raw), None).is_ok())
        .unwrap_or(false)
}

/// SIGTERM each PID, then SIGKILL whatever survives `grace`. Returns the PIDs signalled.
pub(crate) async fn terminate_pids(pids: &[u32], grace: Duration) -> Vec<u32> {
    let signalled: Vec<u32> = pids
        .iter()
        .copied()
        .filter(|pid| alive(*pid) && send(*pid, Signal::SIGTERM))
        .collect();
    if signalled.is_empty() {
        return signalled;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline && signalled.iter().any(|p| alive(*p)) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for pid in signalled.iter().copied().filter(|p| alive(*p)) {
        tracing::warn!(pid, "still alive after SIGTERM, sending SIGKILL");
        send(pid, Signal::SIGKILL);
    }
    signalled
}
