//! Ordered teardown of the supervised processes.
//!
//! The tunnel goes first so no new public traffic reaches a dying server.
//! Each process is signalled through its tracked group, then the fallback
//! sweeps catch anything that escaped the group.

use super::controller::Registry;
use crate::config::Configuration;
use crate::model::Role;
use crate::process::termination;
use crate::process::{KillOutcome, LaunchSpec, TerminationStrategy};

/// Shutdown order over roles.
pub(crate) const ROLE_ORDER: [Role; 2] = [Role::Tunnel, Role::Serving];

/// Run every enabled termination strategy in order.
pub(crate) async fn terminate_all(cfg: &Configuration, registry: &mut Registry) {
    let grace = cfg.shutdown.grace_period;

    for strategy in TerminationStrategy::ORDER {
        match strategy {
            TerminationStrategy::ProcessGroup => {
                for role in ROLE_ORDER {
                    let Some(process) = registry.get_mut(&role) else {
                        continue;
                    };
                    let outcome = process.terminate(grace).await;
                    match outcome {
                        KillOutcome::NotStarted => {}
                        KillOutcome::AlreadyGone => {
                            tracing::info!(role = %role, "{role} process already exited")
                        }
                        KillOutcome::Terminated => tracing::info!(role = %role, "{role} process stopped"),
                        KillOutcome::Killed => {
                            tracing::warn!(role = %role, "{role} process killed after grace period")
                        }
                    }
                }
            }
            TerminationStrategy::CommandPattern if cfg.shutdown.sweep_patterns => {
                for role in ROLE_ORDER {
                    let spec = match (registry.get(&role), role) {
                        (Some(process), _) => process.spec().clone(),
                        (None, Role::Serving) => LaunchSpec::serving(cfg),
                        (None, Role::Tunnel) => LaunchSpec::tunnel(cfg),
                    };
                    let pids =
                        termination::pids_matching_command(spec.program_name(), &spec.signature).await;
                    if pids.is_empty() {
                        continue;
                    }
                    let hit = termination::terminate_pids(&pids, grace).await;
                    tracing::warn!(role = %role, pids = ?hit, "terminated stray {role} processes");
                }
            }
            TerminationStrategy::PortBinding if cfg.shutdown.sweep_port => {
                let pids = termination::pids_on_port(cfg.server.port).await;
                if pids.is_empty() {
                    continue;
                }
                let hit = termination::terminate_pids(&pids, grace).await;
                tracing::warn!(port = cfg.server.port, pids = ?hit, "terminated processes holding the serving port");
            }
            TerminationStrategy::CommandPattern | TerminationStrategy::PortBinding => {
                tracing::debug!(?strategy, "sweep disabled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::logging::init_test_logging;
    use crate::model::ProcessState;
    use crate::process::ManagedProcess;
    use std::time::Duration;

    const IDLE: &str = "sleep 30; true";

    fn cfg(dir: &std::path::Path, model: &str, sweep_patterns: bool) -> Configuration {
        cfg_with(dir, model, sweep_patterns, IDLE, IDLE)
    }

    fn cfg_with(
        dir: &std::path::Path,
        model: &str,
        sweep_patterns: bool,
        serving_script: &str,
        tunnel_script: &str,
    ) -> Configuration {
        let text = format!(
            r#"
            [model]
            primary = "{model}"
            test = "{model}-test"

            [server]
            command = ["sh", "-c", "{serving_script}"]
            host = "127.0.0.1"
            port = 1

            [tunnel]
            command = ["sh", "-c", "{tunnel_script}"]
            authtoken = "tok"
            label = "sweep"

            [paths]
            cache_dir = "{cache}"
            log_dir = "{logs}"

            [shutdown]
            grace_period = "2s"
            sweep_port = false
            sweep_patterns = {sweep_patterns}
            "#,
            cache = dir.join("cache").display(),
            logs = dir.join("logs").display(),
        );
        config::parse(&text).unwrap()
    }

    #[tokio::test]
    async fn tracked_processes_are_stopped_tunnel_first() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let order = dir.path().join("order");
        // Each stub records its role when it receives SIGTERM.
        let script = |role: &str| {
            format!(
                "trap 'echo {role} >> {}; exit 0' TERM; while true; do sleep 0.1; done",
                order.display()
            )
        };
        let cfg = cfg_with(
            dir.path(),
            "shutdown-order-model",
            false,
            &script("serving"),
            &script("tunnel"),
        );
        let mut registry = Registry::new();
        for spec in [LaunchSpec::serving(&cfg), LaunchSpec::tunnel(&cfg)] {
            let role = spec.role;
            registry.insert(role, ManagedProcess::start(spec).unwrap());
        }
        // Let both shells install their traps.
        tokio::time::sleep(Duration::from_millis(300)).await;

        terminate_all(&cfg, &mut registry).await;
        for process in registry.values() {
            assert_eq!(process.state(), ProcessState::Killed);
        }
        assert_eq!(std::fs::read_to_string(&order).unwrap(), "tunnel\nserving\n");

        // A second pass has nothing left to do.
        terminate_all(&cfg, &mut registry).await;
    }

    #[tokio::test]
    async fn pattern_sweep_catches_untracked_process() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path(), "orphaned-model-5d2e", true);

        // Launched outside the registry, as a leftover from a crashed run would be.
        let spec = LaunchSpec::serving(&cfg);
        let mut orphan = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut registry = Registry::new();
        terminate_all(&cfg, &mut registry).await;

        let status = tokio::time::timeout(Duration::from_secs(5), orphan.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
