use crate::config::{self, ConfigError, Configuration, CONFIG_PATH};
use crate::logging;
use crate::model::{Phase, SupervisorEvent};
use crate::orchestrator::{termination_signal, Supervisor};
use crate::process::LaunchSpec;
use crate::text_summary::build_endpoint_summary;
use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "serve-tunnel",
    version,
    about = "Serve a language model and expose it through a tunnel",
    long_about = "Reads serve-tunnel.toml from the working directory, starts the model server, \
                  waits for it to become healthy, opens a tunnel to it and keeps both running \
                  until one exits or the process is interrupted."
)]
pub struct Cli {
    /// Validate the configuration, print the launch commands and exit
    #[arg(long)]
    pub check: bool,
}

/// Run the CLI and return the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    let cfg = match config::load(Path::new(CONFIG_PATH)) {
        Ok(cfg) => cfg,
        Err(e) => {
            logging::init_stderr_logging();
            tracing::error!("{e}");
            if let ConfigError::Invalid(_) = &e {
                tracing::error!("fix these keys in {CONFIG_PATH}: {}", e.keys().join(", "));
            }
            return Ok(1);
        }
    };

    if args.check {
        for line in check_report(&cfg) {
            println!("{line}");
        }
        return Ok(0);
    }

    let files = logging::init_logging(&cfg.paths.log_dir)?;
    tracing::info!(
        mode = ?cfg.mode,
        model = cfg.active_model(),
        deploy_log = %files.deploy.display(),
        keepalive_log = %files.keep_alive.display(),
        "starting deployment"
    );

    let (out_tx, out_handle) = spawn_output_writer();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx, out_tx));

    let outcome = Supervisor::new(cfg, Some(event_tx))
        .run(termination_signal())
        .await;

    // The supervisor (and its sender) is gone; drain what is left.
    let _ = printer.await;
    let _ = out_handle.await;

    Ok(outcome.exit_code())
}

/// Lines printed by `--check`.
fn check_report(cfg: &Configuration) -> Vec<String> {
    vec![
        format!("configuration: {CONFIG_PATH} (ok)"),
        format!("mode:          {:?}", cfg.mode),
        format!("serving:       {}", LaunchSpec::serving(cfg).display_command()),
        format!("tunnel:        {}", LaunchSpec::tunnel(cfg).display_command()),
        format!("health:        {}", cfg.health_url()),
        format!("logs:          {}", cfg.paths.log_dir.display()),
        format!(
            "keep-alive:    {}",
            if cfg.keep_alive.enabled {
                "enabled"
            } else {
                "disabled"
            }
        ),
    ]
}

async fn print_events(
    mut rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    out: mpsc::UnboundedSender<OutputLine>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SupervisorEvent::EndpointDiscovered(summary) => {
                for line in build_endpoint_summary(&summary).lines {
                    let _ = out.send(OutputLine::Stdout(line));
                }
            }
            SupervisorEvent::PhaseStarted {
                phase: Phase::Running,
            } => {
                let _ = out.send(OutputLine::Stderr(
                    "Deployment running. Press Ctrl+C to stop.".to_string(),
                ));
            }
            SupervisorEvent::Info(msg) => {
                let _ = out.send(OutputLine::Stderr(msg));
            }
            SupervisorEvent::ProcessStarted { role, pid } => {
                let _ = out.send(OutputLine::Stderr(format!("Started {role} process (pid {pid})")));
            }
            SupervisorEvent::PhaseStarted { .. } => {}
        }
    }
}
