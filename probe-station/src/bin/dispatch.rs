//! Command-line front end for the probe station.
//!
//! `dispatch` starts a session and, for debug and print sessions, keeps
//! running to supervise it until it ends or the process is signalled.
//! Results are printed as JSON on stdout; diagnostics go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tokio::signal::unix::{self, SignalKind};

use probe_station::{
    config::{Config, Mode, TransportPolicy, DEFAULT_CONFIG_PATH},
    environment::DockerEnvironment,
    finder::{self, ProbeQuery},
    lock::ProbeLock,
    session::StopKind,
    status::{self, UdevLookup},
    tracing::{self, prelude::*},
    DispatchRequest, Dispatcher, LockOutcome,
};

#[derive(Parser)]
#[command(name = "probe-dispatch", about = "Start and stop sessions on shared debug probes")]
struct Cli {
    /// Station configuration file
    #[arg(long, short, env = "PROBE_STATION_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a debug, flash or print session
    Dispatch {
        target: String,
        probe_id: u32,
        mode: Mode,
        /// Firmware file name for flash mode
        firmware: Option<String>,
        /// Wire transport (swd, jtag, sdi, ...); defaults to the target policy
        #[arg(long, short)]
        transport: Option<String>,
    },
    /// Stop a probe's sessions and wait for its lock to be released
    Stop {
        probe_id: u32,
        #[arg(long, short, default_value_t = StopKind::All)]
        kind: StopKind,
    },
    /// Find configured probes
    Find {
        #[arg(long)]
        interface: Option<String>,
        #[arg(long)]
        vid: Option<String>,
        #[arg(long)]
        pid: Option<String>,
        #[arg(long)]
        serial: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Report which probes are attached, match their serial, and are in use
    Status,
    /// Show the transport policy of each target
    Targets {
        /// Only this target
        name: Option<String>,
    },
}

#[derive(Serialize)]
struct TargetSummary<'a> {
    name: &'a str,
    description: &'a str,
    transports: BTreeMap<String, TransportPolicy>,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stderr();

    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Dispatch {
            target,
            probe_id,
            mode,
            firmware,
            transport,
        } => {
            let code = dispatch(
                config,
                DispatchRequest {
                    target,
                    probe_id,
                    mode,
                    transport,
                    firmware,
                },
            )
            .await?;
            std::process::exit(code);
        }
        Command::Stop { probe_id, kind } => {
            let env = Arc::new(DockerEnvironment::new(&config.environment));
            let dispatcher = Dispatcher::new(Arc::new(config), env);
            let outcome = dispatcher.stop_session(probe_id, kind).await?;
            print_json(&outcome)?;
            if !outcome.released {
                std::process::exit(1);
            }
        }
        Command::Find {
            interface,
            vid,
            pid,
            serial,
            name,
        } => {
            let query = ProbeQuery {
                interface,
                vendor_id: vid,
                product_id: pid,
                serial,
                name,
            };
            print_json(&finder::search(&config, query))?;
        }
        Command::Status => {
            let devices = UdevLookup::new(&config.paths.device_dir);
            let locks = ProbeLock::new(&config.paths.lock_dir);
            print_json(&status::report(&config, &devices, &locks)?)?;
        }
        Command::Targets { name } => {
            let summaries: Vec<TargetSummary> = config
                .targets
                .iter()
                .filter(|(target, _)| name.as_ref().map_or(true, |n| n == *target))
                .map(|(target, cfg)| TargetSummary {
                    name: target,
                    description: &cfg.description,
                    transports: config.transport_summary(target),
                })
                .collect();
            if let (Some(name), true) = (&name, summaries.is_empty()) {
                anyhow::bail!("Unknown target '{}'", name);
            }
            print_json(&summaries)?;
        }
    }

    Ok(())
}

async fn dispatch(config: Config, request: DispatchRequest) -> Result<i32> {
    let env = Arc::new(DockerEnvironment::new(&config.environment));
    let dispatcher = Dispatcher::new(Arc::new(config), env);
    let mode = request.mode;

    let outcome = dispatcher.dispatch(request).await?;
    print_json(&outcome)?;

    let supervising =
        mode.is_long_running() && outcome.lock == LockOutcome::Acquired && outcome.exit_code == 0;
    if !supervising {
        return Ok(outcome.exit_code);
    }

    info!("Supervising session.");
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => dispatcher.shutdown().await,
        _ = sigterm.recv() => dispatcher.shutdown().await,
        _ = dispatcher.wait_for_sessions() => {}
    }

    info!("Exiting.");
    Ok(outcome.exit_code)
}
