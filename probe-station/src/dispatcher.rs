//! Dispatch and stop entry points.
//!
//! [`Dispatcher::dispatch`] validates a request completely (target, probe,
//! compatibility, command, environment, transport policy, hardware mode)
//! before touching anything, then takes the probe's lock and starts the
//! session. Debug and print sessions hand the lock to a [`SessionMonitor`]
//! spawned on the dispatcher's task tracker; flash runs to completion and
//! releases it before returning.

use futures::future::join_all;
use serde::Serialize;
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::time::{self, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{format_command, CommandValues, Config, Mode, ProbeConfig, ProbePorts},
    environment::{ExecutionEnvironment, RunMode, RunOutput},
    error::{Error, Result},
    hw_mode,
    lock::{LockHandle, ProbeLock},
    session::{
        force_cleanup, ActiveSessions, ProcessSignature, Session, SessionLog, SessionMonitor,
        StopKind,
    },
    tracing::prelude::*,
    transport,
};

/// Interval between lock checks while a stop waits for release.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Directory firmware images are mounted at inside execution environments.
const FIRMWARE_DIR: &str = "/work";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub target: String,
    pub probe_id: u32,
    pub mode: Mode,
    /// Caller's transport choice; `None` takes the policy default
    pub transport: Option<String>,
    /// Firmware file name, relative to the firmware directory
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOutcome {
    Acquired,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub resolved_transport: Option<String>,
    pub lock: LockOutcome,
    pub exit_code: i32,
    /// Human-readable account of what was done
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    /// Whether the probe's lock was free when the stop finished
    pub released: bool,
    pub log: Vec<String>,
}

/// Everything a validated request resolves to.
struct Plan {
    target: String,
    probe: ProbeConfig,
    mode: Mode,
    environment: String,
    command: String,
    transport: Option<String>,
    ports: ProbePorts,
}

impl Plan {
    fn describe(&self) -> Vec<String> {
        vec![
            format!("Target: {}", self.target),
            format!("Probe: {} (ID: {})", self.probe.name, self.probe.id),
            format!("Mode: {}", self.mode),
            format!("Transport: {}", self.transport.as_deref().unwrap_or("-")),
            format!("Container: {}", self.environment),
            format!("Command: {}", self.command),
        ]
    }

    fn session(&self) -> Session {
        Session {
            probe_id: self.probe.id,
            target: self.target.clone(),
            mode: self.mode,
            environment: self.environment.clone(),
            interface: self.probe.interface.clone(),
            transport: self.transport.clone(),
            ports: self.ports,
            started_at: SystemTime::now(),
        }
    }
}

/// Front door for starting and stopping probe sessions.
pub struct Dispatcher {
    config: Arc<Config>,
    env: Arc<dyn ExecutionEnvironment>,
    locks: ProbeLock,
    active: Arc<ActiveSessions>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, env: Arc<dyn ExecutionEnvironment>) -> Self {
        Self {
            locks: ProbeLock::new(&config.paths.lock_dir),
            config,
            env,
            active: Arc::new(ActiveSessions::default()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sessions monitored by this process.
    pub fn active_sessions(&self) -> Vec<Session> {
        self.active.snapshot()
    }

    /// Start a session.
    ///
    /// Validation failures are returned as errors with no side effects. A
    /// busy probe is not an error: it is reported as [`LockOutcome::Busy`]
    /// with exit code 1.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let log = SessionLog::new(&self.config.paths.log_dir, request.probe_id);

        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                if e.is_transport_rejection() {
                    warn!(
                        probe = request.probe_id,
                        target = %request.target,
                        error = %e,
                        "Transport rejected"
                    );
                    log.append(format!("[{}] Rejected: {}", request.mode, e)).await;
                }
                return Err(e);
            }
        };

        if !self.env.is_running(&plan.environment).await? {
            return Err(Error::EnvironmentUnavailable(format!(
                "container {} is not running",
                plan.environment
            )));
        }

        let mut lines = plan.describe();
        let handle = match self.locks.acquire(plan.probe.id) {
            Ok(handle) => handle,
            Err(Error::ProbeBusy(id)) => {
                info!(probe = id, mode = %plan.mode, "Probe busy");
                log.append(format!("[{}] Rejected: probe busy", plan.mode)).await;
                lines.push(format!("Probe #{} is busy", id));
                return Ok(DispatchOutcome {
                    resolved_transport: plan.transport,
                    lock: LockOutcome::Busy,
                    exit_code: 1,
                    log: lines,
                });
            }
            Err(e) => return Err(e),
        };

        let exit_code = match plan.mode {
            Mode::Flash => self.flash(&plan, handle, &log, &mut lines).await?,
            Mode::Debug | Mode::Print => self.start(&plan, handle, log, &mut lines).await?,
        };

        Ok(DispatchOutcome {
            resolved_transport: plan.transport,
            lock: LockOutcome::Acquired,
            exit_code,
            log: lines,
        })
    }

    // All checks that need no I/O.
    fn plan(&self, request: &DispatchRequest) -> Result<Plan> {
        let config = &self.config;
        let target = &request.target;

        config
            .target(target)
            .ok_or_else(|| Error::UnknownTarget(target.clone()))?;
        let probe = config
            .probe(request.probe_id)
            .ok_or(Error::UnknownProbe(request.probe_id))?;
        if !config.is_compatible(target, probe.id) {
            return Err(Error::IncompatibleProbe {
                target: target.clone(),
                probe: probe.id,
            });
        }

        let interface = &probe.interface;
        let template = config
            .command(target, interface, request.mode)
            .ok_or_else(|| Error::MissingCommand {
                target: target.clone(),
                interface: interface.to_string(),
                mode: request.mode.to_string(),
            })?;
        let environment = config
            .environment_for(target, interface)
            .ok_or_else(|| Error::MissingEnvironment {
                target: target.clone(),
                interface: interface.to_string(),
            })?;

        let requested = request.transport.as_deref();
        let transport = transport::resolve(config, target, interface, requested, request.mode)?;
        hw_mode::validate(
            target,
            interface,
            probe,
            requested,
            transport.as_deref(),
            request.mode,
        )?;

        let ports = config.ports_for(probe.id)?;
        let values = CommandValues {
            serial: probe.serial.clone(),
            gdb_port: ports.gdb,
            telnet_port: ports.telnet,
            rtt_port: ports.rtt,
            device_path: probe.device_path.clone().unwrap_or_default(),
            firmware_path: firmware_path(request.firmware.as_deref()),
            transport: transport.clone().unwrap_or_default(),
        };
        let command = format_command(template, &values)?;

        Ok(Plan {
            target: target.clone(),
            probe: probe.clone(),
            mode: request.mode,
            environment: environment.to_string(),
            command,
            transport,
            ports,
        })
    }

    async fn flash(
        &self,
        plan: &Plan,
        handle: LockHandle,
        log: &SessionLog,
        lines: &mut Vec<String>,
    ) -> Result<i32> {
        let timeout = self.config.environment.flash_timeout();
        info!(probe = plan.probe.id, env = %plan.environment, "Flashing");
        let result = self
            .env
            .run(&plan.environment, &plan.command, RunMode::Synchronous(timeout))
            .await;

        release(handle);

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                log.append(format!("[flash] Failed: {}", e)).await;
                return Err(e);
            }
        };
        push_output(lines, &output);
        if output.success() {
            info!(probe = plan.probe.id, "Flash complete");
        } else {
            warn!(probe = plan.probe.id, exit_code = output.exit_code, "Flash failed");
        }
        log.append(format!("[flash] Finished with exit code {}", output.exit_code))
            .await;
        Ok(output.exit_code)
    }

    async fn start(
        &self,
        plan: &Plan,
        handle: LockHandle,
        log: SessionLog,
        lines: &mut Vec<String>,
    ) -> Result<i32> {
        let session = plan.session();

        // Leftovers from a session whose monitor died with its process
        let failures = force_cleanup(
            self.env.as_ref(),
            &plan.environment,
            &session.signature(),
            StopKind::All.modes(),
        )
        .await;
        if failures > 0 {
            lines.push(format!("Stale process cleanup incomplete ({} failed)", failures));
        }

        let output_file = match plan.mode {
            Mode::Print => "/tmp/print.log",
            _ => "/tmp/debug.log",
        };
        let command = format!("nohup {} > {} 2>&1 &", plan.command, output_file);

        let output = match self
            .env
            .run(&plan.environment, &command, RunMode::Background)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                release(handle);
                return Err(e);
            }
        };
        push_output(lines, &output);
        if !output.success() {
            release(handle);
            warn!(probe = plan.probe.id, exit_code = output.exit_code, "Session launch failed");
            log.append(format!(
                "[{}] Launch failed with exit code {}",
                plan.mode, output.exit_code
            ))
            .await;
            return Ok(output.exit_code);
        }

        info!(
            probe = plan.probe.id,
            mode = %plan.mode,
            env = %plan.environment,
            transport = plan.transport.as_deref().unwrap_or("-"),
            "Session started"
        );
        log.append(format!(
            "[{}] Session started: target={} transport={} env={}",
            plan.mode,
            plan.target,
            plan.transport.as_deref().unwrap_or("-"),
            plan.environment
        ))
        .await;
        lines.push(format!("{} server started", capitalize(plan.mode)));

        let stop = self.shutdown.child_token();
        self.active.insert(session.clone(), stop.clone());
        let monitor = SessionMonitor::new(
            session,
            self.env.clone(),
            handle,
            log,
            &self.config.monitor,
            self.active.clone(),
        );
        self.tracker.spawn(monitor.run(stop));

        Ok(output.exit_code)
    }

    /// Tear down a probe's sessions and wait for its lock to come free.
    ///
    /// Succeeds on an idle probe. `released` is false if the lock is still
    /// held when the stop timeout runs out, for example by a session of a
    /// mode not covered by `kind`.
    pub async fn stop_session(&self, probe_id: u32, kind: StopKind) -> Result<StopOutcome> {
        let probe = self
            .config
            .probe(probe_id)
            .ok_or(Error::UnknownProbe(probe_id))?;
        let ports = self.config.ports_for(probe_id)?;
        let modes = kind.modes();
        let signature = ProcessSignature::new(modes[0], ports, probe.interface.clone());
        let environments = self.config.environments_for_probe(probe_id);
        let mut lines = Vec::new();

        info!(probe = probe_id, kind = %kind, "Stopping sessions");
        let failures = join_all(
            environments
                .iter()
                .map(|env| force_cleanup(self.env.as_ref(), env, &signature, modes)),
        )
        .await;
        for (env, failed) in environments.iter().zip(failures) {
            if failed == 0 {
                lines.push(format!("Stopped {} sessions in {}", kind, env));
            } else {
                lines.push(format!("Cleanup in {} incomplete ({} failed)", env, failed));
            }
        }

        if self.active.stop(probe_id, modes) {
            lines.push(format!("Monitor for probe {} stopping", probe_id));
        }

        let deadline = Instant::now() + self.config.monitor.stop_timeout();
        let released = loop {
            if self.locks.is_free(probe_id)? {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            time::sleep(STOP_POLL).await;
        };

        if released {
            lines.push(format!("Probe {} released", probe_id));
            SessionLog::new(&self.config.paths.log_dir, probe_id)
                .append(format!("[{}] Stop requested; probe released", kind))
                .await;
        } else {
            warn!(probe = probe_id, "Probe still locked after stop");
            lines.push(format!("Probe {} still locked", probe_id));
        }

        Ok(StopOutcome { released, log: lines })
    }

    /// Wait for every monitored session to end on its own.
    pub async fn wait_for_sessions(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop every monitor and wait for them to release their locks.
    pub async fn shutdown(&self) {
        debug!("Dispatcher shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn release(handle: LockHandle) {
    let probe_id = handle.probe_id();
    if let Err(e) = handle.release() {
        warn!(probe = probe_id, error = %e, "Lock release reported an error");
    }
}

fn firmware_path(firmware: Option<&str>) -> String {
    match firmware.filter(|f| !f.is_empty()) {
        Some(file) => Path::new(FIRMWARE_DIR).join(file).display().to_string(),
        None => String::new(),
    }
}

fn push_output(lines: &mut Vec<String>, output: &RunOutput) {
    lines.extend(
        output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string),
    );
}

fn capitalize(mode: Mode) -> String {
    let name = mode.to_string();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, ""; "none")]
    #[test_case(Some(""), ""; "empty")]
    #[test_case(Some("app.hex"), "/work/app.hex"; "file")]
    fn test_firmware_path(firmware: Option<&str>, expected: &str) {
        assert_eq!(firmware_path(firmware), expected);
    }

    #[test]
    fn test_push_output_skips_blank_lines() {
        let mut lines = vec!["Target: x".to_string()];
        push_output(
            &mut lines,
            &RunOutput {
                exit_code: 0,
                stdout: "Programming...\n\nDone\n".into(),
                stderr: "warning: slow\n".into(),
            },
        );
        assert_eq!(lines, vec!["Target: x", "Programming...", "Done", "warning: slow"]);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize(Mode::Debug), "Debug");
        assert_eq!(capitalize(Mode::Print), "Print");
    }
}
