//! End-to-end dispatch and stop behaviour against an in-memory environment.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::BTreeSet,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use probe_station::{
    config::{Config, Mode},
    environment::{ExecutionEnvironment, RunMode, RunOutput},
    lock::ProbeLock,
    session::StopKind,
    DispatchRequest, Dispatcher, Error, LockOutcome, Result,
};

#[derive(Debug, Clone)]
struct Process {
    pid: u32,
    env: String,
    cmdline: String,
}

#[derive(Default)]
struct State {
    processes: Vec<Process>,
    next_pid: u32,
    runs: Vec<(String, String, RunMode)>,
    stopped: BTreeSet<String>,
    connections: Option<usize>,
}

/// Process table shared by every environment name.
#[derive(Default)]
struct FakeEnv {
    state: Mutex<State>,
}

impl FakeEnv {
    fn processes(&self, env: &str) -> Vec<String> {
        self.state
            .lock()
            .processes
            .iter()
            .filter(|p| p.env == env)
            .map(|p| p.cmdline.clone())
            .collect()
    }

    fn runs(&self) -> Vec<(String, String, RunMode)> {
        self.state.lock().runs.clone()
    }

    fn crash_all(&self) {
        self.state.lock().processes.clear();
    }
}

#[async_trait]
impl ExecutionEnvironment for FakeEnv {
    async fn run(&self, env: &str, command: &str, mode: RunMode) -> Result<RunOutput> {
        let mut state = self.state.lock();
        state.runs.push((env.to_string(), command.to_string(), mode));
        match mode {
            RunMode::Background => {
                state.next_pid += 1;
                let pid = state.next_pid;
                state.processes.push(Process {
                    pid,
                    env: env.to_string(),
                    cmdline: command.to_string(),
                });
                Ok(RunOutput::default())
            }
            RunMode::Synchronous(_) => Ok(RunOutput {
                exit_code: 0,
                stdout: "Programmed 4096 bytes\n".into(),
                stderr: String::new(),
            }),
        }
    }

    async fn list_matching(&self, env: &str, pattern: &str) -> Result<Vec<u32>> {
        let re = Regex::new(pattern).map_err(|e| Error::Config(e.to_string()))?;
        Ok(self
            .state
            .lock()
            .processes
            .iter()
            .filter(|p| p.env == env && re.is_match(&p.cmdline))
            .map(|p| p.pid)
            .collect())
    }

    async fn kill_matching(&self, env: &str, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| Error::Config(e.to_string()))?;
        self.state
            .lock()
            .processes
            .retain(|p| !(p.env == env && re.is_match(&p.cmdline)));
        Ok(())
    }

    async fn is_running(&self, env: &str) -> Result<bool> {
        Ok(!self.state.lock().stopped.contains(env))
    }

    async fn established_connections(&self, _env: &str, _port: u16) -> Result<Option<usize>> {
        Ok(self.state.lock().connections)
    }
}

fn station_config(dir: &Path) -> Config {
    let yaml = format!(
        r#"
ports:
  gdb_base: 3330
  telnet_base: 4440
  rtt_base: 19020
paths:
  lock_dir: {lock}
  log_dir: {log}
monitor:
  poll_interval_ms: 20
  startup_grace_secs: 1
  first_attach_grace_secs: 60
  miss_limit: 3
  stop_timeout_secs: 3
probes:
  - id: 1
    name: J-Link Plus
    interface: jlink
    vendor_id: "1366"
    product_id: "0105"
    serial: "000683000001"
  - id: 2
    name: WCH-LinkE
    interface: wch-link
    vendor_id: "1a86"
    product_id: "0x8010"
    serial: "WCH0001"
targets:
  nrf52840:
    compatible_probes: [jlink]
    container: arm
    commands:
      jlink:
        debug: "JLinkGDBServer -select usb={{serial}} -if {{transport}} -port {{gdb_port}}"
        flash: "nrfjprog --snr {{serial}} --program {{firmware_path}}"
        print: "JLinkRTTClient -RTTTelnetPort {{rtt_port}}"
    transports:
      jlink:
        default: swd
        allowed: [jtag]
  ch32v307:
    compatible_probes: [wch-link]
    container:
      wch-link: riscv
    commands:
      wch-link:
        debug: "openocd -f wch-riscv.cfg -c 'gdb_port {{gdb_port}}'"
    transports:
      wch-link: sdi
  ch32f103:
    compatible_probes: [wch-link]
    container:
      wch-link: riscv
    commands:
      wch-link:
        debug: "openocd -c 'transport select {{transport}}' -c 'gdb_port {{gdb_port}}'"
    transports:
      wch-link:
        allowed: [swd, jtag]
containers:
  arm:
    name: probe-arm
  riscv:
    name: probe-riscv
"#,
        lock = dir.join("locks").display(),
        log = dir.join("logs").display(),
    );
    Config::from_yaml_str(&yaml).unwrap()
}

struct Station {
    tmp: tempfile::TempDir,
    env: Arc<FakeEnv>,
    dispatcher: Dispatcher,
}

impl Station {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let env = Arc::new(FakeEnv::default());
        let dispatcher = Dispatcher::new(Arc::new(station_config(tmp.path())), env.clone());
        Self {
            tmp,
            env,
            dispatcher,
        }
    }

    /// Another dispatcher on the same station, as a second CLI invocation would be.
    fn peer(&self) -> Dispatcher {
        Dispatcher::new(Arc::new(station_config(self.tmp.path())), self.env.clone())
    }

    fn locks(&self) -> ProbeLock {
        ProbeLock::new(self.tmp.path().join("locks"))
    }

    fn session_log(&self, probe_id: u32) -> String {
        let path = self
            .tmp
            .path()
            .join("logs")
            .join(format!("probe_{}.log", probe_id));
        std::fs::read_to_string(path).unwrap_or_default()
    }

    async fn wait_until_free(&self, probe_id: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.locks().is_free(probe_id).unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

fn request(target: &str, probe_id: u32, mode: Mode, transport: Option<&str>) -> DispatchRequest {
    DispatchRequest {
        target: target.to_string(),
        probe_id,
        mode,
        transport: transport.map(str::to_string),
        firmware: None,
    }
}

#[tokio::test]
async fn debug_dispatch_hands_lock_to_monitor() {
    let station = Station::new();
    station.env.state.lock().connections = Some(0);

    let outcome = station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Debug, None))
        .await
        .unwrap();

    assert_eq!(outcome.lock, LockOutcome::Acquired);
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.resolved_transport.as_deref(), Some("swd"));
    assert!(outcome
        .log
        .iter()
        .any(|line| line.contains("-if swd -port 3331")));

    // Session keeps the probe after dispatch has returned
    assert!(!station.locks().is_free(1).unwrap());
    let active = station.dispatcher.active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].mode, Mode::Debug);

    let processes = station.env.processes("probe-arm");
    assert_eq!(processes.len(), 1);
    assert!(processes[0].starts_with("nohup JLinkGDBServer"));
    assert!(processes[0].ends_with("> /tmp/debug.log 2>&1 &"));

    // Server dies: the monitor notices and gives the probe back
    station.env.crash_all();
    assert!(station.wait_until_free(1).await);
    assert!(station.dispatcher.active_sessions().is_empty());

    let log = station.session_log(1);
    assert!(log.contains("Session started"));
    assert!(log.contains("process_gone"));
}

#[tokio::test]
async fn busy_probe_reports_busy_without_running() {
    let station = Station::new();
    let held = station.locks().acquire(1).unwrap();

    let outcome = station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Debug, None))
        .await
        .unwrap();

    assert_eq!(outcome.lock, LockOutcome::Busy);
    assert_eq!(outcome.exit_code, 1);
    assert!(station.env.runs().is_empty());
    held.release().unwrap();
}

#[tokio::test]
async fn concurrent_dispatches_exactly_one_acquires() {
    let station = Station::new();
    let (a, b) = tokio::join!(
        station
            .dispatcher
            .dispatch(request("nrf52840", 1, Mode::Debug, None)),
        station
            .dispatcher
            .dispatch(request("nrf52840", 1, Mode::Print, None)),
    );
    let mut outcomes = vec![a.unwrap().lock, b.unwrap().lock];
    outcomes.sort_by_key(|lock| *lock == LockOutcome::Busy);
    assert_eq!(outcomes, vec![LockOutcome::Acquired, LockOutcome::Busy]);
    station.dispatcher.shutdown().await;
    assert!(station.locks().is_free(1).unwrap());
}

#[tokio::test]
async fn rejected_transport_has_no_side_effects() {
    let station = Station::new();

    let err = station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Debug, Some("bogus")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportNotAllowed(_)));
    assert!(err.to_string().contains("Allowed: [swd, jtag]"));

    let err = station
        .dispatcher
        .dispatch(request("ch32v307", 2, Mode::Debug, Some("swd")))
        .await
        .unwrap_err();
    assert!(err.is_transport_rejection());

    assert!(station.env.runs().is_empty());
    assert!(station.locks().is_free(1).unwrap());
    assert!(station.locks().is_free(2).unwrap());
    assert!(station.session_log(1).contains("Rejected"));
}

#[tokio::test]
async fn riscv_probe_rejects_arm_policy() {
    let station = Station::new();

    // Caller asked for SWD on a probe fixed to SDI
    let err = station
        .dispatcher
        .dispatch(request("ch32f103", 2, Mode::Debug, Some("swd")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HardwareModeConflict(_)));
    assert!(err.to_string().contains("PID 8010"));

    // Nothing asked for, but the policy resolves to SWD
    let err = station
        .dispatcher
        .dispatch(request("ch32f103", 2, Mode::Debug, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportPolicyMismatch(_)));
    assert!(station.env.runs().is_empty());
}

#[tokio::test]
async fn riscv_probe_defaults_to_sdi() {
    let station = Station::new();
    let outcome = station
        .dispatcher
        .dispatch(request("ch32v307", 2, Mode::Debug, None))
        .await
        .unwrap();
    assert_eq!(outcome.resolved_transport.as_deref(), Some("sdi"));
    assert_eq!(station.env.processes("probe-riscv").len(), 1);
    station.dispatcher.shutdown().await;
}

#[tokio::test]
async fn print_ignores_transport() {
    let station = Station::new();
    let outcome = station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Print, Some("bogus")))
        .await
        .unwrap();
    assert_eq!(outcome.lock, LockOutcome::Acquired);
    assert_eq!(outcome.resolved_transport, None);
    let processes = station.env.processes("probe-arm");
    assert_eq!(
        processes,
        vec!["nohup JLinkRTTClient -RTTTelnetPort 19021 > /tmp/print.log 2>&1 &"]
    );
    station.dispatcher.shutdown().await;
}

#[tokio::test]
async fn flash_releases_lock_before_returning() {
    let station = Station::new();
    let mut req = request("nrf52840", 1, Mode::Flash, None);
    req.firmware = Some("app.hex".into());

    let outcome = station.dispatcher.dispatch(req).await.unwrap();

    assert_eq!(outcome.lock, LockOutcome::Acquired);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.log.iter().any(|l| l == "Programmed 4096 bytes"));
    assert!(station.locks().is_free(1).unwrap());
    assert!(station.dispatcher.active_sessions().is_empty());

    let runs = station.env.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].1, "nrfjprog --snr 000683000001 --program /work/app.hex");
    assert!(matches!(runs[0].2, RunMode::Synchronous(_)));
}

#[tokio::test]
async fn stopped_environment_is_unavailable() {
    let station = Station::new();
    station.env.state.lock().stopped.insert("probe-arm".into());
    let err = station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Debug, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EnvironmentUnavailable(_)));
    assert!(station.locks().is_free(1).unwrap());
}

#[tokio::test]
async fn stop_on_idle_probe_succeeds() {
    let station = Station::new();
    let outcome = station
        .dispatcher
        .stop_session(1, StopKind::All)
        .await
        .unwrap();
    assert!(outcome.released);
}

#[tokio::test]
async fn stop_tears_down_active_session() {
    let station = Station::new();
    station.env.state.lock().connections = Some(1);
    station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Debug, None))
        .await
        .unwrap();
    assert!(!station.locks().is_free(1).unwrap());

    let started = Instant::now();
    let outcome = station
        .dispatcher
        .stop_session(1, StopKind::All)
        .await
        .unwrap();

    assert!(outcome.released);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(station.env.processes("probe-arm").is_empty());
    assert!(station.dispatcher.active_sessions().is_empty());
}

#[tokio::test]
async fn stop_print_session() {
    let station = Station::new();
    station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Print, None))
        .await
        .unwrap();
    assert_eq!(station.env.processes("probe-arm").len(), 1);

    let outcome = station
        .dispatcher
        .stop_session(1, StopKind::Print)
        .await
        .unwrap();

    assert!(outcome.released);
    assert!(outcome.log.iter().any(|l| l == "Probe 1 released"));
    assert!(station.env.processes("probe-arm").is_empty());
    assert!(station.session_log(1).contains("Stop requested"));
}

#[tokio::test]
async fn stop_from_peer_waits_out_startup_grace() {
    let station = Station::new();
    station
        .dispatcher
        .dispatch(request("nrf52840", 1, Mode::Print, None))
        .await
        .unwrap();

    // The peer cannot cancel the owner's monitor, which has not yet seen the
    // server and so only lets go after the startup grace and three misses.
    let peer = station.peer();
    assert!(peer.active_sessions().is_empty());
    let started = Instant::now();
    let outcome = peer.stop_session(1, StopKind::All).await.unwrap();

    assert!(outcome.released, "{:?}", outcome.log);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(station.env.processes("probe-arm").is_empty());
    assert!(station.dispatcher.active_sessions().is_empty());
    assert!(station.session_log(1).contains("process_gone"));
}

#[tokio::test]
async fn unknown_probe_and_target() {
    let station = Station::new();
    assert!(matches!(
        station
            .dispatcher
            .dispatch(request("nrf52840", 9, Mode::Debug, None))
            .await,
        Err(Error::UnknownProbe(9))
    ));
    assert!(matches!(
        station
            .dispatcher
            .dispatch(request("esp32", 1, Mode::Debug, None))
            .await,
        Err(Error::UnknownTarget(_))
    ));
    assert!(matches!(
        station
            .dispatcher
            .dispatch(request("ch32v307", 1, Mode::Debug, None))
            .await,
        Err(Error::IncompatibleProbe { .. })
    ));
    assert!(matches!(
        station.dispatcher.stop_session(9, StopKind::All).await,
        Err(Error::UnknownProbe(9))
    ));
}
