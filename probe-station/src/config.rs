//! Configuration management for probe-station.
//!
//! The configuration describes the probes attached to the station, the
//! targets they can be pointed at, and the execution environments in which
//! hardware-server processes run. It is loaded once from YAML and then shared
//! read-only (usually behind an `Arc`) by every dispatch and session monitor.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};

use crate::error::{Error, Result};

/// Default location of the station configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/probe-station/config.yml";

/// Main configuration structure for the station.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base ports; each probe gets `base + id`
    #[serde(default)]
    pub ports: PortsConfig,

    /// Filesystem locations for locks and session logs
    #[serde(default)]
    pub paths: PathsConfig,

    /// Session monitor tuning
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Execution environment call limits
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Probes attached to the station
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,

    /// Targets keyed by name
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,

    /// Execution environments keyed by the name targets refer to
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerConfig>,
}

/// Per-probe port bases.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortsConfig {
    #[serde(default = "default_gdb_base")]
    pub gdb_base: u16,
    #[serde(default = "default_telnet_base")]
    pub telnet_base: u16,
    #[serde(default = "default_rtt_base")]
    pub rtt_base: u16,
}

fn default_gdb_base() -> u16 {
    3333
}

fn default_telnet_base() -> u16 {
    4444
}

fn default_rtt_base() -> u16 {
    19021
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            gdb_base: default_gdb_base(),
            telnet_base: default_telnet_base(),
            rtt_base: default_rtt_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Directory holding one `probe_<id>.lock` file per probe
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Directory holding one append-only session log per probe
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory of the `probe_<id>` device links created by udev rules
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/probe-station")
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/probes")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            log_dir: default_log_dir(),
            device_dir: default_device_dir(),
        }
    }
}

/// Session monitor tuning.
///
/// The poll interval bounds how long a disconnect can go unnoticed. With
/// connection tracking a debug client disconnect is seen within one poll;
/// process-only liveness needs `miss_limit` polls.
///
/// A stop issued from another process only sees the lock come free once the
/// owning monitor ends, which for a server killed before it was ever seen is
/// the startup grace plus `miss_limit` polls. The stop timeout must cover
/// that, see [`MonitorConfig::worst_case_end`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub startup_grace_secs: u64,
    pub first_attach_grace_secs: u64,
    pub miss_limit: u32,
    pub stop_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            startup_grace_secs: 10,
            first_attach_grace_secs: 120,
            miss_limit: 3,
            stop_timeout_secs: 15,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn first_attach_grace(&self) -> Duration {
        Duration::from_secs(self.first_attach_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Longest a monitor can take to end a session whose processes are gone.
    pub fn worst_case_end(&self) -> Duration {
        self.startup_grace() + self.poll_interval() * self.miss_limit
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Container runtime binary
    pub docker_bin: String,
    /// Bound on every list/kill/inspect/background-run call
    pub call_timeout_secs: u64,
    /// Bound on synchronous flash commands
    pub flash_timeout_secs: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            call_timeout_secs: 5,
            flash_timeout_secs: 120,
        }
    }
}

impl EnvironmentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }
}

/// Operation requested for a probe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    Debug,
    Flash,
    Print,
}

impl Mode {
    /// Debug and print sessions keep a server running after dispatch returns.
    pub fn is_long_running(self) -> bool {
        matches!(self, Mode::Debug | Mode::Print)
    }
}

/// Wire-level debug adapter protocol family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum InterfaceKind {
    JLink,
    CmsisDap,
    StLink,
    /// Dual-mode adapter whose USB product id reflects its firmware mode
    WchLink,
    Other(String),
}

impl InterfaceKind {
    pub fn as_str(&self) -> &str {
        match self {
            InterfaceKind::JLink => "jlink",
            InterfaceKind::CmsisDap => "cmsis-dap",
            InterfaceKind::StLink => "stlink",
            InterfaceKind::WchLink => "wch-link",
            InterfaceKind::Other(name) => name,
        }
    }
}

impl From<String> for InterfaceKind {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "jlink" => InterfaceKind::JLink,
            "cmsis-dap" => InterfaceKind::CmsisDap,
            "stlink" => InterfaceKind::StLink,
            "wch-link" => InterfaceKind::WchLink,
            _ => InterfaceKind::Other(value),
        }
    }
}

impl From<InterfaceKind> for String {
    fn from(value: InterfaceKind) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for InterfaceKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(InterfaceKind::from(s.to_string()))
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical debug adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub id: u32,
    pub name: String,
    pub interface: InterfaceKind,
    #[serde(default)]
    pub vendor_id: String,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub serial: String,
    /// Device node for USB-serial probes
    #[serde(default)]
    pub device_path: Option<String>,
}

/// Normalize USB ID strings such as `0x8010` or ` 8010 `.
pub fn normalize_usb_id(value: &str) -> String {
    let normalized = value.trim().to_lowercase();
    match normalized.strip_prefix("0x") {
        Some(stripped) => stripped.to_string(),
        None => normalized,
    }
}

/// A device/board definition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub description: String,

    /// Interface kinds this target can be driven through
    #[serde(default)]
    pub compatible_probes: Vec<InterfaceKind>,

    /// interface -> mode -> command template
    #[serde(default)]
    pub commands: BTreeMap<String, BTreeMap<Mode, String>>,

    /// interface -> transport policy
    #[serde(default)]
    pub transports: BTreeMap<String, TransportPolicy>,

    /// Execution environment, shared or per interface
    #[serde(default)]
    pub container: Option<ContainerRef>,
}

/// Reference from a target to its execution environment(s).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContainerRef {
    Shared(String),
    PerInterface(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerConfig {
    /// Name the execution environment is addressed by
    pub name: String,
}

/// Allowed transports for one (target, interface) pair.
///
/// Values are trimmed and lower-cased at load time. An explicit default is
/// always a member of `allowed`, inserted at the front if it was missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawTransportPolicy")]
pub struct TransportPolicy {
    pub default: Option<String>,
    pub allowed: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTransportPolicy {
    Single(String),
    Detailed {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        allowed: Vec<String>,
    },
}

impl From<RawTransportPolicy> for TransportPolicy {
    fn from(raw: RawTransportPolicy) -> Self {
        match raw {
            RawTransportPolicy::Single(value) => {
                TransportPolicy::new(Some(value.as_str()), std::iter::empty::<&str>())
            }
            RawTransportPolicy::Detailed { default, allowed } => {
                TransportPolicy::new(default.as_deref(), allowed.iter().map(String::as_str))
            }
        }
    }
}

impl TransportPolicy {
    /// Build a normalized policy.
    pub fn new<'a>(default: Option<&str>, allowed: impl IntoIterator<Item = &'a str>) -> Self {
        let default = default.and_then(normalize_transport);
        let mut allowed: Vec<String> = allowed
            .into_iter()
            .filter_map(normalize_transport)
            .collect();
        if let Some(default) = &default {
            if !allowed.contains(default) {
                allowed.insert(0, default.clone());
            }
        }
        Self { default, allowed }
    }

    /// The explicit default, or the first allowed entry.
    pub fn effective_default(&self) -> Option<&str> {
        self.default
            .as_deref()
            .or_else(|| self.allowed.first().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

/// Trim and lower-case a transport name. Empty means "not requested".
pub fn normalize_transport(value: &str) -> Option<String> {
    let normalized = value.trim().to_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// Ports derived for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbePorts {
    pub gdb: u16,
    pub telnet: u16,
    /// RTT and print share a port
    pub rtt: u16,
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.id) {
                return Err(Error::Config(format!("duplicate probe id {}", probe.id)));
            }
            self.ports_for(probe.id)?;
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(Error::Config("monitor.poll_interval_ms must be non-zero".into()));
        }
        if self.monitor.miss_limit == 0 {
            return Err(Error::Config("monitor.miss_limit must be non-zero".into()));
        }
        if self.monitor.stop_timeout() <= self.monitor.worst_case_end() {
            return Err(Error::Config(format!(
                "monitor.stop_timeout_secs ({}s) must exceed grace plus missed polls ({:?})",
                self.monitor.stop_timeout_secs,
                self.monitor.worst_case_end()
            )));
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.get(name)
    }

    pub fn probe(&self, id: u32) -> Option<&ProbeConfig> {
        self.probes.iter().find(|probe| probe.id == id)
    }

    /// Check if a probe is compatible with a target.
    pub fn is_compatible(&self, target: &str, probe_id: u32) -> bool {
        match (self.target(target), self.probe(probe_id)) {
            (Some(target), Some(probe)) => target.compatible_probes.contains(&probe.interface),
            _ => false,
        }
    }

    /// Transport policy for a (target, interface) pair; empty if unconfigured.
    pub fn transport_policy(&self, target: &str, interface: &InterfaceKind) -> TransportPolicy {
        self.target(target)
            .and_then(|t| t.transports.get(interface.as_str()))
            .cloned()
            .unwrap_or_default()
    }

    /// Transport policy of every compatible interface of a target.
    pub fn transport_summary(&self, target: &str) -> BTreeMap<String, TransportPolicy> {
        let Some(config) = self.target(target) else {
            return BTreeMap::new();
        };
        config
            .compatible_probes
            .iter()
            .map(|interface| {
                (interface.to_string(), self.transport_policy(target, interface))
            })
            .collect()
    }

    pub fn command(&self, target: &str, interface: &InterfaceKind, mode: Mode) -> Option<&str> {
        self.target(target)?
            .commands
            .get(interface.as_str())?
            .get(&mode)
            .map(String::as_str)
    }

    /// Execution environment name for a target, resolved per interface.
    pub fn environment_for(&self, target: &str, interface: &InterfaceKind) -> Option<&str> {
        let key = match self.target(target)?.container.as_ref()? {
            ContainerRef::Shared(key) => key,
            ContainerRef::PerInterface(map) => map.get(interface.as_str())?,
        };
        self.containers.get(key).map(|c| c.name.as_str())
    }

    /// Every environment a probe's session could be running in.
    ///
    /// An operator stopping a session may not know which target started it,
    /// so this covers every compatible target's mapping for the interface.
    pub fn environments_for_probe(&self, probe_id: u32) -> Vec<String> {
        let Some(probe) = self.probe(probe_id) else {
            return Vec::new();
        };
        let mut environments: Vec<String> = Vec::new();
        for (name, target) in &self.targets {
            if !target.compatible_probes.contains(&probe.interface) {
                continue;
            }
            if let Some(env) = self.environment_for(name, &probe.interface) {
                if !environments.iter().any(|e| e == env) {
                    environments.push(env.to_string());
                }
            }
        }
        environments
    }

    pub fn ports_for(&self, probe_id: u32) -> Result<ProbePorts> {
        let offset = |base: u16, what: &str| {
            u16::try_from(u32::from(base) + probe_id).map_err(|_| {
                Error::Config(format!("{} port for probe {} exceeds 65535", what, probe_id))
            })
        };
        Ok(ProbePorts {
            gdb: offset(self.ports.gdb_base, "gdb")?,
            telnet: offset(self.ports.telnet_base, "telnet")?,
            rtt: offset(self.ports.rtt_base, "rtt")?,
        })
    }
}

/// Values substituted into a command template.
#[derive(Debug, Clone, Default)]
pub struct CommandValues {
    pub serial: String,
    pub gdb_port: u16,
    pub telnet_port: u16,
    pub rtt_port: u16,
    pub device_path: String,
    pub firmware_path: String,
    pub transport: String,
}

impl CommandValues {
    fn lookup(&self, key: &str) -> Option<String> {
        Some(match key {
            "serial" => self.serial.clone(),
            "gdb_port" => self.gdb_port.to_string(),
            "telnet_port" => self.telnet_port.to_string(),
            "rtt_port" | "print_port" => self.rtt_port.to_string(),
            "device_path" => self.device_path.clone(),
            "firmware_path" => self.firmware_path.clone(),
            "transport" => self.transport.clone(),
            _ => return None,
        })
    }
}

/// Substitute `{placeholder}` fields of a command template.
///
/// `{{` and `}}` produce literal braces. Unknown placeholders are a
/// configuration error rather than being left in the command.
pub fn format_command(template: &str, values: &CommandValues) -> Result<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER
        .get_or_init(|| {
            Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
        });

    let mut unknown = None;
    let formatted = re.replace_all(template, |caps: &Captures| match caps.get(1) {
        None if &caps[0] == "{{" => "{".to_string(),
        None => "}".to_string(),
        Some(key) => values.lookup(key.as_str()).unwrap_or_else(|| {
            unknown.get_or_insert_with(|| key.as_str().to_string());
            String::new()
        }),
    });

    match unknown {
        Some(key) => Err(Error::Config(format!(
            "unknown placeholder '{{{}}}' in command template",
            key
        ))),
        None => Ok(formatted.into_owned()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use test_case::test_case;

    pub(crate) const SAMPLE: &str = r#"
ports:
  gdb_base: 3330
  telnet_base: 4440
  rtt_base: 19020
probes:
  - id: 1
    name: J-Link Plus
    interface: jlink
    vendor_id: "1366"
    product_id: "0105"
    serial: "000683000001"
  - id: 2
    name: WCH-LinkE RISC-V
    interface: wch-link
    vendor_id: "1a86"
    product_id: "0x8010"
    serial: "WCH0001"
  - id: 3
    name: WCH-LinkE ARM
    interface: wch-link
    vendor_id: "1a86"
    product_id: "8012"
    serial: "WCH0002"
    device_path: /dev/ttyACM0
targets:
  nrf52840:
    description: Nordic nRF52840
    compatible_probes: [jlink, cmsis-dap]
    container: arm
    commands:
      jlink:
        debug: "JLinkGDBServer -select usb={serial} -if {transport} -port {gdb_port}"
        flash: "nrfjprog --snr {serial} --program {firmware_path}"
        print: "JLinkRTTClient -RTTTelnetPort {rtt_port}"
    transports:
      jlink:
        default: SWD
        allowed: [jtag]
  ch32v307:
    compatible_probes: [wch-link]
    container:
      wch-link: riscv
    commands:
      wch-link:
        debug: "openocd -c 'gdb_port {gdb_port}'"
        print: "socat TCP-LISTEN:{print_port},reuseaddr {device_path},raw"
    transports:
      wch-link: " sdi "
  stm32f103:
    compatible_probes: [wch-link]
    container:
      wch-link: arm
    transports:
      wch-link:
        allowed: [swd, jtag]
containers:
  arm:
    name: probe-arm
  riscv:
    name: probe-riscv
"#;

    pub(crate) fn sample() -> Config {
        Config::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_loads_sample() {
        let config = sample();
        assert_eq!(config.probes.len(), 3);
        assert_eq!(config.probe(2).unwrap().interface, InterfaceKind::WchLink);
        assert_eq!(config.monitor.miss_limit, 3);
        assert_eq!(config.paths.lock_dir, PathBuf::from("/var/lock"));
        assert_eq!(config.paths.device_dir, PathBuf::from("/dev/probes"));
    }

    #[test]
    fn test_policy_normalized_and_default_inserted() {
        let config = sample();
        let policy = config.transport_policy("nrf52840", &InterfaceKind::JLink);
        assert_eq!(policy.default.as_deref(), Some("swd"));
        assert_eq!(policy.allowed, vec!["swd", "jtag"]);
    }

    #[test]
    fn test_bare_string_policy() {
        let config = sample();
        let policy = config.transport_policy("ch32v307", &InterfaceKind::WchLink);
        assert_eq!(policy.default.as_deref(), Some("sdi"));
        assert_eq!(policy.allowed, vec!["sdi"]);
    }

    #[test]
    fn test_effective_default_falls_back_to_first_allowed() {
        let config = sample();
        let policy = config.transport_policy("stm32f103", &InterfaceKind::WchLink);
        assert_eq!(policy.default, None);
        assert_eq!(policy.effective_default(), Some("swd"));
    }

    #[test]
    fn test_missing_policy_is_empty() {
        let config = sample();
        assert!(config.transport_policy("nrf52840", &InterfaceKind::CmsisDap).is_empty());
        assert!(config.transport_policy("nope", &InterfaceKind::JLink).is_empty());
    }

    #[test]
    fn test_compatibility() {
        let config = sample();
        assert!(config.is_compatible("nrf52840", 1));
        assert!(!config.is_compatible("nrf52840", 2));
        assert!(!config.is_compatible("nrf52840", 99));
        assert!(!config.is_compatible("nope", 1));
    }

    #[test]
    fn test_environment_resolution() {
        let config = sample();
        assert_eq!(config.environment_for("nrf52840", &InterfaceKind::JLink), Some("probe-arm"));
        assert_eq!(
            config.environment_for("ch32v307", &InterfaceKind::WchLink),
            Some("probe-riscv")
        );
        assert_eq!(config.environment_for("ch32v307", &InterfaceKind::JLink), None);
        assert_eq!(config.environments_for_probe(2), vec!["probe-riscv", "probe-arm"]);
        assert_eq!(config.environments_for_probe(1), vec!["probe-arm"]);
    }

    #[test]
    fn test_ports() {
        let config = sample();
        let ports = config.ports_for(2).unwrap();
        assert_eq!(ports, ProbePorts { gdb: 3332, telnet: 4442, rtt: 19022 });
        assert!(config.ports_for(70_000).is_err());
    }

    #[test]
    fn test_default_stop_timeout_outlasts_monitor() {
        let monitor = MonitorConfig::default();
        assert!(monitor.stop_timeout() > monitor.worst_case_end());
    }

    #[test_case("startup_grace_secs: 10\n  stop_timeout_secs: 10", false; "equal to grace")]
    #[test_case("startup_grace_secs: 10\n  stop_timeout_secs: 13", false; "grace plus misses")]
    #[test_case("startup_grace_secs: 10\n  stop_timeout_secs: 14", true; "with slack")]
    #[test_case("poll_interval_ms: 5000\n  stop_timeout_secs: 25", false; "slow poll")]
    #[test_case("poll_interval_ms: 5000\n  stop_timeout_secs: 26", true; "slow poll with slack")]
    fn test_stop_timeout_validation(monitor: &str, valid: bool) {
        let text = format!("monitor:\n  {}\n", monitor);
        let result = Config::from_yaml_str(&text);
        assert_eq!(result.is_ok(), valid, "{:?}", result.err());
    }

    #[test]
    fn test_duplicate_probe_rejected() {
        let text = r#"
probes:
  - {id: 1, name: a, interface: jlink}
  - {id: 1, name: b, interface: jlink}
"#;
        assert!(matches!(Config::from_yaml_str(text), Err(Error::Config(_))));
    }

    #[test]
    fn test_format_command() {
        let values = CommandValues {
            serial: "ABC".into(),
            gdb_port: 3331,
            rtt_port: 19021,
            transport: "swd".into(),
            ..Default::default()
        };
        let template = "srv -s {serial} -if {transport} -p {gdb_port} {{x}} {print_port}";
        let cmd = format_command(template, &values).unwrap();
        assert_eq!(cmd, "srv -s ABC -if swd -p 3331 {x} 19021");
    }

    #[test]
    fn test_format_command_unknown_placeholder() {
        let err = format_command("srv {bogus}", &CommandValues::default()).unwrap_err();
        assert!(err.to_string().contains("{bogus}"));
    }

    #[test]
    fn test_usb_id_normalization() {
        assert_eq!(normalize_usb_id(" 0x8010 "), "8010");
        assert_eq!(normalize_usb_id("0X8012"), "8012");
        assert_eq!(normalize_usb_id(""), "");
    }
}
