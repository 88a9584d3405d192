//! Process signatures used as a liveness oracle.
//!
//! The execution environment offers no push notification when a debug server
//! exits, so liveness is judged by matching full process command lines
//! against patterns derived from the session's mode, ports and interface.
//! This is a heuristic: a server that rewrites its argv, or one started with
//! an unexpected flag spelling, is reported as absent (a false negative), and
//! the session is eventually torn down.
//!
//! Patterns are POSIX extended regular expressions so they can be handed to
//! `pgrep -f`/`pkill -f` unchanged; [`ProcessSignature::matches`] evaluates
//! the same patterns locally.

use regex::Regex;

use crate::config::{InterfaceKind, Mode, ProbePorts};

/// Identity of one session's processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature {
    mode: Mode,
    ports: ProbePorts,
    interface: InterfaceKind,
}

impl ProcessSignature {
    pub fn new(mode: Mode, ports: ProbePorts, interface: InterfaceKind) -> Self {
        Self {
            mode,
            ports,
            interface,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Port the debug client attaches to, for connection tracking.
    pub fn client_port(&self) -> u16 {
        match self.mode {
            Mode::Print => self.ports.rtt,
            Mode::Debug | Mode::Flash => self.ports.gdb,
        }
    }

    /// Patterns any of which identifies the session's server as running.
    pub fn liveness_patterns(&self) -> Vec<String> {
        let mut patterns = port_patterns(self.mode, &self.ports);
        if self.mode == Mode::Debug && self.interface == InterfaceKind::JLink {
            patterns.push(format!("JLinkGDBServer.* -port {}( |$)", self.ports.gdb));
        }
        patterns
    }

    /// Everything to kill when tearing down sessions of the given modes.
    ///
    /// Port patterns come first, then the interface's server/client process
    /// names, then relay helpers. Interface names are killed wholesale: each
    /// probe has its own execution environment, so they cannot belong to
    /// another probe.
    pub fn cleanup_patterns(&self, modes: &[Mode]) -> Vec<String> {
        let mut patterns: Vec<String> = modes
            .iter()
            .flat_map(|mode| port_patterns(*mode, &self.ports))
            .collect();
        patterns.extend(
            interface_processes(&self.interface)
                .iter()
                .chain(relay_processes(&self.interface))
                .map(|name| name.to_string()),
        );
        patterns
    }

    /// Whether a full command line belongs to this session's server.
    pub fn matches(&self, cmdline: &str) -> bool {
        self.liveness_patterns()
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .any(|re| re.is_match(cmdline))
    }
}

fn port_patterns(mode: Mode, ports: &ProbePorts) -> Vec<String> {
    match mode {
        Mode::Debug => vec![format!("gdb_port {}( |'|$)", ports.gdb)],
        Mode::Print => vec![
            format!("RTTTelnetPort {}( |$)", ports.rtt),
            format!("TCP-LISTEN:{}(,| |$)", ports.rtt),
        ],
        // Flash runs synchronously; nothing survives it
        Mode::Flash => Vec::new(),
    }
}

/// Hardware-server and client binaries started for an interface.
pub fn interface_processes(interface: &InterfaceKind) -> &'static [&'static str] {
    match interface {
        InterfaceKind::JLink => &["JLinkGDBServer", "JLinkRTTClient"],
        InterfaceKind::WchLink => &["openocd", "wlink"],
        _ => &[],
    }
}

/// TCP-forwarding helpers started alongside an interface's servers.
pub fn relay_processes(interface: &InterfaceKind) -> &'static [&'static str] {
    match interface {
        InterfaceKind::WchLink => &["socat"],
        _ => &[],
    }
}
