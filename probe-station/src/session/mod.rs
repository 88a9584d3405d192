//! Probe sessions: what is running on a probe and how it is watched.
//!
//! A debug or print session is started in the background by the dispatcher
//! and then owned by a [`SessionMonitor`], which holds the probe's lock until
//! the session ends. Flash sessions never get here; they run synchronously
//! inside the dispatch call.

mod cleanup;
mod log;
mod monitor;
mod signature;

pub use cleanup::force_cleanup;
pub use log::SessionLog;
pub use monitor::{
    ConnectionObservation, EndReason, LivenessTracker, MonitorEvent, Observation, SessionMonitor,
    SessionState, StepOutcome, Verdict,
};
pub use signature::{interface_processes, relay_processes, ProcessSignature};

use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, time::SystemTime};
use tokio_util::sync::CancellationToken;

use crate::config::{InterfaceKind, Mode, ProbePorts};

/// A long-running session on one probe.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub probe_id: u32,
    pub target: String,
    pub mode: Mode,
    /// Execution environment the server runs in
    pub environment: String,
    pub interface: InterfaceKind,
    pub transport: Option<String>,
    pub ports: ProbePorts,
    pub started_at: SystemTime,
}

impl Session {
    pub fn signature(&self) -> ProcessSignature {
        ProcessSignature::new(self.mode, self.ports, self.interface.clone())
    }
}

/// Which sessions a stop request targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StopKind {
    Debug,
    Print,
    #[default]
    All,
}

impl StopKind {
    pub fn modes(self) -> &'static [Mode] {
        match self {
            StopKind::Debug => &[Mode::Debug],
            StopKind::Print => &[Mode::Print],
            StopKind::All => &[Mode::Debug, Mode::Print],
        }
    }
}

/// Sessions monitored by this process, keyed by probe.
///
/// Never consulted for exclusion: that comes from the probe lock, and a
/// session started by another process will not appear here. Each entry
/// carries the token that stops its monitor.
#[derive(Debug, Default)]
pub struct ActiveSessions {
    sessions: Mutex<HashMap<u32, (Session, CancellationToken)>>,
}

impl ActiveSessions {
    pub fn insert(&self, session: Session, stop: CancellationToken) {
        self.sessions.lock().insert(session.probe_id, (session, stop));
    }

    pub fn remove(&self, probe_id: u32) -> Option<Session> {
        self.sessions.lock().remove(&probe_id).map(|(session, _)| session)
    }

    pub fn get(&self, probe_id: u32) -> Option<Session> {
        self.sessions.lock().get(&probe_id).map(|(session, _)| session.clone())
    }

    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort_by_key(|s| s.probe_id);
        sessions
    }

    /// Ask the monitor of a probe's session to end, if its mode is listed.
    ///
    /// The entry stays until the monitor has cleaned up and removes it.
    pub fn stop(&self, probe_id: u32, modes: &[Mode]) -> bool {
        match self.sessions.lock().get(&probe_id) {
            Some((session, stop)) if modes.contains(&session.mode) => {
                stop.cancel();
                true
            }
            _ => false,
        }
    }
}
