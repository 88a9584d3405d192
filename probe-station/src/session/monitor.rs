//! Session liveness monitoring.
//!
//! [`LivenessTracker`] is the pure state machine: it is fed one
//! [`Observation`] per poll and decides whether the session goes on.
//! [`SessionMonitor`] is the task around it. It owns the probe's lock for
//! the whole session, polls the execution environment, records every
//! transition in the session log, and on the way out force-cleans the
//! session's processes and releases the lock exactly once.
//!
//! ```text
//!   Starting ──process seen──▶ Active ──end verdict──▶ Draining ──▶ Ended
//!      │                                                  ▲
//!      └──────────── startup grace elapsed (counts a miss) ┘ (via Active)
//! ```

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Mode, MonitorConfig},
    environment::ExecutionEnvironment,
    lock::LockHandle,
    tracing::prelude::*,
};

use super::{force_cleanup, ActiveSessions, Session, SessionLog};

/// Lifecycle state of a monitored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    /// Launched; the server may not have appeared yet
    Starting,
    /// Server seen at least once, or startup grace expired
    Active,
    /// End decided; cleanup and lock release in progress
    Draining,
    /// Lock released
    Ended,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndReason {
    /// No matching process for `miss_limit` consecutive polls
    ProcessGone,
    /// The debug client that had attached went away
    ClientDisconnected,
    /// No debug client attached within the first-attach grace
    NoClientAttached,
    /// Stop requested, or the owning process is shutting down
    Stopped,
}

/// Connection-count reading for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionObservation {
    /// Not checked
    Unknown,
    /// Established connections on the client port
    Count(usize),
    /// The environment cannot count connections, or the query failed
    Unsupported,
}

/// What one poll of the environment saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Matching processes, or `None` if the environment could not be queried
    pub processes: Option<usize>,
    pub connections: ConnectionObservation,
}

/// Something worth recording about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Transition { from: SessionState, to: SessionState },
    ClientAttached { connections: usize },
    ProcessMissing { misses: u32, limit: u32, query_failed: bool },
    ProcessRecovered,
    ConnectionTrackingUnavailable,
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::Transition { from, to } => write!(f, "State {} -> {}", from, to),
            MonitorEvent::ClientAttached { connections } => {
                write!(f, "Debug client attached ({} connection(s))", connections)
            }
            MonitorEvent::ProcessMissing {
                misses,
                limit,
                query_failed,
            } => {
                let why = if *query_failed { "query failed" } else { "not found" };
                write!(f, "Session process {} ({}/{})", why, misses, limit)
            }
            MonitorEvent::ProcessRecovered => f.write_str("Session process seen again"),
            MonitorEvent::ConnectionTrackingUnavailable => {
                f.write_str("Connection tracking unavailable; using process liveness only")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    End(EndReason),
}

/// Result of feeding one observation to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub verdict: Verdict,
    pub events: Vec<MonitorEvent>,
}

/// Liveness state machine for one session.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    mode: Mode,
    startup_grace: Duration,
    first_attach_grace: Duration,
    miss_limit: u32,
    state: SessionState,
    misses: u32,
    client_attached: bool,
    degraded: bool,
    ended: Option<EndReason>,
}

impl LivenessTracker {
    pub fn new(mode: Mode, config: &MonitorConfig) -> Self {
        Self {
            mode,
            startup_grace: config.startup_grace(),
            first_attach_grace: config.first_attach_grace(),
            miss_limit: config.miss_limit.max(1),
            state: SessionState::Starting,
            misses: 0,
            client_attached: false,
            degraded: false,
            ended: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether connection counts are consulted.
    ///
    /// Only debug sessions have a client worth tracking, and only until the
    /// environment has shown it cannot count connections.
    pub fn tracks_connections(&self) -> bool {
        self.mode == Mode::Debug && !self.degraded
    }

    /// Feed one poll's observation. `elapsed` is time since session start.
    pub fn observe(&mut self, observation: &Observation, elapsed: Duration) -> StepOutcome {
        let mut events = Vec::new();
        if let Some(reason) = self.ended {
            return StepOutcome {
                verdict: Verdict::End(reason),
                events,
            };
        }

        if self.tracks_connections() {
            match observation.connections {
                ConnectionObservation::Unsupported => {
                    self.degraded = true;
                    events.push(MonitorEvent::ConnectionTrackingUnavailable);
                }
                ConnectionObservation::Count(n) if n > 0 => {
                    if !self.client_attached {
                        self.client_attached = true;
                        events.push(MonitorEvent::ClientAttached { connections: n });
                    }
                }
                ConnectionObservation::Count(_) => {
                    if self.client_attached {
                        return self.end(EndReason::ClientDisconnected, events);
                    }
                    if elapsed >= self.first_attach_grace {
                        return self.end(EndReason::NoClientAttached, events);
                    }
                }
                ConnectionObservation::Unknown => {}
            }
        }

        match observation.processes {
            Some(n) if n > 0 => {
                if self.state == SessionState::Starting {
                    self.transition(SessionState::Active, &mut events);
                }
                if self.misses > 0 {
                    self.misses = 0;
                    events.push(MonitorEvent::ProcessRecovered);
                }
            }
            processes => {
                if self.state == SessionState::Starting {
                    if elapsed < self.startup_grace {
                        return StepOutcome {
                            verdict: Verdict::Continue,
                            events,
                        };
                    }
                    self.transition(SessionState::Active, &mut events);
                }
                self.misses += 1;
                events.push(MonitorEvent::ProcessMissing {
                    misses: self.misses,
                    limit: self.miss_limit,
                    query_failed: processes.is_none(),
                });
                if self.misses >= self.miss_limit {
                    return self.end(EndReason::ProcessGone, events);
                }
            }
        }

        StepOutcome {
            verdict: Verdict::Continue,
            events,
        }
    }

    /// End the session for a reason that did not come from an observation.
    pub fn stop(&mut self, reason: EndReason) -> StepOutcome {
        self.end(reason, Vec::new())
    }

    /// Mark the lock as released.
    pub fn finish(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        if self.state != SessionState::Ended {
            self.transition(SessionState::Ended, &mut events);
        }
        events
    }

    fn end(&mut self, reason: EndReason, mut events: Vec<MonitorEvent>) -> StepOutcome {
        let reason = *self.ended.get_or_insert(reason);
        if !matches!(self.state, SessionState::Draining | SessionState::Ended) {
            self.transition(SessionState::Draining, &mut events);
        }
        StepOutcome {
            verdict: Verdict::End(reason),
            events,
        }
    }

    fn transition(&mut self, to: SessionState, events: &mut Vec<MonitorEvent>) {
        events.push(MonitorEvent::Transition {
            from: self.state,
            to,
        });
        self.state = to;
    }
}

/// Task that watches one session and owns its probe lock.
pub struct SessionMonitor {
    session: Session,
    env: Arc<dyn ExecutionEnvironment>,
    lock: LockHandle,
    log: SessionLog,
    tracker: LivenessTracker,
    poll_interval: Duration,
    active: Arc<ActiveSessions>,
}

impl SessionMonitor {
    pub fn new(
        session: Session,
        env: Arc<dyn ExecutionEnvironment>,
        lock: LockHandle,
        log: SessionLog,
        config: &MonitorConfig,
        active: Arc<ActiveSessions>,
    ) -> Self {
        Self {
            tracker: LivenessTracker::new(session.mode, config),
            poll_interval: config.poll_interval(),
            session,
            env,
            lock,
            log,
            active,
        }
    }

    /// Watch the session until it ends, then clean up and release the lock.
    ///
    /// Cancelling `stop` ends the session through the same cleanup path.
    pub async fn run(mut self, stop: CancellationToken) -> EndReason {
        let started = Instant::now();
        debug!(
            probe = self.session.probe_id,
            mode = %self.session.mode,
            env = %self.session.environment,
            "Monitoring session"
        );

        let reason = loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let outcome = self.tracker.stop(EndReason::Stopped);
                    self.record(&outcome.events).await;
                    break EndReason::Stopped;
                }
                _ = time::sleep(self.poll_interval) => {}
            }

            let observation = self.observe().await;
            let outcome = self.tracker.observe(&observation, started.elapsed());
            self.record(&outcome.events).await;
            if let Verdict::End(reason) = outcome.verdict {
                break reason;
            }
        };

        self.teardown(reason).await;
        reason
    }

    async fn observe(&self) -> Observation {
        let session = &self.session;
        let signature = session.signature();

        let mut pids = BTreeSet::new();
        let mut failed = false;
        for pattern in signature.liveness_patterns() {
            match self.env.list_matching(&session.environment, &pattern).await {
                Ok(found) => pids.extend(found),
                Err(e) => {
                    debug!(
                        probe = session.probe_id,
                        pattern = %pattern,
                        error = %e,
                        "Process query failed"
                    );
                    failed = true;
                }
            }
        }
        let processes = if pids.is_empty() && failed {
            None
        } else {
            Some(pids.len())
        };

        let connections = if self.tracker.tracks_connections() {
            match self
                .env
                .established_connections(&session.environment, signature.client_port())
                .await
            {
                Ok(Some(n)) => ConnectionObservation::Count(n),
                Ok(None) => ConnectionObservation::Unsupported,
                Err(e) => {
                    debug!(probe = session.probe_id, error = %e, "Connection query failed");
                    ConnectionObservation::Unsupported
                }
            }
        } else {
            ConnectionObservation::Unknown
        };

        Observation {
            processes,
            connections,
        }
    }

    async fn record(&self, events: &[MonitorEvent]) {
        for event in events {
            info!(probe = self.session.probe_id, mode = %self.session.mode, "{}", event);
            self.log.append(format!("[{}] {}", self.session.mode, event)).await;
        }
    }

    async fn teardown(mut self, reason: EndReason) {
        let session = &self.session;
        info!(probe = session.probe_id, mode = %session.mode, reason = %reason, "Session ending");
        self.log
            .append(format!("[{}] Session ending: {}", session.mode, reason))
            .await;

        let failures = force_cleanup(
            self.env.as_ref(),
            &session.environment,
            &session.signature(),
            &[session.mode],
        )
        .await;
        if failures > 0 {
            warn!(probe = session.probe_id, failures, "Cleanup incomplete");
            self.log
                .append(format!(
                    "[{}] Cleanup incomplete: {} kill(s) failed",
                    session.mode, failures
                ))
                .await;
        }

        // Unregister before the lock goes so a new session on this probe
        // cannot be removed by mistake.
        self.active.remove(session.probe_id);

        let probe_id = session.probe_id;
        if let Err(e) = self.lock.release() {
            // Closing the descriptor still drops the lock
            warn!(probe = probe_id, error = %e, "Lock release reported an error");
        }

        let events = self.tracker.finish();
        for event in &events {
            info!(probe = probe_id, "{}", event);
            self.log.append(format!("[{}] {}", self.session.mode, event)).await;
        }
    }
}
