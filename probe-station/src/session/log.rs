//! Per-probe append-only session log.
//!
//! Each probe gets `<log_dir>/probe_<id>.log`, which accumulates session
//! starts, state transitions, rejections and end reasons for postmortem
//! diagnosis. Appends are best effort: a failed or stalled write is reported
//! through tracing and otherwise ignored, so logging can never take a session
//! monitor down with it.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, io::AsyncWriteExt, time::timeout};

use crate::tracing::{self, prelude::*};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionLog {
    probe_id: u32,
    path: PathBuf,
}

impl SessionLog {
    pub fn new(log_dir: &Path, probe_id: u32) -> Self {
        Self {
            probe_id,
            path: log_dir.join(format!("probe_{}.log", probe_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub async fn append(&self, message: impl AsRef<str>) {
        let line = format!("{} {}\n", timestamp(), message.as_ref());
        match timeout(WRITE_TIMEOUT, self.write(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    probe = self.probe_id,
                    path = %self.path.display(),
                    error = %e,
                    "Session log write failed"
                );
            }
            Err(_) => {
                warn!(
                    probe = self.probe_id,
                    path = %self.path.display(),
                    "Session log write timed out"
                );
            }
        }
    }

    async fn write(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn timestamp() -> String {
    tracing::local_now()
        .format(time::macros::format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_else(|_| "????-??-?? ??:??:??".to_string())
}
