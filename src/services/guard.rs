use crate::error::TransferError;
use crate::services::schedule::{RecordingSchedule, ScheduledRecording};
use crate::services::system::SystemProbe;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Safe,
    RecordingActive(String),
    RecordingImminent(String),
}

impl GuardDecision {
    pub fn is_safe(&self) -> bool {
        matches!(self, GuardDecision::Safe)
    }

    pub fn into_result(self) -> Result<(), TransferError> {
        match self {
            GuardDecision::Safe => Ok(()),
            GuardDecision::RecordingActive(title) => Err(TransferError::GuardAbort(format!(
                "conflict with current recording \"{}\"",
                title
            ))),
            GuardDecision::RecordingImminent(title) => Err(TransferError::GuardAbort(format!(
                "conflict with next scheduled recording \"{}\"",
                title
            ))),
        }
    }
}

/// Unsafe while any entry is recording, or will start within `lookahead`
pub fn evaluate(
    recordings: &[ScheduledRecording],
    now: DateTime<Utc>,
    lookahead: Duration,
) -> GuardDecision {
    if let Some(active) = recordings.iter().find(|r| r.is_active(now)) {
        return GuardDecision::RecordingActive(active.title());
    }
    if let Some(next) = recordings.iter().find(|r| r.starts_within(now, lookahead)) {
        return GuardDecision::RecordingImminent(next.title());
    }
    GuardDecision::Safe
}

/// Read-only gate in front of every transfer
pub struct LockGuard<'a> {
    schedule: &'a dyn RecordingSchedule,
    lookahead: Duration,
}

impl<'a> LockGuard<'a> {
    pub fn new(schedule: &'a dyn RecordingSchedule, lookahead: Duration) -> Self {
        Self {
            schedule,
            lookahead,
        }
    }

    pub async fn check(&self) -> Result<GuardDecision> {
        let recordings = self.schedule.list_recordings().await?;
        let decision = evaluate(&recordings, Utc::now(), self.lookahead);
        match &decision {
            GuardDecision::Safe => tracing::info!("No conflicting recordings found, proceeding"),
            other => tracing::info!("Transfer not safe: {:?}", other),
        }
        Ok(decision)
    }

    pub async fn is_transfer_safe(&self) -> Result<bool> {
        Ok(self.check().await?.is_safe())
    }
}

/// Single-instance lock file holding our pid; removed on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path, probe: &dyn SystemProbe) -> Result<Self, TransferError> {
        let own_pid = std::process::id();

        // Second pass only happens after clearing a stale lock
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", own_pid).map_err(|e| {
                        TransferError::ConfigError(format!("cannot write lock file {:?}: {}", path, e))
                    })?;
                    tracing::debug!("Acquired instance lock {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());

                    match holder {
                        Some(pid) if pid != own_pid && probe.pid_alive(pid) => {
                            return Err(TransferError::GuardAbort(format!(
                                "another transfer is running (pid {})",
                                pid
                            )));
                        }
                        _ => {
                            tracing::warn!("Removing stale lock file {:?} (holder {:?})", path, holder);
                            let _ = std::fs::remove_file(path);
                        }
                    }
                }
                Err(e) => {
                    return Err(TransferError::ConfigError(format!(
                        "cannot create lock file {:?}: {}",
                        path, e
                    )));
                }
            }
        }

        Err(TransferError::GuardAbort(format!(
            "lock file {:?} is contended",
            path
        )))
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}
