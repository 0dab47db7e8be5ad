use crate::cli::Mode;
use crate::config::Config;
use crate::error::{Status, TransferError};
use crate::report::{CheckResult, Report};
use crate::services::guard::{self, InstanceLock, LockGuard};
use crate::services::htsp;
use crate::services::mailer::Notifier;
use crate::services::schedule::{self, RecordingSchedule};
use crate::services::system::{SysinfoProbe, SystemProbe};
use crate::services::transfer::{self, CopyFn, TransferOutcome, TransferWorker};
use crate::services::{checksum, health};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct App {
    config: Config,
    schedule: Box<dyn RecordingSchedule>,
    probe: Box<dyn SystemProbe>,
    notifier: Notifier,
    copy: CopyFn,
}

impl App {
    pub fn new(config: Config) -> Result<Self, TransferError> {
        let notifier = Notifier::from_config(&config.mail)?;
        if !notifier.is_enabled() {
            tracing::warn!("Mail transport disabled; failures will only be logged");
        }
        let schedule = schedule::from_config(&config);

        Ok(Self::with_parts(config, schedule, Box::new(SysinfoProbe), notifier))
    }

    pub fn with_parts(
        config: Config,
        schedule: Box<dyn RecordingSchedule>,
        probe: Box<dyn SystemProbe>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            schedule,
            probe,
            notifier,
            copy: transfer::plain_copy,
        }
    }

    #[cfg(test)]
    pub fn with_copy(mut self, copy: CopyFn) -> Self {
        self.copy = copy;
        self
    }

    pub async fn run(&self, mode: Mode) -> Status {
        tracing::debug!("Running in mode {:?}", mode);

        match mode {
            Mode::Transfer {
                file,
                event,
                subfolder,
            } => self.run_transfer(&file, event.as_deref(), subfolder.as_deref()).await,
            Mode::Process { subfolder } => self.run_process(subfolder.as_deref()).await,
            Mode::Test => self.run_test().await,
            Mode::Check => self.run_check().await,
        }
    }

    /// Invoked by TVHeadend once a recording finishes
    async fn run_transfer(&self, file: &Path, event: Option<&str>, subfolder: Option<&str>) -> Status {
        tracing::info!("About to process recording {:?}", file);
        let mut status = Status::Ok;

        let tvh_error = event.map(str::trim).filter(|e| *e != "OK");
        if let Some(error) = tvh_error {
            tracing::error!("TVHeadend error for {:?}: {}", file, error);
            let mut report = Report::new("TVHeadend Error");
            report.push(CheckResult::fail(
                "recording",
                format!("TVHeadend reported an error with the recording {:?}: {}", file, error),
            ));
            self.notifier.send_report(&report).await;
            status = Status::Failed;

            if !self.config.sweep_after_transfer {
                return status;
            }
        }

        let _lock = match self.acquire_lock() {
            Ok(lock) => lock,
            Err(gate) => return status.worst(gate),
        };

        let guard = LockGuard::new(self.schedule.as_ref(), self.config.lookahead());
        match guard.check().await {
            Ok(decision) => {
                if let Err(e) = decision.into_result() {
                    tracing::info!("Aborted: {}", e);
                    return status.worst(e.status());
                }
            }
            Err(e) => return status.worst(self.schedule_unreadable(e).await),
        }

        if !self.share_ready().await {
            return Status::Failed;
        }

        if tvh_error.is_none() {
            let mut report = Report::new("File transfer failed");
            report.push(self.deliver_result(file, subfolder).await);
            if !report.all_passed() {
                self.notifier.send_report(&report).await;
                status = Status::Failed;
            }
        }

        if self.config.sweep_after_transfer {
            status = status.worst(self.process_backlog(subfolder, Some(file)).await);
        }

        status
    }

    /// Transfer every finished recording that is still on local storage
    async fn run_process(&self, subfolder: Option<&str>) -> Status {
        let _lock = match self.acquire_lock() {
            Ok(lock) => lock,
            Err(gate) => return gate,
        };

        self.process_backlog(subfolder, None).await
    }

    /// Caller holds the instance lock
    /// `exclude` keeps the recording this run already handled (or refused) out of the sweep
    async fn process_backlog(&self, subfolder: Option<&str>, exclude: Option<&Path>) -> Status {
        let recordings = match self.schedule.list_recordings().await {
            Ok(recordings) => recordings,
            Err(e) => return self.schedule_unreadable(e).await,
        };

        let lookahead = self.config.lookahead();
        if let Err(e) = guard::evaluate(&recordings, Utc::now(), lookahead).into_result() {
            tracing::info!("Aborted: {}", e);
            return e.status();
        }

        let mut pending = schedule::completed_recordings(&recordings, Utc::now());
        pending.retain(|path| Some(path.as_path()) != exclude);
        if pending.is_empty() {
            tracing::info!("No unprocessed recordings found");
            return Status::Ok;
        }
        tracing::info!("Found {} unprocessed recordings", pending.len());

        if !self.share_ready().await {
            return Status::Failed;
        }

        let mut status = Status::Ok;
        let mut report = Report::new("File transfer failed");

        let guard = LockGuard::new(self.schedule.as_ref(), lookahead);
        for (index, recording) in pending.iter().enumerate() {
            // Long copies can run into the next scheduled recording
            if index > 0 {
                match guard.is_transfer_safe().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!("Skipped {} remaining recordings", pending.len() - index);
                        status = Status::Deferred;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Schedule unreadable, stopping: {:#}", e);
                        status = Status::Deferred;
                        break;
                    }
                }
            }
            report.push(self.deliver_result(recording, subfolder).await);
        }

        if !report.all_passed() {
            self.notifier.send_report(&report).await;
            status = status.worst(Status::Failed);
        }

        status
    }

    /// Every check, a dry-run transfer and exactly one summary email
    async fn run_test(&self) -> Status {
        let mut report = Report::new("Network PVR Test Email");

        report.push(self_checksum().await);

        let share = health::check_share_accessible(
            &self.config.share_path,
            self.config.require_mount,
            self.share_timeout(),
        )
        .await;
        let share_ok = share.passed;
        report.push(share);

        report.push(health::check_free_space(
            self.probe.as_ref(),
            &self.config.free_space_path,
            self.config.free_space_threshold_bytes(),
        ));
        report.push(health::check_service_running(
            self.probe.as_ref(),
            &self.config.service_name,
        ));
        report.push(htsp::check_htsp_connectivity(&self.config.htsp).await);
        report.push(self.schedule_summary().await);

        if share_ok {
            report.push(self.dry_run_transfer().await);
        } else {
            report.push(CheckResult::fail(
                "dry-run transfer",
                "skipped, share not accessible",
            ));
        }

        let status = if report.all_passed() {
            Status::Ok
        } else {
            Status::Failed
        };
        self.notifier.send_report(&report).await;
        status
    }

    /// Cron-friendly check; stays quiet unless something is wrong
    async fn run_check(&self) -> Status {
        let mut report = Report::new("Network PVR check failed");
        report.push(health::check_free_space(
            self.probe.as_ref(),
            &self.config.free_space_path,
            self.config.free_space_threshold_bytes(),
        ));
        report.push(health::check_service_running(
            self.probe.as_ref(),
            &self.config.service_name,
        ));

        if report.all_passed() {
            tracing::info!("All checks passed");
            return Status::Ok;
        }

        self.notifier.send_report(&report).await;
        Status::Failed
    }

    fn acquire_lock(&self) -> Result<InstanceLock, Status> {
        InstanceLock::acquire(&self.config.lock_file, self.probe.as_ref()).map_err(|e| {
            tracing::warn!("{}", e);
            e.status()
        })
    }

    async fn schedule_unreadable(&self, error: anyhow::Error) -> Status {
        tracing::error!("Unable to read recording schedule: {:#}", error);
        let mut report = Report::new("Recording schedule unavailable");
        report.push(CheckResult::fail("schedule", format!("{:#}", error)));
        self.notifier.send_report(&report).await;
        Status::Failed
    }

    /// Alerts by email when the share cannot take transfers
    async fn share_ready(&self) -> bool {
        let result = health::check_share_accessible(
            &self.config.share_path,
            self.config.require_mount,
            self.share_timeout(),
        )
        .await;
        if result.passed {
            return true;
        }

        let mut report = Report::new("NFS share not accessible");
        report.push(result);
        self.notifier.send_report(&report).await;
        false
    }

    async fn deliver_result(&self, recording: &Path, subfolder: Option<&str>) -> CheckResult {
        let name = recording
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| recording.display().to_string());

        match self.deliver(recording, subfolder).await {
            Ok(outcome) if outcome.skipped => CheckResult::pass(
                name,
                format!("already on share at {:?}", outcome.destination),
            ),
            Ok(outcome) => CheckResult::pass(
                name,
                format!(
                    "transferred {} to {:?}",
                    health::format_bytes(outcome.bytes),
                    outcome.destination
                ),
            ),
            Err(e) => {
                tracing::error!("Error transferring recording {:?}: {}", recording, e);
                CheckResult::fail(name, e.to_string())
            }
        }
    }

    /// Copy, verify, copy the checksum file, then drop the local files
    async fn deliver(
        &self,
        recording: &Path,
        subfolder: Option<&str>,
    ) -> Result<TransferOutcome, TransferError> {
        if !recording.is_file() {
            return Err(TransferError::SourceMissing(recording.to_path_buf()));
        }

        let worker = TransferWorker::new(self.probe.as_ref()).with_copy(self.copy);
        let outcome = worker
            .transfer(recording, &self.config.share_path, subfolder)
            .await?;

        let digest = match &outcome.checksum {
            Some(digest) => digest.clone(),
            None => checksum::verify(recording, &outcome.destination)
                .await
                .map_err(|e| as_transfer_error(recording, e))?,
        };

        let sidecar = checksum::write_sidecar(recording, &digest)
            .await
            .map_err(|e| as_transfer_error(recording, e))?;
        worker
            .transfer(&sidecar, &self.config.share_path, subfolder)
            .await?;
        tracing::info!(
            "Successfully transferred recording {:?} to {:?}",
            recording,
            outcome.destination
        );

        if self.config.remove_source {
            for local in [recording, sidecar.as_path()] {
                if let Err(e) = tokio::fs::remove_file(local).await {
                    tracing::warn!("Failed to remove local file {:?}: {}", local, e);
                }
            }
        }

        Ok(outcome)
    }

    async fn schedule_summary(&self) -> CheckResult {
        match self.schedule.list_recordings().await {
            Ok(recordings) => {
                let now = Utc::now();
                let completed = schedule::completed_recordings(&recordings, now).len();
                let next = schedule::next_start(&recordings, now)
                    .map(|t| {
                        t.with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M")
                            .to_string()
                    })
                    .unwrap_or_else(|| "none".to_string());
                CheckResult::pass(
                    "schedule",
                    format!(
                        "{} completed recordings awaiting transfer; next recording scheduled for {}",
                        completed, next
                    ),
                )
            }
            Err(e) => CheckResult::fail("schedule", format!("Unable to check for recordings: {:#}", e)),
        }
    }

    /// Copy a scratch file to the share, verify it, then remove it again
    async fn dry_run_transfer(&self) -> CheckResult {
        match self.try_dry_run().await {
            Ok(bytes) => CheckResult::pass(
                "dry-run transfer",
                format!("{} copied and verified", health::format_bytes(bytes)),
            ),
            Err(e) => CheckResult::fail("dry-run transfer", e.to_string()),
        }
    }

    async fn try_dry_run(&self) -> Result<u64, TransferError> {
        let scratch = tempfile::Builder::new()
            .prefix(".pvr-transfer-selftest-")
            .suffix(".ts")
            .tempfile()
            .map_err(|e| TransferError::CopyError {
                source_path: std::env::temp_dir(),
                error: e,
            })?;
        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(scratch.path(), &payload).map_err(|e| TransferError::CopyError {
            source_path: scratch.path().to_path_buf(),
            error: e,
        })?;

        let worker = TransferWorker::new(self.probe.as_ref());
        let outcome = worker
            .transfer(scratch.path(), &self.config.share_path, None)
            .await?;
        let verified = checksum::verify(scratch.path(), &outcome.destination).await;

        if let Err(e) = tokio::fs::remove_file(&outcome.destination).await {
            tracing::warn!("Failed to remove dry-run file {:?}: {}", outcome.destination, e);
        }
        verified.map_err(|e| as_transfer_error(scratch.path(), e))?;

        Ok(outcome.bytes)
    }

    fn share_timeout(&self) -> Duration {
        Duration::from_secs(self.config.share_timeout_secs)
    }
}

async fn self_checksum() -> CheckResult {
    let exe: PathBuf = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return CheckResult::fail("checksum", format!("cannot locate executable: {}", e)),
    };

    match checksum::digest(&exe).await {
        Ok(digest) => CheckResult::pass("checksum", format!("SHA256 of {:?}: {}", exe, digest)),
        Err(e) => CheckResult::fail(
            "checksum",
            format!("Unable to generate the checksum for {:?}: {:#}", exe, e),
        ),
    }
}

fn as_transfer_error(path: &Path, error: anyhow::Error) -> TransferError {
    match error.downcast::<TransferError>() {
        Ok(e) => e,
        Err(other) => TransferError::CopyError {
            source_path: path.to_path_buf(),
            error: std::io::Error::other(format!("{:#}", other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailTransportKind;
    use crate::services::htsp::fake::FakeServer;
    use crate::services::mailer::fake::RecordingTransport;
    use crate::services::schedule::ScheduledRecording;
    use crate::services::schedule::fake::{FixedSchedule, entry};
    use crate::services::system::fake::FakeProbe;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        local: PathBuf,
        share: PathBuf,
        mail: Arc<RecordingTransport>,
        config: Config,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let local = dir.path().join("local");
            let share = dir.path().join("share");
            std::fs::create_dir(&local).unwrap();
            std::fs::create_dir(&share).unwrap();

            let mut config = Config {
                share_path: share.clone(),
                require_mount: false,
                free_space_path: local.clone(),
                lock_file: dir.path().join("pvr.lock"),
                ..Config::default()
            };
            config.mail.transport = MailTransportKind::Disabled;
            // Nothing listens here; test mode must cope with an unreachable server
            config.htsp.host = "127.0.0.1".to_string();
            config.htsp.port = 1;
            config.htsp.timeout_secs = 2;

            Self {
                _dir: dir,
                local,
                share,
                mail: Arc::new(RecordingTransport::default()),
                config,
            }
        }

        fn recording(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.local.join(name);
            std::fs::write(&path, data).unwrap();
            path
        }

        fn app(&self, recordings: Vec<ScheduledRecording>, probe: FakeProbe) -> App {
            App::with_parts(
                self.config.clone(),
                Box::new(FixedSchedule(recordings)),
                Box::new(probe),
                Notifier::new(self.mail.clone()),
            )
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_transfer_moves_recording_and_checksum() {
        let h = Harness::new();
        let rec = h.recording("News.ts", b"evening news");
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("OK".into()),
                subfolder: Some("News".into()),
            })
            .await;

        assert_eq!(status, Status::Ok);
        let dest = h.share.join("News").join("News.ts");
        assert_eq!(std::fs::read(&dest).unwrap(), b"evening news");
        assert!(h.share.join("News").join("News.sha2").exists());
        assert!(!rec.exists());
        assert!(!h.local.join("News.sha2").exists());
        assert!(h.mail.sent().is_empty());
        assert!(!h.config.lock_file.exists());
    }

    #[tokio::test]
    async fn test_keeps_source_when_configured() {
        let mut h = Harness::new();
        h.config.remove_source = false;
        let rec = h.recording("Film.ts", b"film");
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: None,
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Ok);
        assert!(rec.exists());
        assert!(h.share.join("Film.ts").exists());
    }

    #[tokio::test]
    async fn test_unsafe_guard_never_transfers() {
        let h = Harness::new();
        let rec = h.recording("News.ts", b"evening news");
        let t = now();
        let app = h.app(
            vec![entry("live", t - 60, t + 600, None)],
            FakeProbe::healthy(),
        );

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("OK".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Deferred);
        assert_eq!(status.code(), 2);
        assert!(rec.exists());
        assert!(std::fs::read_dir(&h.share).unwrap().next().is_none());
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_imminent_recording_defers_backlog() {
        let h = Harness::new();
        let rec = h.recording("Old.ts", b"old");
        let t = now();
        let app = h.app(
            vec![
                entry("old", t - 7200, t - 3600, Some(&rec)),
                entry("soon", t + 600, t + 4200, None),
            ],
            FakeProbe::healthy(),
        );

        assert_eq!(app.run(Mode::Process { subfolder: None }).await, Status::Deferred);
        assert!(rec.exists());
    }

    #[tokio::test]
    async fn test_tvheadend_error_is_reported() {
        let mut h = Harness::new();
        h.config.sweep_after_transfer = false;
        let rec = h.recording("Broken.ts", b"partial");
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("Data errors".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
        assert!(rec.exists());
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "TVHeadend Error");
        assert!(sent[0].text.contains("Data errors"));
    }

    #[tokio::test]
    async fn test_sweep_leaves_failed_recording_behind() {
        let h = Harness::new();
        let broken = h.recording("Broken.ts", b"partial");
        let older = h.recording("Older.ts", b"older");
        let t = now();
        let app = h.app(
            vec![
                entry("broken", t - 3600, t - 60, Some(&broken)),
                entry("older", t - 7200, t - 3600, Some(&older)),
            ],
            FakeProbe::healthy(),
        );

        let status = app
            .run(Mode::Transfer {
                file: broken.clone(),
                event: Some("Data errors".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
        assert!(broken.exists());
        assert!(!h.share.join("Broken.ts").exists());
        assert!(h.share.join("Older.ts").exists());
        assert_eq!(h.mail.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_share_alerts_once() {
        let mut h = Harness::new();
        h.config.share_path = h.share.join("gone");
        let rec = h.recording("News.ts", b"news");
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: None,
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
        assert!(rec.exists());
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "NFS share not accessible");
    }

    #[tokio::test]
    async fn test_transfer_failure_survives_mail_failure() {
        let h = Harness::new();
        let app = App::with_parts(
            h.config.clone(),
            Box::new(FixedSchedule(vec![])),
            Box::new(FakeProbe::healthy()),
            Notifier::new(Arc::new(RecordingTransport {
                fail: true,
                ..Default::default()
            })),
        );

        let status = app
            .run(Mode::Transfer {
                file: h.local.join("missing.ts"),
                event: None,
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
    }

    #[tokio::test]
    async fn test_process_transfers_backlog() {
        let h = Harness::new();
        let a = h.recording("A.ts", b"first");
        let b = h.recording("B.ts", b"second");
        let t = now();
        let app = h.app(
            vec![
                entry("a", t - 7200, t - 3600, Some(&a)),
                entry("b", t - 3000, t - 1200, Some(&b)),
                entry("gone", t - 3000, t - 1200, Some(&h.local.join("gone.ts"))),
            ],
            FakeProbe::healthy(),
        );

        assert_eq!(app.run(Mode::Process { subfolder: None }).await, Status::Ok);
        assert_eq!(std::fs::read(h.share.join("A.ts")).unwrap(), b"first");
        assert_eq!(std::fs::read(h.share.join("B.ts")).unwrap(), b"second");
        assert!(!a.exists() && !b.exists());
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_process_reports_insufficient_space() {
        let h = Harness::new();
        let a = h.recording("A.ts", &[7u8; 4096]);
        let t = now();
        let mut probe = FakeProbe::healthy();
        probe.available = Some(1024);
        let app = h.app(vec![entry("a", t - 7200, t - 3600, Some(&a))], probe);

        assert_eq!(app.run(Mode::Process { subfolder: None }).await, Status::Failed);
        assert!(a.exists());
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("insufficient space"), "{}", sent[0].text);
    }

    #[tokio::test]
    async fn test_second_instance_is_deferred() {
        let h = Harness::new();
        let mut probe = FakeProbe::healthy();
        probe.live_pids.push(4242);
        std::fs::write(&h.config.lock_file, "4242").unwrap();
        let app = h.app(vec![], probe);

        assert_eq!(app.run(Mode::Process { subfolder: None }).await, Status::Deferred);
        assert!(h.config.lock_file.exists());
    }

    #[tokio::test]
    async fn test_check_mode_is_silent_when_healthy() {
        let h = Harness::new();
        let app = h.app(vec![], FakeProbe::healthy());

        assert_eq!(app.run(Mode::Check).await, Status::Ok);
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_check_mode_alerts_once_when_service_down() {
        let h = Harness::new();
        let mut probe = FakeProbe::healthy();
        probe.running.clear();
        let app = h.app(vec![], probe);

        assert_eq!(app.run(Mode::Check).await, Status::Failed);
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("tvheadend is not running"));
    }

    #[tokio::test]
    async fn test_test_mode_sends_exactly_one_email() {
        let h = Harness::new();
        let t = now();
        let app = h.app(vec![entry("next", t + 7200, t + 9000, None)], FakeProbe::healthy());

        // HTSP is unreachable in this harness, so the run fails overall
        assert_eq!(app.run(Mode::Test).await, Status::Failed);

        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Network PVR Test Email");
        let body = &sent[0].text;
        assert!(body.contains("[OK  ] checksum"), "{}", body);
        assert!(body.contains("[OK  ] share"), "{}", body);
        assert!(body.contains("[OK  ] free space"), "{}", body);
        assert!(body.contains("[OK  ] service"), "{}", body);
        assert!(body.contains("[OK  ] schedule"), "{}", body);
        assert!(body.contains("[OK  ] dry-run transfer"), "{}", body);
        assert!(body.contains("[FAIL] htsp"), "{}", body);

        // The dry run leaves nothing behind on the share
        assert!(std::fs::read_dir(&h.share).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_test_mode_passes_with_reachable_htsp() {
        let port = FakeServer::default().start().await;

        let mut h = Harness::new();
        h.config.htsp.port = port;
        let app = h.app(vec![], FakeProbe::healthy());

        assert_eq!(app.run(Mode::Test).await, Status::Ok);
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].text.contains("[FAIL]"), "{}", sent[0].text);
    }

    fn sha256(data: &[u8]) -> String {
        use sha2::Digest;
        format!("{:x}", sha2::Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_stale_checksum_file_never_hides_new_recording() {
        let h = Harness::new();
        let rec = h.recording("News.ts", b"NEW!");
        std::fs::write(h.local.join("News.sha2"), format!("{} *News.ts\n", sha256(b"OLD!"))).unwrap();
        std::fs::write(h.share.join("News.ts"), b"OLD!").unwrap();
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("OK".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Ok);
        assert_eq!(std::fs::read(h.share.join("News.ts")).unwrap(), b"NEW!");
        assert_eq!(
            checksum::read_sidecar(&h.share.join("News.sha2")),
            Some(sha256(b"NEW!"))
        );
        assert!(!rec.exists());
    }

    #[tokio::test]
    async fn test_stale_checksum_file_does_not_fail_good_copy() {
        let h = Harness::new();
        let rec = h.recording("Film.ts", b"film");
        std::fs::write(h.local.join("Film.sha2"), format!("{} *Film.ts\n", sha256(b"other"))).unwrap();
        let app = h.app(vec![], FakeProbe::healthy());

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: None,
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Ok);
        assert_eq!(std::fs::read(h.share.join("Film.ts")).unwrap(), b"film");
        assert_eq!(
            checksum::read_sidecar(&h.share.join("Film.sha2")),
            Some(sha256(b"film"))
        );
        assert!(h.mail.sent().is_empty());
    }

    // Same length as the input, first byte flipped
    fn corrupting_copy(
        input: &mut std::fs::File,
        output: &mut std::fs::File,
    ) -> std::io::Result<u64> {
        use std::io::{Read, Write};

        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        if let Some(first) = data.first_mut() {
            *first ^= 0xff;
        }
        output.write_all(&data)?;
        Ok(data.len() as u64)
    }

    #[tokio::test]
    async fn test_corrupted_copy_keeps_source_and_alerts() {
        let h = Harness::new();
        let rec = h.recording("News.ts", b"evening news");
        let app = h.app(vec![], FakeProbe::healthy()).with_copy(corrupting_copy);

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("OK".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
        assert!(rec.exists());
        assert!(!h.share.join("News.sha2").exists());
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "File transfer failed");
        assert!(sent[0].text.contains("checksum mismatch"), "{}", sent[0].text);
    }

    #[tokio::test]
    async fn test_sweep_does_not_retry_failed_transfer() {
        let h = Harness::new();
        let rec = h.recording("News.ts", &[7u8; 4096]);
        let t = now();
        let mut probe = FakeProbe::healthy();
        probe.available = Some(1024);
        let app = h.app(vec![entry("news", t - 3600, t - 60, Some(&rec))], probe);

        let status = app
            .run(Mode::Transfer {
                file: rec.clone(),
                event: Some("OK".into()),
                subfolder: None,
            })
            .await;

        assert_eq!(status, Status::Failed);
        assert!(rec.exists());
        let sent = h.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text.matches("[FAIL] News.ts").count(), 1, "{}", sent[0].text);
    }

    /// Serves `first` once, then `later` on every following read
    struct ChangingSchedule {
        reads: std::sync::atomic::AtomicUsize,
        first: Vec<ScheduledRecording>,
        later: Vec<ScheduledRecording>,
    }

    #[async_trait::async_trait]
    impl RecordingSchedule for ChangingSchedule {
        async fn list_recordings(&self) -> anyhow::Result<Vec<ScheduledRecording>> {
            let read = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(if read == 0 {
                self.first.clone()
            } else {
                self.later.clone()
            })
        }
    }

    #[tokio::test]
    async fn test_backlog_rereads_schedule_between_recordings() {
        let h = Harness::new();
        let a = h.recording("A.ts", b"first");
        let b = h.recording("B.ts", b"second");
        let t = now();
        let finished = vec![
            entry("a", t - 7200, t - 3600, Some(&a)),
            entry("b", t - 3000, t - 1200, Some(&b)),
        ];
        let mut later = finished.clone();
        later.push(entry("new", t + 300, t + 3900, None));

        let app = App::with_parts(
            h.config.clone(),
            Box::new(ChangingSchedule {
                reads: Default::default(),
                first: finished,
                later,
            }),
            Box::new(FakeProbe::healthy()),
            Notifier::new(h.mail.clone()),
        );

        assert_eq!(app.run(Mode::Process { subfolder: None }).await, Status::Deferred);
        assert!(h.share.join("A.ts").exists());
        assert!(!a.exists());
        assert!(b.exists());
        assert!(!h.share.join("B.ts").exists());
        assert!(h.mail.sent().is_empty());
    }
}
