use crate::config::{Config, HtspConfig, ScheduleSource};
use crate::services::htsp::{self, HtsMsg, HtsValue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One TVHeadend DVR entry, as stored in `dvr/log/<id>`
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledRecording {
    #[serde(skip)]
    pub id: String,

    /// Unix seconds
    pub start: i64,

    /// Unix seconds
    pub stop: i64,

    /// Padding before `start`, in minutes
    #[serde(default)]
    pub start_extra: i64,

    /// Padding after `stop`, in minutes
    #[serde(default)]
    pub stop_extra: i64,

    /// Language map (`{"eng": "News"}`) on current TVHeadend, a plain string on old ones
    #[serde(default)]
    title: Option<serde_json::Value>,

    #[serde(default)]
    filename: Option<PathBuf>,

    #[serde(default)]
    files: Vec<DvrFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct DvrFile {
    filename: PathBuf,
}

impl ScheduledRecording {
    pub fn window_start(&self) -> i64 {
        self.start
            .saturating_sub(self.start_extra.max(0).saturating_mul(60))
    }

    pub fn window_end(&self) -> i64 {
        self.stop
            .saturating_add(self.stop_extra.max(0).saturating_mul(60))
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp();
        self.window_start() < now && now < self.window_end()
    }

    pub fn starts_within(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        let start = self.window_start();
        now.timestamp() < start && start < (now + lookahead).timestamp()
    }

    pub fn is_finished(&self, now: DateTime<Utc>) -> bool {
        self.window_end() < now.timestamp()
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.window_start(), 0)
    }

    pub fn file(&self) -> Option<&Path> {
        self.filename
            .as_deref()
            .or_else(|| self.files.first().map(|f| f.filename.as_path()))
    }

    /// Map a `dvrEntryAdd` message; entries without a time window are dropped
    fn from_htsp(msg: &HtsMsg) -> Option<Self> {
        let files = match msg.get("files") {
            Some(HtsValue::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    HtsValue::Map(fields) => fields.iter().find_map(|(name, value)| match value {
                        HtsValue::Str(path) if name == "filename" => Some(DvrFile {
                            filename: PathBuf::from(path),
                        }),
                        _ => None,
                    }),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            id: msg.get_s64("id")?.to_string(),
            start: msg.get_s64("start")?,
            stop: msg.get_s64("stop")?,
            start_extra: msg.get_s64("startExtra").unwrap_or(0),
            stop_extra: msg.get_s64("stopExtra").unwrap_or(0),
            title: msg
                .get_str("title")
                .map(|title| serde_json::Value::String(title.to_string())),
            filename: msg
                .get_str("filename")
                .filter(|f| !f.is_empty())
                .map(PathBuf::from),
            files,
        })
    }

    pub fn title(&self) -> String {
        match &self.title {
            Some(serde_json::Value::String(title)) => title.clone(),
            Some(serde_json::Value::Object(langs)) => langs
                .values()
                .find_map(|v| v.as_str())
                .unwrap_or(self.id.as_str())
                .to_string(),
            _ => self.id.clone(),
        }
    }
}

/// Source of TVHeadend's recording schedule
#[async_trait]
pub trait RecordingSchedule: Send + Sync {
    async fn list_recordings(&self) -> Result<Vec<ScheduledRecording>>;
}

/// Reads TVHeadend's on-disk DVR log directory
pub struct DvrLog {
    dir: PathBuf,
}

impl DvrLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecordingSchedule for DvrLog {
    async fn list_recordings(&self) -> Result<Vec<ScheduledRecording>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read DVR log directory {:?}", self.dir))?;
        let mut recordings = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }

            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    tracing::warn!("Skipping unreadable DVR entry {:?}: {}", path, e);
                    continue;
                }
            };

            match serde_json::from_str::<ScheduledRecording>(&contents) {
                Ok(mut recording) => {
                    recording.id = entry.file_name().to_string_lossy().into_owned();
                    recordings.push(recording);
                }
                Err(e) => tracing::warn!("Skipping malformed DVR entry {:?}: {}", path, e),
            }
        }

        tracing::debug!("Read {} DVR entries from {:?}", recordings.len(), self.dir);
        Ok(recordings)
    }
}

/// Asks the running TVHeadend for its DVR entries over HTSP
pub struct HtspSchedule {
    config: HtspConfig,
}

impl HtspSchedule {
    pub fn new(config: HtspConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecordingSchedule for HtspSchedule {
    async fn list_recordings(&self) -> Result<Vec<ScheduledRecording>> {
        let sync = async {
            let (mut session, _) = htsp::open_session(&self.config).await?;
            session.dvr_entries().await
        };
        let entries = tokio::time::timeout(std::time::Duration::from_secs(self.config.timeout_secs), sync)
            .await
            .with_context(|| {
                format!(
                    "No DVR entries from {}:{} within {}s",
                    self.config.host, self.config.port, self.config.timeout_secs
                )
            })??;

        let recordings: Vec<ScheduledRecording> = entries
            .iter()
            .filter_map(ScheduledRecording::from_htsp)
            .collect();
        if recordings.len() < entries.len() {
            tracing::warn!(
                "Ignored {} DVR entries without start/stop times",
                entries.len() - recordings.len()
            );
        }
        Ok(recordings)
    }
}

/// Reads `primary`, and `fallback` whenever `primary` fails
pub struct FallbackSchedule {
    primary: Box<dyn RecordingSchedule>,
    fallback: Box<dyn RecordingSchedule>,
}

impl FallbackSchedule {
    pub fn new(primary: Box<dyn RecordingSchedule>, fallback: Box<dyn RecordingSchedule>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl RecordingSchedule for FallbackSchedule {
    async fn list_recordings(&self) -> Result<Vec<ScheduledRecording>> {
        match self.primary.list_recordings().await {
            Ok(recordings) => Ok(recordings),
            Err(primary) => {
                tracing::warn!("Falling back to the DVR log: {:#}", primary);
                self.fallback
                    .list_recordings()
                    .await
                    .map_err(|fallback| anyhow::anyhow!("{:#}; fallback also failed: {:#}", primary, fallback))
            }
        }
    }
}

/// Schedule source selected by `schedule_source`
pub fn from_config(config: &Config) -> Box<dyn RecordingSchedule> {
    match config.schedule_source {
        ScheduleSource::Htsp => Box::new(FallbackSchedule::new(
            Box::new(HtspSchedule::new(config.htsp.clone())),
            Box::new(DvrLog::new(&config.dvr_log_dir)),
        )),
        ScheduleSource::DvrLog => Box::new(DvrLog::new(&config.dvr_log_dir)),
    }
}

/// Finished recordings whose files are still on local storage
pub fn completed_recordings(recordings: &[ScheduledRecording], now: DateTime<Utc>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = recordings
        .iter()
        .filter(|r| r.is_finished(now))
        .filter_map(|r| r.file())
        .filter(|f| f.exists())
        .map(Path::to_path_buf)
        .collect();
    files.sort();
    files.dedup();
    files
}

pub fn next_start(recordings: &[ScheduledRecording], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    recordings
        .iter()
        .filter_map(|r| r.starts_at())
        .filter(|start| *start > now)
        .min()
}
