use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One week
const MAX_LOOKAHEAD_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Mounted network share that receives finished recordings
    #[serde(default)]
    pub share_path: PathBuf,

    /// Where the recording schedule comes from
    #[serde(default = "default_schedule_source")]
    pub schedule_source: ScheduleSource,

    /// TVHeadend's directory of DVR log entries (one JSON file per entry)
    #[serde(default = "default_dvr_log_dir")]
    pub dvr_log_dir: PathBuf,

    /// Minimum gap before the next scheduled recording for a transfer to start
    #[serde(default = "default_lookahead_minutes")]
    pub lookahead_minutes: i64,

    #[serde(default = "default_true")]
    pub remove_source: bool,

    #[serde(default = "default_true")]
    pub sweep_after_transfer: bool,

    /// Local recording storage watched by the free space check
    #[serde(default = "default_free_space_path")]
    pub free_space_path: PathBuf,

    #[serde(default = "default_free_space_threshold_mb")]
    pub free_space_threshold_mb: u64,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_true")]
    pub require_mount: bool,

    #[serde(default = "default_share_timeout")]
    pub share_timeout_secs: u64,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub htsp: HtspConfig,

    #[serde(default)]
    pub mail: MailConfig,
}

/// `htsp` asks TVHeadend and reads `dvr_log_dir` if that fails; `dvr_log` only reads the directory
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    Htsp,
    DvrLog,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtspConfig {
    #[serde(default = "default_htsp_host")]
    pub host: String,

    #[serde(default = "default_htsp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_htsp_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MailTransportKind {
    Smtp,
    /// SMTP authenticated with XOAUTH2 (Gmail)
    Oauth2,
    Sendmail,
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailConfig {
    #[serde(default = "default_transport")]
    pub transport: MailTransportKind,

    #[serde(default)]
    pub recipient: String,

    #[serde(default)]
    pub sender: String,

    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    #[serde(default)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub oauth2: OAuth2Config,

    #[serde(default = "default_sendmail_binary")]
    pub sendmail_binary: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub starttls: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuth2Config {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Access token cache; without it a fresh token is requested for every mail
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_schedule_source() -> ScheduleSource {
    ScheduleSource::Htsp
}

fn default_dvr_log_dir() -> PathBuf {
    PathBuf::from("/home/hts/.hts/tvheadend/dvr/log")
}

fn default_lookahead_minutes() -> i64 {
    60
}

fn default_free_space_path() -> PathBuf {
    PathBuf::from("/home/hts/recordings")
}

fn default_free_space_threshold_mb() -> u64 {
    2048
}

fn default_service_name() -> String {
    "tvheadend".to_string()
}

fn default_share_timeout() -> u64 {
    15
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("pvr-transfer.lock")
}

fn default_htsp_host() -> String {
    "localhost".to_string()
}

fn default_htsp_port() -> u16 {
    9982
}

fn default_htsp_timeout() -> u64 {
    10
}

fn default_transport() -> MailTransportKind {
    MailTransportKind::Sendmail
}

fn default_sender_name() -> String {
    "Network PVR".to_string()
}

fn default_sendmail_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/ssmtp")
}

fn default_smtp_port() -> u16 {
    587
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl Default for HtspConfig {
    fn default() -> Self {
        Self {
            host: default_htsp_host(),
            port: default_htsp_port(),
            username: None,
            password: None,
            timeout_secs: default_htsp_timeout(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_smtp_port(),
            starttls: true,
            username: None,
            password: None,
        }
    }
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            token_url: default_token_url(),
            token_file: None,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            recipient: String::new(),
            sender: String::new(),
            sender_name: default_sender_name(),
            reply_to: None,
            smtp: SmtpConfig::default(),
            oauth2: OAuth2Config::default(),
            sendmail_binary: default_sendmail_binary(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            share_path: PathBuf::new(),
            schedule_source: default_schedule_source(),
            dvr_log_dir: default_dvr_log_dir(),
            lookahead_minutes: default_lookahead_minutes(),
            remove_source: true,
            sweep_after_transfer: true,
            free_space_path: default_free_space_path(),
            free_space_threshold_mb: default_free_space_threshold_mb(),
            service_name: default_service_name(),
            require_mount: true,
            share_timeout_secs: default_share_timeout(),
            lock_file: default_lock_file(),
            htsp: HtspConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location
    /// (~/.config/pvr-transfer/config.json) when none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save(&config_path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("pvr-transfer").join("config.json"))
    }

    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lookahead_minutes)
    }

    pub fn free_space_threshold_bytes(&self) -> u64 {
        self.free_space_threshold_mb.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        if self.share_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("share_path cannot be empty"));
        }

        if !(0..=MAX_LOOKAHEAD_MINUTES).contains(&self.lookahead_minutes) {
            return Err(anyhow::anyhow!(
                "lookahead_minutes must be between 0 and {}",
                MAX_LOOKAHEAD_MINUTES
            ));
        }

        if self.service_name.is_empty() {
            return Err(anyhow::anyhow!("service_name cannot be empty"));
        }

        if self.share_timeout_secs == 0 {
            return Err(anyhow::anyhow!("share_timeout_secs must be at least 1"));
        }

        if self.htsp.username.is_some() && self.htsp.password.is_none() {
            return Err(anyhow::anyhow!("htsp.password is required when htsp.username is set"));
        }

        match self.mail.transport {
            MailTransportKind::Disabled => {}
            MailTransportKind::Smtp | MailTransportKind::Oauth2 | MailTransportKind::Sendmail => {
                if self.mail.recipient.is_empty() {
                    return Err(anyhow::anyhow!("mail.recipient cannot be empty"));
                }
                if self.mail.sender.is_empty() {
                    return Err(anyhow::anyhow!("mail.sender cannot be empty"));
                }
                if self.mail.transport == MailTransportKind::Smtp && self.mail.smtp.server.is_empty()
                {
                    return Err(anyhow::anyhow!("mail.smtp.server cannot be empty"));
                }
                if self.mail.transport == MailTransportKind::Oauth2 {
                    let oauth2 = &self.mail.oauth2;
                    if oauth2.client_id.is_empty()
                        || oauth2.client_secret.is_empty()
                        || oauth2.refresh_token.is_empty()
                    {
                        return Err(anyhow::anyhow!(
                            "mail.oauth2 needs client_id, client_secret and refresh_token"
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
