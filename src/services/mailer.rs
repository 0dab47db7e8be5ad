use crate::config::{MailConfig, MailTransportKind, OAuth2Config, SmtpConfig};
use crate::error::TransferError;
use crate::report::Report;
use async_trait::async_trait;
use chrono::Utc;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Delivers a finished message to the configured recipient
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransferError>;
}

#[derive(Clone)]
struct Envelope {
    from: Mailbox,
    reply_to: Mailbox,
    to: Mailbox,
}

impl Envelope {
    fn from_config(config: &MailConfig) -> Result<Self, TransferError> {
        let parse = |name: Option<String>, addr: &str| -> Result<Mailbox, TransferError> {
            let address = addr
                .parse::<lettre::Address>()
                .map_err(|e| TransferError::ConfigError(format!("invalid address {:?}: {}", addr, e)))?;
            Ok(Mailbox::new(name, address))
        };

        let from = parse(Some(config.sender_name.clone()), &config.sender)?;
        let reply_to = match &config.reply_to {
            Some(addr) => parse(None, addr)?,
            None => from.clone(),
        };
        let to = parse(None, &config.recipient)?;

        Ok(Self { from, reply_to, to })
    }

    fn build(&self, mail: &OutgoingMail) -> Result<Message, TransferError> {
        Message::builder()
            .from(self.from.clone())
            .reply_to(self.reply_to.clone())
            .to(self.to.clone())
            .subject(mail.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                mail.text.clone(),
                mail.html.clone(),
            ))
            .map_err(|e| TransferError::MailSendFailure(format!("failed to build message: {}", e)))
    }
}

pub struct SmtpMailer {
    envelope: Envelope,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    fn new(envelope: Envelope, config: &SmtpConfig) -> Result<Self, TransferError> {
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
                .map_err(|e| TransferError::ConfigError(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
        };
        builder = builder.port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            envelope,
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransferError> {
        let message = self.envelope.build(mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| TransferError::MailSendFailure(e.to_string()))?;
        Ok(())
    }
}

const GMAIL_SMTP: &str = "smtp.gmail.com";

/// Refresh this long before the recorded expiry
const TOKEN_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Contents of `token_file`
#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    /// Unix seconds
    expires_at: i64,
}

/// SMTP with XOAUTH2: the refresh token is traded for a short-lived access
/// token, cached in `token_file` until it expires
pub struct OAuth2Mailer {
    envelope: Envelope,
    user: String,
    server: String,
    port: u16,
    oauth: OAuth2Config,
    client: reqwest::Client,
}

impl OAuth2Mailer {
    fn new(envelope: Envelope, config: &MailConfig) -> Self {
        let server = if config.smtp.server.is_empty() {
            GMAIL_SMTP.to_string()
        } else {
            config.smtp.server.clone()
        };

        Self {
            envelope,
            user: config.sender.clone(),
            server,
            port: config.smtp.port,
            oauth: config.oauth2.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn access_token(&self) -> Result<String, TransferError> {
        let now = Utc::now().timestamp();

        if let Some(path) = &self.oauth.token_file {
            match read_cached_token(path).await {
                Some(cached) if cached.expires_at > now + TOKEN_MARGIN_SECS => {
                    return Ok(cached.access_token);
                }
                Some(_) => tracing::info!("Access token expired. Generating a new token."),
                None => {}
            }
        }

        let token = self.refresh().await?;

        if let Some(path) = &self.oauth.token_file {
            let cached = CachedToken {
                access_token: token.access_token.clone(),
                expires_at: now.saturating_add(token.expires_in),
            };
            if let Err(e) = write_cached_token(path, &cached).await {
                tracing::warn!("Failed to cache access token in {:?}: {:#}", path, e);
            }
        }

        Ok(token.access_token)
    }

    async fn refresh(&self) -> Result<TokenResponse, TransferError> {
        let failed = |e: reqwest::Error| {
            TransferError::MailSendFailure(format!("OAuth2 token refresh failed: {}", e))
        };

        self.client
            .post(&self.oauth.token_url)
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", self.oauth.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(failed)?
            .error_for_status()
            .map_err(failed)?
            .json::<TokenResponse>()
            .await
            .map_err(failed)
    }
}

async fn read_cached_token(path: &Path) -> Option<CachedToken> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&contents) {
        Ok(cached) => Some(cached),
        Err(e) => {
            tracing::warn!("Ignoring unreadable token file {:?}: {}", path, e);
            None
        }
    }
}

async fn write_cached_token(path: &Path, cached: &CachedToken) -> anyhow::Result<()> {
    let contents = serde_json::to_string(cached)?;
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl MailTransport for OAuth2Mailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransferError> {
        let message = self.envelope.build(mail)?;
        let token = self.access_token().await?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.server)
            .map_err(|e| TransferError::ConfigError(format!("invalid SMTP relay: {}", e)))?
            .port(self.port)
            .credentials(Credentials::new(self.user.clone(), token))
            .authentication(vec![Mechanism::Xoauth2])
            .build();

        transport
            .send(message)
            .await
            .map_err(|e| TransferError::MailSendFailure(e.to_string()))?;
        Ok(())
    }
}

/// Pipes the formatted message into a sendmail-compatible binary (ssmtp, msmtp, ...)
pub struct SendmailMailer {
    envelope: Envelope,
    binary: PathBuf,
    recipient: String,
}

#[async_trait]
impl MailTransport for SendmailMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransferError> {
        let message = self.envelope.build(mail)?;

        let mut child = Command::new(&self.binary)
            .arg(&self.recipient)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                TransferError::MailSendFailure(format!("failed to spawn {:?}: {}", self.binary, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&message.formatted())
                .await
                .map_err(|e| TransferError::MailSendFailure(format!("failed to write message: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransferError::MailSendFailure(format!("failed to wait on {:?}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::MailSendFailure(format!(
                "{:?} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Sends reports; delivery problems are logged, never propagated
#[derive(Clone)]
pub struct Notifier {
    transport: Option<Arc<dyn MailTransport>>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn disabled() -> Self {
        Self { transport: None }
    }

    pub fn from_config(config: &MailConfig) -> Result<Self, TransferError> {
        let transport: Arc<dyn MailTransport> = match config.transport {
            MailTransportKind::Disabled => return Ok(Self::disabled()),
            MailTransportKind::Smtp => {
                Arc::new(SmtpMailer::new(Envelope::from_config(config)?, &config.smtp)?)
            }
            MailTransportKind::Oauth2 => {
                Arc::new(OAuth2Mailer::new(Envelope::from_config(config)?, config))
            }
            MailTransportKind::Sendmail => Arc::new(SendmailMailer {
                envelope: Envelope::from_config(config)?,
                binary: config.sendmail_binary.clone(),
                recipient: config.recipient.clone(),
            }),
        };

        Ok(Self::new(transport))
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// True when the report was handed to the mail transport
    pub async fn send_report(&self, report: &Report) -> bool {
        let Some(transport) = &self.transport else {
            tracing::info!("Mail disabled, not sending \"{}\"", report.subject);
            return false;
        };

        let mail = OutgoingMail {
            subject: report.subject.clone(),
            text: report.text_body(),
            html: report.html_body(),
        };

        match transport.send(&mail).await {
            Ok(()) => {
                tracing::info!("Email sent: {}", report.subject);
                true
            }
            Err(e) => {
                tracing::error!("Error sending email \"{}\": {}", report.subject, e);
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::RecordingTransport;
    use super::*;
    use crate::report::CheckResult;

    fn report() -> Report {
        let mut report = Report::new("Network PVR Test Email");
        report.push(CheckResult::pass("share", "mounted"));
        report
    }

    fn mail_config() -> MailConfig {
        MailConfig {
            recipient: "me@example.com".into(),
            sender: "pvr@example.com".into(),
            ..MailConfig::default()
        }
    }

    #[tokio::test]
    async fn test_report_is_rendered_into_mail() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone());

        assert!(notifier.send_report(&report()).await);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Network PVR Test Email");
        assert!(sent[0].text.contains("[OK  ] share: mounted"));
        assert!(sent[0].html.contains("<table>"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_swallowed() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let notifier = Notifier::new(transport);

        assert!(!notifier.send_report(&report()).await);
    }

    #[tokio::test]
    async fn test_disabled_notifier_sends_nothing() {
        let notifier = Notifier::from_config(&MailConfig {
            transport: MailTransportKind::Disabled,
            ..MailConfig::default()
        })
        .unwrap();

        assert!(!notifier.is_enabled());
        assert!(!notifier.send_report(&report()).await);
    }

    #[test]
    fn test_invalid_sender_is_a_config_error() {
        let config = MailConfig {
            sender: "not an address".into(),
            ..mail_config()
        };
        assert!(matches!(
            Notifier::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_message_headers() {
        let config = MailConfig {
            reply_to: Some("owner@example.com".into()),
            ..mail_config()
        };
        let envelope = Envelope::from_config(&config).unwrap();
        let message = envelope
            .build(&OutgoingMail {
                subject: "File transfer failed".into(),
                text: "plain".into(),
                html: "<p>html</p>".into(),
            })
            .unwrap();

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: File transfer failed"));
        assert!(raw.contains("To: me@example.com"));
        assert!(raw.contains("Reply-To: owner@example.com"));
        assert!(raw.contains("multipart/alternative"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sendmail_pipes_message_to_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let captured = dir.path().join("captured.eml");
        let script = dir.path().join("fake-sendmail");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1\" > '{0}.rcpt'\ncat > '{0}'\n", captured.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = MailConfig {
            sendmail_binary: script,
            ..mail_config()
        };
        let notifier = Notifier::from_config(&config).unwrap();
        assert!(notifier.send_report(&report()).await);

        let raw = std::fs::read_to_string(&captured).unwrap();
        assert!(raw.contains("Subject: Network PVR Test Email"));
        let rcpt = std::fs::read_to_string(format!("{}.rcpt", captured.display())).unwrap();
        assert_eq!(rcpt.trim(), "me@example.com");
    }

    /// Token endpoint answering every POST with `body`; counts requests
    async fn token_endpoint(body: &'static str) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !String::from_utf8_lossy(&request).contains("grant_type=refresh_token") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (url, hits)
    }

    fn oauth_config(token_url: String, token_file: Option<PathBuf>) -> MailConfig {
        MailConfig {
            transport: MailTransportKind::Oauth2,
            oauth2: OAuth2Config {
                client_id: "id".into(),
                client_secret: "secret".into(),
                refresh_token: "refresh".into(),
                token_url,
                token_file,
            },
            ..mail_config()
        }
    }

    fn oauth_mailer(config: &MailConfig) -> OAuth2Mailer {
        OAuth2Mailer::new(Envelope::from_config(config).unwrap(), config)
    }

    #[tokio::test]
    async fn test_cached_access_token_is_reused_until_expiry() {
        use std::sync::atomic::Ordering;

        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token.json");
        let (url, hits) = token_endpoint(r#"{"access_token": "fresh", "expires_in": 3600}"#).await;
        let mailer = oauth_mailer(&oauth_config(url, Some(token_file.clone())));

        let valid = CachedToken {
            access_token: "cached".into(),
            expires_at: Utc::now().timestamp() + 600,
        };
        std::fs::write(&token_file, serde_json::to_string(&valid).unwrap()).unwrap();
        assert_eq!(mailer.access_token().await.unwrap(), "cached");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let expired = CachedToken {
            access_token: "cached".into(),
            expires_at: Utc::now().timestamp() - 1,
        };
        std::fs::write(&token_file, serde_json::to_string(&expired).unwrap()).unwrap();
        assert_eq!(mailer.access_token().await.unwrap(), "fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let saved: CachedToken =
            serde_json::from_str(&std::fs::read_to_string(&token_file).unwrap()).unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert!(saved.expires_at > Utc::now().timestamp() + 3000);

        // Now cached again
        assert_eq!(mailer.access_token().await.unwrap(), "fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_token_file_every_mail_refreshes() {
        use std::sync::atomic::Ordering;

        let (url, hits) = token_endpoint(r#"{"access_token": "fresh", "expires_in": 3600}"#).await;
        let mailer = oauth_mailer(&oauth_config(url, None));

        mailer.access_token().await.unwrap();
        mailer.access_token().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bad_token_response_is_a_send_failure() {
        let (url, _) = token_endpoint(r#"{"error": "invalid_grant"}"#).await;
        let mailer = oauth_mailer(&oauth_config(url, None));

        assert!(matches!(
            mailer.access_token().await,
            Err(TransferError::MailSendFailure(_))
        ));
    }

    #[test]
    fn test_oauth2_defaults_to_gmail() {
        let config = oauth_config("http://127.0.0.1:1/token".into(), None);
        let mailer = oauth_mailer(&config);
        assert_eq!(mailer.server, GMAIL_SMTP);
        assert_eq!(mailer.port, 587);
        assert_eq!(mailer.user, "pvr@example.com");
        assert!(Notifier::from_config(&config).unwrap().is_enabled());
    }
}
