//! Just enough of TVHeadend's HTSP for this tool: a binary htsmsg codec, the
//! `hello` and `authenticate` calls, and the initial metadata sync that lists
//! DVR entries.

use crate::config::HtspConfig;
use crate::error::TransferError;
use crate::report::CheckResult;
use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HTSP_VERSION: i64 = 25;
const CLIENT_NAME: &str = "pvr-transfer";
const MAX_MESSAGE: usize = 16 * 1024 * 1024;

const TYPE_MAP: u8 = 1;
const TYPE_S64: u8 = 2;
const TYPE_STR: u8 = 3;
const TYPE_BIN: u8 = 4;
const TYPE_LIST: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum HtsValue {
    Map(Vec<(String, HtsValue)>),
    S64(i64),
    Str(String),
    Bin(Vec<u8>),
    List(Vec<HtsValue>),
}

/// Top-level htsmsg: an ordered map of named fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtsMsg {
    pub fields: Vec<(String, HtsValue)>,
}

impl HtsMsg {
    pub fn method(name: &str) -> Self {
        Self::default().with("method", HtsValue::Str(name.to_string()))
    }

    pub fn with(mut self, name: &str, value: HtsValue) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&HtsValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            HtsValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_s64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            HtsValue::S64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bin(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            HtsValue::Bin(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Length-prefixed wire form
    pub fn encode(&self) -> Vec<u8> {
        let body = encode_fields(&mut self.fields.iter().map(|(n, v)| (n.as_str(), v)));
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a message body (without the length prefix)
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: decode_fields(body)?,
        })
    }
}

// Nested maps and lists recurse, so the iterator is a trait object
fn encode_fields<'a>(fields: &mut dyn Iterator<Item = (&'a str, &'a HtsValue)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        let (kind, data) = match value {
            HtsValue::Map(entries) => (
                TYPE_MAP,
                encode_fields(&mut entries.iter().map(|(n, v)| (n.as_str(), v))),
            ),
            HtsValue::S64(v) => (TYPE_S64, encode_s64(*v)),
            HtsValue::Str(s) => (TYPE_STR, s.as_bytes().to_vec()),
            HtsValue::Bin(b) => (TYPE_BIN, b.clone()),
            HtsValue::List(items) => (TYPE_LIST, encode_fields(&mut items.iter().map(|v| ("", v)))),
        };
        out.push(kind);
        out.push(name.len() as u8);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&data);
    }
    out
}

// Little endian with trailing zero bytes dropped
fn encode_s64(value: i64) -> Vec<u8> {
    let mut bytes = (value as u64).to_le_bytes().to_vec();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

fn decode_s64(data: &[u8]) -> Result<i64> {
    if data.len() > 8 {
        bail!("s64 field too long: {} bytes", data.len());
    }
    let mut bytes = [0u8; 8];
    bytes[..data.len()].copy_from_slice(data);
    Ok(u64::from_le_bytes(bytes) as i64)
}

fn decode_fields(mut buf: &[u8]) -> Result<Vec<(String, HtsValue)>> {
    let mut fields = Vec::new();

    while !buf.is_empty() {
        if buf.len() < 6 {
            bail!("truncated htsmsg field header");
        }
        let kind = buf[0];
        let name_len = buf[1] as usize;
        let data_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        buf = &buf[6..];

        if buf.len() < name_len + data_len {
            bail!("truncated htsmsg field body");
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        let data = &buf[name_len..name_len + data_len];
        buf = &buf[name_len + data_len..];

        let value = match kind {
            TYPE_MAP => HtsValue::Map(decode_fields(data)?),
            TYPE_S64 => HtsValue::S64(decode_s64(data)?),
            TYPE_STR => HtsValue::Str(String::from_utf8_lossy(data).into_owned()),
            TYPE_BIN => HtsValue::Bin(data.to_vec()),
            TYPE_LIST => HtsValue::List(decode_fields(data)?.into_iter().map(|(_, v)| v).collect()),
            other => bail!("unknown htsmsg field type {}", other),
        };
        fields.push((name, value));
    }

    Ok(fields)
}

/// What the server told us in its `hello` reply
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub htsp_version: i64,
    pub challenge: Vec<u8>,
}

pub struct HtspSession {
    stream: TcpStream,
    seq: i64,
}

impl HtspSession {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        Ok(Self { stream, seq: 0 })
    }

    async fn send(&mut self, request: HtsMsg) -> Result<()> {
        self.seq += 1;
        let request = request.with("seq", HtsValue::S64(self.seq));
        self.stream
            .write_all(&request.encode())
            .await
            .context("Failed to send HTSP request")
    }

    async fn read_message(&mut self) -> Result<HtsMsg> {
        let mut len = [0u8; 4];
        self.stream
            .read_exact(&mut len)
            .await
            .context("Failed to read HTSP message length")?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_MESSAGE {
            bail!("HTSP message too large: {} bytes", len);
        }

        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .await
            .context("Failed to read HTSP message")?;
        HtsMsg::decode(&body)
    }

    async fn call(&mut self, request: HtsMsg) -> Result<HtsMsg> {
        self.send(request).await?;
        let reply = self.read_message().await?;
        reply_error(&reply)?;
        Ok(reply)
    }

    pub async fn hello(&mut self, username: Option<&str>) -> Result<ServerInfo> {
        let mut request = HtsMsg::method("hello")
            .with("htspversion", HtsValue::S64(HTSP_VERSION))
            .with("clientname", HtsValue::Str(CLIENT_NAME.to_string()))
            .with(
                "clientversion",
                HtsValue::Str(env!("CARGO_PKG_VERSION").to_string()),
            );
        if let Some(username) = username {
            request = request.with("username", HtsValue::Str(username.to_string()));
        }

        let reply = self.call(request).await?;
        Ok(ServerInfo {
            name: reply.get_str("servername").unwrap_or("unknown").to_string(),
            version: reply.get_str("serverversion").unwrap_or("").to_string(),
            htsp_version: reply.get_s64("htspversion").unwrap_or(0),
            challenge: reply.get_bin("challenge").unwrap_or_default().to_vec(),
        })
    }

    pub async fn authenticate(&mut self, username: &str, password: &str, challenge: &[u8]) -> Result<()> {
        let reply = self
            .call(
                HtsMsg::method("authenticate")
                    .with("username", HtsValue::Str(username.to_string()))
                    .with("digest", HtsValue::Bin(auth_digest(password, challenge))),
            )
            .await?;

        if reply.get_s64("noaccess").unwrap_or(0) != 0 {
            bail!("access denied for user {}", username);
        }
        Ok(())
    }

    /// Every `dvrEntryAdd` the server sends before `initialSyncCompleted`
    pub async fn dvr_entries(&mut self) -> Result<Vec<HtsMsg>> {
        self.send(HtsMsg::method("enableAsyncMetadata")).await?;

        let mut entries = Vec::new();
        loop {
            let message = self.read_message().await?;
            match message.get_str("method") {
                Some("dvrEntryAdd") => entries.push(message),
                Some("initialSyncCompleted") => break,
                None => reply_error(&message)?,
                // channels, tags
                Some(_) => {}
            }
        }

        tracing::debug!("Received {} DVR entries over HTSP", entries.len());
        Ok(entries)
    }
}

// Only replies use `error` for failure; DVR entries carry their own `error` text
fn reply_error(reply: &HtsMsg) -> Result<()> {
    match reply.get_str("error") {
        Some(error) => bail!("HTSP error: {}", error),
        None => Ok(()),
    }
}

/// SHA-1 over the password followed by the server challenge
pub fn auth_digest(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

/// Connect, say hello and authenticate when a username is configured
pub async fn open_session(config: &HtspConfig) -> Result<(HtspSession, ServerInfo)> {
    let mut session = HtspSession::connect(&config.host, config.port).await?;
    let info = session.hello(config.username.as_deref()).await?;
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        session.authenticate(user, pass, &info.challenge).await?;
    }
    Ok((session, info))
}

/// `open_session` bounded by the configured timeout
pub async fn probe(config: &HtspConfig) -> Result<ServerInfo, TransferError> {
    let addr = format!("{}:{}", config.host, config.port);
    let unreachable_err = |reason: String| TransferError::HtspUnreachable {
        addr: addr.clone(),
        reason,
    };

    let attempt = async { open_session(config).await.map(|(_, info)| info) };

    match tokio::time::timeout(Duration::from_secs(config.timeout_secs), attempt).await {
        Ok(Ok(info)) => Ok(info),
        Ok(Err(e)) => Err(unreachable_err(format!("{:#}", e))),
        Err(_) => Err(unreachable_err(format!(
            "no answer within {}s",
            config.timeout_secs
        ))),
    }
}

pub async fn check_htsp_connectivity(config: &HtspConfig) -> CheckResult {
    match probe(config).await {
        Ok(info) => CheckResult::pass(
            "htsp",
            format!(
                "{} {} answered on {}:{} (HTSP v{})",
                info.name, info.version, config.host, config.port, info.htsp_version
            ),
        ),
        Err(e) => CheckResult::fail("htsp", e.to_string()),
    }
}
