//! RouterOS API transport.
//!
//! The API is a stream of *sentences* over TCP (port 8728). A sentence is a list of
//! length-prefixed *words* ended by an empty word. Commands are tagged with `.tag=<n>`
//! so that several can be in flight on one connection; the reader task routes `!re`,
//! `!trap` and `!done` replies back to the caller waiting on that tag. `!fatal`, EOF and
//! any I/O error fail every pending command and are reported on [`DeviceEvents`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DeviceConnection, DeviceConnector, DeviceError, DeviceEvents, Row};

pub const DEFAULT_API_PORT: u16 = 8728;

/// Words larger than this are treated as a protocol violation.
const MAX_WORD_LEN: usize = 1 << 20;

#[derive(Clone)]
pub struct RouterOsConfig {
    /// `host:port` of the API service.
    pub address: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl std::fmt::Debug for RouterOsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOsConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RouterOsConnector {
    config: RouterOsConfig,
}

impl RouterOsConnector {
    pub fn new(config: RouterOsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeviceConnector for RouterOsConnector {
    async fn connect(&self, events: DeviceEvents) -> Result<Arc<dyn DeviceConnection>, DeviceError> {
        let timeout = self.config.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.open(events))
            .await
            .map_err(|_| DeviceError::Timeout(timeout))??;
        Ok(Arc::new(connection))
    }
}

impl RouterOsConnector {
    async fn open(&self, events: DeviceEvents) -> Result<RouterOsConnection, DeviceError> {
        let stream = TcpStream::connect(&self.config.address)
            .await
            .map_err(|e| DeviceError::Transport(format!("{}: {e}", self.config.address)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        login(
            &mut reader,
            &mut write_half,
            &self.config.username,
            &self.config.password,
        )
        .await?;
        tracing::debug!(address = %self.config.address, "RouterOS login succeeded");

        let pending: Arc<DashMap<u64, PendingCommand>> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        tokio::spawn(read_replies(
            reader,
            Arc::clone(&pending),
            events.clone(),
            closed.clone(),
        ));
        Ok(RouterOsConnection {
            writer: Mutex::new(write_half),
            pending,
            next_tag: AtomicU64::new(1),
            closed,
            events,
            command_timeout: self.config.command_timeout,
        })
    }
}

async fn login<R, W>(
    reader: &mut R,
    writer: &mut W,
    username: &str,
    password: &str,
) -> Result<(), DeviceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let name = format!("=name={username}");
    let password = format!("=password={password}");
    write_sentence(writer, &["/login", name.as_str(), password.as_str()]).await?;
    loop {
        match Reply::parse(read_sentence(reader).await?) {
            Reply::Done { attrs, .. } if attrs.contains_key("ret") => {
                return Err(DeviceError::Protocol(
                    "device requested legacy challenge login (RouterOS < 6.43)".to_string(),
                ));
            }
            Reply::Done { .. } => return Ok(()),
            Reply::Trap { message, .. } | Reply::Fatal(message) => {
                return Err(DeviceError::Unavailable(format!("login rejected: {message}")));
            }
            Reply::Re { .. } | Reply::Unknown(_) => continue,
        }
    }
}

struct PendingCommand {
    rows: Vec<Row>,
    trap: Option<String>,
    reply: Option<oneshot::Sender<Result<Vec<Row>, DeviceError>>>,
}

impl PendingCommand {
    fn finish(&mut self, result: Result<Vec<Row>, DeviceError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// An authenticated RouterOS API session.
pub struct RouterOsConnection {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<DashMap<u64, PendingCommand>>,
    next_tag: AtomicU64,
    closed: CancellationToken,
    events: DeviceEvents,
    command_timeout: Duration,
}

#[async_trait]
impl DeviceConnection for RouterOsConnection {
    async fn write(&self, path: &str, args: &[(&str, &str)]) -> Result<Vec<Row>, DeviceError> {
        if self.closed.is_cancelled() {
            return Err(DeviceError::Transport("connection closed".to_string()));
        }
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.pending.insert(
            tag,
            PendingCommand {
                rows: Vec::new(),
                trap: None,
                reply: Some(reply),
            },
        );

        let mut words = Vec::with_capacity(args.len() + 2);
        words.push(path.to_string());
        words.extend(args.iter().map(|(key, value)| format!("={key}={value}")));
        words.push(format!(".tag={tag}"));
        // One budget covers the write and the reply.
        let deadline = Instant::now() + self.command_timeout;
        let written = tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            write_sentence(&mut *writer, words.as_slice()).await
        })
        .await
        .unwrap_or(Err(DeviceError::Timeout(self.command_timeout)));
        if let Err(error) = written {
            // A half-written sentence leaves the stream unusable.
            self.pending.remove(&tag);
            self.events.transport_error(&error);
            return Err(error);
        }

        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::Transport("connection closed".to_string())),
            Err(_) => {
                self.pending.remove(&tag);
                Err(DeviceError::Timeout(self.command_timeout))
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = tokio::time::timeout(self.command_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        })
        .await;
        fail_all(&self.pending, DeviceError::Transport("connection closed".to_string()));
    }
}

async fn read_replies(
    mut reader: BufReader<OwnedReadHalf>,
    pending: Arc<DashMap<u64, PendingCommand>>,
    events: DeviceEvents,
    closed: CancellationToken,
) {
    let error = loop {
        let sentence = tokio::select! {
            _ = closed.cancelled() => return,
            sentence = read_sentence(&mut reader) => sentence,
        };
        match sentence.map(Reply::parse) {
            Ok(Reply::Fatal(message)) => break DeviceError::Transport(format!("!fatal {message}")),
            Ok(reply) => dispatch(&pending, reply),
            Err(error) => break error,
        }
    };
    if closed.is_cancelled() {
        return;
    }
    tracing::warn!(generation = events.generation(), %error, "RouterOS connection lost");
    fail_all(&pending, error.clone());
    events.transport_error(error);
}

fn dispatch(pending: &DashMap<u64, PendingCommand>, reply: Reply) {
    match reply {
        Reply::Re { tag: Some(tag), attrs } => {
            if let Some(mut command) = pending.get_mut(&tag) {
                command.rows.push(attrs);
            }
        }
        Reply::Trap { tag: Some(tag), message } => {
            if let Some(mut command) = pending.get_mut(&tag) {
                command.trap = Some(message);
            }
        }
        Reply::Done { tag: Some(tag), .. } => {
            if let Some((_, mut command)) = pending.remove(&tag) {
                let result = match command.trap.take() {
                    Some(message) => Err(DeviceError::Command(message)),
                    None => Ok(std::mem::take(&mut command.rows)),
                };
                command.finish(result);
            }
        }
        other => tracing::debug!(?other, "Ignoring untagged RouterOS reply"),
    }
}

fn fail_all(pending: &DashMap<u64, PendingCommand>, error: DeviceError) {
    let tags: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for tag in tags {
        if let Some((_, mut command)) = pending.remove(&tag) {
            command.finish(Err(error.clone()));
        }
    }
}

/// A decoded reply sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Re { tag: Option<u64>, attrs: Row },
    Done { tag: Option<u64>, attrs: Row },
    Trap { tag: Option<u64>, message: String },
    Fatal(String),
    Unknown(Vec<String>),
}

impl Reply {
    pub fn parse(words: Vec<String>) -> Self {
        let mut words = words.into_iter();
        let Some(kind) = words.next() else {
            return Reply::Unknown(Vec::new());
        };
        let rest: Vec<String> = words.collect();
        if kind == "!fatal" {
            return Reply::Fatal(rest.join(" "));
        }
        let mut tag = None;
        let mut attrs = Row::new();
        for word in &rest {
            if let Some(value) = word.strip_prefix(".tag=") {
                tag = value.parse().ok();
            } else if let Some((key, value)) = word.strip_prefix('=').and_then(|kv| kv.split_once('=')) {
                attrs.insert(key.to_string(), value.to_string());
            }
        }
        match kind.as_str() {
            "!re" => Reply::Re { tag, attrs },
            "!done" => Reply::Done { tag, attrs },
            "!trap" => Reply::Trap {
                tag,
                message: attrs
                    .remove("message")
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
            _ => Reply::Unknown(std::iter::once(kind.clone()).chain(rest).collect()),
        }
    }
}

/// Variable-length prefix of a word.
pub fn encode_length(len: usize) -> Vec<u8> {
    let len = len as u32;
    match len {
        0..0x80 => vec![len as u8],
        0x80..0x4000 => (len | 0x8000).to_be_bytes()[2..].to_vec(),
        0x4000..0x20_0000 => (len | 0xC0_0000).to_be_bytes()[1..].to_vec(),
        0x20_0000..0x1000_0000 => (len | 0xE000_0000).to_be_bytes().to_vec(),
        _ => {
            let mut bytes = vec![0xF0];
            bytes.extend_from_slice(&len.to_be_bytes());
            bytes
        }
    }
}

pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut buf = Vec::new();
    for word in words {
        let word = word.as_ref().as_bytes();
        buf.extend(encode_length(word.len()));
        buf.extend_from_slice(word);
    }
    buf.push(0);
    buf
}

async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> Result<(), DeviceError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let buf = encode_sentence(words);
    writer.write_all(&buf).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, DeviceError> {
    let first = reader.read_u8().await.map_err(io_error)?;
    let (extra, initial) = match first {
        b if b & 0x80 == 0x00 => (0, b as u32),
        b if b & 0xC0 == 0x80 => (1, (b & 0x3F) as u32),
        b if b & 0xE0 == 0xC0 => (2, (b & 0x1F) as u32),
        b if b & 0xF0 == 0xE0 => (3, (b & 0x0F) as u32),
        0xF0 => (4, 0),
        b => {
            return Err(DeviceError::Protocol(format!(
                "unexpected control byte {b:#04x}"
            )));
        }
    };
    let mut len = initial;
    for _ in 0..extra {
        len = (len << 8) | reader.read_u8().await.map_err(io_error)? as u32;
    }
    Ok(len as usize)
}

pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>, DeviceError> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(DeviceError::Protocol(format!("word of {len} bytes")));
        }
        let mut word = vec![0; len];
        reader.read_exact(&mut word).await.map_err(io_error)?;
        words.push(String::from_utf8_lossy(&word).into_owned());
    }
}

fn io_error(error: std::io::Error) -> DeviceError {
    DeviceError::Transport(error.to_string())
}
