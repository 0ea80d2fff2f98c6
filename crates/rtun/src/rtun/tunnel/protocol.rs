use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const TYPE_PROXY: u8 = 1;
const TYPE_VERSION: u8 = 2;
const TYPE_ERROR: u8 = 3;
const TYPE_WORKER: u8 = 4;

pub const MAX_MESSAGE_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registration request sent by the client on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Leading frame of every server-initiated worker stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeader {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Proxy(ProxyRequest),
    Version(VersionResponse),
    Error(ErrorResponse),
    Worker(WorkerHeader),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Proxy(_) => "proxy",
            Message::Version(_) => "version",
            Message::Error(_) => "error",
            Message::Worker(_) => "worker",
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Message::Proxy(_) => TYPE_PROXY,
            Message::Version(_) => TYPE_VERSION,
            Message::Error(_) => TYPE_ERROR,
            Message::Worker(_) => TYPE_WORKER,
        }
    }
}

/// Writes one frame: `u8 type`, `u32be len`, JSON payload.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let b = match msg {
        Message::Proxy(m) => serde_json::to_vec(m)?,
        Message::Version(m) => serde_json::to_vec(m)?,
        Message::Error(m) => serde_json::to_vec(m)?,
        Message::Worker(m) => serde_json::to_vec(m)?,
    };
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    w.write_u8(msg.type_byte()).await?;
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

/// Reads exactly one frame; bytes after it are left in the stream.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
    let ty = r.read_u8().await?;
    if !matches!(ty, TYPE_PROXY | TYPE_VERSION | TYPE_ERROR | TYPE_WORKER) {
        return Err(ProtocolError::UnknownType(ty));
    }

    let n = r.read_u32().await?;
    if n > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;

    let msg = match ty {
        TYPE_PROXY => Message::Proxy(serde_json::from_slice(&buf)?),
        TYPE_VERSION => Message::Version(serde_json::from_slice(&buf)?),
        TYPE_ERROR => Message::Error(serde_json::from_slice(&buf)?),
        _ => Message::Worker(serde_json::from_slice(&buf)?),
    };
    Ok(msg)
}

pub async fn read_worker_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<WorkerHeader, ProtocolError> {
    match read_message(r).await? {
        Message::Worker(h) => Ok(h),
        other => Err(ProtocolError::Unexpected {
            expected: "worker",
            got: other.kind(),
        }),
    }
}
