use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Requests above this size are rejected as `bad command`.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// A connection that has not delivered a full request by then is dropped.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub const BAD_COMMAND: &str = "bad command";
pub const UNKNOWN_COMMAND: &str = "unknown command";

/// Control commands, decoded once at the socket boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Stop { pattern: Option<String> },
    Start { pattern: Option<String> },
    Exit,
    Log { pattern: Option<String> },
    Reload,
    Unrecognized(String),
}

impl Command {
    /// Inverse of [`decode`] for clients.
    pub fn to_wire(&self) -> Request {
        let (name, pattern) = match self {
            Command::Status => ("status", None),
            Command::Stop { pattern } => ("stop", pattern.as_ref()),
            Command::Start { pattern } => ("start", pattern.as_ref()),
            Command::Exit => ("exit", None),
            Command::Log { pattern } => ("log", pattern.as_ref()),
            Command::Reload => ("reload", None),
            Command::Unrecognized(name) => (name.as_str(), None),
        };
        let mut command = vec![name.to_string()];
        command.extend(pattern.cloned());
        Request { command }
    }

    fn from_parts(name: &str, mut args: Vec<String>) -> Self {
        let first = if args.is_empty() { None } else { Some(args.swap_remove(0)) };
        match name {
            "status" => Command::Status,
            "stop" => Command::Stop { pattern: first },
            "start" => Command::Start { pattern: first },
            "exit" => Command::Exit,
            "log" => Command::Log {
                pattern: first.filter(|p| !p.is_empty()),
            },
            "reload" => Command::Reload,
            other => Command::Unrecognized(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: Vec<String>,
}

/// Exactly one of `{"success": ..}` / `{"error": ..}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Success(String),
    Error(String),
}

/// Outcome of decoding one request document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Command(Command),
    /// Well-formed object without a `command`; logged, never answered.
    NoCommand,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
    TooLarge,
    #[error("no complete request within {READ_TIMEOUT:?}")]
    TimedOut,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub fn decode(raw: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::Malformed("request is not a JSON object".to_string()));
    };
    let items = match obj.remove("command") {
        None | Some(Value::Null) => return Ok(Decoded::NoCommand),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(DecodeError::Malformed(format!("command must be an array, got {other}")));
        }
    };
    let mut items = items.into_iter();
    let name = match items.next() {
        Some(Value::String(s)) => s,
        Some(other) => return Ok(Decoded::Command(Command::Unrecognized(other.to_string()))),
        None => return Ok(Decoded::Command(Command::Unrecognized(String::new()))),
    };
    let args = items
        .map(|v| match v {
            Value::String(s) => Ok(s),
            other => Err(DecodeError::Malformed(format!("argument must be a string, got {other}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Decoded::Command(Command::from_parts(&name, args)))
}

/// Reads one request: up to a newline, EOF, or as soon as the bytes read so
/// far form one complete JSON document (clients that send no delimiter and
/// keep the connection open).
pub async fn read_request<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Vec<u8>, DecodeError> {
    tokio::time::timeout(READ_TIMEOUT, read_framed(rd))
        .await
        .map_err(|_| DecodeError::TimedOut)?
}

async fn read_framed<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Vec<u8>, DecodeError> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 4096];
    loop {
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            buf.truncate(pos);
            return Ok(buf);
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(DecodeError::TooLarge);
        }
        match serde_json::from_slice::<Value>(&buf) {
            Ok(_) => return Ok(buf),
            Err(e) if e.is_eof() => continue,
            Err(_) => return Ok(buf),
        }
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(wr: &mut W, reply: &Reply) -> anyhow::Result<()> {
    let line = serde_json::to_string(reply)? + "\n";
    wr.write_all(line.as_bytes()).await?;
    wr.flush().await?;
    Ok(())
}

/// Sends one command and waits for the single reply.
pub async fn client_call(sock: &Path, command: &Command) -> anyhow::Result<Reply> {
    let mut stream = tokio::net::UnixStream::connect(sock).await.map_err(|e| {
        anyhow::anyhow!("failed to connect to restarter socket {}: {e}", sock.display())
    })?;
    let line = serde_json::to_string(&command.to_wire())? + "\n";
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;

    let mut resp = Vec::new();
    stream.read_to_end(&mut resp).await?;
    let text = String::from_utf8_lossy(&resp);
    if text.trim().is_empty() {
        anyhow::bail!("empty response from restarter");
    }
    let reply: Reply = serde_json::from_str(text.trim_end())
        .map_err(|e| anyhow::anyhow!("unknown response from server: {e}"))?;
    Ok(reply)
}
