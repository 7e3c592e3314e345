use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_HEAD_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("method {0:?} not allowed")]
    MethodNotAllowed(String),
    #[error("bad target {0:?}")]
    BadTarget(String),
    #[error("malformed request line")]
    BadRequestLine,
    #[error("request head too large")]
    HeadTooLarge,
    #[error("unexpected eof in request head")]
    UnexpectedEof,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    /// Status owed to the client for this error, if the exchange is still in
    /// a state where a response makes sense.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectError::MethodNotAllowed(_) => Some(405),
            ConnectError::BadTarget(_) | ConnectError::BadRequestLine => Some(400),
            ConnectError::HeadTooLarge => Some(431),
            ConnectError::UnexpectedEof | ConnectError::Io(_) => None,
        }
    }
}

/// A parsed CONNECT request. `target` is the authority-form `host:port` the
/// client asked to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: String,
}

/// Reads the CONNECT request head (request line plus headers, up to the
/// blank line) and returns the parsed request together with any bytes the
/// client pipelined after the head. Those bytes belong to the tunnel payload
/// and must reach the remote; dropping them would corrupt eager clients that
/// do not wait for the acknowledgment.
///
/// `max_head_bytes` caps the head (0 uses the default). Headers are read and
/// discarded; CONNECT needs nothing from them.
pub async fn read_connect_request<R>(
    r: &mut R,
    max_head_bytes: usize,
) -> Result<(ConnectRequest, Vec<u8>), ConnectError>
where
    R: AsyncRead + Unpin,
{
    let max = if max_head_bytes == 0 {
        DEFAULT_MAX_HEAD_BYTES
    } else {
        max_head_bytes
    };

    let mut head = Vec::with_capacity(512);
    let mut scratch = [0u8; 1024];
    let head_len = loop {
        if let Some(end) = find_head_end(&head) {
            break end;
        }
        if head.len() >= max {
            return Err(ConnectError::HeadTooLarge);
        }
        let want = (max - head.len()).min(scratch.len());
        let n = r.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(ConnectError::UnexpectedEof);
        }
        head.extend_from_slice(&scratch[..n]);
    };

    let leftover = head.split_off(head_len);

    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ConnectError::BadRequestLine)?;
    let line = String::from_utf8_lossy(&head[..line_end]);
    let line = line.trim_end_matches('\r');

    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
        return Err(ConnectError::BadRequestLine);
    }
    if method != "CONNECT" {
        return Err(ConnectError::MethodNotAllowed(method.to_string()));
    }

    let target = parse_target(target)?;
    Ok((ConnectRequest { target }, leftover))
}

/// End of the request head: the byte index just past the blank line.
/// Tolerates bare-LF line endings the way lenient HTTP parsers do.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// CONNECT targets are authority-form only: `host:port`, with IPv6 hosts in
/// brackets. Absolute URIs and bare hosts are rejected.
fn parse_target(raw: &str) -> Result<String, ConnectError> {
    if raw.contains('/') {
        return Err(ConnectError::BadTarget(raw.to_string()));
    }
    let Some((host, port)) = raw.rsplit_once(':') else {
        return Err(ConnectError::BadTarget(raw.to_string()));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ConnectError::BadTarget(raw.to_string()));
    }
    Ok(raw.to_string())
}

pub async fn write_established<W>(w: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    w.flush().await
}

pub async fn write_error_response<W>(w: &mut W, status: u16) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(status_line(status).as_bytes()).await?;
    w.flush().await
}

fn status_line(status: u16) -> &'static str {
    match status {
        400 => "HTTP/1.1 400 Bad Request\r\n\r\n",
        405 => "HTTP/1.1 405 Method Not Allowed\r\n\r\n",
        431 => "HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n",
        502 => "HTTP/1.1 502 Bad Gateway\r\n\r\n",
        504 => "HTTP/1.1 504 Gateway Timeout\r\n\r\n",
        _ => "HTTP/1.1 500 Internal Server Error\r\n\r\n",
    }
}
