use std::{io, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{net::TcpStream, time};

/// A bidirectional async byte stream.
///
/// Trait objects admit only one principal trait, so `AsyncRead + AsyncWrite`
/// is folded into a single trait here.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Failure to establish the outbound leg of a tunnel. Produced before any
/// tunnel state exists; the handler maps it to an HTTP error response.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {addr}: timeout after {}", humantime::format_duration(*timeout))]
    Timeout { addr: String, timeout: Duration },

    #[error("dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout { .. })
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, DialError>;
}

/// Plain TCP dialer with an optional connect timeout (zero disables it).
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, DialError> {
        let res = if self.timeout > Duration::from_millis(0) {
            match time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(DialError::Timeout {
                        addr: addr.to_string(),
                        timeout: self.timeout,
                    });
                }
            }
        } else {
            TcpStream::connect(addr).await
        };

        match res {
            Ok(c) => Ok(Box::new(c)),
            Err(source) => Err(DialError::Connect {
                addr: addr.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr").to_string();

        let accept = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.expect("read");
            buf
        });

        let dialer = TcpDialer::default();
        let mut stream = dialer.dial(&addr).await.expect("dial");
        stream.write_all(b"ping").await.expect("write");
        stream.flush().await.expect("flush");

        let got = accept.await.expect("join");
        assert_eq!(&got, b"ping");
    }

    #[tokio::test]
    async fn dial_refused_is_connect_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr").to_string();
        drop(listener);

        let dialer = TcpDialer::default();
        let err = dialer.dial(&addr).await.err().expect("dial should fail");
        assert!(!err.is_timeout());
        match &err {
            DialError::Connect { addr: a, .. } => assert_eq!(a, &addr),
            other => panic!("expected Connect, got {other:?}"),
        }
    }
}
