use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time,
};

use crate::culvert::{
    connect::{self, ConnectError, ConnectRequest},
    dial::Dialer,
    net, relay, telemetry,
};

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("culvert_connections_total").increment(1);
        metrics::gauge!("culvert_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("culvert_active_connections").decrement(1.0);
    }
}

pub struct TcpHandlerOptions {
    pub sessions: telemetry::SharedSessions,
    pub dialer: Arc<dyn Dialer>,
    pub relay: relay::RelayOptions,
    pub handshake_timeout: Duration,
    pub max_header_bytes: usize,
}

#[derive(Clone)]
pub struct TcpHandler {
    opts: Arc<TcpHandlerOptions>,
}

impl TcpHandler {
    pub fn new(opts: TcpHandlerOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    pub async fn handle(&self, conn: TcpStream) {
        handle_connect(conn, self.opts.clone()).await
    }
}

pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    handler: TcpHandler,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "proxy: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let h = handler.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "proxy: accepted");
                    }
                    h.handle(conn).await;
                });
            }
        }
    }

    Ok(())
}

/// One accepted connection, start to finish: CONNECT handshake, dial,
/// acknowledgment, then the tunnel. The client stream is handed to the
/// relay core as a plain argument once the handshake settles.
async fn handle_connect(mut conn: TcpStream, opts: Arc<TcpHandlerOptions>) {
    let _active = ActiveConnGuard::new();
    let sid = telemetry::new_session_id();
    let client = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();

    let (req, prelude) = match read_head(&mut conn, &opts).await {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!(sid = %sid, client = %client, err = %err, "proxy: handshake failed");
            if let Some(status) = err.status() {
                let _ = connect::write_error_response(&mut conn, status).await;
            }
            let _ = conn.shutdown().await;
            return;
        }
    };

    // Dial before acknowledging. A dial failure here is the one clean error
    // exit: the client gets a status response and no tunnel ever exists.
    let mut remote = match opts.dialer.dial(&req.target).await {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("culvert_dial_failures_total").increment(1);
            tracing::warn!(sid = %sid, client = %client, target = %req.target, err = %err, "proxy: dial failed");
            let status = if err.is_timeout() { 504 } else { 502 };
            let _ = connect::write_error_response(&mut conn, status).await;
            let _ = conn.shutdown().await;
            return;
        }
    };

    if let Err(err) = connect::write_established(&mut conn).await {
        tracing::debug!(sid = %sid, client = %client, err = %err, "proxy: ack write failed");
        let _ = conn.shutdown().await;
        return;
    }

    // Bytes the client pipelined after the head belong to the tunnel; flush
    // them to the remote before the loops take over.
    if !prelude.is_empty() {
        if let Err(err) = remote.write_all(&prelude).await {
            tracing::debug!(sid = %sid, target = %req.target, err = %err, "proxy: prelude write failed");
            let _ = conn.shutdown().await;
            return;
        }
    }

    opts.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: client.clone(),
        target: req.target.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    let started = std::time::Instant::now();

    let out = relay::run_tunnel(conn, remote, &opts.relay).await;

    opts.sessions.remove(&sid);

    metrics::counter!("culvert_tunnels_closed_total").increment(1);
    metrics::counter!("culvert_bytes_client_to_remote_total").increment(out.client_to_remote);
    metrics::counter!("culvert_bytes_remote_to_client_total").increment(out.remote_to_client);

    match out.error_side() {
        None => {
            tracing::debug!(
                sid = %sid,
                client = %client,
                target = %req.target,
                first = %out.first,
                end = %out.end,
                c2r = out.client_to_remote,
                r2c = out.remote_to_client,
                duration = %humantime::format_duration(started.elapsed()),
                "proxy: tunnel closed"
            );
        }
        Some(side) => {
            tracing::debug!(
                sid = %sid,
                client = %client,
                target = %req.target,
                side = %side,
                first = %out.first,
                end = %out.end,
                c2r = out.client_to_remote,
                r2c = out.remote_to_client,
                duration = %humantime::format_duration(started.elapsed()),
                "proxy: tunnel ended with error"
            );
        }
    }
}

async fn read_head(
    conn: &mut TcpStream,
    opts: &TcpHandlerOptions,
) -> Result<(ConnectRequest, Vec<u8>), ConnectError> {
    if opts.handshake_timeout > Duration::from_millis(0) {
        match time::timeout(
            opts.handshake_timeout,
            connect::read_connect_request(conn, opts.max_header_bytes),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "handshake timeout",
            ))),
        }
    } else {
        connect::read_connect_request(conn, opts.max_header_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::culvert::dial::{BoxedStream, DialError, TcpDialer};
    use tokio::io::AsyncReadExt;

    fn test_opts(sessions: telemetry::SharedSessions) -> Arc<TcpHandlerOptions> {
        Arc::new(TcpHandlerOptions {
            sessions,
            dialer: Arc::new(TcpDialer {
                timeout: Duration::from_secs(2),
            }),
            relay: relay::RelayOptions::default(),
            handshake_timeout: Duration::from_secs(2),
            max_header_bytes: 64 * 1024,
        })
    }

    fn spawn_proxy(
        ln: TcpListener,
        opts: Arc<TcpHandlerOptions>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (c, _) = ln.accept().await.unwrap();
                let o = opts.clone();
                tokio::spawn(async move {
                    handle_connect(c, o).await;
                });
            }
        })
    }

    async fn read_response_head(c: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = c.read(&mut byte).await.unwrap();
            assert!(n > 0, "eof before end of response head: {head:?}");
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                return head;
            }
        }
    }

    #[tokio::test]
    async fn connect_tunnel_end_to_end() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = backend_ln.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            s.write_all(b"pong").await.unwrap();
        });

        let proxy_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_ln.local_addr().unwrap();
        let sessions = Arc::new(telemetry::SessionRegistry::new());
        let accept_task = spawn_proxy(proxy_ln, test_opts(sessions.clone()));

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        let head = format!("CONNECT {backend_addr} HTTP/1.1\r\nHost: {backend_addr}\r\n\r\n");
        c.write_all(head.as_bytes()).await.unwrap();

        let resp = read_response_head(&mut c).await;
        assert!(
            resp.starts_with(b"HTTP/1.1 200"),
            "unexpected response: {}",
            String::from_utf8_lossy(&resp)
        );

        c.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        // Backend closed after the reply; the tunnel tears down.
        let mut rest = Vec::new();
        c.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        backend_task.await.unwrap();

        // The session entry goes away once the tunnel is released.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sessions.len() != 0 {
            assert!(std::time::Instant::now() < deadline, "session never removed");
            time::sleep(Duration::from_millis(10)).await;
        }

        accept_task.abort();
    }

    #[tokio::test]
    async fn pipelined_prelude_reaches_backend() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = backend_ln.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early");
        });

        let proxy_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_ln.local_addr().unwrap();
        let sessions = Arc::new(telemetry::SessionRegistry::new());
        let accept_task = spawn_proxy(proxy_ln, test_opts(sessions));

        // Eager client: payload follows the head without waiting for the ack.
        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        let head = format!("CONNECT {backend_addr} HTTP/1.1\r\n\r\nearly");
        c.write_all(head.as_bytes()).await.unwrap();

        let resp = read_response_head(&mut c).await;
        assert!(resp.starts_with(b"HTTP/1.1 200"));

        backend_task.await.unwrap();
        accept_task.abort();
    }

    #[tokio::test]
    async fn dial_refused_answers_502_without_session() {
        // A port with nothing listening.
        let dead_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead_ln.local_addr().unwrap();
        drop(dead_ln);

        let proxy_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_ln.local_addr().unwrap();
        let sessions = Arc::new(telemetry::SessionRegistry::new());
        let accept_task = spawn_proxy(proxy_ln, test_opts(sessions.clone()));

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        let head = format!("CONNECT {dead_addr} HTTP/1.1\r\n\r\n");
        c.write_all(head.as_bytes()).await.unwrap();

        let resp = read_response_head(&mut c).await;
        assert!(
            resp.starts_with(b"HTTP/1.1 502"),
            "unexpected response: {}",
            String::from_utf8_lossy(&resp)
        );

        let mut rest = Vec::new();
        c.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(sessions.len(), 0);

        accept_task.abort();
    }

    struct TimeoutDialer;

    #[async_trait::async_trait]
    impl Dialer for TimeoutDialer {
        async fn dial(&self, addr: &str) -> Result<BoxedStream, DialError> {
            Err(DialError::Timeout {
                addr: addr.to_string(),
                timeout: Duration::from_millis(10),
            })
        }
    }

    #[tokio::test]
    async fn dial_timeout_answers_504() {
        let proxy_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_ln.local_addr().unwrap();

        let opts = Arc::new(TcpHandlerOptions {
            sessions: Arc::new(telemetry::SessionRegistry::new()),
            dialer: Arc::new(TimeoutDialer),
            relay: relay::RelayOptions::default(),
            handshake_timeout: Duration::from_secs(2),
            max_header_bytes: 64 * 1024,
        });
        let accept_task = spawn_proxy(proxy_ln, opts);

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        c.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let resp = read_response_head(&mut c).await;
        assert!(resp.starts_with(b"HTTP/1.1 504"));

        accept_task.abort();
    }

    #[tokio::test]
    async fn non_connect_answers_405() {
        let proxy_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_ln.local_addr().unwrap();
        let sessions = Arc::new(telemetry::SessionRegistry::new());
        let accept_task = spawn_proxy(proxy_ln, test_opts(sessions));

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        c.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let resp = read_response_head(&mut c).await;
        assert!(
            resp.starts_with(b"HTTP/1.1 405"),
            "unexpected response: {}",
            String::from_utf8_lossy(&resp)
        );

        let mut rest = Vec::new();
        c.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        accept_task.abort();
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let sessions = Arc::new(telemetry::SessionRegistry::new());
        let handler = TcpHandler::new(TcpHandlerOptions {
            sessions,
            dialer: Arc::new(TcpDialer::default()),
            relay: relay::RelayOptions::default(),
            handshake_timeout: Duration::from_secs(2),
            max_header_bytes: 64 * 1024,
        });

        let srv = tokio::spawn(async move {
            serve_tcp_with_shutdown("127.0.0.1:0", handler, rx).await
        });

        time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let res = time::timeout(Duration::from_secs(2), srv)
            .await
            .expect("server must stop")
            .expect("join");
        assert!(res.is_ok());
    }
}
