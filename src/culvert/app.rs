use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::culvert::{admin, config, dial, logging, net, proxy, relay, telemetry};

pub async fn run(
    config_path: Option<PathBuf>,
    listen_override: Option<String>,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    if let Some(listen) = listen_override {
        if !listen.trim().is_empty() {
            cfg.listen_addr = listen;
        }
    }

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        admin_addr = %cfg.admin_addr,
        frame_size = cfg.relay.frame_size,
        channel_capacity = cfg.relay.channel_capacity,
        idle_timeout = %humantime::format_duration(cfg.relay.idle_timeout),
        handshake_timeout = %humantime::format_duration(cfg.handshake.timeout),
        dial_timeout = %humantime::format_duration(cfg.dial_timeout),
        "culvert: starting"
    );

    // Shared state for admin endpoints.
    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            config_path: resolved.path.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Proxy listener.
    {
        let listen_addr = cfg.listen_addr.clone();
        let handler = proxy::TcpHandler::new(proxy::TcpHandlerOptions {
            sessions: sessions.clone(),
            dialer: Arc::new(dial::TcpDialer {
                timeout: cfg.dial_timeout,
            }),
            relay: relay::RelayOptions {
                frame_size: cfg.relay.frame_size,
                channel_capacity: cfg.relay.channel_capacity,
                idle_timeout: cfg.relay.idle_timeout,
            },
            handshake_timeout: cfg.handshake.timeout,
            max_header_bytes: cfg.handshake.max_header_bytes,
        });

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            proxy::serve_tcp_with_shutdown(&listen_addr, handler, shutdown).await
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain: tasks observe the shutdown flag and finish on their own; the
    // timeout only matters if one hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {}
    };

    // Hard cap so `docker stop` does not stall.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
