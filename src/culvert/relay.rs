use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
    time,
};

use crate::culvert::dial::{DialError, Dialer};

pub const DEFAULT_FRAME_SIZE: usize = 16 * 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Tunnel knobs. Zero for a size/capacity means "use the default"; a zero
/// idle timeout disables it.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub frame_size: usize,
    pub channel_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            idle_timeout: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    /// The endpoint being read from.
    pub fn source(self) -> Side {
        match self {
            Direction::ClientToRemote => Side::Client,
            Direction::RemoteToClient => Side::Remote,
        }
    }

    /// The endpoint being written to.
    pub fn dest(self) -> Side {
        match self {
            Direction::ClientToRemote => Side::Remote,
            Direction::RemoteToClient => Side::Client,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToRemote => write!(f, "client->remote"),
            Direction::RemoteToClient => write!(f, "remote->client"),
        }
    }
}

/// How the direction that ended the tunnel ended.
#[derive(Debug)]
pub enum TunnelEnd {
    Eof,
    ReadError(io::Error),
    WriteError(io::Error),
}

impl TunnelEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, TunnelEnd::Eof)
    }
}

impl fmt::Display for TunnelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelEnd::Eof => write!(f, "eof"),
            TunnelEnd::ReadError(err) => write!(f, "read error: {err}"),
            TunnelEnd::WriteError(err) => write!(f, "write error: {err}"),
        }
    }
}

/// Result of a finished tunnel: which direction reported the terminal event,
/// how it ended, and the bytes delivered per direction.
#[derive(Debug)]
pub struct RelayOutcome {
    pub first: Direction,
    pub end: TunnelEnd,
    pub client_to_remote: u64,
    pub remote_to_client: u64,
}

impl RelayOutcome {
    /// The endpoint at fault, if the tunnel ended on an error. An EOF is a
    /// clean close and attributes no fault.
    pub fn error_side(&self) -> Option<Side> {
        match &self.end {
            TunnelEnd::Eof => None,
            TunnelEnd::ReadError(_) => Some(self.first.source()),
            TunnelEnd::WriteError(_) => Some(self.first.dest()),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.end.is_clean()
    }
}

/// One hop through a delivery channel: a chunk of payload, or the marker a
/// reader leaves behind when its source is done (cleanly or not).
enum Frame {
    Data(Bytes),
    Eos(Option<io::Error>),
}

struct DirectionDone {
    dir: Direction,
    end: TunnelEnd,
}

/// Dials the remote and relays the client against it until the tunnel
/// closes. On dial failure no tunnel exists and no loop has started;
/// dropping the client stream is the only teardown.
pub async fn relay<C>(
    client: C,
    remote_addr: &str,
    dialer: &dyn Dialer,
    opts: &RelayOptions,
) -> Result<RelayOutcome, DialError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let remote = dialer.dial(remote_addr).await?;
    Ok(run_tunnel(client, remote, opts).await)
}

/// Runs one established tunnel to completion: two reader loops feeding two
/// bounded delivery channels, two writer loops draining them, and this task
/// coordinating teardown.
///
/// The first direction to report a terminal outcome wins: both streams are
/// closed immediately and the other direction's loops are forced down rather
/// than left to hang. Writers report only after flushing everything queued
/// ahead of the end-of-stream marker, so a direction's own EOF never cuts
/// off frames it already read.
pub async fn run_tunnel<C, R>(client: C, remote: R, opts: &RelayOptions) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let frame_size = if opts.frame_size == 0 {
        DEFAULT_FRAME_SIZE
    } else {
        opts.frame_size
    };
    let capacity = if opts.channel_capacity == 0 {
        DEFAULT_CHANNEL_CAPACITY
    } else {
        opts.channel_capacity
    };

    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let (to_remote_tx, to_remote_rx) = mpsc::channel(capacity);
    let (to_client_tx, to_client_rx) = mpsc::channel(capacity);

    let c2r_bytes = Arc::new(AtomicU64::new(0));
    let r2c_bytes = Arc::new(AtomicU64::new(0));

    let mut readers = JoinSet::new();
    readers.spawn(read_loop(
        client_read,
        to_remote_tx,
        frame_size,
        opts.idle_timeout,
        Direction::ClientToRemote,
    ));
    readers.spawn(read_loop(
        remote_read,
        to_client_tx,
        frame_size,
        opts.idle_timeout,
        Direction::RemoteToClient,
    ));

    let mut writers = JoinSet::new();
    writers.spawn(write_loop(
        to_remote_rx,
        remote_write,
        Direction::ClientToRemote,
        c2r_bytes.clone(),
    ));
    writers.spawn(write_loop(
        to_client_rx,
        client_write,
        Direction::RemoteToClient,
        r2c_bytes.clone(),
    ));

    // Running: wait for the first direction to report.
    let first = loop {
        match writers.join_next().await {
            Some(Ok(done)) => break done,
            Some(Err(err)) => {
                tracing::error!(err = %err, "relay: writer task failed");
                continue;
            }
            None => {
                break DirectionDone {
                    dir: Direction::ClientToRemote,
                    end: TunnelEnd::WriteError(io::Error::other("relay task failed")),
                };
            }
        }
    };

    // Draining: force both directions down. Aborting the loops drops all
    // four stream halves, which closes the pair and unblocks any read or
    // write still pending on the other direction. A second terminal event
    // racing in here is consumed and discarded.
    readers.abort_all();
    writers.abort_all();
    while readers.join_next().await.is_some() {}
    while writers.join_next().await.is_some() {}

    // Closed: every loop has exited and both handles are gone.
    RelayOutcome {
        first: first.dir,
        end: first.end,
        client_to_remote: c2r_bytes.load(Ordering::Relaxed),
        remote_to_client: r2c_bytes.load(Ordering::Relaxed),
    }
}

/// Reads frames from one endpoint into its delivery channel until the source
/// is done. Terminal reads (EOF, error, idle timeout) leave an end-of-stream
/// marker in the channel; the loop never closes the channel itself.
async fn read_loop<R>(
    mut src: R,
    tx: mpsc::Sender<Frame>,
    frame_size: usize,
    idle_timeout: Duration,
    dir: Direction,
) where
    R: AsyncRead + Unpin,
{
    // Each direction owns its buffer; nothing is shared across directions.
    let mut scratch = vec![0u8; frame_size];
    loop {
        match read_frame(&mut src, &mut scratch, idle_timeout).await {
            Ok(0) => {
                let _ = tx.send(Frame::Eos(None)).await;
                return;
            }
            Ok(n) => {
                let frame = Bytes::copy_from_slice(&scratch[..n]);
                if tx.send(Frame::Data(frame)).await.is_err() {
                    // Writer is gone; teardown is underway.
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(dir = %dir, err = %err, "relay: read failed");
                let _ = tx.send(Frame::Eos(Some(err))).await;
                return;
            }
        }
    }
}

async fn read_frame<R>(src: &mut R, buf: &mut [u8], idle_timeout: Duration) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    if idle_timeout > Duration::from_millis(0) {
        match time::timeout(idle_timeout, src.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        }
    } else {
        src.read(buf).await
    }
}

/// Drains one delivery channel into its destination, in order, each frame
/// written in full. Stops on the end-of-stream marker (propagating the
/// half-close) or on the first write error (queued frames are not drained;
/// the destination is gone).
async fn write_loop<W>(
    mut rx: mpsc::Receiver<Frame>,
    mut dst: W,
    dir: Direction,
    delivered: Arc<AtomicU64>,
) -> DirectionDone
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = rx.recv().await else {
            // Reader vanished without a marker: only possible once teardown
            // has started, so this result is never the first event.
            return DirectionDone {
                dir,
                end: TunnelEnd::Eof,
            };
        };
        match frame {
            Frame::Data(b) => {
                if let Err(err) = dst.write_all(&b).await {
                    tracing::debug!(dir = %dir, err = %err, "relay: write failed");
                    return DirectionDone {
                        dir,
                        end: TunnelEnd::WriteError(err),
                    };
                }
                delivered.fetch_add(b.len() as u64, Ordering::Relaxed);
            }
            Frame::Eos(cause) => {
                // Everything queued ahead of the marker has been written.
                let _ = dst.shutdown().await;
                let end = match cause {
                    None => TunnelEnd::Eof,
                    Some(err) => TunnelEnd::ReadError(err),
                };
                return DirectionDone { dir, end };
            }
        }
    }
}
