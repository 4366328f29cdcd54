//! Transport adapters: abstract framed connections feeding the protocol
//! driver.
//!
//! A transport is anything that delivers [`ConnEvent`]s into the driver's
//! connection channel and accepts outbound frames through the per-connection
//! sender handed over in [`ConnEvent::Up`]. A frame is a UTF-8 string; the
//! wire encodes messages as JSON.
//!
//! Two adapters live here: an in-process pair for tests and multi-node
//! simulations, and TCP with u32 length-prefixed frames. Peer identity is
//! not a transport concern; it arrives in-band via the HELLO message.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Frames above this are dropped before parsing.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Per-connection outbound queue depth.
pub const SEND_QUEUE_CAP: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery handle for one transport connection. Process-unique; routing
/// identity lives in the finger table, not here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
#[display(fmt = "conn{}", _0)]
pub struct ConnId(u64);

impl ConnId {
    pub fn fresh() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connection lifecycle events delivered to the protocol driver.
#[derive(Debug)]
pub enum ConnEvent {
    /// A connection came up; outbound frames go through `tx`.
    Up {
        conn: ConnId,
        tx: mpsc::Sender<String>,
    },
    /// An inbound frame.
    Frame { conn: ConnId, frame: String },
    /// The connection closed.
    Down { conn: ConnId },
}

/// Connect two drivers in-process. Frames one side sends come out as
/// [`ConnEvent::Frame`] on the other side. Returns the connection ids as
/// seen by `a` and `b` respectively.
pub async fn connect_memory(
    a: &mpsc::Sender<ConnEvent>,
    b: &mpsc::Sender<ConnEvent>,
) -> Result<(ConnId, ConnId)> {
    let a_conn = ConnId::fresh();
    let b_conn = ConnId::fresh();
    let (a_tx, a_rx) = mpsc::channel::<String>(SEND_QUEUE_CAP);
    let (b_tx, b_rx) = mpsc::channel::<String>(SEND_QUEUE_CAP);

    a.send(ConnEvent::Up {
        conn: a_conn,
        tx: a_tx,
    })
    .await
    .context("peer a gone")?;
    b.send(ConnEvent::Up {
        conn: b_conn,
        tx: b_tx,
    })
    .await
    .context("peer b gone")?;

    tokio::spawn(pump(a_rx, b.clone(), b_conn));
    tokio::spawn(pump(b_rx, a.clone(), a_conn));
    Ok((a_conn, b_conn))
}

async fn pump(mut rx: mpsc::Receiver<String>, to: mpsc::Sender<ConnEvent>, conn: ConnId) {
    while let Some(frame) = rx.recv().await {
        if to.send(ConnEvent::Frame { conn, frame }).await.is_err() {
            break;
        }
    }
    let _ = to.send(ConnEvent::Down { conn }).await;
}

/// Bind a TCP server transport. Every accepted connection is surfaced to
/// `events`; the accept loop runs until the returned task is aborted.
pub async fn listen_tcp(
    addr: impl Into<SocketAddr>,
    events: mpsc::Sender<ConnEvent>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr.into()).await?;
    let local = listener.local_addr()?;
    debug!(%local, "transport listening");
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!(%peer, "inbound transport connection");
                    spawn_conn(stream, events.clone());
                }
                Err(err) => {
                    warn!(%err, "accept failed, stopping listener");
                    break;
                }
            }
        }
    });
    Ok((local, handle))
}

/// Dial a TCP peer. Reconnects are the caller's concern.
pub async fn connect_tcp(addr: &str, events: mpsc::Sender<ConnEvent>) -> Result<ConnId> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    Ok(spawn_conn(stream, events))
}

fn spawn_conn(stream: TcpStream, events: mpsc::Sender<ConnEvent>) -> ConnId {
    let conn = ConnId::fresh();
    let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_CAP);
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::spawn(async move {
        if events.send(ConnEvent::Up { conn, tx }).await.is_err() {
            return;
        }
        let reader = {
            let events = events.clone();
            async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(Some(frame)) => {
                            if events.send(ConnEvent::Frame { conn, frame }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(%conn, %err, "read failed");
                            break;
                        }
                    }
                }
            }
        };
        let writer = async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &frame).await {
                    debug!(%conn, %err, "write failed");
                    break;
                }
            }
        };
        tokio::select! {
            _ = reader => {}
            _ = writer => {}
        }
        let _ = events.send(ConnEvent::Down { conn }).await;
        trace!(%conn, "transport connection closed");
    });
    conn
}

/// Write one u32 length-prefixed frame.
async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &str) -> Result<()> {
    let bytes = frame.as_bytes();
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("outbound frame of {} bytes exceeds cap", bytes.len());
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_SIZE {
        bail!("inbound frame of {len} bytes exceeds cap");
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let frame = String::from_utf8(buf).context("frame is not UTF-8")?;
    Ok(Some(frame))
}
