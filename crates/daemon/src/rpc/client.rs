//! Client side of the transport with automatic reconnect.
//!
//! Server events are only ever pushed live, so every (re)connect starts by
//! asking for a full resync instead of trying to recover missed deltas.
//! A command whose write failed is sent again right after that resync.

use super::codec::ClientCodec;
use super::{ClientMessage, RequestFlags, ServerMessage, TransportError};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay unit for reconnect attempts.
pub const RECONNECT_BASE: Duration = Duration::from_secs(10);

/// Linear backoff: the n-th consecutive failure waits `n * base`.
pub fn backoff_delay(base: Duration, fail_count: u32) -> Duration {
    base.saturating_mul(fail_count.max(1))
}

/// Handle to a background connection task.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    tx: mpsc::Sender<ClientMessage>,
    shutdown: CancellationToken,
}

enum SessionEnd {
    Stop,
    Lost,
}

impl ServerConnection {
    /// Connect to `addr` in the background; decoded events go to `events`.
    pub fn connect(addr: impl Into<String>, events: mpsc::Sender<ServerMessage>) -> Self {
        Self::with_base_delay(addr, events, RECONNECT_BASE)
    }

    pub fn with_base_delay(
        addr: impl Into<String>,
        events: mpsc::Sender<ServerMessage>,
        base: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        tokio::spawn(run(addr.into(), base, rx, events, shutdown.clone()));
        Self { tx, shutdown }
    }

    /// Queue a command; it is written once a connection is up.
    pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.tx.send(message).await.map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection task stopped",
            ))
        })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn run(
    addr: String,
    base: Duration,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
) {
    let mut fail_count: u32 = 0;
    let mut pending = None;
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(server = %addr, "connected");
                fail_count = 0;
                match session(stream, &mut outbound, &events, &shutdown, &mut pending).await {
                    Ok(SessionEnd::Stop) => break,
                    Ok(SessionEnd::Lost) => warn!(server = %addr, "connection lost"),
                    Err(e) => warn!(server = %addr, error = %e, "connection failed"),
                }
            }
            Err(e) => warn!(server = %addr, error = %e, "connect failed"),
        }
        fail_count += 1;
        let delay = backoff_delay(base, fail_count);
        debug!(retry_in = ?delay, "reconnecting");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session<S>(
    stream: S,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::Sender<ServerMessage>,
    shutdown: &CancellationToken,
    pending: &mut Option<ClientMessage>,
) -> Result<SessionEnd, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ClientCodec::default());
    framed.send(ClientMessage::Request(RequestFlags::ALL)).await?;
    if let Some(message) = pending.take() {
        deliver(&mut framed, message, pending).await?;
    }
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(SessionEnd::Stop),
            message = outbound.recv() => match message {
                Some(message) => deliver(&mut framed, message, pending).await?,
                None => return Ok(SessionEnd::Stop),
            },
            event = framed.next() => match event {
                Some(Ok(event)) => {
                    if events.send(event).await.is_err() {
                        return Ok(SessionEnd::Stop);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(SessionEnd::Lost),
            },
        }
    }
}

/// Write `message`, keeping it in `pending` if the connection fails.
async fn deliver<S>(
    framed: &mut Framed<S, ClientCodec>,
    message: ClientMessage,
    pending: &mut Option<ClientMessage>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = framed.send(message.clone()).await {
        *pending = Some(message);
        return Err(e);
    }
    Ok(())
}
