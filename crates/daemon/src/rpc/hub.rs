//! Server side of the transport.
//!
//! Every connected client gets a bounded outbound queue drained by its own
//! writer task. Broadcast frames are encoded once and handed to every queue
//! without waiting; a client whose queue is full or whose socket fails is
//! dropped on its own, the others never notice.

use super::codec::ServerCodec;
use super::{ClientMessage, EventSink, ServerMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound frames buffered per client before it is considered stuck.
pub const CLIENT_QUEUE: usize = 1024;

/// Base delay between failed accepts, multiplied by the failure count.
const ACCEPT_RETRY: Duration = Duration::from_secs(5);

pub type ClientId = u64;

/// A decoded command and the client it came from.
#[derive(Debug)]
pub struct Inbound {
    pub client: ClientId,
    pub message: ClientMessage,
}

#[derive(Debug)]
struct ClientEntry {
    peer: String,
    tx: mpsc::Sender<Bytes>,
    close: CancellationToken,
}

#[derive(Debug, Default)]
struct HubInner {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
}

/// Set of connected clients.
#[derive(Debug, Clone, Default)]
pub struct ClientHub {
    inner: Arc<HubInner>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Start serving a connected stream. Decoded commands go to `inbound`.
    pub fn attach<S>(&self, stream: S, peer: String, inbound: mpsc::Sender<Inbound>) -> ClientId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let close = CancellationToken::new();
        self.inner.clients.lock().insert(
            id,
            ClientEntry {
                peer: peer.clone(),
                tx,
                close: close.clone(),
            },
        );
        info!(client = id, peer = %peer, "client connected");

        let (reader, writer) = tokio::io::split(stream);
        let reader = FramedRead::new(reader, ServerCodec::default());
        let writer = FramedWrite::new(writer, ServerCodec::default());
        tokio::spawn(write_loop(self.clone(), id, writer, rx, close.clone()));
        tokio::spawn(read_loop(self.clone(), id, reader, inbound, close));
        id
    }

    /// Queue an encoded frame for every client.
    pub fn broadcast(&self, frame: Bytes) {
        let mut stuck = Vec::new();
        {
            let clients = self.inner.clients.lock();
            for (id, client) in clients.iter() {
                if client.tx.try_send(frame.clone()).is_err() {
                    stuck.push(*id);
                }
            }
        }
        for id in stuck {
            warn!(client = id, "client not keeping up, disconnecting");
            self.remove(id);
        }
    }

    /// Queue a message for one client only.
    pub fn send_to(&self, id: ClientId, message: &ServerMessage) {
        let frame = match message.to_frame() {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to encode message");
                return;
            }
        };
        let failed = match self.inner.clients.lock().get(&id) {
            Some(client) => client.tx.try_send(frame).is_err(),
            None => false,
        };
        if failed {
            self.remove(id);
        }
    }

    pub fn remove(&self, id: ClientId) {
        if let Some(client) = self.inner.clients.lock().remove(&id) {
            client.close.cancel();
            info!(client = id, peer = %client.peer, "client disconnected");
        }
    }

    pub fn close_all(&self) {
        let clients: Vec<ClientEntry> = self.inner.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close.cancel();
        }
    }
}

impl EventSink for ClientHub {
    fn publish(&self, message: ServerMessage) {
        match message.to_frame() {
            Ok(frame) => self.broadcast(frame),
            Err(e) => error!(method = ?message.method(), error = %e, "failed to encode broadcast"),
        }
    }
}

async fn write_loop<W>(
    hub: ClientHub,
    id: ClientId,
    mut writer: FramedWrite<W, ServerCodec>,
    mut rx: mpsc::Receiver<Bytes>,
    close: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        debug!(client = id, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    hub.remove(id);
}

async fn read_loop<R>(
    hub: ClientHub,
    id: ClientId,
    mut reader: FramedRead<R, ServerCodec>,
    inbound: mpsc::Sender<Inbound>,
    close: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = close.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(message)) => {
                if inbound.send(Inbound { client: id, message }).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(client = id, error = %e, "read failed");
                break;
            }
            None => break,
        }
    }
    hub.remove(id);
}

/// Accept clients until `shutdown` fires.
///
/// Accept errors are retried after a delay that grows with each consecutive
/// failure.
pub async fn serve(
    listener: TcpListener,
    hub: ClientHub,
    inbound: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    let mut error_count: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    error_count = 0;
                    let _ = stream.set_nodelay(true);
                    hub.attach(stream, addr.to_string(), inbound.clone());
                }
                Err(e) => {
                    error_count += 1;
                    let delay = ACCEPT_RETRY * error_count;
                    error!(error = %e, retry_in = ?delay, "accept failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
    hub.close_all();
    info!("listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::{encode_frame, ClientCodec};
    use crate::rpc::{OperationResult, RequestFlags};
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::codec::Framed;

    type Remote = Framed<DuplexStream, ClientCodec>;

    fn remote(stream: DuplexStream) -> Remote {
        Framed::new(stream, ClientCodec::default())
    }

    async fn next_message(remote: &mut Remote) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), remote.next())
            .await
            .expect("frame should arrive")
            .expect("stream open")
            .unwrap()
    }

    async fn wait_for_count(hub: &ClientHub, n: usize) {
        for _ in 0..100 {
            if hub.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, have {}", n, hub.client_count());
    }

    #[tokio::test]
    async fn test_broken_client_does_not_affect_others() {
        let hub = ClientHub::new();
        let (inbound, _rx) = mpsc::channel(16);
        let (a_local, a_remote) = duplex(64 * 1024);
        let (b_local, b_remote) = duplex(64 * 1024);
        let mut a_remote = remote(a_remote);
        hub.attach(a_local, "a".into(), inbound.clone());
        hub.attach(b_local, "b".into(), inbound);
        assert_eq!(hub.client_count(), 2);

        drop(b_remote);
        let msg = ServerMessage::OnOperationResult(OperationResult::ok("hello"));
        hub.publish(msg.clone());

        assert_eq!(next_message(&mut a_remote).await, msg);
        wait_for_count(&hub, 1).await;

        hub.publish(ServerMessage::operation_ok("again"));
        match next_message(&mut a_remote).await {
            ServerMessage::OnOperationResult(r) => assert_eq!(r.message, "again"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_commands_carry_client_id() {
        let hub = ClientHub::new();
        let (inbound, mut rx) = mpsc::channel(16);
        let (local, remote_end) = duplex(64 * 1024);
        let mut remote_end = remote(remote_end);
        let id = hub.attach(local, "a".into(), inbound);

        remote_end
            .send(ClientMessage::Request(RequestFlags::QUEUE))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.client, id);
        assert_eq!(got.message, ClientMessage::Request(RequestFlags::QUEUE));
    }

    #[tokio::test]
    async fn test_unknown_method_is_skipped() {
        let hub = ClientHub::new();
        let (inbound, mut rx) = mpsc::channel(16);
        let (local, remote_end) = duplex(64 * 1024);
        let mut remote_end = remote(remote_end);
        hub.attach(local, "a".into(), inbound);

        remote_end
            .send(encode_frame(77, b"{}").unwrap())
            .await
            .unwrap();
        remote_end.send(ClientMessage::EndServer).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, ClientMessage::EndServer);
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_reaches_only_target() {
        let hub = ClientHub::new();
        let (inbound, _rx) = mpsc::channel(16);
        let (a_local, a_remote) = duplex(64 * 1024);
        let (b_local, b_remote) = duplex(64 * 1024);
        let mut a_remote = remote(a_remote);
        let mut b_remote = remote(b_remote);
        let a = hub.attach(a_local, "a".into(), inbound.clone());
        hub.attach(b_local, "b".into(), inbound);

        hub.send_to(a, &ServerMessage::operation_ok("only a"));
        hub.publish(ServerMessage::operation_ok("everyone"));

        match next_message(&mut a_remote).await {
            ServerMessage::OnOperationResult(r) => assert_eq!(r.message, "only a"),
            other => panic!("unexpected {:?}", other),
        }
        match next_message(&mut b_remote).await {
            ServerMessage::OnOperationResult(r) => assert_eq!(r.message, "everyone"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
