//! Session core (§3 Session, §4.1 Session pipeline).
//!
//! A `Session` owns exactly one framed transport: a send queue, a recv
//! queue, a `Framer`, and a scoped lifetime (`CancellationToken`) that, once
//! tripped, is observed at every suspension point (§5) by the read, write
//! and — for `GatewaySession` — worker task.
//!
//! Three-stage isolation per connection (§4.1):
//!   1. read:  one task decodes frames and both pushes to `recv` and invokes
//!      `SessionHandler::on_message` synchronously.
//!   2. dispatch: the handler answers inline or enqueues backend work.
//!   3. write: one task drains `send` in FIFO order and writes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, Framer};
use crate::errors::SessionError;

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Callbacks invoked by the read/write loop. Implemented per service
/// (gateway, login, game) — see `crate::gateway::handler` for the richest
/// implementation. The handler never stores `Arc<Session>` beyond a call
/// (§9 Design Notes, cyclic references): it receives `&Session` as an
/// argument and returns.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_opened(&self, session: &Arc<Session>);
    async fn on_message(&self, session: &Arc<Session>, envelope: Envelope);
    async fn on_closed(&self, session_id: Uuid);
    async fn on_error(&self, session_id: Uuid, error: SessionError);
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("session closed")]
    Closed,
    #[error("send queue full, envelope dropped")]
    QueueFull,
}

/// Transport-agnostic connection identity and queues (§3 Session).
///
/// `id` is a UUIDv4 minted on accept/dial. Destroyed on transport close or
/// explicit `close()`; the scoped lifetime is cancelled on either path and
/// propagates to every child task (read, write, and — for gateway sessions
/// — the per-player worker).
pub struct Session {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    send_tx: mpsc::Sender<Envelope>,
    lifetime: CancellationToken,
    framer: Arc<Framer>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Enqueues an envelope for the write loop. Non-blocking: if the send
    /// queue is full the envelope is dropped and `SendError::QueueFull` is
    /// returned (§4.1 stage 3 — producers never write the transport
    /// directly, and the queue is never allowed to block a producer).
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.send_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Cancels the scoped lifetime. Read/write/worker tasks observe this at
    /// their next suspension point and exit; double-close is a no-op
    /// because `CancellationToken::cancel` is idempotent.
    pub fn close(&self) {
        self.lifetime.cancel();
    }
}

struct SessionInner {
    stream: TcpStream,
    framer: Arc<Framer>,
    send_rx: mpsc::Receiver<Envelope>,
    recv_tx: mpsc::Sender<Envelope>,
    lifetime: CancellationToken,
}

/// Accepts a single TCP connection and runs its three-stage pipeline to
/// completion. Returns once the session is fully torn down (`on_closed` has
/// been invoked exactly once).
pub async fn run_session<H: SessionHandler + 'static>(
    stream: TcpStream,
    remote_addr: SocketAddr,
    framer: Arc<Framer>,
    handler: Arc<H>,
    parent_lifetime: CancellationToken,
    queue_depth: usize,
) {
    let id = Uuid::new_v4();
    let lifetime = parent_lifetime.child_token();
    let (send_tx, send_rx) = mpsc::channel(queue_depth);
    let (recv_tx, mut recv_rx) = mpsc::channel(queue_depth);

    let session = Arc::new(Session {
        id,
        remote_addr,
        send_tx,
        lifetime: lifetime.clone(),
        framer: framer.clone(),
    });

    handler.on_opened(&session).await;

    // recv_rx is drained purely to apply backpressure on the read loop's
    // push; on_message is the actual dispatch path (§4.1 stage 1 fires both).
    tokio::spawn(async move { while recv_rx.recv().await.is_some() {} });

    let inner = SessionInner {
        stream,
        framer,
        send_rx,
        recv_tx,
        lifetime: lifetime.clone(),
    };

    let (read_half, write_half) = inner.stream.into_split();

    let read_task = tokio::spawn(read_loop(
        read_half,
        inner.framer.clone(),
        inner.recv_tx,
        session.clone(),
        handler.clone(),
        inner.lifetime.clone(),
    ));
    let write_task = tokio::spawn(write_loop(
        write_half,
        inner.framer,
        inner.send_rx,
        inner.lifetime.clone(),
    ));

    // Either loop exiting (EOF, error, or cancellation) tears down the
    // session; we wait for both so sockets are fully released.
    let _ = tokio::join!(read_task, write_task);

    session.close();
    handler.on_closed(id).await;
}

async fn read_loop<H: SessionHandler + 'static>(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    framer: Arc<Framer>,
    recv_tx: mpsc::Sender<Envelope>,
    session: Arc<Session>,
    handler: Arc<H>,
    lifetime: CancellationToken,
) {
    let mut length_buf = [0u8; 4];
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            result = read_half.read_exact(&mut length_buf) => {
                if result.is_err() {
                    break;
                }
            }
        }

        let len = u32::from_be_bytes(length_buf) as usize;
        if len > framer.max_frame_len() {
            warn!(session_id = %session.id, len, max = framer.max_frame_len(), "rejecting oversized frame length prefix");
            handler
                .on_error(session.id, SessionError::Framer(crate::envelope::FramerError::FrameTooLarge {
                    max: framer.max_frame_len(),
                    got: len,
                }))
                .await;
            break;
        }
        let mut body = BytesMut::with_capacity(len);
        body.resize(len, 0);

        tokio::select! {
            _ = lifetime.cancelled() => break,
            result = read_half.read_exact(&mut body) => {
                if result.is_err() {
                    break;
                }
            }
        }

        let envelope = match framer.decode(body.freeze()) {
            Ok(e) => e,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "frame decode failed");
                handler.on_error(session.id, SessionError::Framer(e)).await;
                break;
            }
        };

        // Recovery boundary: a handler panic must not take down the read
        // loop (§5 Failure isolation). `catch_unwind` requires the future
        // to be driven to completion outside the panicking stack frame, so
        // we spawn it and join, converting a join error into OnError.
        let handler_for_call = handler.clone();
        let session_for_call = session.clone();
        let envelope_for_call = envelope.clone();
        let dispatch = tokio::spawn(async move {
            handler_for_call
                .on_message(&session_for_call, envelope_for_call)
                .await;
        });

        if dispatch.await.is_err() {
            error!(session_id = %session.id, "handler panicked");
            handler
                .on_error(session.id, SessionError::HandlerPanicked("on_message".into()))
                .await;
            break;
        }

        if recv_tx.try_send(envelope).is_err() {
            debug!(session_id = %session.id, "recv queue full, dropping envelope");
            handler.on_error(session.id, SessionError::QueueFull).await;
        }
    }
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    framer: Arc<Framer>,
    mut send_rx: mpsc::Receiver<Envelope>,
    lifetime: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = lifetime.cancelled() => break,
            maybe = send_rx.recv() => match maybe {
                Some(e) => e,
                None => break,
            },
        };

        let frame = match framer.encode(&envelope) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "frame encode failed, dropping envelope");
                continue;
            }
        };

        let len = (frame.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err() {
            break;
        }
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
}

/// Helper for tests and for the Login/client-dial path: builds a bare
/// `Session` without spawning a transport pipeline (used to exercise
/// `SessionManager` invariants without a real socket).
pub fn detached_session(queue_depth: usize) -> (Session, mpsc::Receiver<Envelope>) {
    let (send_tx, send_rx) = mpsc::channel(queue_depth);
    let session = Session {
        id: Uuid::new_v4(),
        remote_addr: "0.0.0.0:0".parse().unwrap(),
        send_tx,
        lifetime: CancellationToken::new(),
        framer: Arc::new(Framer::plain()),
    };
    (session, send_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (session, _rx) = detached_session(4);
        session.close();
        let err = session.send(Envelope::new(1, Bytes::new())).unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn send_enqueue_order_is_fifo() {
        let (session, mut rx) = detached_session(4);
        session.send(Envelope::new(1, Bytes::from_static(b"A"))).unwrap();
        session.send(Envelope::new(2, Bytes::from_static(b"B"))).unwrap();
        session.send(Envelope::new(3, Bytes::from_static(b"C"))).unwrap();
        assert_eq!(rx.recv().await.unwrap().op, 1);
        assert_eq!(rx.recv().await.unwrap().op, 2);
        assert_eq!(rx.recv().await.unwrap().op, 3);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (session, _rx) = detached_session(1);
        session.send(Envelope::new(1, Bytes::new())).unwrap();
        let err = session.send(Envelope::new(2, Bytes::new())).unwrap_err();
        assert!(matches!(err, SendError::QueueFull));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let (session, _rx) = detached_session(4);
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    struct RecordingHandler {
        errors: std::sync::Mutex<Vec<SessionError>>,
        lifetime: CancellationToken,
    }

    #[async_trait::async_trait]
    impl SessionHandler for RecordingHandler {
        async fn on_opened(&self, _session: &Arc<Session>) {}
        async fn on_message(&self, _session: &Arc<Session>, _envelope: Envelope) {}
        async fn on_closed(&self, _session_id: Uuid) {}
        async fn on_error(&self, _session_id: Uuid, error: SessionError) {
            self.errors.lock().unwrap().push(error);
            self.lifetime.cancel();
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_allocating() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let lifetime = CancellationToken::new();
        let handler = Arc::new(RecordingHandler { errors: std::sync::Mutex::new(Vec::new()), lifetime: lifetime.clone() });
        let framer = Arc::new(Framer::plain());

        let handler_for_server = handler.clone();
        let framer_for_server = framer.clone();
        let lifetime_for_server = lifetime.clone();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            run_session(stream, remote, framer_for_server, handler_for_server, lifetime_for_server, 8).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // Claims a near-4 GiB body with no intent of ever sending it; a
        // bound check must reject this before `body.resize(len, 0)` runs.
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), server).await.unwrap().unwrap();

        let errors = handler.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SessionError::Framer(crate::envelope::FramerError::FrameTooLarge { .. })));
    }
}
