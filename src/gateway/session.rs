//! GatewaySession overlay (§3 GatewaySession, §4.3 per-player serialisation).
//!
//! Adds auth/role state on top of `Session` plus a bounded per-player task
//! queue. On the first backend-bound message a worker is lazily spawned to
//! drain that queue one envelope at a time, performing the full blocking
//! backend call to completion before taking the next — this is what keeps
//! messages from role R reaching Game in the order they arrived on R's
//! connection (§4.3 Ordering) without letting a slow backend call for role A
//! stall role B's read loop.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::session::Session;

pub const DEFAULT_TASK_QUEUE_DEPTH: usize = 1024;

/// A unit of backend-bound work handed to the per-player worker.
pub type ForwardFn = Arc<dyn Fn(Envelope) -> BoxFuture + Send + Sync>;

// A boxed future alias keeps the trait object above nameable without pulling
// in a new async-trait-object abstraction just for this one closure type.
pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>;

/// Auth/role state plus the per-player serialisation queue (§3
/// GatewaySession). Invariants enforced here, matching §3 verbatim:
///   (a) `role_selected ⇒ authenticated`
///   (b) while `role_selected`, exactly one worker drains `task_queue`
///   (c) `task_queue` never blocks producers; full pushes are dropped with
///       a diagnostic, not retried.
pub struct GatewaySession {
    pub session: Arc<Session>,
    uid: AtomicI64,
    role_id: AtomicI64,
    authenticated: AtomicBool,
    role_selected: AtomicBool,
    task_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    worker_started: AtomicBool,
}

impl GatewaySession {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            uid: AtomicI64::new(0),
            role_id: AtomicI64::new(0),
            authenticated: AtomicBool::new(false),
            role_selected: AtomicBool::new(false),
            task_tx: Mutex::new(None),
            worker_started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn role_id(&self) -> i64 {
        self.role_id.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_role_selected(&self) -> bool {
        self.role_selected.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, uid: i64) {
        self.uid.store(uid, Ordering::Release);
        self.authenticated.store(true, Ordering::Release);
    }

    pub(crate) fn set_role(&self, role_id: i64) {
        debug_assert!(self.is_authenticated(), "role_selected requires authenticated (P1)");
        self.role_id.store(role_id, Ordering::Release);
        self.role_selected.store(true, Ordering::Release);
    }

    pub(crate) fn clear_role(&self) {
        self.role_selected.store(false, Ordering::Release);
    }

    /// Idempotent: a second call while the worker is already running is a
    /// no-op (§4.3 "single-flight"). Spawns one long-lived task that drains
    /// `task_queue` in order, calling `forward` to completion for each
    /// envelope before pulling the next.
    ///
    /// `parent_lifetime` is ANDed with the session's own lifetime: the
    /// worker exits when either is cancelled (§4.3).
    pub fn start_processor(self: &Arc<Self>, parent_lifetime: CancellationToken, forward: ForwardFn) {
        if self.worker_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Envelope>(DEFAULT_TASK_QUEUE_DEPTH);
        *self.task_tx.lock() = Some(tx);

        let session_lifetime = self.session.lifetime();
        let session_id = self.id();

        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = session_lifetime.cancelled() => break,
                    _ = parent_lifetime.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(e) => e,
                        None => break,
                    },
                };

                // Full blocking backend call to completion before the next
                // envelope is taken — this single-worker serialisation is
                // what guarantees per-role FIFO delivery to Game (§4.3, P5).
                forward(envelope).await;
            }
            debug!(session_id = %session_id, "per-player worker exiting");
        });
    }

    /// Non-blocking push onto the per-player queue (§4.3 Backpressure): if
    /// the worker hasn't been started yet, or the queue is full, the
    /// envelope is dropped and `false` is returned so the caller can bump a
    /// diagnostic counter. The transport is never paused.
    pub fn enqueue_forward(&self, envelope: Envelope) -> bool {
        let guard = self.task_tx.lock();
        match guard.as_ref() {
            Some(tx) => match tx.try_send(envelope) {
                Ok(()) => true,
                Err(_) => {
                    warn!(session_id = %self.id(), "per-player task queue full, dropping envelope");
                    false
                }
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::detached_session;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn role_selected_implies_authenticated_invariant_holds() {
        let (session, _rx) = detached_session(4);
        let gs = GatewaySession::new(Arc::new(session));
        gs.set_authenticated(42);
        gs.set_role(100);
        assert!(gs.is_role_selected());
        assert!(gs.is_authenticated());
    }

    #[tokio::test]
    async fn per_player_forwarding_preserves_arrival_order() {
        let (session, _rx) = detached_session(4);
        let gs = Arc::new(GatewaySession::new(Arc::new(session)));

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let forward: ForwardFn = Arc::new(move |env: Envelope| {
            let order = order_clone.clone();
            Box::pin(async move {
                // Simulate variable backend latency: later messages would
                // race ahead of earlier ones if processed concurrently.
                if env.op == 1 {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                order.lock().push(env.op);
            })
        });

        gs.start_processor(CancellationToken::new(), forward);
        gs.enqueue_forward(Envelope::new(1, Bytes::from_static(b"A")));
        gs.enqueue_forward(Envelope::new(2, Bytes::from_static(b"B")));
        gs.enqueue_forward(Envelope::new(3, Bytes::from_static(b"C")));

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn second_start_processor_call_is_noop() {
        let (session, _rx) = detached_session(4);
        let gs = Arc::new(GatewaySession::new(Arc::new(session)));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let forward: ForwardFn = Arc::new(move |_env: Envelope| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            });
            gs.start_processor(CancellationToken::new(), forward);
        }

        gs.enqueue_forward(Envelope::new(1, Bytes::new()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Only the first `forward` closure is ever installed; the second
        // start_processor call must not have replaced the channel.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
