//! Opcode dispatch table (§4.6 Router/Processor).
//!
//! A small mechanical layer on top of the opcode match arms each service
//! writes by hand (`gateway::handler`, the Game stream inbound loop):
//! register one async closure per opcode, dispatch decodes nothing itself —
//! it only routes — and pairs a response opcode via
//! `envelope::response_of` when the handler produces one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::envelope::{response_of, Envelope};

pub type RouteFuture = Pin<Box<dyn std::future::Future<Output = Option<Envelope>> + Send + 'static>>;
pub type RouteHandler = Arc<dyn Fn(Envelope) -> RouteFuture + Send + Sync>;

/// Maps request opcodes to handlers. Unregistered opcodes are dropped
/// silently, matching the client protocol's "no unknown-op response" rule
/// (§6).
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<u32, RouteHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, op: u32, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Envelope>> + Send + 'static,
    {
        self.routes.insert(op, Arc::new(move |e| Box::pin(handler(e))));
    }

    pub fn is_registered(&self, op: u32) -> bool {
        self.routes.contains_key(&op)
    }

    /// Dispatches `envelope` to its registered handler. If the handler
    /// returns a payload-bearing response, the reply's `op` is forced to
    /// `response_of(request.op)` (§C.2) and its `seq_id` mirrors the
    /// request's, so callers never have to remember the pairing rule.
    pub async fn dispatch(&self, envelope: Envelope) -> Option<Envelope> {
        let handler = self.routes.get(&envelope.op)?.clone();
        let req_op = envelope.op;
        let req_seq = envelope.seq_id;
        let reply = handler(envelope).await?;
        Some(Envelope { op: response_of(req_op), seq_id: req_seq, ..reply })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn dispatch_pairs_response_opcode_automatically() {
        let mut router = Router::new();
        router.register(10, |e: Envelope| async move {
            Some(Envelope::new(0, Bytes::from(e.payload.to_vec())))
        });

        let req = Envelope::new(10, Bytes::from_static(b"ping")).with_seq(5);
        let res = router.dispatch(req).await.unwrap();
        assert_eq!(res.op, 11);
        assert_eq!(res.seq_id, 5);
        assert_eq!(res.payload.as_ref(), b"ping");
    }

    #[tokio::test]
    async fn unregistered_opcode_is_silently_dropped() {
        let router = Router::new();
        let req = Envelope::new(999, Bytes::new());
        assert!(router.dispatch(req).await.is_none());
    }

    #[tokio::test]
    async fn handler_returning_none_produces_no_response() {
        let mut router = Router::new();
        router.register(1, |_e: Envelope| async move { None });
        let req = Envelope::new(1, Bytes::new());
        assert!(router.dispatch(req).await.is_none());
    }
}
