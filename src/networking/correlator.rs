use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::dispatcher::{Dispatcher, HandlerId};
use crate::networking::wire::OutboundFrame;
use crate::{Error, Result};

/// Anything a correlated request can be transmitted over. Implemented by the
/// transport session; tests substitute their own sinks.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &OutboundFrame) -> Result<()>;
}

/// How a pending request recognizes its reply: a success event kind gated on
/// a payload predicate, and optionally an error event kind whose payload's
/// `error` field fails the request.
pub struct ReplyMatch {
    kind: &'static str,
    predicate: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    error_kind: Option<&'static str>,
}

impl ReplyMatch {
    pub fn on<F>(kind: &'static str, predicate: F) -> ReplyMatch
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        ReplyMatch {
            kind,
            predicate: Box::new(predicate),
            error_kind: None,
        }
    }

    pub fn with_failure(mut self, error_kind: &'static str) -> ReplyMatch {
        self.error_kind = Some(error_kind);
        self
    }
}

// The deadline itself lives in the timeout future racing the completion
// slot; all a pending entry owns is what must be torn down on settlement.
struct PendingRequest {
    subscriptions: Vec<(String, HandlerId)>,
}

/// Turns a fire-and-forget send into an awaitable call: subscribe one-shot
/// handlers for the expected reply, transmit, then race the completion slot
/// against a deadline. Exactly one of success, typed failure, timeout, or
/// transport error reaches the caller, and the handlers are unsubscribed on
/// every exit path.
pub struct Correlator {
    dispatcher: Arc<Dispatcher>,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl Correlator {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Correlator {
        Correlator {
            dispatcher,
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub async fn send_and_await(
        &self,
        sink: &dyn FrameSink,
        frame: OutboundFrame,
        reply: ReplyMatch,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (resolve_tx, resolve_rx) = oneshot::channel::<std::result::Result<Value, String>>();
        // At-most-one resolution: whichever handler fires first takes the
        // sender out of the slot, later events find it empty.
        let slot = Arc::new(Mutex::new(Some(resolve_tx)));

        let mut subscriptions = Vec::new();
        {
            let slot = slot.clone();
            let predicate = reply.predicate;
            let id = self.dispatcher.subscribe(reply.kind, move |payload| {
                if predicate(payload) {
                    if let Some(tx) = slot.lock().unwrap().take() {
                        let _ = tx.send(Ok(payload.clone()));
                    }
                }
                Ok(())
            });
            subscriptions.push((reply.kind.to_string(), id));
        }
        if let Some(error_kind) = reply.error_kind {
            let slot = slot.clone();
            let id = self.dispatcher.subscribe(error_kind, move |payload| {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let reason = payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified relay error")
                        .to_string();
                    let _ = tx.send(Err(reason));
                }
                Ok(())
            });
            subscriptions.push((error_kind.to_string(), id));
        }

        self.pending
            .lock()
            .unwrap()
            .insert(request_id, PendingRequest { subscriptions });

        if let Err(err) = sink.send_frame(&frame) {
            self.settle(request_id);
            return Err(err);
        }

        let outcome = tokio::time::timeout(timeout, resolve_rx).await;
        self.settle(request_id);
        match outcome {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(reason))) => Err(Error::Remote { reason }),
            // Completion slot dropped or deadline hit: either way no reply
            // arrived in time.
            Ok(Err(_)) | Err(_) => Err(Error::CorrelationTimeout { waited: timeout }),
        }
    }

    /// Removes the pending registration and its dispatcher subscriptions.
    fn settle(&self, request_id: u32) {
        let pending = self.pending.lock().unwrap().remove(&request_id);
        if let Some(pending) = pending {
            for (kind, id) in pending.subscriptions {
                self.dispatcher.unsubscribe(&kind, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullSink;
    impl FrameSink for NullSink {
        fn send_frame(&self, _frame: &OutboundFrame) -> Result<()> {
            Ok(())
        }
    }

    struct DeadSink;
    impl FrameSink for DeadSink {
        fn send_frame(&self, _frame: &OutboundFrame) -> Result<()> {
            Err(crate::TransportError::ChannelClosed.into())
        }
    }

    fn correlator() -> (Arc<Dispatcher>, Correlator) {
        let dispatcher = Arc::new(Dispatcher::new());
        let correlator = Correlator::new(dispatcher.clone());
        (dispatcher, correlator)
    }

    #[tokio::test]
    async fn resolves_when_the_predicate_matches() {
        let (dispatcher, correlator) = correlator();
        let publish = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dispatcher.publish("registered", &json!({"address": "other"}));
                dispatcher.publish("registered", &json!({"address": "me"}));
            })
        };
        let payload = correlator
            .send_and_await(
                &NullSink,
                OutboundFrame::register("me"),
                ReplyMatch::on("registered", |p| p["address"] == "me"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(payload["address"], "me");
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(dispatcher.handler_count("registered"), 0);
        publish.await.unwrap();
    }

    #[tokio::test]
    async fn times_out_and_removes_the_registration() {
        let (dispatcher, correlator) = correlator();
        let result = correlator
            .send_and_await(
                &NullSink,
                OutboundFrame::register("me"),
                ReplyMatch::on("registered", |p| p["address"] == "me"),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(Error::CorrelationTimeout { .. })));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(dispatcher.handler_count("registered"), 0);
        // A matching event after the deadline has nothing to land on.
        dispatcher.publish("registered", &json!({"address": "me"}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_event_fails_the_request() {
        let (dispatcher, correlator) = correlator();
        {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dispatcher.publish("messageError", &json!({"error": "unknown recipient"}));
            });
        }
        let result = correlator
            .send_and_await(
                &NullSink,
                OutboundFrame::message("a", "b", "hi"),
                ReplyMatch::on("messageSent", |p| p["to"] == "b").with_failure("messageError"),
                Duration::from_secs(1),
            )
            .await;
        match result {
            Err(Error::Remote { reason }) => assert_eq!(reason, "unknown recipient"),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert_eq!(dispatcher.handler_count("messageError"), 0);
        assert_eq!(dispatcher.handler_count("messageSent"), 0);
    }

    #[tokio::test]
    async fn transport_failure_cleans_up_immediately() {
        let (dispatcher, correlator) = correlator();
        let result = correlator
            .send_and_await(
                &DeadSink,
                OutboundFrame::register("me"),
                ReplyMatch::on("registered", |_| true),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Transport(crate::TransportError::ChannelClosed))
        ));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(dispatcher.handler_count("registered"), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_with_distinct_predicates_do_not_interfere() {
        let (dispatcher, correlator) = correlator();
        let correlator = Arc::new(correlator);
        {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dispatcher.publish("messageSent", &json!({"to": "carol"}));
                dispatcher.publish("messageSent", &json!({"to": "bob"}));
            });
        }
        let to_bob = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_await(
                        &NullSink,
                        OutboundFrame::message("a", "bob", "hi"),
                        ReplyMatch::on("messageSent", |p| p["to"] == "bob"),
                        Duration::from_secs(1),
                    )
                    .await
            })
        };
        let to_carol = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_await(
                        &NullSink,
                        OutboundFrame::message("a", "carol", "hi"),
                        ReplyMatch::on("messageSent", |p| p["to"] == "carol"),
                        Duration::from_secs(1),
                    )
                    .await
            })
        };
        assert_eq!(to_bob.await.unwrap().unwrap()["to"], "bob");
        assert_eq!(to_carol.await.unwrap().unwrap()["to"], "carol");
        assert_eq!(correlator.pending_count(), 0);
    }
}
