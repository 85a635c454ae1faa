use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{event, Level};

/// Token returned by `subscribe`, used to remove exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Value) -> crate::Result<()> + Send + Sync>;

/// In-process multicast of typed events, keyed by event-type string. The
/// transport session republishes every inbound frame through here; the
/// correlator and the store bridge subscribe.
///
/// `publish` runs handlers synchronously in the calling context over a
/// snapshot of the registration list, so a handler may subscribe or
/// unsubscribe during dispatch without corrupting iteration.
pub struct Dispatcher {
    registry: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `kind`. Handlers for one kind run in
    /// registration order.
    pub fn subscribe<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> crate::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = self.registry.lock().unwrap();
        registry
            .entry(kind.to_string())
            .or_insert_with(Vec::new)
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes the one registration identified by `id`. Dropping the last
    /// handler for a kind frees the kind's bucket.
    pub fn unsubscribe(&self, kind: &str, id: HandlerId) -> bool {
        let mut registry = self.registry.lock().unwrap();
        let handlers = match registry.get_mut(kind) {
            Some(handlers) => handlers,
            None => return false,
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() < before;
        if handlers.is_empty() {
            registry.remove(kind);
        }
        removed
    }

    /// Invokes every current handler for `kind`. A failing handler is logged
    /// and must not prevent the remaining handlers from running.
    pub fn publish(&self, kind: &str, payload: &Value) {
        let snapshot: Vec<(HandlerId, Handler)> = {
            let registry = self.registry.lock().unwrap();
            registry.get(kind).cloned().unwrap_or_default()
        };
        for (id, handler) in snapshot {
            if let Err(err) = handler(payload) {
                event!(
                    Level::WARN,
                    "event handler {:?} for '{}' failed: {}",
                    id,
                    kind,
                    err
                );
            }
        }
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.get(kind).map(|handlers| handlers.len()).unwrap_or(0)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}
