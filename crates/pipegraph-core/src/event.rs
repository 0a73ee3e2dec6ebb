use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{ErrorEvent, ExecutionId, Value};

/// Progress events emitted while executing a graph.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// An invocation entered a pipeline.
    ExecutionStarted {
        execution_id: ExecutionId,
        pipeline: String,
    },
    /// A component began processing.
    ComponentStarted {
        execution_id: ExecutionId,
        pipeline: String,
        component: String,
    },
    /// A component produced an output.
    ComponentCompleted {
        execution_id: ExecutionId,
        pipeline: String,
        component: String,
        elapsed_ms: u64,
    },
    /// A component failed; the invocation is aborted.
    ComponentFailed {
        execution_id: ExecutionId,
        pipeline: String,
        component: String,
        error: String,
    },
    /// A branching component selected a target.
    BranchTaken {
        execution_id: ExecutionId,
        component: String,
        label: Option<String>,
        target: String,
    },
    /// An output was forwarded along a connection.
    Dispatched {
        execution_id: ExecutionId,
        from: String,
        to: String,
        depth: usize,
    },
    /// An invocation finished.
    ExecutionCompleted {
        execution_id: ExecutionId,
        pipeline: String,
        branch: Option<String>,
        result: Value,
    },
    /// An invocation failed.
    ExecutionFailed {
        execution_id: ExecutionId,
        pipeline: String,
        error: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Callback attached to an error channel.
pub type ErrorHandler = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// An explicit, ordered list of error subscribers.
///
/// Components, pipelines, and graphs each own one. Handlers are invoked
/// synchronously in subscription order.
#[derive(Default)]
pub struct ErrorChannel {
    handlers: Mutex<Vec<ErrorHandler>>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.lock().push(Arc::new(handler));
    }

    pub fn notify(&self, event: &ErrorEvent) {
        // Snapshot so a handler may subscribe further handlers.
        let handlers: Vec<ErrorHandler> = self.lock().clone();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_error() -> ErrorEvent {
        ErrorEvent {
            execution_id: ExecutionId::new(),
            pipeline: "main".into(),
            component: "parse".into(),
            kind: "component".into(),
            message: "bad input".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(FlowEvent::ExecutionStarted {
            execution_id: ExecutionId::new(),
            pipeline: "main".into(),
        });
        assert!(matches!(a.recv().await, Ok(FlowEvent::ExecutionStarted { .. })));
        assert!(matches!(b.recv().await, Ok(FlowEvent::ExecutionStarted { .. })));
    }

    #[test]
    fn publish_without_receivers_is_fine() {
        let bus = EventBus::new(0);
        bus.publish(FlowEvent::ExecutionFailed {
            execution_id: ExecutionId::new(),
            pipeline: "main".into(),
            error: "x".into(),
        });
    }

    #[test]
    fn error_channel_preserves_order() {
        let channel = ErrorChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = seen.clone();
            channel.subscribe(move |e: &ErrorEvent| {
                seen.lock().unwrap().push(format!("{tag}:{}", e.component))
            });
        }
        channel.notify(&sample_error());
        assert_eq!(*seen.lock().unwrap(), vec!["0:parse", "1:parse", "2:parse"]);
        assert_eq!(channel.len(), 3);
    }
}
