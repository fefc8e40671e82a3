use std::sync::{Arc, Mutex};

use serde_json::Value;

use kestrel_types::EngineEvent;

/// Receives turn-progress events in the order they happen.
///
/// Implementations are called inline from the turn loop, so they should not
/// block for long. An `Err` is logged by [`Emitter`] and otherwise ignored.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent) -> anyhow::Result<()>;
}

/// Keeps every event in memory.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: EngineEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event buffer poisoned"))?
            .push(event);
        Ok(())
    }
}

/// Handle the turn loop and its collaborators emit through.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Drops everything.
    pub fn discard() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit(&self, event_type: &str, data: Value) {
        if let Err(err) = self.sink.emit(EngineEvent::new(event_type, data)) {
            tracing::warn!(event_type, "event delivery failed: {err:#}");
        }
    }
}

struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn emit(&self, _event: EngineEvent) -> anyhow::Result<()> {
            anyhow::bail!("pipe closed")
        }
    }

    #[test]
    fn emitter_swallows_delivery_failures() {
        let emitter = Emitter::new(Arc::new(BrokenSink));
        emitter.emit("status", json!({"state": "running"}));
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        let emitter = Emitter::new(Arc::new(sink.clone()));
        emitter.emit("status", json!({}));
        emitter.emit("tool_call_started", json!({}));
        emitter.emit("complete", json!({}));
        assert_eq!(sink.types(), vec!["status", "tool_call_started", "complete"]);
    }
}
