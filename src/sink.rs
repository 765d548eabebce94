//! Event sink contract
//!
//! The parser hands every finalized or anomalous [`CommandEvent`] to an
//! [`EventSink`] exactly once. A failing sink is logged by the caller and
//! never stops the session.

use crate::error::SinkError;
use crate::events::CommandEvent;
use std::sync::{Arc, Mutex};

/// Receiver of finalized command events
pub trait EventSink: Send {
    fn deliver(&mut self, event: &CommandEvent) -> Result<(), SinkError>;
}

/// Collects events in memory. Clones share the same buffer, so one clone can
/// be handed to a session while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CommandEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far
    pub fn events(&self) -> Vec<CommandEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn deliver(&mut self, event: &CommandEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock().map_err(|_| SinkError::Closed)?;
        events.push(event.clone());
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn deliver(&mut self, event: &CommandEvent) -> Result<(), SinkError> {
        (**self).deliver(event)
    }
}
