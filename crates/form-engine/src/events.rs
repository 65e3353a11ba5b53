//! Event types for reporting session changes
//!
//! Events are sent from a session to any consumer (a UI bridge, a log, a
//! test) after each committed update. Updates made inside a transaction are
//! reported once the transaction commits and never if it rolls back.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Receiver of the events of a session.
///
/// A failed send is logged by the session and never fails the update.
pub trait EventSink: Send + Sync {
    fn send(&self, event: SessionEvent) -> Result<(), EventError>;
}

/// An event sink could not take an event
#[derive(Debug, Clone, Error)]
#[error("Event sink rejected {event}: {reason}")]
pub struct EventError {
    /// Kind of the rejected event
    pub event: &'static str,
    pub reason: String,
}

impl EventError {
    pub fn rejected(event: &SessionEvent, reason: impl Into<String>) -> Self {
        Self {
            event: event.kind(),
            reason: reason.into(),
        }
    }
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// An update was committed
    #[serde(rename_all = "camelCase")]
    UpdateCompleted {
        session_id: String,
        changed_annotations: usize,
        changed_error_fields: usize,
        evaluations: usize,
    },

    /// The resolved value of an annotation changed; `None` when it was removed
    #[serde(rename_all = "camelCase")]
    AnnotationChanged {
        session_id: String,
        field: String,
        key: String,
        value: Option<Value>,
    },

    /// The error list of a field changed; empty when it has no errors left
    #[serde(rename_all = "camelCase")]
    ErrorsChanged {
        session_id: String,
        field: String,
        errors: Vec<Value>,
    },

    /// A transaction was rolled back to its starting state
    #[serde(rename_all = "camelCase")]
    TransactionRolledBack { session_id: String, reason: String },
}

impl SessionEvent {
    /// Kind name, as in the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpdateCompleted { .. } => "updateCompleted",
            Self::AnnotationChanged { .. } => "annotationChanged",
            Self::ErrorsChanged { .. } => "errorsChanged",
            Self::TransactionRolledBack { .. } => "transactionRolledBack",
        }
    }

    /// Create a rollback event
    pub fn rolled_back(session_id: &str, reason: impl Into<String>) -> Self {
        Self::TransactionRolledBack {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Discards every event; the sink of sessions that were not given one
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: SessionEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Records every event in order, for inspection in tests and tools
#[derive(Debug, Default)]
pub struct VecEventSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<SessionEvent> {
        self.recorded().clone()
    }

    /// Forget the recorded events
    pub fn clear(&self) {
        self.recorded().clear();
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Vec<SessionEvent>> {
        // A panicking reader cannot leave the list half-written
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: SessionEvent) -> Result<(), EventError> {
        self.recorded().push(event);
        Ok(())
    }
}
