//! Page ↔ worker messages.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

/// Command posted from a page to a worker.
///
/// Wire shape: `{"type": "SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Activate the waiting worker now.
    SkipWaiting,
}

impl WorkerCommand {
    /// Parse an untyped message. Unrecognized shapes yield `None`.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// What a worker asks the platform to do after handling a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    SkipWaiting,
}

/// Events fanned out from the platform to every page of the scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A new worker started installing.
    UpdateFound { worker: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// The controlling worker switched.
    ControllerChange,
}

/// A command addressed to one worker.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub target: ServiceWorkerId,
    pub command: WorkerCommand,
}

/// Page-side handle to a worker (`registration.waiting`, etc.).
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: ServiceWorkerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerHandle {
    pub(crate) fn new(id: ServiceWorkerId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, tx }
    }

    /// Post a typed command.
    pub fn post_message(&self, command: WorkerCommand) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(Envelope {
                target: self.id,
                command,
            })
            .map_err(|_| ServiceWorkerError::ChannelClosed)
    }

    /// Post an untyped payload; anything that is not a known command is dropped.
    pub fn post_json(&self, payload: &JsonValue) -> Result<(), ServiceWorkerError> {
        match WorkerCommand::from_json(payload) {
            Some(command) => self.post_message(command),
            None => {
                debug!(worker = %self.id, %payload, "Ignoring unrecognized message");
                Ok(())
            }
        }
    }
}
