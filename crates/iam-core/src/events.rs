//! Structured engine events and the sink they are emitted to
//!
//! Events never carry attribute values, so a sink can log them verbatim
//! without leaking sensitive data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::LockToken;

/// Reconciliation phase of a single instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Locking,
    Validating,
    Planning,
    Applying,
    Persisting,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Locking => "locking",
            Phase::Validating => "validating",
            Phase::Planning => "planning",
            Phase::Applying => "applying",
            Phase::Persisting => "persisting",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Event emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    LockAcquired {
        key: String,
        holder: String,
        token: LockToken,
    },
    LockReleased {
        key: String,
        token: LockToken,
    },
    LockContended {
        key: String,
        holder: String,
    },
    PhaseChanged {
        key: String,
        from: Phase,
        to: Phase,
    },
    PlanComputed {
        key: String,
        action: String,
    },
    BatchPlanned {
        instances: usize,
        changes: usize,
        plan_hash: String,
    },
    ApplyStarted {
        key: String,
        action: String,
    },
    ApplyFinished {
        key: String,
        action: String,
        version: u64,
    },
    StaleResponseDiscarded {
        correlation_id: String,
    },
    Error {
        key: Option<String>,
        phase: Option<Phase>,
        message: String,
    },
}

/// Destination for engine events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Default sink: writes events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::LockAcquired { key, holder, token } => {
                debug!(key = %key, holder = %holder, token = %token, "Lock acquired");
            }
            EngineEvent::LockReleased { key, token } => {
                debug!(key = %key, token = %token, "Lock released");
            }
            EngineEvent::LockContended { key, holder } => {
                info!(key = %key, holder = %holder, "Lock contended");
            }
            EngineEvent::PhaseChanged { key, from, to } => {
                debug!(key = %key, from = %from, to = %to, "Phase changed");
            }
            EngineEvent::PlanComputed { key, action } => {
                info!(key = %key, action = %action, "Plan computed");
            }
            EngineEvent::BatchPlanned {
                instances,
                changes,
                plan_hash,
            } => {
                info!(instances, changes, plan_hash = %plan_hash, "Batch planned");
            }
            EngineEvent::ApplyStarted { key, action } => {
                info!(key = %key, action = %action, "Apply started");
            }
            EngineEvent::ApplyFinished {
                key,
                action,
                version,
            } => {
                info!(key = %key, action = %action, version, "Apply finished");
            }
            EngineEvent::StaleResponseDiscarded { correlation_id } => {
                warn!(correlation_id = %correlation_id, "Discarded response with unknown correlation id");
            }
            EngineEvent::Error {
                key,
                phase,
                message,
            } => {
                warn!(key = ?key, phase = ?phase, error = %message, "Engine error");
            }
        }
    }
}

/// Sink that keeps every event in memory, for inspection after a run
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events emitted so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events concerning a single instance key
    pub fn events_for(&self, key: &str) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|event| event_key(event) == Some(key))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

fn event_key(event: &EngineEvent) -> Option<&str> {
    match event {
        EngineEvent::LockAcquired { key, .. }
        | EngineEvent::LockReleased { key, .. }
        | EngineEvent::LockContended { key, .. }
        | EngineEvent::PhaseChanged { key, .. }
        | EngineEvent::PlanComputed { key, .. }
        | EngineEvent::ApplyStarted { key, .. }
        | EngineEvent::ApplyFinished { key, .. } => Some(key),
        EngineEvent::Error { key, .. } => key.as_deref(),
        EngineEvent::BatchPlanned { .. } | EngineEvent::StaleResponseDiscarded { .. } => None,
    }
}
