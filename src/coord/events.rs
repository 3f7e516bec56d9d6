//! Lifecycle event stream
//!
//! Typed events emitted by the controller at every lifecycle transition.

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entity::SequenceId;

pub const EVENT_VERSION: u32 = 1;

/// Lifecycle event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    RootRegistered {
        seq_id: SequenceId,
    },
    ChildSpawned {
        parent_id: SequenceId,
        child_id: SequenceId,
        spawn_depth: usize,
    },
    SpawnRejected {
        parent_id: SequenceId,
        category: String,
        reason: String,
    },
    ParentBlocked {
        parent_id: SequenceId,
        awaiting: Vec<SequenceId>,
    },
    ChildCompleted {
        child_id: SequenceId,
        parent_id: Option<SequenceId>,
        failed: bool,
    },
    ParentResumed {
        parent_id: SequenceId,
        merged_children: Vec<SequenceId>,
        prefill_from: usize,
        forced: bool,
    },
    DegradedResume {
        seq_id: SequenceId,
        prefix_len: usize,
    },
    MalformedSignal {
        seq_id: SequenceId,
        signal: Option<String>,
        message: String,
    },
    SequenceCancelled {
        seq_id: SequenceId,
        reason: String,
    },
    SequenceReleased {
        seq_id: SequenceId,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub tick: u64,
    pub timestamp: u64,
    pub event: LifecycleEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &LifecycleEnvelope);
}

/// Logs every event at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &LifecycleEnvelope) {
        tracing::debug!(tick = envelope.tick, sequence = envelope.sequence, "Event: {:?}", envelope.event);
    }
}

/// Collects events in memory
#[derive(Clone, Default)]
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<LifecycleEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<LifecycleEnvelope> {
        self.events.read().clone()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &LifecycleEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Fans events out to async subscribers. Oldest events are dropped when a
/// slow subscriber falls `capacity` events behind.
pub struct BroadcastEventSink {
    tx: Sender<LifecycleEnvelope>,
    _keepalive: InactiveReceiver<LifecycleEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            _keepalive: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<LifecycleEnvelope> {
        self.tx.new_receiver()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, envelope: &LifecycleEnvelope) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.tx.try_broadcast(envelope.clone()) {
            tracing::debug!(sequence = envelope.sequence, error = %e, "Lifecycle event not broadcast");
        }
    }
}

/// Global sequence counter for events
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next event sequence number
pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
