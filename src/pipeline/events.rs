use super::error::EventSinkError;
use super::run::RunStatus;
use crate::shared::RunId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};

pub const WORKFLOW_START_STAGE: &str = "start";
pub const WORKFLOW_END_STAGE: &str = "end";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub sequence: u64,
    pub stage: String,
    pub outcome: String,
    pub status: RunStatus,
    pub retry_count: u32,
    pub timestamp: String,
    #[serde(default)]
    pub summary: Map<String, Value>,
}

/// Receives progress events. Implementations must not block; the orchestrator
/// logs and ignores any error returned here.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EventSinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &ProgressEvent) -> Result<(), EventSinkError> {
        Ok(())
    }
}

/// Collects every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_for(&self, run_id: &RunId) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|event| &event.run_id == run_id)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EventSinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Bounded channel sink. A full buffer drops the event instead of waiting.
#[derive(Debug)]
pub struct ChannelEventSink {
    sender: SyncSender<ProgressEvent>,
}

impl ChannelEventSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &ProgressEvent) -> Result<(), EventSinkError> {
        match self.sender.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => Err(EventSinkError::Full {
                sequence: dropped.sequence,
            }),
            Err(TrySendError::Disconnected(_)) => Err(EventSinkError::Disconnected),
        }
    }
}
