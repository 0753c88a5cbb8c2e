//! Engine-to-consumer event bus.
//!
//! The engine never calls back into the UI. Everything the UI needs to
//! surface (save failures, blocked switches, rebuild progress) is pushed
//! onto this channel and drained from the UI loop at its own pace.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

/// Notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A buffer reached disk, either through the debounce timer or a flush.
    SaveSucceeded { path: PathBuf },
    /// A save gave up: retries were exhausted or the error was permanent.
    /// The buffer stays dirty until the user intervenes.
    SaveFailed {
        path: PathBuf,
        error: String,
        attempts: u32,
    },
    /// A workspace switch was abandoned because a dirty buffer could not
    /// be flushed. No workspace state changed.
    WorkspaceSwitchBlocked {
        name: String,
        path: PathBuf,
        error: String,
    },
    /// Periodic progress while a background index rebuild walks the tree.
    IndexRebuildProgress { percent: u8 },
    /// A rebuild ran to completion and the index was swapped wholesale.
    IndexRebuildFinished { indexed: usize, skipped: usize },
    /// A rebuild was cancelled before finishing; the old index is intact.
    IndexRebuildCancelled,
    /// Another process modified a file the engine has open.
    FileChangedOnDisk { path: PathBuf },
}

/// Sending half handed to the engine.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
}

impl EventSender {
    /// Push an event. A disconnected consumer is not an error; the engine
    /// keeps running headless and the event is dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Receiving half held by the consumer.
pub struct EventReceiver {
    rx: Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Non-blocking poll for the next event.
    pub fn try_recv(&self) -> Option<EngineEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Create a connected sender/receiver pair.
pub fn event_bus() -> (EventSender, EventReceiver) {
    let (tx, rx) = channel();
    (EventSender { tx }, EventReceiver { rx })
}
