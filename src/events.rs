//! Streamer notifications
//!
//! Subscribers get every state transition plus a one-shot bitrate event.
//! Each `Streamer` owns its hub; there is no process-wide registry.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::Serialize;

use crate::streamer::StreamerState;

/// Event payloads delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamerEvent {
    /// Posted on every state transition.
    StatusChanged { state: StreamerState },
    /// Posted once, when the bitrate first becomes estimable.
    BitrateReady { bits_per_second: f64 },
}

/// Subscriber registry shared between the handle and the engine thread.
pub struct NotificationHub {
    subscribers: Mutex<Vec<Sender<StreamerEvent>>>,
}

impl NotificationHub {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<StreamerEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Deliver an event to every live subscriber, pruning dropped ones.
    pub(crate) fn post(&self, event: StreamerEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
