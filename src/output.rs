//! Audio output queue contract
//!
//! The platform queue decodes and plays; the engine only rents its buffers.
//! Implementations own the buffer storage (`allocate_buffers`) and copy the
//! bytes handed to `enqueue_buffer`. Completion and run-state changes are
//! reported back through `OutputEvents`, which marshals them onto the engine
//! thread — implementations may call it from any thread.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use thiserror::Error;

use crate::parser::{AudioStreamDescription, PacketDescription};
use crate::streamer::engine::EngineMessage;

/// Failure reported by an output implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct OutputError(pub String);

/// Callbacks from the output queue, delivered in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// Buffer `index` finished playing and is free to refill.
    BufferComplete { index: usize },
    /// The queue's running state flipped. A stop (hard or after drain) must
    /// report `running: false` exactly once; `pause` reports nothing.
    RunningChanged { running: bool },
}

/// Sender handed to the output factory; the implementation posts its
/// callbacks through it.
#[derive(Clone)]
pub struct OutputEvents {
    tx: Sender<EngineMessage>,
}

impl OutputEvents {
    pub(crate) fn new(tx: Sender<EngineMessage>) -> Self {
        Self { tx }
    }

    pub fn post(&self, event: OutputEvent) {
        // A send failure means the engine is gone; the callback is moot.
        let _ = self.tx.send(EngineMessage::Output(event));
    }
}

/// Read-only playback clock, shared out of the queue so position queries
/// never cross into the engine thread.
pub trait SampleClock: Send + Sync {
    /// Current playback position in sample frames. None while the queue is
    /// not running; may be briefly negative right after a restart.
    fn sample_time(&self) -> Option<f64>;
}

/// Platform audio output queue.
pub trait AudioOutput: Send {
    /// Allocate `count` buffers of `byte_capacity` bytes each.
    fn allocate_buffers(&mut self, count: usize, byte_capacity: usize) -> Result<(), OutputError>;

    /// Submit buffer `index` with `bytes` of encoded audio. `descriptions`
    /// is empty for constant-bitrate data.
    fn enqueue_buffer(
        &mut self,
        index: usize,
        bytes: &[u8],
        descriptions: &[PacketDescription],
    ) -> Result<(), OutputError>;

    /// Register the run-state listener. `RunningChanged` events flow through
    /// the `OutputEvents` handed to the factory, but on platform queues the
    /// registration itself is a separate step that can fail.
    fn listen_run_state(&mut self) -> Result<(), OutputError>;

    /// Start or resume playback.
    fn start(&mut self) -> Result<(), OutputError>;

    fn pause(&mut self) -> Result<(), OutputError>;

    /// Stop playback. `immediate` discards queued audio and returns every
    /// buffer; otherwise queued audio drains first.
    fn stop(&mut self, immediate: bool) -> Result<(), OutputError>;

    /// Play out everything enqueued, then report `RunningChanged(false)`.
    fn flush(&mut self) -> Result<(), OutputError>;

    /// Discard queued audio and internal decoder state, keeping the queue
    /// usable. Used by the Shoutcast re-detection path.
    fn reset(&mut self) -> Result<(), OutputError>;

    fn set_volume(&mut self, volume: f32);

    /// Enable time-pitch processing; `bypass` keeps it inert.
    fn enable_time_pitch(&mut self, bypass: bool) -> Result<(), OutputError>;

    fn set_playback_rate(&mut self, rate: f32) -> Result<(), OutputError>;

    /// Hand codec configuration bytes to the decoder.
    fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<(), OutputError>;

    /// Clock handle that stays valid for the life of the queue.
    fn clock(&self) -> Arc<dyn SampleClock>;
}

/// Builds an output queue for a discovered stream description. Called again
/// if a Shoutcast redetection tears the first queue down.
pub type OutputFactory = Box<
    dyn FnMut(&AudioStreamDescription, OutputEvents) -> Result<Box<dyn AudioOutput>, OutputError>
        + Send,
>;
