//! Streamer handle
//!
//! `Streamer` is the public face of the engine: one instance per URL,
//! configured before `start()`, then driven by commands over a channel to
//! the engine thread. Position, duration, and bitrate queries answer from a
//! snapshot the engine keeps mirrored, so they never block on streaming
//! work.

pub(crate) mod bitrate;
pub(crate) mod buffer_pool;
pub(crate) mod engine;
pub(crate) mod packet_queue;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::events::{NotificationHub, StreamerEvent};
use crate::file_type::AudioFileType;
use crate::output::{AudioOutput, OutputError, OutputEvents, OutputFactory, SampleClock};
use crate::parser::{AudioStreamDescription, FormatParser, ParseError, ParserFactory};
use crate::source::{ProxyConfig, ProxyKind};

use bitrate::FormatSnapshot;
use engine::{Command, EngineMessage};

/// Lifecycle states of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamerState {
    Initialized,
    WaitingForData,
    WaitingForQueueToStart,
    Playing,
    Paused,
    Stopped,
    Done,
}

impl StreamerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Done)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::WaitingForData => 1,
            Self::WaitingForQueueToStart => 2,
            Self::Playing => 3,
            Self::Paused => 4,
            Self::Stopped => 5,
            Self::Done => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::WaitingForData,
            2 => Self::WaitingForQueueToStart,
            3 => Self::Playing,
            4 => Self::Paused,
            5 => Self::Stopped,
            _ => Self::Done,
        }
    }
}

/// Why a stream reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Stopped,
    Error,
    Eof,
}

/// Tunables fixed at `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Output buffers in the pool.
    pub buffer_count: usize,
    /// Fallback byte capacity per buffer when the parser offers no packet
    /// size bound.
    pub buffer_size: usize,
    /// Watchdog interval in seconds.
    pub timeout_interval: f64,
    pub playback_rate: f32,
    /// Never unschedule the byte source under backpressure.
    pub buffer_infinite: bool,
    /// Explicit container hint, skipping header/extension derivation.
    pub file_type: Option<AudioFileType>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_count: 16,
            buffer_size: 2048,
            timeout_interval: 10.0,
            playback_rate: 1.0,
            buffer_infinite: false,
            file_type: None,
        }
    }
}

/// Query-side mirror of the engine's observable state.
#[derive(Default)]
pub(crate) struct Snapshot {
    pub format: FormatSnapshot,
    pub error: Option<StreamError>,
    pub last_progress: f64,
    pub seek_time: f64,
    pub bitrate_ready: bool,
    pub clock: Option<Arc<dyn SampleClock>>,
    pub http_headers: HashMap<String, String>,
}

pub(crate) struct SharedState {
    state: AtomicU8,
    queue_created: AtomicBool,
    snapshot: Mutex<Snapshot>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamerState::Initialized.as_u8()),
            queue_created: AtomicBool::new(false),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    pub(crate) fn state(&self) -> StreamerState {
        StreamerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns true when the state actually changed.
    pub(crate) fn set_state(&self, state: StreamerState) -> bool {
        self.state.swap(state.as_u8(), Ordering::SeqCst) != state.as_u8()
    }

    pub(crate) fn queue_created(&self) -> bool {
        self.queue_created.load(Ordering::SeqCst)
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn with_snapshot<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        f(&mut self.lock_snapshot())
    }

    pub(crate) fn set_clock(&self, clock: Arc<dyn SampleClock>) {
        self.with_snapshot(|s| s.clock = Some(clock));
        self.queue_created.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_clock(&self) {
        self.with_snapshot(|s| s.clock = None);
        self.queue_created.store(false, Ordering::SeqCst);
    }

    pub(crate) fn progress(&self) -> Option<f64> {
        let state = self.state();
        if state == StreamerState::Initialized {
            return None;
        }
        let snapshot = self.lock_snapshot();
        if state.is_terminal() {
            return Some(snapshot.last_progress);
        }
        let mut position = snapshot.seek_time;
        if snapshot.format.sample_rate > 0.0 {
            if let Some(sample_time) = snapshot.clock.as_ref().and_then(|c| c.sample_time()) {
                // Sample time can dip negative right after a queue restart.
                position += sample_time / snapshot.format.sample_rate;
            }
        }
        Some(position.max(0.0))
    }

    pub(crate) fn duration(&self) -> Option<f64> {
        self.lock_snapshot().format.duration()
    }

    pub(crate) fn calculated_bit_rate(&self) -> Option<f64> {
        self.lock_snapshot().format.calculated_bit_rate()
    }

    pub(crate) fn error(&self) -> Option<StreamError> {
        self.lock_snapshot().error.clone()
    }

    pub(crate) fn http_headers(&self) -> HashMap<String, String> {
        self.lock_snapshot().http_headers.clone()
    }
}

struct Control {
    config: StreamerConfig,
    proxy: Option<ProxyConfig>,
    parser_factory: Option<ParserFactory>,
    output_factory: Option<OutputFactory>,
    tx: Option<Sender<EngineMessage>>,
    started: bool,
}

/// Builder for a `Streamer`. The parser and output factories are the two
/// collaborator seams and must both be provided.
pub struct StreamerBuilder {
    url: String,
    config: StreamerConfig,
    proxy: Option<ProxyConfig>,
    parser_factory: Option<ParserFactory>,
    output_factory: Option<OutputFactory>,
}

impl StreamerBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: StreamerConfig::default(),
            proxy: None,
            parser_factory: None,
            output_factory: None,
        }
    }

    pub fn config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn parser<F>(mut self, factory: F) -> Self
    where
        F: FnMut(AudioFileType) -> Result<Box<dyn FormatParser>, ParseError> + Send + 'static,
    {
        self.parser_factory = Some(Box::new(factory));
        self
    }

    pub fn output<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&AudioStreamDescription, OutputEvents) -> Result<Box<dyn AudioOutput>, OutputError>
            + Send
            + 'static,
    {
        self.output_factory = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Streamer {
        Streamer {
            url: self.url,
            shared: Arc::new(SharedState::new()),
            hub: Arc::new(NotificationHub::new()),
            control: Mutex::new(Control {
                config: self.config,
                proxy: self.proxy,
                parser_factory: self.parser_factory,
                output_factory: self.output_factory,
                tx: None,
                started: false,
            }),
        }
    }
}

/// One streaming session for one URL.
pub struct Streamer {
    url: String,
    shared: Arc<SharedState>,
    hub: Arc<NotificationHub>,
    control: Mutex<Control>,
}

impl Streamer {
    pub fn builder(url: impl Into<String>) -> StreamerBuilder {
        StreamerBuilder::new(url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // ----- configuration (before start) ------------------------------------

    fn configure(&self, f: impl FnOnce(&mut StreamerConfig)) -> bool {
        let Ok(mut control) = self.control.lock() else {
            return false;
        };
        if control.started {
            return false;
        }
        f(&mut control.config);
        true
    }

    pub fn set_buffer_count(&self, count: usize) -> bool {
        self.configure(|c| c.buffer_count = count.max(1))
    }

    pub fn set_buffer_size(&self, bytes: usize) -> bool {
        self.configure(|c| c.buffer_size = bytes.max(1))
    }

    pub fn set_timeout_interval(&self, seconds: f64) -> bool {
        self.configure(|c| c.timeout_interval = seconds)
    }

    pub fn set_playback_rate(&self, rate: f32) -> bool {
        self.configure(|c| c.playback_rate = rate)
    }

    pub fn set_buffer_infinite(&self, infinite: bool) -> bool {
        self.configure(|c| c.buffer_infinite = infinite)
    }

    pub fn set_file_type(&self, file_type: AudioFileType) -> bool {
        self.configure(|c| c.file_type = Some(file_type))
    }

    fn set_proxy(&self, proxy: ProxyConfig) -> bool {
        let Ok(mut control) = self.control.lock() else {
            return false;
        };
        if control.started {
            return false;
        }
        control.proxy = Some(proxy);
        true
    }

    pub fn set_http_proxy(&self, host: impl Into<String>, port: u16) -> bool {
        self.set_proxy(ProxyConfig {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
        })
    }

    pub fn set_socks_proxy(&self, host: impl Into<String>, port: u16) -> bool {
        self.set_proxy(ProxyConfig {
            kind: ProxyKind::Socks,
            host: host.into(),
            port,
        })
    }

    // ----- lifecycle -------------------------------------------------------

    /// Begin streaming. False when already started (or already stopped), or
    /// when a collaborator factory is missing.
    pub fn start(&self) -> bool {
        let Ok(mut control) = self.control.lock() else {
            return false;
        };
        if control.started || self.shared.state() != StreamerState::Initialized {
            return false;
        }
        let (parser_factory, output_factory) = match (
            control.parser_factory.take(),
            control.output_factory.take(),
        ) {
            (Some(parser), Some(output)) => (parser, output),
            (parser, output) => {
                // Put back whichever half existed; the caller may retry.
                control.parser_factory = parser;
                control.output_factory = output;
                log::error!("cannot start stream: parser or output factory missing");
                return false;
            }
        };
        control.started = true;
        let tx = engine::spawn(engine::EngineParams {
            url: self.url.clone(),
            config: control.config.clone(),
            proxy: control.proxy.clone(),
            shared: Arc::clone(&self.shared),
            hub: Arc::clone(&self.hub),
            parser_factory,
            output_factory,
        });
        control.tx = Some(tx);
        true
    }

    fn send(&self, command: Command) -> bool {
        let Ok(control) = self.control.lock() else {
            return false;
        };
        match &control.tx {
            Some(tx) => tx.send(EngineMessage::Command(command)).is_ok(),
            None => false,
        }
    }

    /// Pause playback. False unless currently playing.
    pub fn pause(&self) -> bool {
        if self.shared.state() != StreamerState::Playing {
            return false;
        }
        self.send(Command::Pause)
    }

    /// Resume playback. False unless currently paused.
    pub fn play(&self) -> bool {
        if self.shared.state() != StreamerState::Paused {
            return false;
        }
        self.send(Command::Resume)
    }

    /// Stop the stream and release every resource. Idempotent, callable from
    /// any state.
    pub fn stop(&self) {
        if self.send(Command::Stop) {
            return;
        }
        // Never started, or the engine already wound down: transition here.
        if !self.shared.state().is_terminal() && self.shared.set_state(StreamerState::Stopped) {
            self.hub.post(StreamerEvent::StatusChanged {
                state: StreamerState::Stopped,
            });
        }
    }

    pub fn seek_to_time(&self, seconds: f64) {
        let _ = self.send(Command::SeekToTime(seconds));
    }

    /// Seek relative to the current position. False when the position is not
    /// yet known.
    pub fn seek_by_delta(&self, delta_seconds: f64) -> bool {
        match self.progress() {
            Some(progress) => {
                self.seek_to_time((progress + delta_seconds).max(0.0));
                true
            }
            None => false,
        }
    }

    // ----- volume ----------------------------------------------------------

    /// Set playback volume in [0, 1]. False while no output queue exists.
    pub fn set_volume(&self, volume: f32) -> bool {
        if !self.shared.queue_created() {
            return false;
        }
        self.send(Command::SetVolume(volume.clamp(0.0, 1.0)))
    }

    pub fn fade_to(&self, volume: f32, duration_seconds: f64) {
        let _ = self.send(Command::FadeTo {
            target: volume.clamp(0.0, 1.0),
            duration: duration_seconds,
        });
    }

    pub fn fade_in(&self, duration_seconds: f64) {
        let _ = self.send(Command::FadeIn {
            duration: duration_seconds,
        });
    }

    pub fn fade_out(&self, duration_seconds: f64) {
        let _ = self.send(Command::FadeOut {
            duration: duration_seconds,
        });
    }

    // ----- queries ---------------------------------------------------------

    pub fn state(&self) -> StreamerState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == StreamerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == StreamerState::Paused
    }

    /// Buffering: waiting for data or for the queue to spin up.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.state(),
            StreamerState::WaitingForData | StreamerState::WaitingForQueueToStart
        )
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        match self.state() {
            StreamerState::Stopped => Some(DoneReason::Stopped),
            StreamerState::Done => Some(if self.shared.error().is_some() {
                DoneReason::Error
            } else {
                DoneReason::Eof
            }),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<StreamError> {
        self.shared.error()
    }

    /// Playback position in seconds. None before `start()`.
    pub fn progress(&self) -> Option<f64> {
        self.shared.progress()
    }

    /// Estimated total duration in seconds, once estimable.
    pub fn duration(&self) -> Option<f64> {
        self.shared.duration()
    }

    /// Estimated bits per second, once estimable.
    pub fn calculated_bit_rate(&self) -> Option<f64> {
        self.shared.calculated_bit_rate()
    }

    /// Response headers of the most recent GET.
    pub fn http_headers(&self) -> HashMap<String, String> {
        self.shared.http_headers()
    }

    /// Subscribe to status and bitrate notifications.
    pub fn subscribe(&self) -> Receiver<StreamerEvent> {
        self.hub.subscribe()
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        // The engine holds a sender of its own channel (for collaborator
        // callbacks), so disconnection alone would never reach it; an
        // explicit stop winds the thread down.
        if let Ok(mut control) = self.control.lock() {
            if let Some(tx) = control.tx.take() {
                let _ = tx.send(EngineMessage::Command(Command::Stop));
            }
        }
    }
}
