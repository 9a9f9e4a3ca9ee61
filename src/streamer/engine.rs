//! Streaming engine
//!
//! One thread owns every piece of mutable streaming state: the state
//! machine, the parser, the buffer pool, the spillover queue, and the output
//! queue. Network chunks, output callbacks, and user commands all arrive as
//! messages on one channel; the watchdog tick and volume fades ride the
//! receive timeout. Nothing here blocks and nothing needs a lock.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::events::{NotificationHub, StreamerEvent};
use crate::file_type::{self, AudioFileType};
use crate::output::{AudioOutput, OutputEvent, OutputEvents, OutputFactory};
use crate::parser::{
    AudioStreamDescription, FormatParser, PacketDescription, ParserEvent, ParserFactory,
    ParserProperty,
};
use crate::source::sniffer::{ShoutcastSniffer, SniffOutcome};
use crate::source::{ByteSource, ProxyConfig, SourceEvent, SourceRequest};

use super::bitrate::{FormatSnapshot, PACKET_COUNT_SENTINEL};
use super::buffer_pool::BufferPool;
use super::packet_queue::{PacketQueue, QueuedPacket};
use super::{SharedState, StreamerConfig, StreamerState};

/// Volume fades step on this cadence.
const FADE_STEP: Duration = Duration::from_millis(30);

/// User-facing operations forwarded from the `Streamer` handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Command {
    Pause,
    Resume,
    Stop,
    SeekToTime(f64),
    SetVolume(f32),
    FadeTo { target: f32, duration: f64 },
    FadeIn { duration: f64 },
    FadeOut { duration: f64 },
}

/// Everything the engine thread can receive.
pub(crate) enum EngineMessage {
    Command(Command),
    Source { id: u64, event: SourceEvent },
    Output(OutputEvent),
}

pub(crate) struct EngineParams {
    pub url: String,
    pub config: StreamerConfig,
    pub proxy: Option<ProxyConfig>,
    pub shared: Arc<SharedState>,
    pub hub: Arc<NotificationHub>,
    pub parser_factory: ParserFactory,
    pub output_factory: OutputFactory,
}

/// Result of submitting the fill buffer, mirroring the 1 / 0 / −1 protocol:
/// keep feeding, stop feeding (pool exhausted), or stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnqueueOutcome {
    Continue,
    Blocked,
    Failed,
}

/// Result of offering one packet to the pool. `Rejected` means the packet
/// was not consumed and must be re-delivered later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedOutcome {
    Accepted,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum FadeShape {
    To(f32),
    In,
    Out,
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    /// Whether completion also moves the user volume setting.
    update_volume: bool,
    started: Instant,
    duration: f64,
}

/// Spawn the engine thread and return its message sender.
pub(crate) fn spawn(params: EngineParams) -> Sender<EngineMessage> {
    let (tx, rx) = mpsc::channel();
    let engine_tx = tx.clone();
    let spawned = thread::Builder::new()
        .name("streamcast-engine".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("failed to build network runtime: {e}");
                    params.shared.with_snapshot(|s| {
                        s.error = Some(StreamError::NetworkConnectionFailed(format!(
                            "runtime setup failed: {e}"
                        )))
                    });
                    params.shared.set_state(StreamerState::Done);
                    params.hub.post(StreamerEvent::StatusChanged {
                        state: StreamerState::Done,
                    });
                    return;
                }
            };
            Engine::new(params, engine_tx, runtime).run(rx);
        });
    if let Err(e) = spawned {
        log::error!("failed to spawn engine thread: {e}");
    }
    tx
}

pub(crate) struct Engine {
    url: String,
    config: StreamerConfig,
    proxy: Option<ProxyConfig>,
    shared: Arc<SharedState>,
    hub: Arc<NotificationHub>,
    tx: Sender<EngineMessage>,
    runtime: tokio::runtime::Runtime,

    parser_factory: ParserFactory,
    output_factory: OutputFactory,

    state: StreamerState,

    parser: Option<Box<dyn FormatParser>>,
    output: Option<Box<dyn AudioOutput>>,
    pool: Option<BufferPool>,
    packet_queue: PacketQueue,

    source: Option<ByteSource>,
    source_id: u64,
    request_offset: u64,

    file_type: AudioFileType,
    file_type_derived: bool,
    sniffer: Option<ShoutcastSniffer>,

    description: Option<AudioStreamDescription>,
    fmt: FormatSnapshot,
    audio_data_byte_count: u64,
    packet_buffer_size: usize,
    discontinuous: bool,
    discovery_done: bool,

    waiting_on_buffer: bool,
    unscheduled: bool,
    rescheduled: bool,
    source_eof: bool,
    seeking: bool,
    queue_running: bool,

    seek_byte_offset: u64,
    seek_time: f64,

    volume: f32,
    applied_volume: f32,
    fade: Option<Fade>,

    bitrate_notified: bool,
    events_since_last_tick: u32,
    next_tick: Instant,
    watchdog_armed: bool,
}

impl Engine {
    fn new(params: EngineParams, tx: Sender<EngineMessage>, runtime: tokio::runtime::Runtime) -> Self {
        let mut config = params.config;
        config.buffer_count = config.buffer_count.max(1);
        config.buffer_size = config.buffer_size.max(1);

        // An explicit hint from configuration counts as derived and never
        // arms the sniffer.
        let (file_type, file_type_derived) = match config.file_type {
            Some(kind) => (kind, true),
            None => (AudioFileType::Mp3, false),
        };

        let timeout = Duration::from_secs_f64(config.timeout_interval.max(0.1));
        Self {
            url: params.url,
            config,
            proxy: params.proxy,
            shared: params.shared,
            hub: params.hub,
            tx,
            runtime,
            parser_factory: params.parser_factory,
            output_factory: params.output_factory,
            state: StreamerState::Initialized,
            parser: None,
            output: None,
            pool: None,
            packet_queue: PacketQueue::new(),
            source: None,
            source_id: 0,
            request_offset: 0,
            file_type,
            file_type_derived,
            sniffer: None,
            description: None,
            fmt: FormatSnapshot::default(),
            audio_data_byte_count: 0,
            packet_buffer_size: 0,
            discontinuous: false,
            discovery_done: false,
            waiting_on_buffer: false,
            unscheduled: false,
            rescheduled: false,
            source_eof: false,
            seeking: false,
            queue_running: false,
            seek_byte_offset: 0,
            seek_time: 0.0,
            volume: 1.0,
            applied_volume: 1.0,
            fade: None,
            bitrate_notified: false,
            events_since_last_tick: 0,
            next_tick: Instant::now() + timeout,
            watchdog_armed: false,
        }
    }

    fn run(mut self, rx: Receiver<EngineMessage>) {
        log::info!("starting stream for {}", self.url);
        self.set_state(StreamerState::WaitingForData);
        self.open_source();
        self.watchdog_armed = true;
        self.next_tick = Instant::now() + self.tick_interval();

        while !self.is_terminal() {
            match rx.recv_timeout(self.next_timeout()) {
                Ok(message) => self.handle_message(message),
                Err(RecvTimeoutError::Timeout) => self.on_deadline(),
                Err(RecvTimeoutError::Disconnected) => {
                    // The handle is gone; nobody can observe us anymore.
                    self.stop_stream();
                    break;
                }
            }
        }
        log::debug!("engine thread exiting in state {:?}", self.state);
    }

    fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Command(command) => self.on_command(command),
            EngineMessage::Source { id, event } => self.on_source_event(id, event),
            EngineMessage::Output(OutputEvent::BufferComplete { index }) => {
                self.on_buffer_complete(index)
            }
            EngineMessage::Output(OutputEvent::RunningChanged { running }) => {
                self.on_running_changed(running)
            }
        }
    }

    // ----- deadlines -------------------------------------------------------

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout_interval.max(0.1))
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut deadline = self.next_tick;
        if self.fade.is_some() {
            deadline = deadline.min(now + FADE_STEP);
        }
        deadline.saturating_duration_since(now)
    }

    fn on_deadline(&mut self) {
        if self.fade.is_some() {
            self.step_fade();
        }
        if Instant::now() >= self.next_tick {
            self.on_tick();
        }
    }

    /// Watchdog sample. Fails the stream when a tick elapses with no network
    /// activity and no legitimate reason for silence.
    fn on_tick(&mut self) {
        self.next_tick = Instant::now() + self.tick_interval();
        if !self.watchdog_armed || self.is_terminal() {
            return;
        }
        if self.state == StreamerState::Paused {
            return;
        }
        if self.unscheduled && !self.rescheduled {
            // Backpressure: no data is expected, so silence is fine.
            return;
        }
        if self.unscheduled && self.rescheduled {
            // This sample straddled an unschedule/reschedule pair.
            self.unscheduled = false;
            self.rescheduled = false;
            return;
        }
        if self.events_since_last_tick > 0 {
            self.events_since_last_tick = 0;
            return;
        }
        self.fail_with(StreamError::TimedOut(format!(
            "no network activity for {:.0} s",
            self.config.timeout_interval
        )));
    }

    fn step_fade(&mut self) {
        let Some(fade) = self.fade else { return };
        let t = (fade.started.elapsed().as_secs_f64() / fade.duration).min(1.0);
        let volume = fade.from + (fade.to - fade.from) * t as f32;
        self.applied_volume = volume;
        if let Some(output) = self.output.as_mut() {
            output.set_volume(volume);
        }
        if t >= 1.0 {
            if fade.update_volume {
                self.volume = fade.to;
            }
            self.fade = None;
        }
    }

    // ----- commands --------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Pause => {
                if self.state != StreamerState::Playing {
                    return;
                }
                match self.output.as_mut().map(|o| o.pause()) {
                    Some(Ok(())) => self.set_state(StreamerState::Paused),
                    Some(Err(e)) => {
                        self.fail_with(StreamError::AudioQueuePauseFailed(e.to_string()))
                    }
                    None => {}
                }
            }
            Command::Resume => {
                if self.state != StreamerState::Paused {
                    return;
                }
                match self.output.as_mut().map(|o| o.start()) {
                    Some(Ok(())) => self.set_state(StreamerState::Playing),
                    Some(Err(e)) => {
                        self.fail_with(StreamError::AudioQueueStartFailed(e.to_string()))
                    }
                    None => {}
                }
            }
            Command::Stop => self.stop_stream(),
            Command::SeekToTime(seconds) => self.seek_to_time(seconds),
            Command::SetVolume(volume) => {
                self.volume = volume;
                self.applied_volume = volume;
                self.fade = None;
                if let Some(output) = self.output.as_mut() {
                    output.set_volume(volume);
                }
            }
            Command::FadeTo { target, duration } => self.begin_fade(FadeShape::To(target), duration),
            Command::FadeIn { duration } => self.begin_fade(FadeShape::In, duration),
            Command::FadeOut { duration } => self.begin_fade(FadeShape::Out, duration),
        }
    }

    fn begin_fade(&mut self, shape: FadeShape, duration: f64) {
        if self.output.is_none() {
            // Nothing audible yet; a fade target just becomes the volume the
            // queue will be created with.
            if let FadeShape::To(target) = shape {
                self.volume = target;
                self.applied_volume = target;
            }
            return;
        }
        let (from, to, update_volume) = match shape {
            FadeShape::To(target) => (self.applied_volume, target, true),
            FadeShape::In => (0.0, self.volume, false),
            FadeShape::Out => (self.applied_volume, 0.0, false),
        };
        if duration <= 0.0 {
            self.applied_volume = to;
            if update_volume {
                self.volume = to;
            }
            if let Some(output) = self.output.as_mut() {
                output.set_volume(to);
            }
            self.fade = None;
            return;
        }
        if matches!(shape, FadeShape::In) {
            self.applied_volume = 0.0;
            if let Some(output) = self.output.as_mut() {
                output.set_volume(0.0);
            }
        }
        self.fade = Some(Fade {
            from,
            to,
            update_volume,
            started: Instant::now(),
            duration,
        });
    }

    // ----- byte source -----------------------------------------------------

    fn open_source(&mut self) {
        self.close_source();
        let range = if self.fmt.file_length > 0 && self.seek_byte_offset > 0 {
            Some((self.seek_byte_offset, self.fmt.file_length))
        } else {
            None
        };
        if range.is_some() {
            self.discontinuous = self.fmt.vbr;
        }
        self.request_offset = range.map(|(offset, _)| offset).unwrap_or(0);
        let request = SourceRequest {
            url: self.url.clone(),
            proxy: self.proxy.clone(),
            range,
        };
        let source = ByteSource::open(&self.runtime, request, self.source_id, self.tx.clone());
        self.source = Some(source);
        self.source_eof = false;
        self.unscheduled = false;
        self.rescheduled = false;
        log::debug!("byte source opened (generation {})", self.source_id);
    }

    fn close_source(&mut self) {
        if let Some(source) = self.source.take() {
            source.close();
        }
        // Anything still in flight from the old task carries a stale id.
        self.source_id += 1;
    }

    fn set_source_scheduled(&self, scheduled: bool) {
        if let Some(source) = &self.source {
            source.set_scheduled(scheduled);
        }
    }

    fn on_source_event(&mut self, id: u64, event: SourceEvent) {
        if id != self.source_id {
            return;
        }
        self.events_since_last_tick += 1;
        match event {
            SourceEvent::Opened {
                status,
                headers,
                content_length,
            } => self.on_source_opened(status, headers, content_length),
            SourceEvent::Bytes(data) => self.on_source_bytes(data),
            SourceEvent::End => self.on_source_end(),
            SourceEvent::Error(reason) => {
                self.fail_with(StreamError::NetworkConnectionFailed(reason))
            }
        }
    }

    fn on_source_opened(
        &mut self,
        status: u16,
        headers: HashMap<String, String>,
        content_length: Option<u64>,
    ) {
        log::debug!("source opened with HTTP {status}");
        if self.request_offset == 0 && self.fmt.file_length == 0 {
            if let Some(length) = content_length {
                self.fmt.file_length = length;
            }
        }
        if !self.file_type_derived {
            let content_type = headers.get("content-type").map(String::as_str);
            let (kind, defaulted) = file_type::derive_file_type(content_type, &self.url);
            self.file_type = kind;
            self.file_type_derived = true;
            if defaulted {
                log::debug!("no usable content type; arming shoutcast sniffer");
                self.sniffer = Some(ShoutcastSniffer::new());
            }
        }
        self.shared.with_snapshot(|s| s.http_headers = headers);
        self.sync_shared();
    }

    fn on_source_bytes(&mut self, data: Vec<u8>) {
        let disposition = self.sniffer.as_mut().map(|s| s.feed(&data));
        match disposition {
            None => self.feed_parser(&data),
            Some(SniffOutcome::Pending) => {}
            Some(SniffOutcome::Passthrough(buffered)) => {
                self.sniffer = None;
                self.feed_parser(&buffered);
            }
            Some(SniffOutcome::ContentType {
                file_type,
                remainder,
            }) => {
                self.sniffer = None;
                self.apply_sniffed_type(file_type);
                if !self.is_terminal() && !remainder.is_empty() {
                    self.feed_parser(&remainder);
                }
            }
        }
    }

    /// End of the HTTP body: flush, then decide between queue start, a quiet
    /// end for a seek past the resource, a data-free failure, or draining.
    fn on_source_end(&mut self) {
        log::debug!("byte source reached end of stream");
        self.source_eof = true;

        if let Some(mut sniffer) = self.sniffer.take() {
            // The whole body fit inside the sniff window; it was audio.
            let buffered = sniffer.take_buffered();
            if !buffered.is_empty() {
                self.feed_parser(&buffered);
            }
            if self.is_terminal() {
                return;
            }
        }

        let partial = self
            .pool
            .as_ref()
            .map(|p| p.has_partial_fill() && !p.fill_buffer_inuse())
            .unwrap_or(false);
        if partial && self.enqueue_buffer() == EnqueueOutcome::Failed {
            return;
        }
        if self.is_terminal() {
            return;
        }

        if self.state == StreamerState::WaitingForData {
            let have_audio = self.pool.as_ref().map(|p| p.buffers_used() > 0).unwrap_or(false);
            if have_audio {
                self.start_queue();
            } else if self.seek_byte_offset > 0 {
                log::info!("seek landed past end of stream");
                self.finish_eof();
            } else {
                self.fail_with(StreamError::AudioDataNotFound(
                    "stream ended before any audio data".into(),
                ));
            }
            return;
        }

        let drained = self.pool.as_ref().map(|p| p.all_free()).unwrap_or(true)
            && self.packet_queue.is_empty();
        if drained {
            if self.seeking {
                log::info!("seek landed past end of stream");
                self.finish_eof();
                return;
            }
            match self.output.as_mut().map(|o| o.stop(false)) {
                Some(Ok(())) => {}
                Some(Err(e)) => self.fail_with(StreamError::AudioQueueStopFailed(e.to_string())),
                None => self.finish_eof(),
            }
        }
    }

    // ----- shoutcast -------------------------------------------------------

    fn apply_sniffed_type(&mut self, sniffed: Option<AudioFileType>) {
        let file_type = sniffed.unwrap_or(AudioFileType::Mp3);
        log::info!("inline header block redirects container type to {file_type:?}");

        self.parser = None;
        if let Some(mut output) = self.output.take() {
            let _ = output.stop(true);
            let _ = output.reset();
            self.pool = None;
            self.packet_queue.clear();
            self.waiting_on_buffer = false;
            self.queue_running = false;
            self.shared.clear_clock();
            self.set_state(StreamerState::WaitingForData);
        }

        // Format metadata belonged to the old parser; only the resource
        // length survives the redetection.
        let file_length = self.fmt.file_length;
        self.fmt = FormatSnapshot {
            file_length,
            ..FormatSnapshot::default()
        };
        self.description = None;
        self.audio_data_byte_count = 0;
        self.packet_buffer_size = 0;
        // The redetected stream gets its own shot at packet discovery.
        self.discovery_done = false;

        self.file_type = file_type;
        self.open_parser();
        self.sync_shared();
    }

    // ----- parser ----------------------------------------------------------

    fn open_parser(&mut self) -> bool {
        match (self.parser_factory)(self.file_type) {
            Ok(parser) => {
                log::debug!("parser opened for {:?}", self.file_type);
                self.parser = Some(parser);
                true
            }
            Err(e) => {
                self.fail_with(StreamError::FileStreamOpenFailed(e.to_string()));
                false
            }
        }
    }

    /// Feed one network chunk through the parser in bounded slices.
    fn feed_parser(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.parser.is_none() && !self.open_parser() {
            return;
        }
        // Packet discovery can restart the connection from inside an event
        // handler; the rest of this chunk belongs to the abandoned stream.
        let generation = self.source_id;
        let read_size = self.packet_buffer_size.max(2048);
        let mut offset = 0;
        while offset < data.len() {
            if self.is_terminal() || self.source_id != generation {
                return;
            }
            let end = (offset + read_size).min(data.len());
            let discontinuous = self.discontinuous;
            let parsed = match self.parser.as_mut() {
                Some(parser) => parser.parse_bytes(&data[offset..end], discontinuous),
                // The parser can vanish mid-chunk if a sniffer reset fails.
                None => return,
            };
            self.discontinuous = false;
            let events = match parsed {
                Ok(events) => events,
                Err(e) => {
                    self.fail_with(StreamError::FileStreamParseBytesFailed(e.to_string()));
                    return;
                }
            };
            for event in events {
                if self.is_terminal() || self.source_id != generation {
                    return;
                }
                self.on_parser_event(event);
            }
            offset = end;
        }
    }

    fn on_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::PropertyChanged(property) => self.on_parser_property(property),
            ParserEvent::Packets { data, descriptions } => self.on_packets(data, Some(descriptions)),
            ParserEvent::Bytes { data } => self.on_packets(data, None),
        }
    }

    fn on_parser_property(&mut self, property: ParserProperty) {
        match property {
            ParserProperty::DataOffset => {
                if let Some(offset) = self.parser.as_ref().and_then(|p| p.data_offset()) {
                    self.fmt.data_offset = offset;
                    self.refresh_file_length();
                }
            }
            ParserProperty::AudioDataByteCount => {
                if let Some(count) = self.parser.as_ref().and_then(|p| p.audio_data_byte_count()) {
                    self.audio_data_byte_count = count;
                    self.refresh_file_length();
                }
            }
            ParserProperty::DataFormat => {
                if self.description.is_none() {
                    if let Some(description) = self.parser.as_ref().and_then(|p| p.data_format()) {
                        self.apply_description(&description);
                    }
                }
            }
            ParserProperty::FormatList => match self.parser.as_ref().map(|p| p.format_list()) {
                Some(Ok(list)) if !list.is_empty() => {
                    let preferred = self
                        .description
                        .and_then(|d| list.iter().find(|e| e.format_id == d.format_id).copied())
                        .unwrap_or(list[0]);
                    self.apply_description(&preferred);
                }
                Some(Err(e)) => {
                    // Ignorable: fall through to the plain description.
                    log::debug!("format list unavailable ({e}); keeping described format");
                }
                _ => {}
            },
            ParserProperty::ReadyToProducePackets => {
                log::debug!("parser ready to produce packets");
            }
        }
        self.sync_shared();
    }

    fn refresh_file_length(&mut self) {
        if self.audio_data_byte_count > 0 {
            self.fmt.file_length = self.fmt.data_offset + self.audio_data_byte_count;
        }
    }

    fn apply_description(&mut self, description: &AudioStreamDescription) {
        self.description = Some(*description);
        self.fmt.sample_rate = description.sample_rate;
        self.fmt.frames_per_packet = description.frames_per_packet;
        self.fmt.bytes_per_packet = description.bytes_per_packet;
        self.fmt.vbr = description.is_vbr();
        self.fmt.parser_packet_count =
            self.parser.as_ref().and_then(|p| p.audio_data_packet_count());
        log::debug!(
            "stream description: {} Hz, {} frames/packet, {}",
            description.sample_rate,
            description.frames_per_packet,
            if description.is_vbr() { "vbr" } else { "cbr" }
        );
    }

    // ----- packet flow -----------------------------------------------------

    /// One packet callback from the parser. The first one bootstraps the
    /// output queue (and, for seekable VBR streams, the packet-count
    /// discovery, which restarts the connection and re-delivers the payload).
    fn on_packets(
        &mut self,
        data: Vec<u8>,
        descriptions: Option<Vec<PacketDescription>>,
    ) {
        if self.output.is_none() {
            if self.run_packet_discovery() {
                return;
            }
            if self.is_terminal() || !self.create_queue() {
                return;
            }
        }

        match descriptions {
            Some(descriptions) => {
                let mut index = 0;
                while index < descriptions.len() {
                    if self.is_terminal() {
                        return;
                    }
                    if self.waiting_on_buffer || !self.packet_queue.is_empty() {
                        break;
                    }
                    let d = descriptions[index];
                    let Some(packet) = packet_slice(&data, &d) else {
                        self.fail_with(StreamError::FileStreamParseBytesFailed(
                            "packet descriptor out of bounds".into(),
                        ));
                        return;
                    };
                    match self.feed_vbr(packet, d.frames) {
                        FeedOutcome::Accepted => index += 1,
                        FeedOutcome::Rejected => break,
                        FeedOutcome::Failed => return,
                    }
                }
                for d in &descriptions[index..] {
                    let Some(packet) = packet_slice(&data, d) else {
                        self.fail_with(StreamError::FileStreamParseBytesFailed(
                            "packet descriptor out of bounds".into(),
                        ));
                        return;
                    };
                    self.packet_queue.push(QueuedPacket {
                        data: packet.to_vec(),
                        description: Some(PacketDescription {
                            start_offset: 0,
                            byte_size: d.byte_size,
                            frames: d.frames,
                        }),
                    });
                }
            }
            None => {
                let mut consumed = 0;
                if !self.waiting_on_buffer && self.packet_queue.is_empty() {
                    let (n, outcome) = self.write_cbr(&data);
                    consumed = n;
                    if outcome == FeedOutcome::Failed {
                        return;
                    }
                }
                if consumed < data.len() {
                    self.packet_queue.push(QueuedPacket {
                        data: data[consumed..].to_vec(),
                        description: None,
                    });
                }
            }
        }
    }

    /// Offer one VBR packet to the pool.
    fn feed_vbr(&mut self, packet: &[u8], frames: u32) -> FeedOutcome {
        let capacity = match self.pool.as_ref() {
            Some(pool) => pool.capacity(),
            None => return FeedOutcome::Failed,
        };
        if packet.len() > capacity {
            self.fail_with(StreamError::AudioBufferTooSmall(format!(
                "packet of {} bytes exceeds buffer capacity {capacity}",
                packet.len()
            )));
            return FeedOutcome::Failed;
        }
        let remaining = self.pool.as_ref().map(|p| p.remaining()).unwrap_or(0);
        if remaining < packet.len() {
            match self.enqueue_buffer() {
                EnqueueOutcome::Continue => {}
                EnqueueOutcome::Blocked => return FeedOutcome::Rejected,
                EnqueueOutcome::Failed => return FeedOutcome::Failed,
            }
        }

        let packet_duration = self.fmt.packet_duration();
        self.fmt.estimator.record_packet(packet.len() as u32, packet_duration);
        self.maybe_post_bitrate_ready();

        if let Some(pool) = self.pool.as_mut() {
            pool.write_packet(packet, frames);
        }
        let descriptors_full = self
            .pool
            .as_ref()
            .map(|p| p.descriptors_full())
            .unwrap_or(false);
        if descriptors_full && self.enqueue_buffer() == EnqueueOutcome::Failed {
            return FeedOutcome::Failed;
        }
        FeedOutcome::Accepted
    }

    /// Copy a CBR byte run into the pool, submitting buffers as they fill.
    /// Returns how many bytes were consumed.
    fn write_cbr(&mut self, data: &[u8]) -> (usize, FeedOutcome) {
        let mut consumed = 0;
        while consumed < data.len() {
            if self.waiting_on_buffer {
                return (consumed, FeedOutcome::Rejected);
            }
            let remaining = match self.pool.as_ref() {
                Some(pool) => pool.remaining(),
                None => return (consumed, FeedOutcome::Failed),
            };
            let byte_size = data.len() - consumed;
            if remaining < byte_size {
                match self.enqueue_buffer() {
                    EnqueueOutcome::Continue => {}
                    EnqueueOutcome::Blocked => return (consumed, FeedOutcome::Rejected),
                    EnqueueOutcome::Failed => return (consumed, FeedOutcome::Failed),
                }
            }
            let n = match self.pool.as_mut() {
                Some(pool) => pool.write_bytes(&data[consumed..]),
                None => return (consumed, FeedOutcome::Failed),
            };
            if n == 0 {
                return (consumed, FeedOutcome::Failed);
            }
            consumed += n;
            self.maybe_post_bitrate_ready();
        }
        (consumed, FeedOutcome::Accepted)
    }

    /// Submit the current fill buffer to the output queue.
    fn enqueue_buffer(&mut self) -> EnqueueOutcome {
        let submitted = {
            let Some(pool) = self.pool.as_mut() else {
                return EnqueueOutcome::Failed;
            };
            let Some(output) = self.output.as_mut() else {
                return EnqueueOutcome::Failed;
            };
            let (index, bytes, descriptions) = pool.take_filled();
            output.enqueue_buffer(index, bytes, descriptions)
        };
        if let Err(e) = submitted {
            self.fail_with(StreamError::AudioQueueEnqueueFailed(e.to_string()));
            return EnqueueOutcome::Failed;
        }

        let buffers_used = self.pool.as_ref().map(|p| p.buffers_used()).unwrap_or(0);
        let should_start = (self.state == StreamerState::WaitingForData
            || (self.seeking && !self.queue_running))
            && (self.config.buffer_count < 3 || buffers_used > 2);
        if should_start && !self.start_queue() {
            return EnqueueOutcome::Failed;
        }

        if let Some(pool) = self.pool.as_mut() {
            pool.advance();
        }

        if self.packet_queue.is_empty() && self.source_eof {
            if let Some(Err(e)) = self.output.as_mut().map(|o| o.flush()) {
                self.fail_with(StreamError::AudioQueueFlushFailed(e.to_string()));
                return EnqueueOutcome::Failed;
            }
        }

        let blocked = self
            .pool
            .as_ref()
            .map(|p| p.fill_buffer_inuse())
            .unwrap_or(false);
        if blocked {
            if !self.config.buffer_infinite {
                self.set_source_scheduled(false);
                self.unscheduled = true;
                self.rescheduled = false;
                log::debug!("all buffers in use; byte source unscheduled");
            }
            self.waiting_on_buffer = true;
            self.sync_shared();
            return EnqueueOutcome::Blocked;
        }
        self.sync_shared();
        EnqueueOutcome::Continue
    }

    /// Hand cached packets to the pool after a buffer freed up.
    fn drain_packet_queue(&mut self) {
        while let Some(packet) = self.packet_queue.pop() {
            if self.is_terminal() {
                return;
            }
            match packet.description {
                Some(d) => match self.feed_vbr(&packet.data, d.frames) {
                    FeedOutcome::Accepted => {
                        if self.waiting_on_buffer {
                            break;
                        }
                    }
                    FeedOutcome::Rejected => {
                        self.packet_queue.push_front(packet);
                        break;
                    }
                    FeedOutcome::Failed => return,
                },
                None => {
                    let (consumed, outcome) = self.write_cbr(&packet.data);
                    match outcome {
                        FeedOutcome::Accepted => {
                            if self.waiting_on_buffer {
                                break;
                            }
                        }
                        FeedOutcome::Rejected => {
                            if consumed < packet.data.len() {
                                self.packet_queue.push_front(QueuedPacket {
                                    data: packet.data[consumed..].to_vec(),
                                    description: None,
                                });
                            }
                            break;
                        }
                        FeedOutcome::Failed => return,
                    }
                }
            }
        }
        if self.packet_queue.is_empty() && self.unscheduled && !self.config.buffer_infinite {
            self.set_source_scheduled(true);
            self.rescheduled = true;
            log::debug!("packet queue drained; byte source rescheduled");
        }
        if self.packet_queue.is_empty() && self.source_eof {
            // The stream already ended, so no further packet will top this
            // buffer off; submit whatever the drain left in it.
            let partial = self
                .pool
                .as_ref()
                .map(|p| p.has_partial_fill() && !p.fill_buffer_inuse())
                .unwrap_or(false);
            if partial {
                self.enqueue_buffer();
            }
        }
    }

    fn maybe_post_bitrate_ready(&mut self) {
        if self.bitrate_notified {
            return;
        }
        if let Some(bits_per_second) = self.fmt.calculated_bit_rate() {
            self.bitrate_notified = true;
            self.sync_shared();
            log::info!("bitrate estimable: {:.0} bps", bits_per_second);
            self.hub.post(StreamerEvent::BitrateReady { bits_per_second });
        }
    }

    // ----- total-packets discovery -----------------------------------------

    /// Bisect the parser's packet-seek to count the stream's packets, then
    /// realign everything to packet 0. Returns true when the connection was
    /// restarted (the caller drops its in-hand payload, which the reopened
    /// stream re-delivers).
    fn run_packet_discovery(&mut self) -> bool {
        if self.discovery_done {
            return false;
        }
        self.discovery_done = true;
        if !self.fmt.vbr || self.fmt.file_length == 0 {
            return false;
        }
        let Some(parser) = self.parser.as_mut() else {
            return false;
        };
        if parser.audio_data_packet_count().is_some() {
            return false;
        }

        let mut lower: u64 = 0;
        let mut upper: u64 = PACKET_COUNT_SENTINEL;
        let mut last_ok = None;
        while upper - lower > 1 {
            let mid = (lower + upper) / 2;
            match parser.seek_to_packet(mid) {
                Ok(_) => {
                    lower = mid;
                    last_ok = Some(mid);
                }
                Err(_) => upper = mid,
            }
        }
        let Some(last) = last_ok else {
            log::debug!("parser cannot seek by packet; total packet count unknown");
            return false;
        };
        // When the parser never rejects a probe this is the sentinel, which
        // the duration tiers treat as "unknowable".
        self.fmt.discovered_packet_count = Some(last + 1);
        log::info!("discovered {} audio packets by bisection", last + 1);

        let realigned = parser.seek_to_packet(0);
        match realigned {
            Ok(offset) => {
                self.seek_byte_offset = offset + self.fmt.data_offset;
                self.discontinuous = true;
                self.open_source();
                self.sync_shared();
                true
            }
            Err(e) => {
                self.fail_with(StreamError::FileStreamGetPropertyFailed(format!(
                    "packet realignment failed: {e}"
                )));
                true
            }
        }
    }

    // ----- output queue adapter --------------------------------------------

    fn create_queue(&mut self) -> bool {
        let Some(description) = self.description else {
            self.fail_with(StreamError::AudioQueueCreationFailed(
                "no stream description from parser".into(),
            ));
            return false;
        };
        let events = OutputEvents::new(self.tx.clone());
        let mut output = match (self.output_factory)(&description, events) {
            Ok(output) => output,
            Err(e) => {
                self.fail_with(StreamError::AudioQueueCreationFailed(e.to_string()));
                return false;
            }
        };
        if let Err(e) = output.listen_run_state() {
            self.fail_with(StreamError::AudioQueueAddListenerFailed(e.to_string()));
            return false;
        }

        // Parser's upper bound, then the largest packet seen, then the
        // configured buffer size.
        self.packet_buffer_size = self
            .parser
            .as_ref()
            .and_then(|p| p.packet_size_upper_bound())
            .or_else(|| self.parser.as_ref().and_then(|p| p.maximum_packet_size()))
            .map(|v| v as usize)
            .filter(|&v| v > 0)
            .unwrap_or(self.config.buffer_size);

        if let Err(e) = output.allocate_buffers(self.config.buffer_count, self.packet_buffer_size) {
            self.fail_with(StreamError::AudioQueueBufferAllocationFailed(e.to_string()));
            return false;
        }
        // Cookie retrieval is best-effort; the transfer itself must succeed.
        if let Some(cookie) = self.parser.as_ref().and_then(|p| p.magic_cookie()) {
            if let Err(e) = output.set_magic_cookie(&cookie) {
                self.fail_with(StreamError::FileStreamSetPropertyFailed(format!(
                    "magic cookie rejected: {e}"
                )));
                return false;
            }
        }
        output.set_volume(self.applied_volume);
        self.shared.set_clock(output.clock());
        self.output = Some(output);
        self.pool = Some(BufferPool::new(self.config.buffer_count, self.packet_buffer_size));
        self.fmt.parser_packet_count =
            self.parser.as_ref().and_then(|p| p.audio_data_packet_count());
        self.sync_shared();
        log::info!(
            "output queue created: {} buffers x {} bytes",
            self.config.buffer_count,
            self.packet_buffer_size
        );
        true
    }

    fn start_queue(&mut self) -> bool {
        let restarting = self.seeking;
        let bypass = self.config.playback_rate == 1.0 || self.fmt.file_length == 0;
        let rate = self.config.playback_rate;
        let Some(output) = self.output.as_mut() else {
            return false;
        };
        if let Err(e) = output.enable_time_pitch(bypass) {
            log::warn!("time-pitch setup failed: {e}");
        } else if !bypass {
            if let Err(e) = output.set_playback_rate(rate) {
                log::warn!("playback rate {rate} rejected: {e}");
            }
        }
        match output.start() {
            Ok(()) => {
                if !restarting && self.state == StreamerState::WaitingForData {
                    self.set_state(StreamerState::WaitingForQueueToStart);
                }
                true
            }
            Err(e) => {
                self.fail_with(StreamError::AudioQueueStartFailed(e.to_string()));
                false
            }
        }
    }

    fn on_buffer_complete(&mut self, index: usize) {
        let released = match self.pool.as_mut() {
            Some(pool) => pool.release(index),
            None => false,
        };
        if !released || self.is_terminal() {
            return;
        }

        let pool_empty = self.pool.as_ref().map(|p| p.all_free()).unwrap_or(true);
        if pool_empty && self.packet_queue.is_empty() && self.source_eof {
            // Everything audible has been handed over; stop after the drain.
            match self.output.as_mut().map(|o| o.stop(false)) {
                Some(Ok(())) | None => {}
                Some(Err(e)) => self.fail_with(StreamError::AudioQueueStopFailed(e.to_string())),
            }
        } else if self.waiting_on_buffer {
            self.waiting_on_buffer = false;
            self.drain_packet_queue();
        }
    }

    fn on_running_changed(&mut self, running: bool) {
        self.queue_running = running;
        if running {
            self.seeking = false;
            if self.state == StreamerState::WaitingForQueueToStart {
                self.set_state(StreamerState::Playing);
            }
        } else {
            if self.is_terminal() {
                return;
            }
            if self.seeking {
                // The hard stop from the seek path; the restart follows.
                return;
            }
            log::info!("output queue stopped; stream finished");
            self.finish_eof();
        }
    }

    // ----- seek ------------------------------------------------------------

    fn seek_to_time(&mut self, seconds: f64) {
        if self.is_terminal() {
            return;
        }
        let Some(bit_rate) = self.fmt.calculated_bit_rate() else {
            log::debug!("seek rejected: bitrate unknown");
            return;
        };
        let Some(duration) = self.fmt.duration() else {
            log::debug!("seek rejected: duration unknown");
            return;
        };
        if bit_rate <= 0.0 || duration <= 0.0 || self.fmt.file_length == 0 {
            return;
        }
        if self.output.is_none() {
            log::debug!("seek rejected: no output queue yet");
            return;
        }

        let seconds = seconds.clamp(0.0, duration);
        let data_offset = self.fmt.data_offset as f64;
        let file_length = self.fmt.file_length as f64;
        self.seek_time = seconds;
        let mut target = data_offset + (seconds / duration) * (file_length - data_offset);
        // Leave room for format trailers at the end of the resource.
        let cap = file_length - 2.0 * self.packet_buffer_size as f64;
        if target > cap {
            target = cap.max(data_offset);
        }
        self.seek_byte_offset = target.max(0.0) as u64;

        let packet_duration = self.fmt.packet_duration();
        if packet_duration > 0.0 {
            let seek_packet = (seconds / packet_duration).floor() as u64;
            let aligned = self.parser.as_mut().map(|p| p.seek_to_packet(seek_packet));
            if let Some(Ok(relative)) = aligned {
                let naive_relative =
                    self.seek_byte_offset.saturating_sub(self.fmt.data_offset) as f64;
                self.seek_time -= (naive_relative - relative as f64) * 8.0 / bit_rate;
                self.seek_byte_offset = relative + self.fmt.data_offset;
            }
        }
        if self.seek_time < 0.0 {
            self.seek_time = 0.0;
        }

        self.seeking = true;
        self.close_source();
        if let Some(Err(e)) = self.output.as_mut().map(|o| o.stop(true)) {
            self.fail_with(StreamError::AudioQueueStopFailed(e.to_string()));
            return;
        }
        self.queue_running = false;
        if let Some(pool) = self.pool.as_mut() {
            pool.reset();
        }
        self.packet_queue.clear();
        self.waiting_on_buffer = false;
        self.discontinuous = self.fmt.vbr;
        self.open_source();
        self.sync_shared();
        log::info!(
            "seeking to {:.2} s (byte {})",
            self.seek_time,
            self.seek_byte_offset
        );
    }

    // ----- lifecycle -------------------------------------------------------

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn set_state(&mut self, state: StreamerState) {
        if self.state == state {
            return;
        }
        log::info!("state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.shared.set_state(state);
        self.hub.post(StreamerEvent::StatusChanged { state });
    }

    fn stop_stream(&mut self) {
        if self.is_terminal() {
            return;
        }
        log::info!("stopping stream");
        self.snapshot_progress();
        self.teardown();
        self.set_state(StreamerState::Stopped);
    }

    /// Terminal failure. Only the first call takes effect.
    fn fail_with(&mut self, error: StreamError) {
        if self.is_terminal() {
            return;
        }
        log::error!("stream failed: {error}");
        self.snapshot_progress();
        self.shared.with_snapshot(|s| s.error = Some(error));
        self.teardown();
        self.set_state(StreamerState::Done);
    }

    /// Natural end of playback.
    fn finish_eof(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.snapshot_progress();
        self.teardown();
        self.set_state(StreamerState::Done);
    }

    fn teardown(&mut self) {
        self.watchdog_armed = false;
        self.fade = None;
        self.close_source();
        self.packet_queue.clear();
        if let Some(mut output) = self.output.take() {
            let _ = output.stop(true);
        }
        self.pool = None;
        self.parser = None;
        self.queue_running = false;
        self.waiting_on_buffer = false;
        self.shared.clear_clock();
    }

    /// Record the live position so terminal states answer progress queries.
    fn snapshot_progress(&mut self) {
        if let Some(progress) = self.shared.progress() {
            self.shared.with_snapshot(|s| s.last_progress = progress);
        }
    }

    /// Mirror engine-owned metadata into the query snapshot.
    fn sync_shared(&self) {
        let format = self.fmt;
        let seek_time = self.seek_time;
        let bitrate_ready = self.bitrate_notified;
        self.shared.with_snapshot(|s| {
            s.format = format;
            s.seek_time = seek_time;
            s.bitrate_ready = bitrate_ready;
        });
    }
}

fn packet_slice<'d>(data: &'d [u8], d: &PacketDescription) -> Option<&'d [u8]> {
    let start = usize::try_from(d.start_offset).ok()?;
    let end = start.checked_add(d.byte_size as usize)?;
    data.get(start..end)
}
