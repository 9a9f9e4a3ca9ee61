//! End-to-end engine tests
//!
//! Each test runs the real engine against a local HTTP server and scripted
//! parser/output collaborators, covering the straight play-through, seek,
//! Shoutcast redetection, stall timeout, backpressure, and stop paths.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::events::StreamerEvent;
use crate::file_type::AudioFileType;
use crate::output::{AudioOutput, OutputError, OutputEvent, OutputEvents, SampleClock};
use crate::parser::{
    AudioStreamDescription, FormatParser, PacketDescription, ParseError, ParserEvent,
    ParserProperty,
};
use crate::source::parse_range;
use crate::streamer::{DoneReason, Streamer, StreamerState};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn drain_events(rx: &Receiver<StreamerEvent>) -> Vec<StreamerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states_of(events: &[StreamerEvent]) -> Vec<StreamerState> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamerEvent::StatusChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

fn bitrate_events(events: &[StreamerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamerEvent::BitrateReady { .. }))
        .count()
}

// ----- test HTTP server ----------------------------------------------------

#[derive(Debug, Clone)]
struct RequestHead {
    line: String,
    headers: HashMap<String, String>,
}

impl RequestHead {
    fn range(&self) -> Option<(u64, u64)> {
        self.headers.get("range").and_then(|v| parse_range(v))
    }
}

enum TestBody {
    Full(Vec<u8>),
    Paced {
        data: Vec<u8>,
        chunk: usize,
        delay: Duration,
    },
    /// Send headers, then nothing for ~15 s.
    Stall,
}

struct TestResponse {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: TestBody,
}

struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RequestHead>>>,
}

impl TestServer {
    fn start<H>(handler: H) -> Self
    where
        H: Fn(&RequestHead) -> TestResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let log = Arc::clone(&log);
                let handler = Arc::clone(&handler);
                thread::spawn(move || serve_connection(stream, log, handler));
            }
        });
        Self { addr, requests }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> Option<RequestHead> {
        self.requests.lock().unwrap().get(index).cloned()
    }
}

fn serve_connection(
    stream: TcpStream,
    log: Arc<Mutex<Vec<RequestHead>>>,
    handler: Arc<dyn Fn(&RequestHead) -> TestResponse + Send + Sync>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut line = String::new();
    if reader.read_line(&mut line).is_err() || line.is_empty() {
        return;
    }
    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        match reader.read_line(&mut header_line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = header_line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                if let Some((name, value)) = trimmed.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }
            Err(_) => return,
        }
    }
    let head = RequestHead {
        line: line.trim_end().to_string(),
        headers,
    };
    log.lock().unwrap().push(head.clone());

    let response = handler(&head);
    let mut stream = stream;
    let reason = match response.status {
        200 => "OK",
        206 => "Partial Content",
        _ => "Error",
    };
    let mut head_text = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    for (name, value) in &response.headers {
        head_text.push_str(&format!("{name}: {value}\r\n"));
    }
    head_text.push_str("Connection: close\r\n\r\n");
    if stream.write_all(head_text.as_bytes()).is_err() {
        return;
    }
    let _ = stream.flush();

    match response.body {
        TestBody::Full(data) => {
            let _ = stream.write_all(&data);
        }
        TestBody::Paced { data, chunk, delay } => {
            for piece in data.chunks(chunk.max(1)) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
        TestBody::Stall => {
            // Hold the connection open, sending nothing. The process exits
            // when the test binary finishes, taking this thread with it.
            thread::sleep(Duration::from_secs(15));
        }
    }
}

fn full_response(content_type: Option<&str>, resource: &[u8], head: &RequestHead) -> TestResponse {
    sliced_response(content_type, resource, head, None)
}

fn sliced_response(
    content_type: Option<&str>,
    resource: &[u8],
    head: &RequestHead,
    pacing: Option<(usize, Duration)>,
) -> TestResponse {
    let (status, slice) = match head.range() {
        Some((start, end)) => {
            let start = (start as usize).min(resource.len());
            let end = (end as usize).min(resource.len());
            (206, resource[start..end].to_vec())
        }
        None => (200, resource.to_vec()),
    };
    let mut headers = vec![("Content-Length", slice.len().to_string())];
    if let Some(mime) = content_type {
        headers.push(("Content-Type", mime.to_string()));
    }
    let body = match pacing {
        Some((chunk, delay)) => TestBody::Paced {
            data: slice,
            chunk,
            delay,
        },
        None => TestBody::Full(slice),
    };
    TestResponse {
        status,
        headers,
        body,
    }
}

// ----- scripted parsers ----------------------------------------------------

/// Constant-bitrate parser: skips a fixed header, then passes audio bytes
/// straight through.
struct CbrParser {
    description: AudioStreamDescription,
    data_offset: u64,
    packet_count: Option<u64>,
    header_remaining: usize,
    announced: bool,
}

impl CbrParser {
    fn new(data_offset: u64, bytes_per_packet: u32, packet_count: Option<u64>) -> Self {
        Self {
            description: AudioStreamDescription {
                sample_rate: 44_100.0,
                format_id: 0x2e6d7033, // ".mp3"
                bytes_per_packet,
                frames_per_packet: 1152,
                channels_per_frame: 2,
            },
            data_offset,
            packet_count,
            header_remaining: data_offset as usize,
            announced: false,
        }
    }
}

impl FormatParser for CbrParser {
    fn parse_bytes(
        &mut self,
        bytes: &[u8],
        discontinuous: bool,
    ) -> Result<Vec<ParserEvent>, ParseError> {
        let mut events = Vec::new();
        let mut input = bytes;
        if discontinuous {
            // Ranged reconnects land inside the audio data.
            self.header_remaining = 0;
        }
        if self.header_remaining > 0 {
            let skip = self.header_remaining.min(input.len());
            self.header_remaining -= skip;
            input = &input[skip..];
        }
        if self.header_remaining == 0 && !self.announced {
            self.announced = true;
            events.push(ParserEvent::PropertyChanged(ParserProperty::DataOffset));
            events.push(ParserEvent::PropertyChanged(ParserProperty::DataFormat));
            events.push(ParserEvent::PropertyChanged(
                ParserProperty::ReadyToProducePackets,
            ));
        }
        if !input.is_empty() {
            events.push(ParserEvent::Bytes {
                data: input.to_vec(),
            });
        }
        Ok(events)
    }

    fn data_offset(&self) -> Option<u64> {
        Some(self.data_offset)
    }

    fn audio_data_packet_count(&self) -> Option<u64> {
        self.packet_count
    }

    fn data_format(&self) -> Option<AudioStreamDescription> {
        Some(self.description)
    }

    fn seek_to_packet(&mut self, packet: u64) -> Result<u64, ParseError> {
        if let Some(total) = self.packet_count {
            if packet >= total {
                return Err(ParseError("packet past end of stream".into()));
            }
        }
        Ok(packet * u64::from(self.description.bytes_per_packet))
    }
}

/// Variable-bitrate parser: fixed-size packets with descriptors, a packet
/// count only reachable by bisection, and an optional magic cookie.
struct VbrParser {
    description: AudioStreamDescription,
    data_offset: u64,
    packet_size: usize,
    total_packets: Option<u64>,
    reported_packet_count: Option<u64>,
    upper_bound: Option<u32>,
    cookie: Option<Vec<u8>>,
    header_remaining: usize,
    announced: bool,
    pending: Vec<u8>,
}

impl VbrParser {
    fn new(data_offset: u64, packet_size: usize) -> Self {
        Self {
            description: AudioStreamDescription {
                sample_rate: 44_100.0,
                format_id: 0x61616320, // "aac "
                bytes_per_packet: 0,
                frames_per_packet: 1024,
                channels_per_frame: 2,
            },
            data_offset,
            packet_size,
            total_packets: None,
            reported_packet_count: None,
            upper_bound: None,
            cookie: None,
            header_remaining: data_offset as usize,
            announced: false,
            pending: Vec::new(),
        }
    }
}

impl FormatParser for VbrParser {
    fn parse_bytes(
        &mut self,
        bytes: &[u8],
        discontinuous: bool,
    ) -> Result<Vec<ParserEvent>, ParseError> {
        let mut events = Vec::new();
        let mut input = bytes;
        if discontinuous {
            self.header_remaining = 0;
            self.pending.clear();
        }
        if self.header_remaining > 0 {
            let skip = self.header_remaining.min(input.len());
            self.header_remaining -= skip;
            input = &input[skip..];
        }
        if self.header_remaining == 0 && !self.announced {
            self.announced = true;
            events.push(ParserEvent::PropertyChanged(ParserProperty::DataOffset));
            events.push(ParserEvent::PropertyChanged(ParserProperty::DataFormat));
            events.push(ParserEvent::PropertyChanged(
                ParserProperty::ReadyToProducePackets,
            ));
        }
        self.pending.extend_from_slice(input);
        let full_packets = self.pending.len() / self.packet_size;
        if full_packets > 0 {
            let take = full_packets * self.packet_size;
            let data: Vec<u8> = self.pending.drain(..take).collect();
            let descriptions = (0..full_packets)
                .map(|i| PacketDescription {
                    start_offset: (i * self.packet_size) as u64,
                    byte_size: self.packet_size as u32,
                    frames: self.description.frames_per_packet,
                })
                .collect();
            events.push(ParserEvent::Packets { data, descriptions });
        }
        Ok(events)
    }

    fn data_offset(&self) -> Option<u64> {
        Some(self.data_offset)
    }

    fn audio_data_packet_count(&self) -> Option<u64> {
        self.reported_packet_count
    }

    fn packet_size_upper_bound(&self) -> Option<u32> {
        self.upper_bound
    }

    fn data_format(&self) -> Option<AudioStreamDescription> {
        Some(self.description)
    }

    fn magic_cookie(&self) -> Option<Vec<u8>> {
        self.cookie.clone()
    }

    fn seek_to_packet(&mut self, packet: u64) -> Result<u64, ParseError> {
        if let Some(total) = self.total_packets {
            if packet >= total {
                return Err(ParseError("packet past end of stream".into()));
            }
        }
        Ok(packet * self.packet_size as u64)
    }
}

// ----- mock output queue ---------------------------------------------------

#[derive(Default)]
struct OutputLog {
    description: Option<AudioStreamDescription>,
    allocated: Option<(usize, usize)>,
    enqueued: Vec<(usize, Vec<u8>, usize)>,
    listeners: usize,
    started: usize,
    stops: Vec<bool>,
    flushes: usize,
    resets: usize,
    cookies: Vec<Vec<u8>>,
    volumes: Vec<f32>,
}

struct OutputHarness {
    log: Mutex<OutputLog>,
    samples: Mutex<f64>,
    auto_complete: bool,
    /// Sample frames credited per enqueued byte when completing a buffer.
    frames_per_byte: f64,
    events: Mutex<Option<OutputEvents>>,
    pending: Mutex<VecDeque<(usize, usize)>>,
    running: AtomicBool,
    factory_calls: AtomicUsize,
    fail_cookie: AtomicBool,
}

impl OutputHarness {
    fn new(auto_complete: bool, frames_per_byte: f64) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(OutputLog::default()),
            samples: Mutex::new(0.0),
            auto_complete,
            frames_per_byte,
            events: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            factory_calls: AtomicUsize::new(0),
            fail_cookie: AtomicBool::new(false),
        })
    }

    fn factory(
        self: &Arc<Self>,
    ) -> impl FnMut(&AudioStreamDescription, OutputEvents) -> Result<Box<dyn AudioOutput>, OutputError>
           + Send
           + 'static {
        let harness = Arc::clone(self);
        move |description, events| {
            harness.factory_calls.fetch_add(1, Ordering::SeqCst);
            harness.log.lock().unwrap().description = Some(*description);
            *harness.events.lock().unwrap() = Some(events);
            Ok(Box::new(MockOutput {
                harness: Arc::clone(&harness),
            }))
        }
    }

    fn post(&self, event: OutputEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.post(event);
        }
    }

    fn credit(&self, bytes: usize) {
        *self.samples.lock().unwrap() += bytes as f64 * self.frames_per_byte;
    }

    /// Complete the oldest outstanding buffer; false when none are pending.
    fn complete_one(&self) -> bool {
        let popped = self.pending.lock().unwrap().pop_front();
        match popped {
            Some((index, bytes)) => {
                self.credit(bytes);
                self.post(OutputEvent::BufferComplete { index });
                true
            }
            None => false,
        }
    }

    fn enqueued_count(&self) -> usize {
        self.log.lock().unwrap().enqueued.len()
    }

    fn enqueued_bytes(&self) -> Vec<u8> {
        let log = self.log.lock().unwrap();
        let mut bytes = Vec::new();
        for (_, data, _) in &log.enqueued {
            bytes.extend_from_slice(data);
        }
        bytes
    }

    fn factory_calls(&self) -> usize {
        self.factory_calls.load(Ordering::SeqCst)
    }
}

struct HarnessClock(Arc<OutputHarness>);

impl SampleClock for HarnessClock {
    fn sample_time(&self) -> Option<f64> {
        Some(*self.0.samples.lock().unwrap())
    }
}

struct MockOutput {
    harness: Arc<OutputHarness>,
}

impl AudioOutput for MockOutput {
    fn allocate_buffers(&mut self, count: usize, byte_capacity: usize) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().allocated = Some((count, byte_capacity));
        Ok(())
    }

    fn enqueue_buffer(
        &mut self,
        index: usize,
        bytes: &[u8],
        descriptions: &[PacketDescription],
    ) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().enqueued.push((
            index,
            bytes.to_vec(),
            descriptions.len(),
        ));
        if self.harness.auto_complete {
            self.harness.credit(bytes.len());
            self.harness.post(OutputEvent::BufferComplete { index });
        } else {
            self.harness
                .pending
                .lock()
                .unwrap()
                .push_back((index, bytes.len()));
        }
        Ok(())
    }

    fn listen_run_state(&mut self) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().listeners += 1;
        Ok(())
    }

    fn start(&mut self) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().started += 1;
        self.harness.running.store(true, Ordering::SeqCst);
        self.harness.post(OutputEvent::RunningChanged { running: true });
        Ok(())
    }

    fn pause(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn stop(&mut self, immediate: bool) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().stops.push(immediate);
        if immediate {
            *self.harness.samples.lock().unwrap() = 0.0;
            self.harness.pending.lock().unwrap().clear();
        }
        if self.harness.running.swap(false, Ordering::SeqCst) {
            self.harness.post(OutputEvent::RunningChanged { running: false });
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), OutputError> {
        self.harness.log.lock().unwrap().resets += 1;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.harness.log.lock().unwrap().volumes.push(volume);
    }

    fn enable_time_pitch(&mut self, _bypass: bool) -> Result<(), OutputError> {
        Ok(())
    }

    fn set_playback_rate(&mut self, _rate: f32) -> Result<(), OutputError> {
        Ok(())
    }

    fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<(), OutputError> {
        if self.harness.fail_cookie.load(Ordering::SeqCst) {
            return Err(OutputError("codec configuration unsupported".into()));
        }
        self.harness.log.lock().unwrap().cookies.push(cookie.to_vec());
        Ok(())
    }

    fn clock(&self) -> Arc<dyn SampleClock> {
        Arc::new(HarnessClock(Arc::clone(&self.harness)))
    }
}

// ----- fixtures ------------------------------------------------------------

const CBR_HEADER: u64 = 45;
const CBR_PACKET: u32 = 418;

/// 1,000,000-byte resource: 45 header bytes then patterned audio.
fn cbr_resource() -> Vec<u8> {
    let mut resource = vec![0xAA; CBR_HEADER as usize];
    resource.extend((0..1_000_000 - CBR_HEADER as usize).map(|i| (i % 251) as u8));
    resource
}

fn cbr_packet_count(resource_len: u64) -> u64 {
    (resource_len - CBR_HEADER) / u64::from(CBR_PACKET)
}

// ----- scenarios -----------------------------------------------------------

#[test]
fn cbr_play_through_reaches_eof() {
    init_logging();
    let resource = cbr_resource();
    let audio = resource[CBR_HEADER as usize..].to_vec();
    let packet_count = cbr_packet_count(resource.len() as u64);
    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| full_response(Some("audio/mpeg"), &resource, head))
    };
    let harness = OutputHarness::new(true, 1152.0 / f64::from(CBR_PACKET));

    let streamer = Streamer::builder(server.url("/track"))
        .parser(move |_| {
            Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, Some(packet_count))) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();
    let events = streamer.subscribe();

    assert!(streamer.start());
    assert!(!streamer.start(), "start is one-shot");
    assert!(
        wait_for(Duration::from_secs(15), || streamer.is_done()),
        "stream never finished"
    );

    assert_eq!(streamer.state(), StreamerState::Done);
    assert_eq!(streamer.done_reason(), Some(DoneReason::Eof));
    assert!(streamer.error().is_none());

    let log = drain_events(&events);
    assert_eq!(
        states_of(&log),
        vec![
            StreamerState::WaitingForData,
            StreamerState::WaitingForQueueToStart,
            StreamerState::Playing,
            StreamerState::Done,
        ]
    );
    assert_eq!(bitrate_events(&log), 1, "BitrateReady must post exactly once");

    // ~128 kbps over ~1 MB of audio.
    let duration = streamer.duration().unwrap();
    assert!((duration - 62.49).abs() < 0.1, "duration was {duration}");
    let progress = streamer.progress().unwrap();
    assert!((progress - duration).abs() < 1.0, "progress was {progress}");

    // Bitrate stays available once ready.
    let rate = streamer.calculated_bit_rate().unwrap();
    assert!((rate - 128_012.5).abs() < 10.0, "bit rate was {rate}");

    // Every audio byte reached the output, in order, over one connection.
    assert_eq!(server.request_count(), 1);
    assert_eq!(harness.enqueued_bytes(), audio);
    assert_eq!(
        streamer.http_headers().get("content-type").map(String::as_str),
        Some("audio/mpeg")
    );
}

#[test]
fn seek_mid_stream_restarts_with_range() {
    init_logging();
    let resource = cbr_resource();
    let packet_count = cbr_packet_count(resource.len() as u64);
    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| {
            sliced_response(
                Some("audio/mpeg"),
                &resource,
                head,
                Some((64 * 1024, Duration::from_millis(20))),
            )
        })
    };
    // Manual completion keeps the clock deterministic across the seek.
    let harness = OutputHarness::new(false, 0.0);

    let streamer = Streamer::builder(server.url("/track.mp3"))
        .parser(move |_| {
            Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, Some(packet_count))) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();
    let events = streamer.subscribe();

    assert!(streamer.start());
    assert!(
        wait_for(Duration::from_secs(10), || streamer.is_playing()),
        "never started playing"
    );
    drain_events(&events);
    let buffers_before_seek = harness.enqueued_count();

    streamer.seek_to_time(30.0);
    assert!(
        wait_for(Duration::from_secs(10), || server.request_count() >= 2),
        "seek sent no new request"
    );

    // Packet-aligned offset: floor(30 / (1152/44100)) = 1148 packets.
    let aligned = CBR_HEADER + 1148 * u64::from(CBR_PACKET);
    let head = server.request(1).unwrap();
    assert_eq!(
        head.range(),
        Some((aligned, resource.len() as u64)),
        "range header was {:?}",
        head.headers.get("range")
    );
    assert_eq!((aligned - CBR_HEADER) % u64::from(CBR_PACKET), 0);

    // The queue restarts without the state ever leaving Playing.
    assert!(
        wait_for(Duration::from_secs(10), || {
            harness.enqueued_count() >= buffers_before_seek + 2
        }),
        "no buffers after seek"
    );
    assert_eq!(streamer.state(), StreamerState::Playing);
    assert_eq!(states_of(&drain_events(&events)), Vec::<StreamerState>::new());

    let progress = streamer.progress().unwrap();
    assert!(
        (progress - 30.0).abs() < 0.1,
        "progress after seek was {progress}"
    );

    streamer.stop();
    assert!(wait_for(Duration::from_secs(5), || streamer.is_done()));
}

#[test]
fn shoutcast_stream_without_content_type() {
    init_logging();
    let mut resource = vec![0xAA; CBR_HEADER as usize];
    resource.extend((0..50_000u32).map(|i| (i % 241) as u8));
    let audio = resource[CBR_HEADER as usize..].to_vec();
    let packet_count = cbr_packet_count(resource.len() as u64);

    let mut body = b"Content-Type: audio/mpeg\r\n\r\n".to_vec();
    body.extend_from_slice(&resource);
    let server = TestServer::start(move |head| full_response(None, &body, head));

    let harness = OutputHarness::new(true, 1152.0 / f64::from(CBR_PACKET));
    let opened_types: Arc<Mutex<Vec<AudioFileType>>> = Arc::new(Mutex::new(Vec::new()));
    let opened = Arc::clone(&opened_types);

    // A URL without an extension so only the inline block names the type.
    let streamer = Streamer::builder(server.url("/listen"))
        .parser(move |kind| {
            opened.lock().unwrap().push(kind);
            Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, Some(packet_count))) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();

    assert!(streamer.start());
    assert!(
        wait_for(Duration::from_secs(15), || streamer.is_done()),
        "stream never finished"
    );

    assert_eq!(streamer.done_reason(), Some(DoneReason::Eof));
    assert!(streamer.error().is_none(), "error: {:?}", streamer.error());
    assert_eq!(*opened_types.lock().unwrap(), vec![AudioFileType::Mp3]);
    assert_eq!(harness.enqueued_bytes(), audio);
}

#[test]
fn recognized_content_type_never_sniffs() {
    init_logging();
    // The body starts with header-looking text, but the response header
    // already names a type, so the text must be treated as audio.
    let body = b"Content-Type: audio/x-wav\r\n\r\nactual audio payload bytes ".repeat(400);
    let server = {
        let body = body.clone();
        TestServer::start(move |head| full_response(Some("audio/mpeg"), &body, head))
    };
    let harness = OutputHarness::new(true, 0.0);
    let opened_types: Arc<Mutex<Vec<AudioFileType>>> = Arc::new(Mutex::new(Vec::new()));
    let opened = Arc::clone(&opened_types);

    let streamer = Streamer::builder(server.url("/listen"))
        .parser(move |kind| {
            opened.lock().unwrap().push(kind);
            Ok(Box::new(CbrParser::new(0, CBR_PACKET, None)) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();

    assert!(streamer.start());
    assert!(wait_for(Duration::from_secs(15), || streamer.is_done()));

    assert_eq!(*opened_types.lock().unwrap(), vec![AudioFileType::Mp3]);
    // The header-looking text went to the output verbatim.
    assert_eq!(harness.enqueued_bytes(), body);
}

#[test]
fn network_stall_times_out() {
    init_logging();
    let server = TestServer::start(|_| TestResponse {
        status: 200,
        headers: vec![
            ("Content-Type", "audio/mpeg".to_string()),
            ("Content-Length", "1000000".to_string()),
        ],
        body: TestBody::Stall,
    });
    let harness = OutputHarness::new(true, 0.0);

    let streamer = Streamer::builder(server.url("/track"))
        .parser(|_| Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, None)) as Box<dyn FormatParser>))
        .output(harness.factory())
        .build();
    streamer.set_timeout_interval(2.0);

    assert!(streamer.start());
    assert!(
        wait_for(Duration::from_secs(10), || streamer.is_done()),
        "watchdog never fired"
    );

    assert_eq!(streamer.state(), StreamerState::Done);
    assert_eq!(streamer.done_reason(), Some(DoneReason::Error));
    assert!(matches!(streamer.error(), Some(StreamError::TimedOut(_))));

    // A later stop cannot displace the first terminal outcome.
    streamer.stop();
    assert_eq!(streamer.state(), StreamerState::Done);
    assert_eq!(streamer.done_reason(), Some(DoneReason::Error));
}

#[test]
fn backpressure_loses_no_packets() {
    init_logging();
    const PACKET: usize = 100;
    const PACKETS: usize = 600;
    let mut resource = vec![0xAA; CBR_HEADER as usize];
    resource.extend((0..PACKET * PACKETS).map(|i| (i / PACKET) as u8));
    let audio = resource[CBR_HEADER as usize..].to_vec();

    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| full_response(Some("audio/aac"), &resource, head))
    };
    let harness = OutputHarness::new(false, 0.0);

    let streamer = Streamer::builder(server.url("/stream"))
        .parser(move |_| {
            let mut parser = VbrParser::new(CBR_HEADER, PACKET);
            parser.reported_packet_count = Some(PACKETS as u64);
            parser.total_packets = Some(PACKETS as u64);
            Ok(Box::new(parser) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();
    streamer.set_buffer_count(3);
    streamer.set_buffer_size(512);

    assert!(streamer.start());

    // All three buffers fill, then the pool blocks.
    assert!(
        wait_for(Duration::from_secs(10), || harness.enqueued_count() == 3),
        "pool never filled"
    );
    thread::sleep(Duration::from_millis(150));
    assert_eq!(harness.enqueued_count(), 3, "pool overfilled while blocked");

    // Completing one buffer lets the cached packets drain into the freed slot.
    assert!(harness.complete_one());
    assert!(
        wait_for(Duration::from_secs(5), || harness.enqueued_count() >= 4),
        "drain produced no buffer"
    );

    // Pump completions until the stream ends.
    assert!(
        wait_for(Duration::from_secs(20), || {
            if !harness.complete_one() {
                thread::sleep(Duration::from_millis(5));
            }
            streamer.is_done()
        }),
        "stream never finished"
    );
    assert_eq!(streamer.done_reason(), Some(DoneReason::Eof));

    // Nothing lost, nothing reordered, and every buffer carried descriptors.
    assert_eq!(harness.enqueued_bytes(), audio);
    let log = harness.log.lock().unwrap();
    assert!(log.enqueued.iter().all(|(_, data, descs)| *descs > 0 && !data.is_empty()));
    // Strict FIFO across slots.
    let indices: Vec<usize> = log.enqueued.iter().map(|(i, _, _)| *i).collect();
    for (n, index) in indices.iter().enumerate() {
        assert_eq!(*index, n % 3);
    }
}

#[test]
fn stop_while_waiting_for_data() {
    init_logging();
    let server = TestServer::start(|_| TestResponse {
        status: 200,
        headers: vec![("Content-Type", "audio/mpeg".to_string())],
        body: TestBody::Stall,
    });
    let harness = OutputHarness::new(true, 0.0);

    let streamer = Streamer::builder(server.url("/track"))
        .parser(|_| Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, None)) as Box<dyn FormatParser>))
        .output(harness.factory())
        .build();
    let events = streamer.subscribe();

    assert!(streamer.start());
    assert!(wait_for(Duration::from_secs(5), || {
        streamer.state() == StreamerState::WaitingForData
    }));

    streamer.stop();
    assert!(wait_for(Duration::from_secs(5), || {
        streamer.state() == StreamerState::Stopped
    }));

    assert_eq!(streamer.done_reason(), Some(DoneReason::Stopped));
    assert_eq!(harness.factory_calls(), 0, "no queue may exist");
    assert_eq!(
        states_of(&drain_events(&events)),
        vec![StreamerState::WaitingForData, StreamerState::Stopped]
    );

    // Idempotent: a second stop changes nothing and posts nothing.
    streamer.stop();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(streamer.state(), StreamerState::Stopped);
    assert!(drain_events(&events).is_empty());
}

#[test]
fn vbr_discovery_bisects_and_realigns() {
    init_logging();
    const PACKET: usize = 371;
    const PACKETS: usize = 400;
    let mut resource = vec![0xAA; CBR_HEADER as usize];
    resource.extend((0..PACKET * PACKETS).map(|i| (i % 239) as u8));
    let audio = resource[CBR_HEADER as usize..].to_vec();

    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| full_response(Some("audio/aac"), &resource, head))
    };
    let harness = OutputHarness::new(true, 0.0);

    let streamer = Streamer::builder(server.url("/stream.aac"))
        .parser(move |_| {
            let mut parser = VbrParser::new(CBR_HEADER, PACKET);
            // No reported count: only the bisection can find the total.
            parser.total_packets = Some(PACKETS as u64);
            parser.upper_bound = Some(PACKET as u32 + 16);
            parser.cookie = Some(vec![0xC0, 0x0C, 0x1E]);
            Ok(Box::new(parser) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();
    let events = streamer.subscribe();

    assert!(streamer.start());
    assert!(
        wait_for(Duration::from_secs(15), || streamer.is_done()),
        "stream never finished"
    );
    assert_eq!(streamer.done_reason(), Some(DoneReason::Eof));

    // Discovery reopened the connection at the realigned audio start.
    assert_eq!(server.request_count(), 2);
    let head = server.request(1).unwrap();
    assert_eq!(head.range(), Some((CBR_HEADER, resource.len() as u64)));

    // Duration comes from the discovered packet count.
    let duration = streamer.duration().unwrap();
    let expected = PACKETS as f64 * 1024.0 / 44_100.0;
    assert!((duration - expected).abs() < 0.01, "duration was {duration}");

    // The cookie crossed to the queue, packets arrived exactly once, and the
    // run-state listener was registered with the one queue that was created.
    assert_eq!(bitrate_events(&drain_events(&events)), 1);
    assert_eq!(harness.enqueued_bytes(), audio);
    let log = harness.log.lock().unwrap();
    assert_eq!(log.cookies, vec![vec![0xC0, 0x0C, 0x1E]]);
    assert_eq!(log.listeners, 1);
}

#[test]
fn rejected_magic_cookie_fails_the_stream() {
    init_logging();
    const PACKET: usize = 371;
    const PACKETS: usize = 80;
    let mut resource = vec![0xAA; CBR_HEADER as usize];
    resource.extend((0..PACKET * PACKETS).map(|i| (i % 239) as u8));

    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| full_response(Some("audio/aac"), &resource, head))
    };
    let harness = OutputHarness::new(true, 0.0);
    harness.fail_cookie.store(true, Ordering::SeqCst);

    let streamer = Streamer::builder(server.url("/stream.aac"))
        .parser(move |_| {
            let mut parser = VbrParser::new(CBR_HEADER, PACKET);
            parser.reported_packet_count = Some(PACKETS as u64);
            parser.total_packets = Some(PACKETS as u64);
            parser.cookie = Some(vec![0x01, 0x02]);
            Ok(Box::new(parser) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();

    assert!(streamer.start());
    assert!(wait_for(Duration::from_secs(10), || streamer.is_done()));

    assert_eq!(streamer.done_reason(), Some(DoneReason::Error));
    assert!(matches!(
        streamer.error(),
        Some(StreamError::FileStreamSetPropertyFailed(_))
    ));
    assert_eq!(harness.enqueued_count(), 0, "no buffer may follow the failure");
}

#[test]
fn pause_suppresses_watchdog_and_resumes() {
    init_logging();
    let resource = cbr_resource();
    let packet_count = cbr_packet_count(resource.len() as u64);
    let server = {
        let resource = resource.clone();
        TestServer::start(move |head| {
            sliced_response(
                Some("audio/mpeg"),
                &resource,
                head,
                Some((32 * 1024, Duration::from_millis(15))),
            )
        })
    };
    let harness = OutputHarness::new(false, 0.0);

    let streamer = Streamer::builder(server.url("/track"))
        .parser(move |_| {
            Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, Some(packet_count))) as Box<dyn FormatParser>)
        })
        .output(harness.factory())
        .build();
    streamer.set_timeout_interval(1.0);

    assert!(!streamer.pause(), "pause before playing must fail");
    assert!(streamer.start());
    assert!(wait_for(Duration::from_secs(10), || streamer.is_playing()));

    assert!(streamer.pause());
    assert!(wait_for(Duration::from_secs(2), || streamer.is_paused()));
    // Longer than two watchdog intervals: paused streams never time out.
    thread::sleep(Duration::from_millis(2500));
    assert!(streamer.is_paused());
    assert!(streamer.error().is_none());

    assert!(streamer.play());
    assert!(wait_for(Duration::from_secs(2), || streamer.is_playing()));

    streamer.stop();
    assert!(wait_for(Duration::from_secs(5), || streamer.is_done()));
}

#[test]
fn volume_requires_a_queue() {
    init_logging();
    let server = TestServer::start(|_| TestResponse {
        status: 200,
        headers: vec![("Content-Type", "audio/mpeg".to_string())],
        body: TestBody::Stall,
    });
    let harness = OutputHarness::new(true, 0.0);

    let streamer = Streamer::builder(server.url("/track"))
        .parser(|_| Ok(Box::new(CbrParser::new(CBR_HEADER, CBR_PACKET, None)) as Box<dyn FormatParser>))
        .output(harness.factory())
        .build();

    assert!(!streamer.set_volume(0.5), "no queue exists yet");
    streamer.stop();
}

#[test]
fn config_setters_lock_after_start() {
    init_logging();
    let server = TestServer::start(|_| TestResponse {
        status: 200,
        headers: vec![],
        body: TestBody::Stall,
    });
    let harness = OutputHarness::new(true, 0.0);

    let streamer = Streamer::builder(server.url("/x"))
        .parser(|_| Ok(Box::new(CbrParser::new(0, CBR_PACKET, None)) as Box<dyn FormatParser>))
        .output(harness.factory())
        .build();

    assert!(streamer.set_buffer_count(8));
    assert!(streamer.set_buffer_size(4096));
    assert!(streamer.set_timeout_interval(5.0));
    assert!(streamer.set_playback_rate(1.5));
    assert!(streamer.set_buffer_infinite(true));
    assert!(streamer.set_file_type(AudioFileType::Mp3));
    assert!(streamer.set_http_proxy("proxy.local", 8080));

    assert!(streamer.start());
    assert!(!streamer.set_buffer_count(4));
    assert!(!streamer.set_http_proxy("proxy.local", 8081));
    streamer.stop();
}
