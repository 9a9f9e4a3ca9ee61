//! streamcast: incremental HTTP audio streaming engine
//!
//! Downloads a remote audio resource, parses container framing as bytes
//! arrive, assembles encoded packets into a bounded pool of output buffers,
//! and feeds them to a platform audio queue — with pause, resume, seek,
//! stall detection, and bitrate/duration estimation along the way.
//!
//! The format parser and the audio output queue are collaborator seams
//! ([`FormatParser`], [`AudioOutput`]) injected per stream; the crate owns
//! everything between them: the byte source, the backpressure protocol, the
//! seek machinery, and the lifecycle state machine.

pub mod error;
pub mod events;
pub mod file_type;
pub mod output;
pub mod parser;
pub mod source;
pub mod streamer;

pub use error::StreamError;
pub use events::{NotificationHub, StreamerEvent};
pub use file_type::AudioFileType;
pub use output::{AudioOutput, OutputError, OutputEvent, OutputEvents, SampleClock};
pub use parser::{
    AudioStreamDescription, FormatParser, PacketDescription, ParseError, ParserEvent,
    ParserProperty,
};
pub use source::{ProxyConfig, ProxyKind};
pub use streamer::{DoneReason, Streamer, StreamerBuilder, StreamerConfig, StreamerState};
