//! Format parser contract
//!
//! The engine feeds raw network bytes to a `FormatParser` and reacts to the
//! events it returns: property-change marks while the container header is
//! being digested, then packet payloads. Hosts plug in a parser per container
//! kind through a `ParserFactory`; the crate itself ships no codec.

use thiserror::Error;

use crate::file_type::AudioFileType;

/// Failure reported by a parser implementation. The engine maps it onto the
/// stream error for whichever operation was in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Basic description of the encoded stream, as discovered by the parser.
///
/// `bytes_per_packet == 0` marks a variable-bitrate stream, in which case
/// packets arrive with individual descriptors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioStreamDescription {
    pub sample_rate: f64,
    pub format_id: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub channels_per_frame: u32,
}

impl AudioStreamDescription {
    pub fn is_vbr(&self) -> bool {
        self.bytes_per_packet == 0
    }

    /// Seconds of audio per packet, 0 when unknown.
    pub fn packet_duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            f64::from(self.frames_per_packet) / self.sample_rate
        } else {
            0.0
        }
    }
}

/// Placement of one encoded packet inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    /// Byte offset of the packet within the containing data.
    pub start_offset: u64,
    pub byte_size: u32,
    /// Frames in this packet; 0 means the stream-level constant applies.
    pub frames: u32,
}

/// Properties the parser can announce while digesting the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserProperty {
    DataOffset,
    AudioDataByteCount,
    DataFormat,
    FormatList,
    ReadyToProducePackets,
}

/// One callback from the parser, in emission order.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    PropertyChanged(ParserProperty),
    /// VBR payload: packet bytes plus one descriptor per packet, with
    /// `start_offset` relative to `data`.
    Packets {
        data: Vec<u8>,
        descriptions: Vec<PacketDescription>,
    },
    /// CBR payload: a raw byte run with no per-packet framing.
    Bytes { data: Vec<u8> },
}

/// Incremental container/codec parser.
///
/// `parse_bytes` must accept arbitrary slicing of the input; `discontinuous`
/// is set on the first feed after the input stream jumped (seek, ranged
/// reconnect). Property getters answer `None` until the corresponding
/// property has been discovered.
pub trait FormatParser: Send {
    fn parse_bytes(
        &mut self,
        bytes: &[u8],
        discontinuous: bool,
    ) -> Result<Vec<ParserEvent>, ParseError>;

    /// Byte offset within the resource where audio frames begin.
    fn data_offset(&self) -> Option<u64> {
        None
    }

    /// Total audio payload length, when the container states it.
    fn audio_data_byte_count(&self) -> Option<u64> {
        None
    }

    /// Total audio packet count, when the container states it.
    fn audio_data_packet_count(&self) -> Option<u64> {
        None
    }

    /// Upper bound on one packet's encoded size.
    fn packet_size_upper_bound(&self) -> Option<u32> {
        None
    }

    /// Largest packet actually observed.
    fn maximum_packet_size(&self) -> Option<u32> {
        None
    }

    fn data_format(&self) -> Option<AudioStreamDescription> {
        None
    }

    /// Alternative descriptions for layered formats. A failure here is
    /// ignorable; the engine falls back to `data_format`.
    fn format_list(&self) -> Result<Vec<AudioStreamDescription>, ParseError> {
        Ok(Vec::new())
    }

    fn magic_cookie(&self) -> Option<Vec<u8>> {
        None
    }

    /// Resolve a packet index to the byte offset (relative to the start of
    /// audio data) where that packet begins. Err means the packet does not
    /// exist or the parser cannot seek.
    fn seek_to_packet(&mut self, packet: u64) -> Result<u64, ParseError>;
}

/// Builds a parser for a container kind. Called again after a Shoutcast
/// redetection replaces the hinted kind.
pub type ParserFactory =
    Box<dyn FnMut(AudioFileType) -> Result<Box<dyn FormatParser>, ParseError> + Send>;
