//! Audio container recognition
//!
//! File-type hints come from the `Content-Type` response header first, then
//! the URL path extension, and default to MP3. A defaulted hint is what arms
//! the Shoutcast sniffer.

use serde::{Deserialize, Serialize};

/// Recognized audio container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFileType {
    Mp3,
    Wav,
    Aiff,
    M4a,
    Mpeg4,
    Caf,
    AacAdts,
}

impl AudioFileType {
    /// Map a MIME type (parameters allowed) onto a container kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "audio/mpeg" => Some(Self::Mp3),
            "audio/x-wav" => Some(Self::Wav),
            "audio/x-aiff" => Some(Self::Aiff),
            "audio/x-m4a" => Some(Self::M4a),
            "audio/mp4" => Some(Self::Mpeg4),
            "audio/x-caf" => Some(Self::Caf),
            "audio/aac" | "audio/aacp" => Some(Self::AacAdts),
            _ => None,
        }
    }

    /// Map a path extension onto a container kind.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "wav" => Some(Self::Wav),
            "aifc" | "aiff" => Some(Self::Aiff),
            "m4a" => Some(Self::M4a),
            "mp4" => Some(Self::Mpeg4),
            "caf" => Some(Self::Caf),
            "aac" => Some(Self::AacAdts),
            _ => None,
        }
    }

    /// Extract and map the extension of a URL's path component.
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let path = parsed.path();
        let (_, ext) = path.rsplit_once('.')?;
        if ext.contains('/') {
            return None;
        }
        Self::from_extension(ext)
    }
}

/// Derive the hint per the header → extension → default order.
///
/// The bool is true when the hint fell through to the MP3 default, which is
/// the condition for Shoutcast sniffing.
pub fn derive_file_type(content_type: Option<&str>, url: &str) -> (AudioFileType, bool) {
    if let Some(kind) = content_type.and_then(AudioFileType::from_mime) {
        return (kind, false);
    }
    if let Some(kind) = AudioFileType::from_url(url) {
        return (kind, false);
    }
    (AudioFileType::Mp3, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_table() {
        assert_eq!(AudioFileType::from_mime("audio/mpeg"), Some(AudioFileType::Mp3));
        assert_eq!(AudioFileType::from_mime("audio/x-wav"), Some(AudioFileType::Wav));
        assert_eq!(AudioFileType::from_mime("audio/x-aiff"), Some(AudioFileType::Aiff));
        assert_eq!(AudioFileType::from_mime("audio/x-m4a"), Some(AudioFileType::M4a));
        assert_eq!(AudioFileType::from_mime("audio/mp4"), Some(AudioFileType::Mpeg4));
        assert_eq!(AudioFileType::from_mime("audio/x-caf"), Some(AudioFileType::Caf));
        assert_eq!(AudioFileType::from_mime("audio/aac"), Some(AudioFileType::AacAdts));
        assert_eq!(AudioFileType::from_mime("audio/aacp"), Some(AudioFileType::AacAdts));
        assert_eq!(AudioFileType::from_mime("text/html"), None);
    }

    #[test]
    fn mime_parameters_and_case_are_ignored() {
        assert_eq!(
            AudioFileType::from_mime("Audio/MPEG; charset=utf-8"),
            Some(AudioFileType::Mp3)
        );
    }

    #[test]
    fn extension_table() {
        assert_eq!(AudioFileType::from_extension("MP3"), Some(AudioFileType::Mp3));
        assert_eq!(AudioFileType::from_extension("aifc"), Some(AudioFileType::Aiff));
        assert_eq!(AudioFileType::from_extension("ogg"), None);
    }

    #[test]
    fn url_extension() {
        assert_eq!(
            AudioFileType::from_url("http://radio.example/stream/track.m4a?token=x"),
            Some(AudioFileType::M4a)
        );
        assert_eq!(AudioFileType::from_url("http://radio.example/stream"), None);
    }

    #[test]
    fn derivation_order() {
        let (kind, defaulted) = derive_file_type(Some("audio/x-wav"), "http://x/file.mp3");
        assert_eq!(kind, AudioFileType::Wav);
        assert!(!defaulted);

        let (kind, defaulted) = derive_file_type(None, "http://x/file.caf");
        assert_eq!(kind, AudioFileType::Caf);
        assert!(!defaulted);

        let (kind, defaulted) = derive_file_type(Some("application/octet-stream"), "http://x/stream");
        assert_eq!(kind, AudioFileType::Mp3);
        assert!(defaulted);
    }
}
