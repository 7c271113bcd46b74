//! Pluggable format handlers.
//!
//! A format handler turns the raw upstream byte stream into refbufs and
//! tags codec sync points so freshly attached listeners start at a frame
//! boundary. No actual decoding happens here; handlers only look for
//! framing markers.

use bytes::Bytes;

use crate::buffer::Refbuf;
use crate::error::ErrorId;

/// Format family selected from the source's Content-Type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Mp3,
    Ogg,
    /// Pass-through for container formats without in-band metadata support.
    Generic,
}

impl FormatKind {
    /// Selects a handler family for a Content-Type.
    ///
    /// `None` means the legacy no-header source path: allowed, handled as
    /// MP3, callers log the warning.
    pub fn from_content_type(content_type: Option<&str>) -> Result<Self, ErrorId> {
        let Some(content_type) = content_type else {
            return Ok(Self::Mp3);
        };
        let base = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "audio/mpeg" | "audio/mp3" => Ok(Self::Mp3),
            "application/ogg" | "audio/ogg" | "video/ogg" => Ok(Self::Ogg),
            "audio/aac" | "audio/aacp" | "audio/flac" | "audio/webm" | "video/webm"
            | "application/octet-stream" => Ok(Self::Generic),
            "" => Err(ErrorId::ConNoContentTypeGiven),
            _ => Err(ErrorId::ConContentTypeNosys),
        }
    }

    /// Builds the stateful handler for this family.
    #[must_use]
    pub fn handler(self) -> Box<dyn FormatHandler> {
        match self {
            Self::Mp3 => Box::new(Mp3Handler),
            Self::Ogg => Box::new(OggHandler),
            Self::Generic => Box::new(GenericHandler),
        }
    }

    /// Whether listeners of this format may request in-band metadata.
    #[must_use]
    pub fn supports_inband_metadata(self) -> bool {
        matches!(self, Self::Mp3)
    }
}

/// Stateful chunk processor for one source.
pub trait FormatHandler: Send {
    /// Splits or tags an upstream chunk into refbufs for the queue.
    fn process(&mut self, chunk: Bytes) -> Vec<Refbuf>;
}

/// MP3: a chunk containing a frame sync (0xFF with the top three bits of
/// the next byte set) is a safe entry point.
struct Mp3Handler;

impl FormatHandler for Mp3Handler {
    fn process(&mut self, chunk: Bytes) -> Vec<Refbuf> {
        let sync = chunk
            .windows(2)
            .any(|w| w[0] == 0xFF && (w[1] & 0xE0) == 0xE0);
        vec![if sync {
            Refbuf::sync(chunk)
        } else {
            Refbuf::new(chunk)
        }]
    }
}

/// Ogg: page boundaries start with the `OggS` capture pattern.
struct OggHandler;

impl FormatHandler for OggHandler {
    fn process(&mut self, chunk: Bytes) -> Vec<Refbuf> {
        let sync = chunk.windows(4).any(|w| w == b"OggS");
        vec![if sync {
            Refbuf::sync(chunk)
        } else {
            Refbuf::new(chunk)
        }]
    }
}

/// Pass-through: every chunk is as good an entry point as any.
struct GenericHandler;

impl FormatHandler for GenericHandler {
    fn process(&mut self, chunk: Bytes) -> Vec<Refbuf> {
        vec![Refbuf::sync(chunk)]
    }
}
