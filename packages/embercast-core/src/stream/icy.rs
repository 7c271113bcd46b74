//! In-band (ICY) metadata injection for MP3 listeners.
//!
//! Listeners that sent `icy-metadata: 1` get a metadata block spliced into
//! the byte stream every `metaint` bytes. A block is one length byte (in
//! units of 16 bytes) followed by the padded `StreamTitle='…';` string; a
//! single zero byte means "no change".

use bytes::{Bytes, BytesMut};

/// Default byte interval between metadata blocks.
pub const DEFAULT_METAINT: usize = 8192;

/// Formats a title into a raw metadata block.
#[must_use]
pub fn format_metadata_block(title: Option<&str>) -> Vec<u8> {
    let Some(title) = title.filter(|t| !t.is_empty()) else {
        return vec![0];
    };

    // Single quotes delimit the value; swap them for the typographic
    // apostrophe so players don't show escape characters.
    let title = title.replace('\'', "\u{2019}");
    let rendered = format!("StreamTitle='{title}';");
    let bytes = rendered.as_bytes();

    let blocks = bytes.len().div_ceil(16);
    let padded = blocks * 16;
    let mut out = Vec::with_capacity(padded + 1);
    out.push(blocks as u8);
    out.extend_from_slice(bytes);
    out.resize(padded + 1, 0);
    out
}

/// Splices metadata blocks into one listener's output stream.
///
/// Tracks the byte position across chunks and caches the rendered block,
/// re-rendering only when the title generation changes. One injector per
/// listener session.
pub struct MetadataInjector {
    metaint: usize,
    bytes_since_meta: usize,
    cached_block: Vec<u8>,
    cached_generation: u64,
    scratch: BytesMut,
}

impl MetadataInjector {
    #[must_use]
    pub fn new(metaint: usize) -> Self {
        Self {
            metaint: metaint.max(1),
            bytes_since_meta: 0,
            cached_block: vec![0],
            cached_generation: 0,
            scratch: BytesMut::new(),
        }
    }

    /// Injects metadata into `chunk`. `title` and `generation` come from
    /// the source; the block is re-rendered when the generation moves.
    pub fn inject(&mut self, chunk: &[u8], title: Option<&str>, generation: u64) -> Bytes {
        if generation != self.cached_generation {
            self.cached_block = format_metadata_block(title);
            self.cached_generation = generation;
        }

        let insertions = (self.bytes_since_meta + chunk.len()) / self.metaint;
        self.scratch
            .reserve(chunk.len() + insertions * self.cached_block.len());

        let mut remaining = chunk;
        while !remaining.is_empty() {
            let to_boundary = self.metaint - self.bytes_since_meta;
            if remaining.len() < to_boundary {
                self.scratch.extend_from_slice(remaining);
                self.bytes_since_meta += remaining.len();
                break;
            }
            self.scratch.extend_from_slice(&remaining[..to_boundary]);
            self.scratch.extend_from_slice(&self.cached_block);
            remaining = &remaining[to_boundary..];
            self.bytes_since_meta = 0;
        }

        self.scratch.split().freeze()
    }

    #[cfg(test)]
    fn bytes_since_meta(&self) -> usize {
        self.bytes_since_meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_title_renders_zero_byte() {
        assert_eq!(format_metadata_block(None), vec![0]);
        assert_eq!(format_metadata_block(Some("")), vec![0]);
    }

    #[test]
    fn block_is_padded_to_sixteen() {
        let block = format_metadata_block(Some("Test Song"));
        // "StreamTitle='Test Song';" is 24 bytes -> two 16-byte blocks
        assert_eq!(block[0], 2);
        assert_eq!(block.len(), 33);
    }

    #[test]
    fn apostrophes_become_typographic() {
        let block = format_metadata_block(Some("It's late"));
        let text = String::from_utf8_lossy(&block[1..]);
        assert!(text.contains("It\u{2019}s late"));
        assert!(!text.contains("It's"));
    }

    #[test]
    fn short_chunks_pass_through_untouched() {
        let mut injector = MetadataInjector::new(1000);
        let out = injector.inject(&[7u8; 100], None, 0);
        assert_eq!(out.len(), 100);
        assert_eq!(injector.bytes_since_meta(), 100);
    }

    #[test]
    fn block_inserted_at_boundary() {
        let mut injector = MetadataInjector::new(64);
        let out = injector.inject(&[1u8; 64], None, 0);
        assert_eq!(out.len(), 65);
        assert_eq!(out[64], 0);
        assert_eq!(injector.bytes_since_meta(), 0);
    }

    #[test]
    fn multiple_boundaries_in_one_chunk() {
        let mut injector = MetadataInjector::new(64);
        let out = injector.inject(&[1u8; 160], None, 0);
        // two zero-byte blocks injected
        assert_eq!(out.len(), 162);
        assert_eq!(injector.bytes_since_meta(), 32);
    }

    #[test]
    fn generation_change_rerenders_block() {
        let mut injector = MetadataInjector::new(16);
        let first = injector.inject(&[0u8; 16], Some("Song A"), 1);
        let again = injector.inject(&[0u8; 16], Some("Song A"), 1);
        assert_eq!(&first[16..], &again[16..]);
        let changed = injector.inject(&[0u8; 16], Some("Song B"), 2);
        assert_ne!(&first[16..], &changed[16..]);
        let text = String::from_utf8_lossy(&changed[17..]);
        assert!(text.contains("Song B"));
    }
}
