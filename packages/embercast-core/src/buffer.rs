//! Byte buffers for the request path and the broadcast pipeline.
//!
//! [`Buffer`] is a growable byte region with a logical read offset, used for
//! incremental header reads and protocol assembly. [`Refbuf`] is the
//! cheaply-cloneable payload unit flowing through the per-source broadcast
//! queue and per-client pending output.

use bytes::Bytes;

/// Allocation granularity for [`Buffer`]; capacity requests round up to this.
const ALLOC_STEP: usize = 64;

/// A growable byte buffer with a logical start offset.
///
/// The region `[offset, fill)` holds the live bytes. `shift` moves the
/// logical start forward without copying; the buffer is not a ring, so
/// shifted-out space is only reclaimed when the buffer is cleared or grown.
#[derive(Debug, Default)]
pub struct Buffer {
    buf: Vec<u8>,
    /// Bytes used, counted from the physical start (includes offset bytes).
    fill: usize,
    /// Leading bytes that were logically shifted out.
    offset: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocated capacity in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.buf.capacity()
    }

    /// Bytes used, including shifted-out offset bytes.
    #[must_use]
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Leading bytes that have been shifted out.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of live bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fill - self.offset
    }

    /// True when no live bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fill == self.offset
    }

    /// The live byte window.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.offset..self.fill]
    }

    /// Capacity hint. Failure to grow is not observable; the buffer stays usable.
    pub fn preallocate(&mut self, request: usize) {
        let want = round_up(request);
        if want > self.buf.capacity() {
            self.buf.reserve(want - self.buf.len());
        }
    }

    /// Appends bytes to the tail.
    pub fn push(&mut self, data: &[u8]) {
        self.ensure_tail(data.len());
        self.buf[self.fill..self.fill + data.len()].copy_from_slice(data);
        self.fill += data.len();
    }

    /// Moves the logical start forward by `n` bytes without copying.
    ///
    /// Shifting past the fill point clamps to the fill point.
    pub fn shift(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.fill);
        if self.offset == self.fill {
            // Whole buffer consumed; reclaim the space.
            self.offset = 0;
            self.fill = 0;
        }
    }

    /// Hands out a writable tail of at least `request` bytes for direct
    /// writes (e.g. `recv`). Must be followed by [`Buffer::zerocopy_push_complete`]
    /// with the number of bytes actually written.
    pub fn zerocopy_push_request(&mut self, request: usize) -> &mut [u8] {
        self.ensure_tail(request);
        let end = self.fill + request;
        &mut self.buf[self.fill..end]
    }

    /// Commits `done` bytes written into the region returned by
    /// [`Buffer::zerocopy_push_request`]. `done` must not exceed the request.
    pub fn zerocopy_push_complete(&mut self, done: usize) {
        debug_assert!(self.fill + done <= self.buf.len());
        self.fill += done;
    }

    /// Truncates the live window to `len` bytes.
    pub fn set_length(&mut self, len: usize) {
        self.fill = (self.offset + len).min(self.buf.len());
    }

    /// Clears all content and the offset.
    pub fn clear(&mut self) {
        self.fill = 0;
        self.offset = 0;
    }

    /// Live bytes as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    fn ensure_tail(&mut self, extra: usize) {
        let needed = self.fill + extra;
        if needed > self.buf.len() {
            self.buf.resize(round_up(needed), 0);
        }
    }
}

fn round_up(n: usize) -> usize {
    n.div_ceil(ALLOC_STEP) * ALLOC_STEP
}

/// A reference-counted byte payload with a codec framing hint.
///
/// Cloning is cheap ([`Bytes`] is refcounted). `sync_point` marks a chunk a
/// freshly attached listener can start decoding at.
#[derive(Debug, Clone)]
pub struct Refbuf {
    pub data: Bytes,
    pub sync_point: bool,
}

impl Refbuf {
    /// Wraps a payload with no framing hint.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            sync_point: false,
        }
    }

    /// Wraps a payload marked as a safe decoder entry point.
    #[must_use]
    pub fn sync(data: Bytes) -> Self {
        Self {
            data,
            sync_point: true,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
