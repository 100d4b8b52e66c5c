//! Incremental CRC-32C checksum engine (C1).
//!
//! A single-threaded, feed-then-read abstraction used both by the container
//! descriptor's self-checksum (C2) and by chunk checksum verification (C5).

/// Non-contiguous view over a buffer, used by callers that hold data split
/// across more than one backing slice (e.g. a ring buffer wrap-around).
pub enum ByteBufferView<'a> {
    Contiguous(&'a [u8]),
    Fragments(&'a [&'a [u8]]),
}

/// Incremental CRC-32C (Castagnoli) checksum.
///
/// Deliberately built on the `crc32c` crate rather than the far more common
/// `crc32fast`: `crc32fast` computes the IEEE 802.3 polynomial, not
/// Castagnoli, and using it here would silently produce the wrong checksum
/// for every chunk and descriptor this crate writes.
pub struct ChecksumEngine {
    state: u32,
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumEngine {
    pub fn new() -> Self {
        ChecksumEngine { state: 0 }
    }

    pub fn feed_byte(&mut self, byte: u8) {
        self.state = crc32c::crc32c_append(self.state, &[byte]);
    }

    pub fn feed_slice(&mut self, buf: &[u8], offset: usize, length: usize) {
        self.state = crc32c::crc32c_append(self.state, &buf[offset..offset + length]);
    }

    /// Feed a (possibly non-contiguous) buffer view. Fragmented views are
    /// copied into a bounce buffer first, since the underlying hasher only
    /// accepts contiguous slices.
    pub fn feed_view(&mut self, view: ByteBufferView<'_>) {
        match view {
            ByteBufferView::Contiguous(buf) => {
                self.state = crc32c::crc32c_append(self.state, buf);
            }
            ByteBufferView::Fragments(parts) => {
                let total: usize = parts.iter().map(|p| p.len()).sum();
                let mut bounce = Vec::with_capacity(total);
                for part in parts {
                    bounce.extend_from_slice(part);
                }
                self.state = crc32c::crc32c_append(self.state, &bounce);
            }
        }
    }

    pub fn value(&self) -> u64 {
        self.state as u64
    }

    pub fn reset(&mut self) {
        self.state = 0;
    }
}

/// One-shot helper used where keeping a live `ChecksumEngine` around would
/// be overkill (descriptor self-checksum, chunk checksum-boundary segments).
pub fn crc32c_of(buf: &[u8]) -> u32 {
    crc32c::crc32c(buf)
}
