//! Bounded Output Capture
//!
//! stdout and stderr are interleaved into one buffer in arrival order. Once
//! the byte limit is reached further output is counted and discarded, so a
//! noisy command can never grow memory beyond the configured cap.

use std::fmt::Write as _;

/// Default output cap (1 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Combined, size-bounded output buffer
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    omitted: usize,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            omitted: 0,
        }
    }

    /// Append a chunk, keeping only what fits under the limit
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.omitted += chunk.len() - take;
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes dropped because the limit was reached
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    /// Render the captured bytes as text, appending the truncation marker
    /// when output was dropped. Invalid UTF-8 is replaced lossily.
    pub fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.omitted > 0 {
            let _ = write!(
                text,
                "\n...[output truncated: {} bytes omitted]\n",
                self.omitted
            );
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_under_limit_kept_verbatim() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push(b"hello\n");
        assert_eq!(buffer.render(), "hello\n");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_exact_limit_not_truncated() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(b"hello");
        assert_eq!(buffer.render(), "hello");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_over_limit_truncated_with_marker() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(b"hello");
        buffer.push(b" world");

        assert!(buffer.is_truncated());
        assert_eq!(buffer.omitted(), 6);
        assert_eq!(
            buffer.render(),
            "hello\n...[output truncated: 6 bytes omitted]\n"
        );
    }

    #[test]
    fn test_zero_limit_drops_everything() {
        let mut buffer = OutputBuffer::new(0);
        buffer.push(b"abc");
        assert!(buffer.is_empty());
        assert_eq!(buffer.omitted(), 3);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push(&[0x66, 0x6f, 0xff, 0x6f]);
        assert_eq!(buffer.render(), "fo\u{fffd}o");
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_limit(
            limit in 0usize..4096,
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..1024), 0..32)
        ) {
            let mut buffer = OutputBuffer::new(limit);
            let total: usize = chunks.iter().map(|c| c.len()).sum();
            for chunk in &chunks {
                buffer.push(chunk);
            }

            prop_assert!(buffer.len() <= limit);
            prop_assert_eq!(buffer.len() + buffer.omitted(), total);
            prop_assert_eq!(buffer.is_truncated(), total > limit);
        }
    }
}
