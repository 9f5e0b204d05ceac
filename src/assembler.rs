//! # Sentence Assembly
//!
//! Rebuilds newline-delimited NMEA sentences from a byte stream that arrives one or a
//! few bytes at a time from the serial receive path.
//!
//! ## Buffer Ownership
//!
//! The assembler owns exactly one fixed 128-byte line buffer and reuses it for every
//! sentence. When a newline completes a sentence, the handler is called synchronously
//! with a borrow of that buffer. The borrow ends when the handler returns and the buffer
//! is overwritten by the next line, so handlers must copy out anything they keep (the
//! borrow checker enforces this: [`SentenceHandler::on_sentence`] receives `&[u8]`).
//!
//! ## Overflow
//!
//! One slot is reserved for the terminator, so at most 127 bytes are kept per line.
//! Bytes beyond that are silently dropped until the next newline. The truncated line
//! is still handed to the handler, whose checksum check rejects it. Losing a malformed
//! sentence is preferred over ever blocking the receive path.

use heapless::Vec;
use tracing::trace;

/// Line buffer size, terminator slot included.
pub const NMEA_SIZE: usize = 128;

/// Longest sentence body kept; the last slot stays free for the terminator.
pub const MAX_SENTENCE_LEN: usize = NMEA_SIZE - 1;

/// Receives each completed sentence, on the receive path.
///
/// Implementations must be bounded-time and non-blocking.
pub trait SentenceHandler {
    fn on_sentence(&mut self, sentence: &[u8]);
}

impl<F> SentenceHandler for F
where
    F: FnMut(&[u8]),
{
    fn on_sentence(&mut self, sentence: &[u8]) {
        self(sentence)
    }
}

/// Byte counters, readable from outside the receive path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Sentences handed to the handler
    pub sentences: u64,
    /// Bytes discarded because the line buffer was full
    pub overflow_bytes: u64,
    /// Sentences that lost at least one byte to overflow
    pub truncated_sentences: u64,
}

/// Newline-delimited sentence assembler with a fixed line buffer.
pub struct SentenceAssembler<H> {
    buffer: Vec<u8, NMEA_SIZE>,
    truncated: bool,
    handler: H,
    stats: AssemblerStats,
}

impl<H: SentenceHandler> SentenceAssembler<H> {
    pub fn new(handler: H) -> Self {
        Self {
            buffer: Vec::new(),
            truncated: false,
            handler,
            stats: AssemblerStats::default(),
        }
    }

    /// Feed one received byte.
    pub fn feed_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            if !self.buffer.is_empty() {
                self.complete_line();
            }
            return;
        }

        if self.buffer.len() < MAX_SENTENCE_LEN {
            // Cannot fail: length was checked against a bound below capacity.
            let _ = self.buffer.push(byte);
        } else {
            self.stats.overflow_bytes += 1;
            self.truncated = true;
        }
    }

    /// Feed a burst of received bytes, as a FIFO drain would deliver them.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.feed_byte(byte);
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Bytes of the sentence currently being assembled.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn complete_line(&mut self) {
        if self.truncated {
            self.stats.truncated_sentences += 1;
            trace!(kept = self.buffer.len(), "sentence truncated by line buffer overflow");
        }
        self.stats.sentences += 1;
        self.handler.on_sentence(&self.buffer);
        self.buffer.clear();
        self.truncated = false;
    }
}
