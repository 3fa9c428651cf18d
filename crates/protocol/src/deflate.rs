//! Streaming per-message deflate with reconnect-safe state.
//!
//! Framed sockets compress each outbound message with raw deflate and a
//! sync flush, stripping the trailing `00 00 FF FF` empty-block marker; the
//! receiving side re-appends the marker before inflating. Compression state
//! carries across messages, so back-references may point into earlier
//! messages' bytes.
//!
//! That sliding window is exactly what breaks on reconnect: a fresh
//! decompressor cannot resolve references into bytes it never saw. The
//! [`MessageInflater`] therefore records every raw byte it is fed
//! (message bodies and re-appended trailers alike) and can be seeded with a
//! predecessor's record, replaying the history to rebuild the window while
//! discarding the replayed output. The record is cumulative and never
//! compacted, so a seeded inflater's record remains valid seed material for
//! the next successor.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::Result;

/// Empty-block marker emitted by a deflate sync flush.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Output buffer growth step for the compress/decompress loops.
const OUTPUT_CHUNK: usize = 4096;

/// Compresses outbound messages with a persistent deflate window.
#[derive(Debug)]
pub struct MessageDeflater {
    inner: Compress,
}

impl MessageDeflater {
    /// Create a deflater with an empty window. `false` selects raw deflate,
    /// no zlib header.
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Compress one message, sync-flushed, with the trailing `00 00 FF FF`
    /// stripped.
    pub fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2 + OUTPUT_CHUNK);
        let mut consumed = 0usize;

        loop {
            let before_in = self.inner.total_in();
            self.inner
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)?;
            consumed += (self.inner.total_in() - before_in) as usize;

            // Spare capacity left means the flush ran to completion
            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
            output.reserve(OUTPUT_CHUNK);
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(output)
    }
}

impl Default for MessageDeflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Decompresses inbound messages, recording its complete input history.
#[derive(Debug)]
pub struct MessageInflater {
    inner: Decompress,
    recorded: Vec<u8>,
}

impl MessageInflater {
    /// Create an inflater with an empty window and empty record.
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
            recorded: Vec::new(),
        }
    }

    /// Create an inflater whose window is rebuilt from a predecessor's
    /// record. The replayed output is discarded; the seed becomes the head
    /// of this inflater's own record.
    pub fn with_seed(seed: &[u8]) -> Result<Self> {
        let mut inflater = Self::new();
        if !seed.is_empty() {
            // Seed bytes already contain their trailers; feed them verbatim
            inflater.run(seed)?;
            inflater.recorded.extend_from_slice(seed);
        }
        Ok(inflater)
    }

    /// Decompress one message body (trailer stripped by the sender),
    /// appending the body plus its re-appended trailer to the record.
    pub fn inflate(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(body.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(body);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let output = self.run(&input)?;
        self.recorded.extend_from_slice(&input);
        Ok(output)
    }

    /// Every raw byte fed to this inflater so far, seed included. Valid
    /// seed material for a successor.
    pub fn recorded(&self) -> &[u8] {
        &self.recorded
    }

    fn run(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() * 2 + OUTPUT_CHUNK);
        let mut consumed = 0usize;

        loop {
            let before_in = self.inner.total_in();
            self.inner
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)?;
            consumed += (self.inner.total_in() - before_in) as usize;

            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
            output.reserve(OUTPUT_CHUNK);
        }
        Ok(output)
    }
}

impl Default for MessageInflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &[u8] = b"the quick brown fox jumps over the lazy dog; \
        the quick brown fox jumps over the lazy dog again and again";

    #[test]
    fn test_deflate_inflate_roundtrip() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new();

        let compressed = deflater.deflate(PHRASE).unwrap();
        let restored = inflater.inflate(&compressed).unwrap();
        assert_eq!(restored, PHRASE);
    }

    #[test]
    fn test_deflate_strips_trailer() {
        let mut deflater = MessageDeflater::new();
        let compressed = deflater.deflate(PHRASE).unwrap();
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));
    }

    #[test]
    fn test_empty_message_roundtrip() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new();

        let compressed = deflater.deflate(b"").unwrap();
        let restored = inflater.inflate(&compressed).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_window_carries_across_messages() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new();

        let first = deflater.deflate(PHRASE).unwrap();
        let second = deflater.deflate(PHRASE).unwrap();

        // The second copy back-references the first through the window
        assert!(second.len() < first.len());

        assert_eq!(inflater.inflate(&first).unwrap(), PHRASE);
        assert_eq!(inflater.inflate(&second).unwrap(), PHRASE);
    }

    #[test]
    fn test_inflater_records_all_input() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new();

        let c1 = deflater.deflate(b"first message").unwrap();
        let c2 = deflater.deflate(b"second message").unwrap();
        inflater.inflate(&c1).unwrap();
        inflater.inflate(&c2).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&c1);
        expected.extend_from_slice(&DEFLATE_TRAILER);
        expected.extend_from_slice(&c2);
        expected.extend_from_slice(&DEFLATE_TRAILER);
        assert_eq!(inflater.recorded(), &expected[..]);
    }

    #[test]
    fn test_seeded_inflater_continues_stream() {
        // One uninterrupted compressor; the decompressor side swaps
        // mid-stream and must keep producing identical output.
        let mut deflater = MessageDeflater::new();
        let messages: Vec<&[u8]> = vec![
            PHRASE,
            b"the quick brown fox prefers deflate",
            b"the lazy dog prefers deflate too",
            b"jumps over the lazy dog one last time",
        ];
        let compressed: Vec<Vec<u8>> = messages
            .iter()
            .map(|m| deflater.deflate(m).unwrap())
            .collect();

        let mut first_socket = MessageInflater::new();
        assert_eq!(first_socket.inflate(&compressed[0]).unwrap(), messages[0]);
        assert_eq!(first_socket.inflate(&compressed[1]).unwrap(), messages[1]);

        // Successor seeded with everything the first socket consumed
        let mut second_socket = MessageInflater::with_seed(first_socket.recorded()).unwrap();
        assert_eq!(second_socket.inflate(&compressed[2]).unwrap(), messages[2]);
        assert_eq!(second_socket.inflate(&compressed[3]).unwrap(), messages[3]);
    }

    #[test]
    fn test_seed_becomes_head_of_record() {
        let mut deflater = MessageDeflater::new();
        let c1 = deflater.deflate(PHRASE).unwrap();

        let mut first = MessageInflater::new();
        first.inflate(&c1).unwrap();
        let seed = first.recorded().to_vec();

        let c2 = deflater.deflate(b"carried forward").unwrap();
        let mut second = MessageInflater::with_seed(&seed).unwrap();
        second.inflate(&c2).unwrap();

        // A chained reconnect needs the full history, so the record
        // starts with the seed
        assert!(second.recorded().starts_with(&seed));
        assert!(second.recorded().len() > seed.len());
    }

    #[test]
    fn test_unseeded_successor_cannot_resolve_references() {
        let mut deflater = MessageDeflater::new();
        let _warmup = deflater.deflate(PHRASE).unwrap();
        // Back-references into the warmup bytes
        let dependent = deflater.deflate(PHRASE).unwrap();

        let mut fresh = MessageInflater::new();
        let result = fresh.inflate(&dependent);
        // Either an outright error or wrong output; never the original
        match result {
            Ok(bytes) => assert_ne!(bytes, PHRASE),
            Err(_) => {}
        }
    }

    #[test]
    fn test_corrupt_stream_errors() {
        let mut inflater = MessageInflater::new();
        let result = inflater.inflate(&[0xFF; 16]);
        assert!(result.is_err());
    }
}
