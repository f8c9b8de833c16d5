//! Length-prefixed framing for byte-stream transports.
//!
//! When message boundaries are required over a protocol that only offers a
//! byte stream, each message is sent as a 32-bit big-endian length followed
//! by the payload, and reassembled from arbitrarily-sized read chunks on the
//! receive side. Message-oriented transports never pass through here.

use crate::defaults;
use tracing::warn;

/// Prefix a payload with its 32-bit big-endian length.
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(defaults::FRAME_HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Incremental reassembler for length-prefixed frames.
///
/// Feed raw chunks in arrival order with [`push`](Self::push); drain
/// complete messages with [`next_frame`](Self::next_frame). Partial headers
/// and partial payloads are buffered across chunks.
#[derive(Debug, Default)]
pub(crate) struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler { buffer: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < defaults::FRAME_HEADER_LEN {
            return None;
        }
        let mut header = [0u8; defaults::FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..defaults::FRAME_HEADER_LEN]);
        let length = u32::from_be_bytes(header) as usize;

        if length > defaults::MAX_FRAME_PAYLOAD {
            // A peer announcing an absurd length is framing corruption;
            // there is no way to resynchronize a length-prefixed stream.
            warn!("dropping stream with oversized frame header ({} bytes)", length);
            self.buffer.clear();
            return None;
        }

        let total = defaults::FRAME_HEADER_LEN + length;
        if self.buffer.len() < total {
            return None;
        }

        let payload = self.buffer[defaults::FRAME_HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(assembler: &mut FrameAssembler) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = assembler.next_frame() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn encode_prepends_big_endian_length() {
        let framed = encode_frame(b"abc");
        assert_eq!(framed, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn round_trips_three_messages_in_one_chunk() {
        let mut wire = Vec::new();
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            wire.extend_from_slice(&encode_frame(payload));
        }

        let mut assembler = FrameAssembler::new();
        assembler.push(&wire);

        assert_eq!(drain(&mut assembler), vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn reassembles_across_arbitrary_chunk_boundaries() {
        let mut wire = Vec::new();
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            wire.extend_from_slice(&encode_frame(payload));
        }

        // Feed one byte at a time: headers and payloads both split.
        let mut assembler = FrameAssembler::new();
        let mut received = Vec::new();
        for byte in wire {
            assembler.push(&[byte]);
            received.extend(drain(&mut assembler));
        }

        assert_eq!(received, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn empty_payload_frames_are_delivered() {
        let mut assembler = FrameAssembler::new();
        assembler.push(&encode_frame(b""));
        assert_eq!(assembler.next_frame(), Some(Vec::new()));
        assert_eq!(assembler.next_frame(), None);
    }

    #[test]
    fn oversized_header_clears_the_stream() {
        let mut assembler = FrameAssembler::new();
        assembler.push(&u32::MAX.to_be_bytes());
        assembler.push(b"garbage");
        assert_eq!(assembler.next_frame(), None);
        // Subsequent well-formed frames on a fresh buffer still parse.
        assembler.push(&encode_frame(b"ok"));
        assert_eq!(assembler.next_frame(), Some(b"ok".to_vec()));
    }
}
