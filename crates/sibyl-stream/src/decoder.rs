//! Incremental frame decoder for the producer's push stream.
//!
//! Frames are blank-line separated; the payload line carries a `data:`
//! marker followed by JSON. Chunks arrive with arbitrary boundaries, so the
//! decoder buffers the unconsumed tail and re-splits on every push. A frame
//! that fails to decode is logged and skipped; it never aborts the stream.

use tracing::{debug, warn};

use crate::event::StreamEvent;

const FRAME_SEPARATOR: &str = "\n\n";
const DATA_MARKER: &str = "data:";

/// Streaming frame decoder with an internal reassembly buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it unlocks, in order.
    ///
    /// The trailing partial frame (if any) stays buffered for the next
    /// push.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find(FRAME_SEPARATOR) {
            let frame: String = self.buffer.drain(..pos + FRAME_SEPARATOR.len()).collect();
            if let Some(event) = decode_frame(frame.trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes currently awaiting a frame separator.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Decode one complete frame; `None` means skip.
fn decode_frame(frame: &str) -> Option<StreamEvent> {
    let Some(payload) = frame.strip_prefix(DATA_MARKER) else {
        if !frame.is_empty() {
            debug!(frame, "Skipping frame without data marker");
        }
        return None;
    };

    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Skipping undecodable frame");
            return None;
        }
    };

    match StreamEvent::from_value(&value) {
        Some(event) => Some(event),
        None => {
            warn!("Skipping frame without event discriminant");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_complete_frame() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push("data: {\"event\":\"token\",\"data\":\"hi\"}\n\n");
        assert_eq!(events, vec![StreamEvent::Token("hi".to_string())]);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_frame_split_mid_json_is_reassembled() {
        let mut decoder = FrameDecoder::new();
        let first = decoder.push("data: {\"event\":\"to");
        assert!(first.is_empty());
        assert!(!decoder.pending().is_empty());

        let second = decoder.push("ken\",\"data\":\"hi\"}\n\n");
        assert_eq!(second, vec![StreamEvent::Token("hi".to_string())]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            "data: {\"event\":\"token\",\"data\":\"a\"}\n\ndata: {\"event\":\"token\",\"data\":\"b\"}\n\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("a".to_string()),
                StreamEvent::Token("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_frame_is_skipped_not_fatal() {
        let mut decoder = FrameDecoder::new();
        let events =
            decoder.push("data: {not json}\n\ndata: {\"event\":\"token\",\"data\":\"ok\"}\n\n");
        assert_eq!(events, vec![StreamEvent::Token("ok".to_string())]);
    }

    #[test]
    fn test_frame_without_marker_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let events =
            decoder.push(": keepalive\n\ndata: {\"event\":\"connected\"}\n\n");
        assert_eq!(events, vec![StreamEvent::Connected]);
    }

    #[test]
    fn test_empty_payload_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push("data: \n\ndata:\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_frame_missing_discriminant_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push("data: {\"data\":\"orphan\"}\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_chunk_boundary_inside_separator() {
        let mut decoder = FrameDecoder::new();
        let first = decoder.push("data: {\"event\":\"connected\"}\n");
        assert!(first.is_empty());
        let second = decoder.push("\n");
        assert_eq!(second, vec![StreamEvent::Connected]);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let frame = "data: {\"event\":\"token\",\"data\":\"drip\"}\n\n";
        let mut events = Vec::new();
        for ch in frame.chars() {
            events.extend(decoder.push(&ch.to_string()));
        }
        assert_eq!(events, vec![StreamEvent::Token("drip".to_string())]);
    }

    #[test]
    fn test_order_preserved_across_pushes() {
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        events.extend(decoder.push("data: {\"event\":\"status\",\"data\":\"s1\"}\n\ndata: {\"ev"));
        events.extend(decoder.push("ent\":\"status\",\"data\":\"s2\"}\n\n"));
        assert_eq!(
            events,
            vec![
                StreamEvent::Status("s1".to_string()),
                StreamEvent::Status("s2".to_string()),
            ]
        );
    }

    #[test]
    fn test_trailing_partial_stays_buffered() {
        let mut decoder = FrameDecoder::new();
        decoder.push("data: {\"event\":\"token\",\"data\":\"x\"}\n\ndata: {\"eve");
        assert_eq!(decoder.pending(), "data: {\"eve");
    }
}
