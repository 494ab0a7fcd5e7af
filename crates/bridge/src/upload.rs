//! Chunked transfer of the engine image.
//!
//! The sender base64-encodes the image and cuts the text into bounded
//! chunks; the receiver stores chunks by index and hands back the joined
//! text once every slot is filled. Reassembly keys on `index`, never on
//! arrival order.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::error::BridgeError;
use crate::protocol::{UploadAck, UploadChunk};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

pub fn encode_image(image: &[u8]) -> String {
    STANDARD.encode(image)
}

pub fn decode_image(encoded: &str) -> Result<Vec<u8>, BridgeError> {
    STANDARD
        .decode(encoded)
        .map_err(|err| BridgeError::protocol(format!("engine image is not valid base64: {err}")))
}

/// Splits `encoded` into chunks of `chunk_size` bytes, widened to the next
/// char boundary for non-ASCII input. Always yields at least one chunk so
/// an empty image still completes an upload.
pub fn split_chunks(encoded: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    if encoded.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::with_capacity(encoded.len().div_ceil(chunk_size));
    let mut start = 0;
    while start < encoded.len() {
        let mut end = (start + chunk_size).min(encoded.len());
        while !encoded.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(&encoded[start..end]);
        start = end;
    }
    chunks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadProgress {
    Partial { received: usize, total: usize },
    Complete(String),
}

impl UploadProgress {
    pub fn ack(&self) -> UploadAck {
        match self {
            Self::Partial { received, total } => UploadAck {
                done: false,
                received: Some(*received),
                total: Some(*total),
            },
            Self::Complete(_) => UploadAck {
                done: true,
                received: None,
                total: None,
            },
        }
    }

    pub fn ack_value(&self) -> Value {
        serde_json::to_value(self.ack()).unwrap_or(Value::Null)
    }
}

/// Chunks are kept sparsely by index: `total` comes off the wire and only
/// the chunks that actually arrived take memory.
#[derive(Debug)]
struct UploadSession {
    total: usize,
    chunks: BTreeMap<usize, String>,
}

impl UploadSession {
    fn new(total: usize) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
        }
    }

    fn received(&self) -> usize {
        self.chunks.len()
    }

    fn join(self) -> String {
        self.chunks.into_values().collect()
    }
}

#[derive(Debug, Default)]
pub struct UploadAssembler {
    sessions: HashMap<String, UploadSession>,
}

impl UploadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, chunk: UploadChunk) -> Result<UploadProgress, BridgeError> {
        let UploadChunk {
            upload_id,
            index,
            total,
            chunk,
        } = chunk;
        if total == 0 {
            return Err(BridgeError::protocol(format!(
                "upload {upload_id} declared zero chunks"
            )));
        }
        if index >= total {
            return Err(BridgeError::protocol(format!(
                "upload {upload_id} chunk index {index} out of range for total {total}"
            )));
        }

        let session = self
            .sessions
            .entry(upload_id.clone())
            .or_insert_with(|| UploadSession::new(total));
        if session.total != total {
            return Err(BridgeError::protocol(format!(
                "upload {upload_id} total mismatch: expected {}, got {total}",
                session.total
            )));
        }

        session.chunks.insert(index, chunk);
        if session.received() < session.total {
            return Ok(UploadProgress::Partial {
                received: session.received(),
                total: session.total,
            });
        }

        let payload = match self.sessions.remove(&upload_id) {
            Some(session) => session.join(),
            None => String::new(),
        };
        tracing::debug!(upload_id = %upload_id, total, bytes = payload.len(), "upload reassembled");
        Ok(UploadProgress::Complete(payload))
    }

    pub fn in_progress(&self) -> usize {
        self.sessions.len()
    }

    pub fn received(&self, upload_id: &str) -> Option<usize> {
        self.sessions.get(upload_id).map(UploadSession::received)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(upload_id: &str, index: usize, total: usize, text: &str) -> UploadChunk {
        UploadChunk {
            upload_id: upload_id.to_owned(),
            index,
            total,
            chunk: text.to_owned(),
        }
    }

    #[test]
    fn reassembles_by_index_not_arrival() {
        let mut assembler = UploadAssembler::new();
        assert_eq!(
            assembler.accept(chunk("u", 2, 3, "C")).unwrap(),
            UploadProgress::Partial { received: 1, total: 3 }
        );
        assert_eq!(
            assembler.accept(chunk("u", 0, 3, "A")).unwrap(),
            UploadProgress::Partial { received: 2, total: 3 }
        );
        assert_eq!(
            assembler.accept(chunk("u", 1, 3, "B")).unwrap(),
            UploadProgress::Complete("ABC".to_owned())
        );
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn every_arrival_order_yields_the_same_payload() {
        let parts = ["w", "x", "y", "z"];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders {
            let mut assembler = UploadAssembler::new();
            let mut last = None;
            for index in order {
                last = Some(assembler.accept(chunk("p", index, 4, parts[index])).unwrap());
            }
            assert_eq!(last, Some(UploadProgress::Complete("wxyz".to_owned())));
        }
    }

    #[test]
    fn overwrite_does_not_double_count() {
        let mut assembler = UploadAssembler::new();
        assembler.accept(chunk("u", 0, 2, "old")).unwrap();
        let progress = assembler.accept(chunk("u", 0, 2, "new")).unwrap();
        assert_eq!(progress, UploadProgress::Partial { received: 1, total: 2 });
        let progress = assembler.accept(chunk("u", 1, 2, "!")).unwrap();
        assert_eq!(progress, UploadProgress::Complete("new!".to_owned()));
    }

    #[test]
    fn total_mismatch_leaves_first_session_untouched() {
        let mut assembler = UploadAssembler::new();
        assembler.accept(chunk("u", 0, 3, "A")).unwrap();
        let err = assembler.accept(chunk("u", 1, 4, "B")).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert_eq!(assembler.received("u"), Some(1));

        assembler.accept(chunk("u", 1, 3, "B")).unwrap();
        assert_eq!(
            assembler.accept(chunk("u", 2, 3, "C")).unwrap(),
            UploadProgress::Complete("ABC".to_owned())
        );
    }

    #[test]
    fn rejects_out_of_range_and_empty_totals() {
        let mut assembler = UploadAssembler::new();
        assert!(assembler.accept(chunk("u", 0, 0, "")).is_err());
        assert!(assembler.accept(chunk("u", 3, 3, "")).is_err());
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn huge_declared_total_only_holds_received_chunks() {
        let mut assembler = UploadAssembler::new();
        assert_eq!(
            assembler.accept(chunk("big", 0, usize::MAX, "A")).unwrap(),
            UploadProgress::Partial { received: 1, total: usize::MAX }
        );
        assert_eq!(
            assembler.accept(chunk("big", usize::MAX - 1, usize::MAX, "Z")).unwrap(),
            UploadProgress::Partial { received: 2, total: usize::MAX }
        );
        assert!(matches!(
            assembler.accept(chunk("big", usize::MAX, usize::MAX, "")),
            Err(BridgeError::Protocol(_))
        ));
        assert_eq!(assembler.received("big"), Some(2));
    }

    #[test]
    fn split_and_join_reproduce_the_image() {
        let image: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let encoded = encode_image(&image);
        let chunks = split_chunks(&encoded, 1024);
        assert_eq!(chunks.len(), encoded.len().div_ceil(1024));
        assert!(chunks.iter().all(|chunk| chunk.len() <= 1024));
        assert_eq!(decode_image(&chunks.concat()).unwrap(), image);
        assert_eq!(split_chunks("", 1024), vec![""]);
    }

    #[test]
    fn ack_shape_matches_progress() {
        let partial = UploadProgress::Partial { received: 1, total: 2 };
        assert_eq!(
            partial.ack_value(),
            serde_json::json!({"done": false, "received": 1, "total": 2})
        );
        let done = UploadProgress::Complete(String::new());
        assert_eq!(done.ack_value(), serde_json::json!({"done": true}));
    }
}
