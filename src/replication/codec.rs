//! Payload Codec
//!
//! Entity batches travel as bincode with a one byte header recording
//! whether the body is lz4 compressed. Decoding honours the header, so
//! nodes with different compression settings interoperate.

use serde::de::DeserializeOwned;
use serde::Serialize;

const FLAG_PLAIN: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Bytes of framing around the items of an encoded batch: flag + vec length.
const BATCH_OVERHEAD: u64 = 1 + 8;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,
    #[error("unknown payload flag {0}")]
    UnknownFlag(u8),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec {
    compression: bool,
}

impl PayloadCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn encode<E: Serialize>(&self, batch: &[E]) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serialize(batch)?;

        if self.compression {
            let compressed = lz4_flex::compress_prepend_size(&body);
            // Incompressible input can grow; never send more than the plain form.
            if compressed.len() < body.len() {
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(FLAG_LZ4);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(FLAG_PLAIN);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode<E: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Vec<E>, CodecError> {
        let (flag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        match *flag {
            FLAG_PLAIN => Ok(bincode::deserialize(body)?),
            FLAG_LZ4 => {
                let plain = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| CodecError::Decompress(e.to_string()))?;
                Ok(bincode::deserialize(&plain)?)
            }
            other => Err(CodecError::UnknownFlag(other)),
        }
    }
}

/// Longest prefix of `items` whose encoded batch fits in `budget` bytes.
///
/// Records too large to fit even on their own are skipped rather than
/// stalling the round; they still travel through immediate gossip and
/// full sync.
pub fn take_within_budget<E: Serialize>(items: Vec<E>, budget: usize) -> Vec<E> {
    let budget = budget as u64;
    let mut total = BATCH_OVERHEAD;
    let mut batch = Vec::new();

    for item in items {
        let size = match bincode::serialized_size(&item) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!("skipping unsizeable record in gossip round: {}", e);
                continue;
            }
        };

        if BATCH_OVERHEAD + size > budget {
            tracing::debug!("record of {} bytes exceeds gossip budget {}", size, budget);
            continue;
        }
        if total + size > budget {
            break;
        }

        total += size;
        batch.push(item);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        body: String,
    }

    fn records(n: usize, body_len: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record { id: format!("r{}", i), body: "x".repeat(body_len) })
            .collect()
    }

    #[test]
    fn test_plain_codec() {
        let codec = PayloadCodec::new(false);
        let batch = records(3, 10);
        let bytes = codec.encode(&batch).unwrap();
        assert_eq!(bytes[0], FLAG_PLAIN);
        assert_eq!(codec.decode::<Record>(&bytes).unwrap(), batch);
    }

    #[test]
    fn test_compressed_codec_shrinks_repetitive_payloads() {
        let codec = PayloadCodec::new(true);
        let batch = records(50, 200);
        let bytes = codec.encode(&batch).unwrap();
        assert_eq!(bytes[0], FLAG_LZ4);
        assert!(bytes.len() < bincode::serialize(&batch).unwrap().len());
        // A node with compression disabled still reads it.
        assert_eq!(PayloadCodec::new(false).decode::<Record>(&bytes).unwrap(), batch);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = PayloadCodec::default();
        assert!(matches!(codec.decode::<Record>(&[]), Err(CodecError::Empty)));
        assert!(matches!(codec.decode::<Record>(&[7, 1, 2]), Err(CodecError::UnknownFlag(7))));
        assert!(codec.decode::<Record>(&[FLAG_PLAIN, 255, 255]).is_err());
    }

    #[test]
    fn test_budget_prefix_fits() {
        let items = records(100, 50);
        let budget = 1024;
        let batch = take_within_budget(items, budget);

        assert!(!batch.is_empty());
        assert!(batch.len() < 100);
        let encoded = PayloadCodec::new(false).encode(&batch).unwrap();
        assert!(encoded.len() <= budget);
        assert_eq!(batch[0].id, "r0");
    }

    #[test]
    fn test_budget_skips_oversized_records() {
        let mut items = vec![Record { id: "huge".into(), body: "x".repeat(10_000) }];
        items.extend(records(3, 5));
        let batch = take_within_budget(items, 512);

        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|r| r.id != "huge"));
    }

    #[test]
    fn test_budget_exact_fit() {
        let items = records(4, 10);
        let exact = PayloadCodec::new(false).encode(&items).unwrap().len();
        assert_eq!(take_within_budget(items.clone(), exact).len(), 4);
        assert_eq!(take_within_budget(items, exact - 1).len(), 3);
    }
}
