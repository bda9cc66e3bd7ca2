//! Storage envelope: version tag, gzip compression and a content checksum.
//!
//! Layout: `b"SVZ"` | version (1 byte) | flags (1 byte) | blake3(payload) (32 bytes) | body.
//! The checksum always covers the uncompressed payload. Bytes without the magic
//! prefix are treated as legacy uncompressed blobs and returned unchanged.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

const MAGIC: &[u8; 3] = b"SVZ";
pub const FORMAT_VERSION: u8 = 1;
const FLAG_RAW: u8 = 0;
const FLAG_GZIP: u8 = 1;
const CHECKSUM_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 2 + CHECKSUM_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Gzip,
    Legacy,
}

#[derive(Debug, Clone)]
pub struct Codec {
    threshold: usize,
    level: Compression,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Codec {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: Compression::default(),
        }
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let checksum = blake3::hash(payload);

        let compressed = if payload.len() >= self.threshold {
            match self.gzip(payload) {
                Ok(body) if body.len() < payload.len() => Some(body),
                Ok(_) => None,
                Err(e) => {
                    warn!("Compression failed, storing uncompressed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (flag, body) = match &compressed {
            Some(body) => (FLAG_GZIP, body.as_slice()),
            None => (FLAG_RAW, payload),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(flag);
        out.extend_from_slice(checksum.as_bytes());
        out.extend_from_slice(body);

        if flag == FLAG_GZIP {
            debug!("Compressed {} -> {} bytes", payload.len(), out.len());
        }
        out
    }

    /// Decode an envelope. `key` only labels integrity errors.
    pub fn decode(&self, key: &str, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(self.decode_with_encoding(key, stored)?.0)
    }

    pub fn decode_with_encoding(&self, key: &str, stored: &[u8]) -> Result<(Vec<u8>, Encoding)> {
        if !stored.starts_with(MAGIC) {
            return Ok((stored.to_vec(), Encoding::Legacy));
        }
        if stored.len() < HEADER_LEN {
            return Err(StorageError::integrity(key, "truncated envelope header"));
        }

        let version = stored[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(StorageError::integrity(
                key,
                format!("unsupported envelope version {}", version),
            ));
        }

        let flag = stored[MAGIC.len() + 1];
        let expected = &stored[MAGIC.len() + 2..HEADER_LEN];
        let body = &stored[HEADER_LEN..];

        let (payload, encoding) = match flag {
            FLAG_RAW => (body.to_vec(), Encoding::Raw),
            FLAG_GZIP => {
                let mut decoder = GzDecoder::new(body);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| StorageError::integrity(key, format!("gzip stream corrupt: {}", e)))?;
                (out, Encoding::Gzip)
            }
            other => {
                return Err(StorageError::integrity(key, format!("unknown flag {}", other)));
            }
        };

        if blake3::hash(&payload).as_bytes() != expected {
            return Err(StorageError::integrity(key, "checksum mismatch"));
        }
        Ok((payload, encoding))
    }

    pub fn encode_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(self.encode(&serde_json::to_vec(value)?))
    }

    pub fn decode_json<T: DeserializeOwned>(&self, key: &str, stored: &[u8]) -> Result<T> {
        let payload = self.decode(key, stored)?;
        serde_json::from_slice(&payload)
            .map_err(|e| StorageError::integrity(key, format!("corrupt JSON: {}", e)))
    }

    pub fn compress_str(&self, text: &str) -> Vec<u8> {
        self.encode(text.as_bytes())
    }

    pub fn decompress_str(&self, key: &str, stored: &[u8]) -> Result<String> {
        let payload = self.decode(key, stored)?;
        String::from_utf8(payload).map_err(|e| StorageError::integrity(key, format!("invalid UTF-8: {}", e)))
    }

    fn gzip(&self, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), self.level);
        encoder.write_all(payload)?;
        encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_and_unicode_strings() {
        let codec = Codec::new(0);
        for text in ["", "héllo wörld", "日本語のテキスト 🎉🚀", "a"] {
            let stored = codec.compress_str(text);
            assert_eq!(codec.decompress_str("t", &stored).unwrap(), text);
        }
    }

    #[test]
    fn test_repetitive_json_shrinks() {
        let codec = Codec::default();
        let items: Vec<_> = (0..200)
            .map(|i| serde_json::json!({"id": i, "kind": "screenshot", "status": "analyzed"}))
            .collect();
        let json = serde_json::to_vec(&items).unwrap();
        assert!(json.len() > 4096);

        let stored = codec.encode(&json);
        assert!(stored.len() < json.len() / 2);
        let (decoded, encoding) = codec.decode_with_encoding("t", &stored).unwrap();
        assert_eq!(decoded, json);
        assert_eq!(encoding, Encoding::Gzip);
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let codec = Codec::new(1024);
        let stored = codec.encode(b"{\"a\":1}");
        let (_, encoding) = codec.decode_with_encoding("t", &stored).unwrap();
        assert_eq!(encoding, Encoding::Raw);
    }

    #[test]
    fn test_legacy_bytes_pass_through() {
        let codec = Codec::default();
        let (decoded, encoding) = codec.decode_with_encoding("t", b"[1,2,3]").unwrap();
        assert_eq!(decoded, b"[1,2,3]");
        assert_eq!(encoding, Encoding::Legacy);
    }

    #[test]
    fn test_checksum_mismatch_is_integrity_error() {
        let codec = Codec::new(0);
        let mut stored = codec.encode(b"important data that must not change");
        let last = stored.len() - 1;
        stored[last] ^= 0xff;

        match codec.decode("sessions/s1/metadata", &stored) {
            Err(StorageError::Integrity { key, .. }) => assert_eq!(key, "sessions/s1/metadata"),
            other => panic!("Expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header_is_integrity_error() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode("k", b"SVZ\x01"),
            Err(StorageError::Integrity { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(text in ".*") {
            let codec = Codec::new(16);
            let stored = codec.compress_str(&text);
            prop_assert_eq!(codec.decompress_str("p", &stored).unwrap(), text);
        }
    }
}
