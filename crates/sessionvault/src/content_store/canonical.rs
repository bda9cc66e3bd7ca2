//! Canonical attachment bytes and their content hash.
//!
//! Base64 input is canonicalized before decoding: an optional `data:<mime>;base64,`
//! prefix and every ASCII whitespace byte are removed. The hash is BLAKE3 over the
//! decoded bytes, rendered as 64 lowercase hex characters.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPayload {
    Raw(Vec<u8>),
    Base64(String),
}

impl From<Vec<u8>> for AttachmentPayload {
    fn from(bytes: Vec<u8>) -> Self {
        AttachmentPayload::Raw(bytes)
    }
}

impl From<&[u8]> for AttachmentPayload {
    fn from(bytes: &[u8]) -> Self {
        AttachmentPayload::Raw(bytes.to_vec())
    }
}

impl From<&str> for AttachmentPayload {
    fn from(text: &str) -> Self {
        AttachmentPayload::Base64(text.to_string())
    }
}

impl From<String> for AttachmentPayload {
    fn from(text: String) -> Self {
        AttachmentPayload::Base64(text)
    }
}

/// Decoded payload plus the MIME type a data URL carried, if any.
#[derive(Debug, Clone)]
pub struct CanonicalPayload {
    pub bytes: Vec<u8>,
    pub data_url_mime: Option<String>,
}

impl AttachmentPayload {
    pub fn canonicalize(self) -> Result<CanonicalPayload> {
        match self {
            AttachmentPayload::Raw(bytes) => Ok(CanonicalPayload {
                bytes,
                data_url_mime: None,
            }),
            AttachmentPayload::Base64(text) => decode_base64(&text),
        }
    }
}

pub fn decode_base64(text: &str) -> Result<CanonicalPayload> {
    let (data_url_mime, body) = split_data_url(text.trim_start());
    let cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    if cleaned.is_empty() {
        return Err(StorageError::Decode("empty base64 payload".to_string()));
    }

    let bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(cleaned.as_bytes()).ok())
        .ok_or_else(|| {
            StorageError::Decode(format!(
                "payload is not valid base64 ({} characters)",
                cleaned.len()
            ))
        })?;

    Ok(CanonicalPayload { bytes, data_url_mime })
}

fn split_data_url(text: &str) -> (Option<String>, &str) {
    let Some(rest) = text.strip_prefix("data:") else {
        return (None, text);
    };
    match rest.split_once(',') {
        Some((header, body)) => {
            let mime = header
                .split(';')
                .next()
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            (mime, body)
        }
        None => (None, text),
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
