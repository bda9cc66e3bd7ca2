//! Typed reads and writes through the storage envelope.
//!
//! Reads that fail the integrity check fall back to the backend's newest backup.
//! A value with no usable backup is logged and reported as not found.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use super::{StorageBackend, WriteOp};
use crate::compression::Codec;
use crate::error::{Result, StorageError};

#[derive(Clone)]
pub struct BlobIo {
    backend: Arc<dyn StorageBackend>,
    codec: Codec,
}

impl BlobIo {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: Codec) -> Self {
        Self { backend, codec }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn put_json<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<WriteOp> {
        Ok(WriteOp::put(key, self.codec.encode_json(value)?))
    }

    pub fn put_bytes(&self, key: impl Into<String>, payload: &[u8]) -> WriteOp {
        WriteOp::put(key, self.codec.encode(payload))
    }

    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(stored) = self.backend.load(key).await? else {
            return Ok(None);
        };
        match self.codec.decode_json(key, &stored) {
            Ok(value) => Ok(Some(value)),
            Err(err @ StorageError::Integrity { .. }) => {
                let Some(backup) = self.load_backup_payload(key, &err).await? else {
                    return Ok(None);
                };
                match serde_json::from_slice(&backup) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        error!("Backup of {} is corrupt too: {}", key, e);
                        Ok(None)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.backend.load(key).await? else {
            return Ok(None);
        };
        match self.codec.decode(key, &stored) {
            Ok(payload) => Ok(Some(payload)),
            Err(err @ StorageError::Integrity { .. }) => self.load_backup_payload(key, &err).await,
            Err(e) => Err(e),
        }
    }

    async fn load_backup_payload(&self, key: &str, original: &StorageError) -> Result<Option<Vec<u8>>> {
        warn!("{}. Trying backup.", original);
        let recovered = match self.backend.load_backup(key).await? {
            Some(stored) => self.codec.decode(key, &stored).ok(),
            None => None,
        };
        match recovered {
            Some(payload) => {
                warn!("Recovered {} from backup", key);
                Ok(Some(payload))
            }
            None => {
                error!("No usable backup for {}, treating it as missing", key);
                Ok(None)
            }
        }
    }
}
