//! Chunk store: opaque file chunks held on behalf of other nodes

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::protocol::{ChunkData, ChunkStored, RequestChunk, StoreChunk};
use crate::store::{get_json, put_json, StorageBackend, StorageError};

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Chunk data is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Chunk not found")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub file_id: String,
    pub size: usize,
    pub stored_at: u64,
    pub node_id: String,
}

pub struct ChunkStore<B> {
    backend: B,
    node_id: String,
}

fn data_key(file_id: &str, chunk_id: &str) -> String {
    format!("chunk:{}/{}", file_id, chunk_id)
}

fn meta_key(file_id: &str, chunk_id: &str) -> String {
    format!("chunkmeta:{}/{}", file_id, chunk_id)
}

impl<B: StorageBackend> ChunkStore<B> {
    pub fn new(backend: B, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            node_id: node_id.into(),
        }
    }

    /// Decode and store one chunk, returning its size in bytes
    pub fn store(&self, file_id: &str, chunk_id: &str, data: &str) -> Result<usize, ChunkError> {
        let bytes = STANDARD.decode(data)?;
        self.backend
            .put(data_key(file_id, chunk_id).as_bytes(), &bytes)?;
        let meta = ChunkMeta {
            chunk_id: chunk_id.to_string(),
            file_id: file_id.to_string(),
            size: bytes.len(),
            stored_at: crate::now_ms(),
            node_id: self.node_id.clone(),
        };
        put_json(&self.backend, &meta_key(file_id, chunk_id), &meta)?;
        self.backend.flush()?;
        Ok(bytes.len())
    }

    /// Load one chunk as base64
    pub fn load(&self, file_id: &str, chunk_id: &str) -> Result<String, ChunkError> {
        let bytes = self
            .backend
            .get(data_key(file_id, chunk_id).as_bytes())?
            .ok_or(ChunkError::NotFound)?;
        Ok(STANDARD.encode(bytes))
    }

    pub fn meta(&self, file_id: &str, chunk_id: &str) -> Result<Option<ChunkMeta>, ChunkError> {
        Ok(get_json(&self.backend, &meta_key(file_id, chunk_id))?)
    }

    /// Answer a `STORE_CHUNK`
    pub fn handle_store(&self, request: StoreChunk) -> ChunkStored {
        let result = self.store(&request.file_id, &request.chunk_id, &request.data);
        let (success, error) = match result {
            Ok(size) => {
                info!(
                    "Stored chunk {}/{} ({} bytes)",
                    request.file_id, request.chunk_id, size
                );
                (true, None)
            }
            Err(e) => {
                warn!(
                    "Failed to store chunk {}/{}: {}",
                    request.file_id, request.chunk_id, e
                );
                (false, Some(e.to_string()))
            }
        };
        ChunkStored {
            to: request.from.unwrap_or_default(),
            node_id: self.node_id.clone(),
            file_id: request.file_id,
            chunk_id: request.chunk_id,
            success,
            error,
        }
    }

    /// Answer a `REQUEST_CHUNK`
    pub fn handle_request(&self, request: RequestChunk) -> ChunkData {
        let (data, error) = match self.load(&request.file_id, &request.chunk_id) {
            Ok(data) => (Some(data), None),
            Err(e) => {
                warn!(
                    "Failed to load chunk {}/{}: {}",
                    request.file_id, request.chunk_id, e
                );
                (None, Some(e.to_string()))
            }
        };
        ChunkData {
            to: request.from.unwrap_or_default(),
            node_id: self.node_id.clone(),
            file_id: request.file_id,
            chunk_id: request.chunk_id,
            request_id: request.request_id,
            success: data.is_some(),
            data,
            error,
        }
    }
}
