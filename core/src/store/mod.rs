// Store module: key-value backends for sessions and chunks

pub mod backend;

pub use backend::{get_json, put_json, MemoryStorage, SledStorage, StorageBackend, StorageError};
