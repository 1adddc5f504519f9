//! Packet storage and state persistence

pub mod cache;
pub mod persistence;

pub use cache::{Cache, DEFAULT_CACHE_SIZE};
pub use persistence::{
    load_from_file, save_to_file, PersistedState, Storage, StorageConfig, StorageError,
};
