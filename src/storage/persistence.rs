//! Relay state persistence
//!
//! Saves and restores the engine state (configuration, cached packets in
//! insertion order and the unpublished set) as JSON, with atomic writes and
//! rotating backups.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Config;
use crate::network::packet::Packet;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Everything needed to reconstruct an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub config: Config,
    /// Cached packets as `(id, packet)` pairs in insertion order
    #[serde(default)]
    pub data: Vec<(String, Packet)>,
    /// Packet id -> cluster id, for packets not yet confirmed sent
    #[serde(default)]
    pub unpublished: HashMap<String, Option<String>>,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub state_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".relay_data"),
            state_file: "state.json".to_string(),
            backup_enabled: true,
            max_backups: 3,
        }
    }
}

/// Relay state storage manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    fn state_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.state_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.state_file, index))
    }

    /// Save the state to disk
    pub fn save(&self, state: &PersistedState) -> Result<(), StorageError> {
        let path = self.state_path();

        if self.config.backup_enabled && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // Write to temporary file first
        let temp_path = self.config.data_dir.join("state.tmp");
        save_to_file(state, &temp_path)?;
        fs::rename(&temp_path, &path)?;

        log::debug!("Saved {} cached packets to {}", state.data.len(), path.display());
        Ok(())
    }

    /// Load the state from disk
    pub fn load(&self) -> Result<PersistedState, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(StorageError::InvalidData("State file not found".to_string()));
        }
        load_from_file(&path)
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Load the state, falling back to the newest readable backup when the
    /// state file is corrupt
    pub fn load_or_recover(&self) -> Result<PersistedState, StorageError> {
        let error = match self.load() {
            Ok(state) => return Ok(state),
            Err(e) => e,
        };

        for index in self.list_backups() {
            match self.restore_backup(index) {
                Ok(state) => {
                    log::warn!("State file unreadable ({}), restored backup {}", error, index);
                    return Ok(state);
                }
                Err(e) => log::debug!("Backup {} unreadable: {}", index, e),
            }
        }
        Err(error)
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        if self.config.max_backups == 0 {
            return Ok(());
        }

        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// Restore from a backup
    pub fn restore_backup(&self, backup_index: usize) -> Result<PersistedState, StorageError> {
        let backup_path = self.backup_path(backup_index);
        if !backup_path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                backup_index
            )));
        }
        load_from_file(&backup_path)
    }

    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }
}

/// Save state to a specific file path
pub fn save_to_file(state: &PersistedState, path: &Path) -> Result<(), StorageError> {
    let file = fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, state)?;
    Ok(())
}

/// Load state from a specific file path
pub fn load_from_file(path: &Path) -> Result<PersistedState, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{Message, Payload};

    fn state() -> PersistedState {
        let packet = Packet::new(Message::Publish(Payload::Bytes(b"kept".to_vec()))).with_id("p1");
        let mut unpublished = HashMap::new();
        unpublished.insert("p1".to_string(), Some("cluster".to_string()));

        PersistedState {
            config: Config {
                port: 4000,
                cluster_id: Some("cluster".to_string()),
                ..Default::default()
            },
            data: vec![("p1".to_string(), packet)],
            unpublished,
        }
    }

    #[test]
    fn test_save_load_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        assert!(!storage.exists());
        assert!(matches!(storage.load(), Err(StorageError::InvalidData(_))));

        let state = state();
        storage.save(&state).unwrap();
        assert!(storage.exists());
        assert_eq!(storage.load().unwrap(), state);
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 2,
            ..Default::default()
        })
        .unwrap();

        let mut state = state();
        for port in 1..=4 {
            state.config.port = port;
            storage.save(&state).unwrap();
        }

        assert_eq!(storage.list_backups(), vec![0, 1]);
        assert_eq!(storage.restore_backup(0).unwrap().config.port, 3);
        assert_eq!(storage.restore_backup(1).unwrap().config.port, 2);
        assert!(storage.restore_backup(5).is_err());
    }

    #[test]
    fn test_corrupt_state_recovered_from_backup() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let mut state = state();
        storage.save(&state).unwrap();
        state.config.port = 4001;
        storage.save(&state).unwrap();
        assert_eq!(storage.load_or_recover().unwrap().config.port, 4001);

        fs::write(temp_dir.path().join("state.json"), b"{ truncated").unwrap();
        assert!(matches!(storage.load(), Err(StorageError::SerializationError(_))));
        assert_eq!(storage.load_or_recover().unwrap().config.port, 4000);

        // nothing readable left
        fs::write(temp_dir.path().join("state.json.backup.0"), b"not json").unwrap();
        assert!(storage.load_or_recover().is_err());
    }
}
