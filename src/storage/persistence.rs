//! Chain persistence hook
//!
//! The ledger only needs two things from storage: the blocks saved last time
//! and a way to save the current ones. [`JsonFileStore`] keeps them in one
//! pretty-printed JSON file with rotating backups; [`MemoryStore`] keeps them
//! in memory.

use crate::core::block::Block;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

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

/// Where the ledger loads its chain from and saves it to
pub trait ChainStore: Send + Sync {
    /// Blocks saved last time, or `None` when nothing was ever saved
    fn load_chain(&self) -> Result<Option<Vec<Block>>, StorageError>;

    /// Replace the saved chain with `blocks`
    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chain_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".ledger_data"),
            chain_file: "chain.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// Chain storage in a JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    config: StorageConfig,
}

impl JsonFileStore {
    /// Create the store, creating the data directory if needed
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Store under `data_dir` with default file names
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(StorageConfig {
            data_dir: data_dir.into(),
            ..StorageConfig::default()
        })
    }

    fn chain_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.chain_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.chain_file, index))
    }

    /// Check if a saved chain exists
    pub fn exists(&self) -> bool {
        self.chain_path().exists()
    }

    /// Shift backups up by one, dropping the oldest
    fn rotate_backups(&self) -> Result<(), StorageError> {
        let Some(last) = self.config.max_backups.checked_sub(1) else {
            return Ok(());
        };

        let oldest = self.backup_path(last);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..last).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    fn read_blocks(path: &PathBuf) -> Result<Vec<Block>, StorageError> {
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Blocks from backup `index` (0 is the most recent)
    pub fn restore_backup(&self, index: usize) -> Result<Vec<Block>, StorageError> {
        let path = self.backup_path(index);
        if !path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                index
            )));
        }
        Self::read_blocks(&path)
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.chain_path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };

        Ok(StorageStats {
            file_size,
            backup_count: self.list_backups().len(),
            data_dir: self.config.data_dir.clone(),
        })
    }
}

impl ChainStore for JsonFileStore {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, StorageError> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(None);
        }
        let blocks = Self::read_blocks(&path)?;
        if blocks.is_empty() {
            return Err(StorageError::InvalidData("Stored chain is empty".to_string()));
        }
        Ok(Some(blocks))
    }

    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError> {
        let path = self.chain_path();

        if self.config.backup_enabled && path.exists() {
            self.rotate_backups()?;
            if self.config.max_backups > 0 {
                fs::copy(&path, self.backup_path(0))?;
            }
        }

        // Write to a temporary file, then rename over the old one
        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.chain_file));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, blocks)?;
        fs::rename(&temp_path, &path)?;

        Ok(())
    }
}

/// Storage statistics
#[derive(Debug)]
pub struct StorageStats {
    pub file_size: u64,
    pub backup_count: usize,
    pub data_dir: PathBuf,
}

/// In-memory chain storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Option<Vec<Block>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously saved blocks
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Mutex::new(Some(blocks)),
        }
    }

    /// Length of the saved chain, 0 if nothing was saved
    pub fn saved_len(&self) -> usize {
        self.blocks
            .lock()
            .map(|guard| guard.as_ref().map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl ChainStore for MemoryStore {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, StorageError> {
        self.blocks
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| StorageError::InvalidData("Store lock poisoned".to_string()))
    }

    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError> {
        let mut guard = self
            .blocks
            .lock()
            .map_err(|_| StorageError::InvalidData("Store lock poisoned".to_string()))?;
        *guard = Some(blocks.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blockchain::ConsensusParams;
    use crate::core::transaction::Transaction;
    use chrono::Utc;

    fn sample_chain(len: u64) -> Vec<Block> {
        let genesis = Block::genesis(&ConsensusParams::regtest());
        let mut blocks = vec![genesis];
        for index in 1..len {
            let previous = blocks[blocks.len() - 1].hash.clone();
            let now = Utc::now();
            blocks.push(Block::new(
                index,
                previous,
                vec![Transaction::reward("miner", 50, index, now)],
                ConsensusParams::regtest().initial_bits,
                now,
            ));
        }
        blocks
    }

    #[test]
    fn test_save_load_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(temp_dir.path()).unwrap();
        assert!(store.load_chain().unwrap().is_none());

        let blocks = sample_chain(3);
        store.save_chain(&blocks).unwrap();
        assert!(store.exists());
        assert_eq!(store.load_chain().unwrap(), Some(blocks));
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 3,
            ..Default::default()
        })
        .unwrap();

        for len in 1..=5 {
            store.save_chain(&sample_chain(len)).unwrap();
        }

        assert_eq!(store.list_backups(), vec![0, 1, 2]);
        // Most recent backup holds the chain saved just before the last one
        assert_eq!(store.restore_backup(0).unwrap().len(), 4);
        assert_eq!(store.stats().unwrap().backup_count, 3);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("chain.json"), b"not json").unwrap();
        assert!(matches!(
            store.load_chain(),
            Err(StorageError::SerializationError(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load_chain().unwrap().is_none());
        store.save_chain(&sample_chain(2)).unwrap();
        assert_eq!(store.saved_len(), 2);
    }
}
