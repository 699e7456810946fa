//! Key-value piece storage addressed by `(file_id, piece_index)`.
//!
//! The transfer engine only reaches for a store on the assembly path; it must
//! keep working when none could be opened.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use skiff_shared::types::FileId;

use crate::database::Database;
use crate::error::{Result, StoreError};

pub trait PieceStore: Send + Sync {
    /// Store piece `piece_index` of `file_id`, replacing any previous bytes.
    fn put(&self, file_id: &FileId, piece_index: u32, data: &[u8]) -> Result<()>;

    /// Every stored piece of `file_id`, ordered by index.
    fn get_all_for_file(&self, file_id: &FileId) -> Result<Vec<(u32, Vec<u8>)>>;

    /// Drop every stored piece of `file_id`.
    fn delete_all_for_file(&self, file_id: &FileId) -> Result<()>;
}

/// Process-local store, mostly for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryPieceStore {
    files: Mutex<HashMap<FileId, BTreeMap<u32, Vec<u8>>>>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> Result<MutexGuard<'_, HashMap<FileId, BTreeMap<u32, Vec<u8>>>>> {
        self.files.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PieceStore for MemoryPieceStore {
    fn put(&self, file_id: &FileId, piece_index: u32, data: &[u8]) -> Result<()> {
        self.files()?
            .entry(*file_id)
            .or_default()
            .insert(piece_index, data.to_vec());
        Ok(())
    }

    fn get_all_for_file(&self, file_id: &FileId) -> Result<Vec<(u32, Vec<u8>)>> {
        Ok(self
            .files()?
            .get(file_id)
            .map(|pieces| pieces.iter().map(|(i, d)| (*i, d.clone())).collect())
            .unwrap_or_default())
    }

    fn delete_all_for_file(&self, file_id: &FileId) -> Result<()> {
        self.files()?.remove(file_id);
        Ok(())
    }
}

/// SQLite-backed store.
pub struct SqlitePieceStore {
    db: Mutex<Database>,
}

impl SqlitePieceStore {
    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_at(path)?),
        })
    }

    /// Open the database in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::new()?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
        })
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PieceStore for SqlitePieceStore {
    fn put(&self, file_id: &FileId, piece_index: u32, data: &[u8]) -> Result<()> {
        self.db()?.put_piece(file_id, piece_index, data)
    }

    fn get_all_for_file(&self, file_id: &FileId) -> Result<Vec<(u32, Vec<u8>)>> {
        self.db()?.pieces_for_file(file_id)
    }

    fn delete_all_for_file(&self, file_id: &FileId) -> Result<()> {
        let removed = self.db()?.delete_pieces_for_file(file_id)?;
        tracing::debug!(file_id = %file_id, removed, "deleted stored pieces");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn PieceStore) {
        let file = FileId::new();
        store.put(&file, 1, b"second").unwrap();
        store.put(&file, 0, b"first").unwrap();

        let all = store.get_all_for_file(&file).unwrap();
        assert_eq!(
            all,
            vec![(0, b"first".to_vec()), (1, b"second".to_vec())]
        );

        store.delete_all_for_file(&file).unwrap();
        assert!(store.get_all_for_file(&file).unwrap().is_empty());

        // deleting an unknown file is not an error
        store.delete_all_for_file(&FileId::new()).unwrap();
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryPieceStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        exercise(&SqlitePieceStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pieces.db");
        let file = FileId::new();

        {
            let store = SqlitePieceStore::open_at(&path).unwrap();
            store.put(&file, 0, b"kept").unwrap();
        }

        let store = SqlitePieceStore::open_at(&path).unwrap();
        assert_eq!(store.get_all_for_file(&file).unwrap().len(), 1);
    }
}
