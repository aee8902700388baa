//! Storage subsystem
//!
//! Abstractions and implementations for persisting the six domain entity
//! types behind one uniform interface.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform API.
//! - `file_storage`: in-memory table persisted as one JSON snapshot.
//! - `database_storage`: SeaORM-based SQLite implementation.
//! - `db_entities`: SeaORM entity models for the database backend.
//!
//! The backend is picked once at process start from configuration; callers
//! only ever see `Arc<dyn Storage>`.

pub mod database_storage;
pub mod db_entities;
pub mod file_storage;
pub mod storage_trait;

use std::sync::Arc;

use crate::configuration::types::StorageBackend;
use crate::error_handling::types::StorageError;

pub use database_storage::DatabaseStorage;
pub use file_storage::FileStorage;
pub use storage_trait::Storage;

/// Build the concrete backend behind the shared interface.
pub fn build(backend: &StorageBackend) -> Result<Arc<dyn Storage>, StorageError> {
    match backend {
        StorageBackend::File { path } => Ok(Arc::new(FileStorage::new_file(path))),
        StorageBackend::Database { url } => Ok(Arc::new(DatabaseStorage::new_url(url)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityKind, State};
    use tempfile::TempDir;

    // The two backends must be indistinguishable through the trait.
    fn lifecycle(storage: &dyn Storage) {
        assert_eq!(storage.count(None).unwrap(), 0);
        let state = Entity::State(State::new("California"));
        storage.new(&state).unwrap();
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 1);
        storage.save().unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_some());
        storage.delete(&state).unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_none());
        storage.save().unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
    }

    #[test]
    fn test_backend_parity_through_build() {
        let dir = TempDir::new().unwrap();

        let file = build(&StorageBackend::File {
            path: dir.path().join("file.json"),
        })
        .unwrap();
        file.reload().unwrap();
        lifecycle(file.as_ref());

        let db = build(&StorageBackend::Database {
            url: format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("roost.sqlite3").display()
            ),
        })
        .unwrap();
        db.reload().unwrap();
        lifecycle(db.as_ref());
    }
}
