use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::error_handling::types::StorageError;
use crate::models::{Entity, EntityKind};
use crate::storage::storage_trait::Storage;

/// JSON-snapshot backend.
///
/// The whole live object graph sits in one in-memory table keyed by
/// `"<TypeName>.<id>"`; `save` replaces a single JSON document with the
/// serialized table. The handle owns the table, callers get clones with no
/// back-channel to storage.
pub struct FileStorage {
    path: PathBuf,
    objects: Mutex<HashMap<String, Entity>>,
}

impl FileStorage {
    /// Handle backed by the given snapshot path. No IO happens here;
    /// `reload` pulls in whatever is durable.
    pub fn new_file<P: AsRef<Path>>(path: P) -> Self {
        FileStorage {
            path: path.as_ref().to_path_buf(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    // A poisoned lock still holds a consistent table; take it back.
    fn table(&self) -> MutexGuard<'_, HashMap<String, Entity>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

impl Storage for FileStorage {
    fn all(&self, kind: Option<EntityKind>) -> Result<HashMap<String, Entity>, StorageError> {
        let objects = self.table();
        let map = match kind {
            Some(k) => objects
                .iter()
                .filter(|(_, e)| e.kind() == k)
                .map(|(key, e)| (key.clone(), e.clone()))
                .collect(),
            None => objects.clone(),
        };
        Ok(map)
    }

    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StorageError> {
        Ok(self.table().get(&kind.key_for(id)).cloned())
    }

    fn new(&self, obj: &Entity) -> Result<(), StorageError> {
        // Last write wins on key collision.
        self.table().insert(obj.key(), obj.clone());
        Ok(())
    }

    fn save(&self) -> Result<(), StorageError> {
        // The table lock is held across the replace: one writer at a time,
        // readers see either the old or the new snapshot.
        let objects = self.table();
        let mut doc = Map::new();
        for (key, entity) in objects.iter() {
            doc.insert(key.clone(), Value::Object(entity.to_map()));
        }
        let payload = serde_json::to_string(&Value::Object(doc)).map_err(|e| {
            error!("Failed to serialize snapshot: {}", e);
            StorageError::WriteFailed
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    error!("Failed to create snapshot dir {}: {}", parent.display(), e);
                    StorageError::WriteFailed
                })?;
            }
        }

        // Write-then-rename keeps the previous artifact intact on failure.
        let tmp = self.tmp_path();
        fs::write(&tmp, payload).map_err(|e| {
            error!("Failed to write snapshot {}: {}", tmp.display(), e);
            StorageError::WriteFailed
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            error!("Failed to replace snapshot {}: {}", self.path.display(), e);
            StorageError::WriteFailed
        })?;
        info!("Saved {} object(s) to {}", objects.len(), self.path.display());
        Ok(())
    }

    fn delete(&self, obj: &Entity) -> Result<(), StorageError> {
        if self.table().remove(&obj.key()).is_some() {
            debug!("Deleted {}", obj.key());
        }
        Ok(())
    }

    fn count(&self, kind: Option<EntityKind>) -> Result<usize, StorageError> {
        let objects = self.table();
        let n = match kind {
            Some(k) => objects.values().filter(|e| e.kind() == k).count(),
            None => objects.len(),
        };
        Ok(n)
    }

    fn reload(&self) -> Result<(), StorageError> {
        if !self.path.exists() {
            info!("No snapshot at {}, starting empty", self.path.display());
            return Ok(());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            error!("Failed to read snapshot {}: {}", self.path.display(), e);
            StorageError::ReadFailed
        })?;
        let doc: Map<String, Value> = serde_json::from_str(&content).map_err(|e| {
            error!("Malformed snapshot {}: {}", self.path.display(), e);
            StorageError::ReadFailed
        })?;

        let mut objects = self.table();
        objects.clear();
        for (key, value) in doc {
            let map = match value {
                Value::Object(map) => map,
                _ => {
                    warn!("Skipping snapshot entry {}: not an object", key);
                    continue;
                }
            };
            if Entity::tag_of(&map).is_none() {
                warn!("Skipping snapshot entry {}: unrecognized type tag", key);
                continue;
            }
            let entity = Entity::from_map(map).map_err(|e| {
                error!("Corrupt snapshot entry {}: {}", key, e);
                StorageError::ReadFailed
            })?;
            objects.insert(entity.key(), entity);
        }
        debug!(
            "Reloaded {} object(s) from {}",
            objects.len(),
            self.path.display()
        );
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        // No external handle held; callable any number of times.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{City, State, User};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn temp_storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new_file(dir.path().join("file.json"));
        (dir, storage)
    }

    #[test]
    fn test_get_unregistered_is_absent() {
        let (_dir, storage) = temp_storage();
        for kind in EntityKind::ALL {
            assert!(storage.get(kind, "no-such-id").unwrap().is_none());
        }
    }

    #[test]
    fn test_new_save_get_roundtrip() {
        let (dir, storage) = temp_storage();
        let state = Entity::State(State::new("California"));
        storage.new(&state).unwrap();
        storage.save().unwrap();

        let got = storage.get(EntityKind::State, state.id()).unwrap().unwrap();
        assert_eq!(got, state);
        assert_eq!(got.to_map(), state.to_map());

        // Nested creation: a city referencing the state.
        let city = Entity::City(City::new("Fremont", state.id()));
        storage.new(&city).unwrap();
        storage.save().unwrap();
        let got = storage.get(EntityKind::City, city.id()).unwrap().unwrap();
        if let Entity::City(c) = got {
            assert_eq!(c.state_id, state.id());
        } else {
            unreachable!();
        }
        drop(dir);
    }

    #[test]
    fn test_count_matches_all_at_every_step() {
        let (_dir, storage) = temp_storage();
        let check = |storage: &FileStorage| {
            let mut total = 0;
            for kind in EntityKind::ALL {
                let n = storage.count(Some(kind)).unwrap();
                assert_eq!(n, storage.all(Some(kind)).unwrap().len());
                total += n;
            }
            assert_eq!(storage.count(None).unwrap(), total);
        };

        check(&storage);
        let s1 = Entity::State(State::new("Oregon"));
        let s2 = Entity::State(State::new("Nevada"));
        let u = Entity::User(User::new("a@b.com", "x"));
        storage.new(&s1).unwrap();
        check(&storage);
        storage.new(&s2).unwrap();
        storage.new(&u).unwrap();
        check(&storage);
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 2);

        storage.save().unwrap();
        check(&storage);
        storage.delete(&s1).unwrap();
        check(&storage);
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 1);
    }

    #[test]
    fn test_delete_visible_before_save() {
        let (_dir, storage) = temp_storage();
        let state = Entity::State(State::new("Texas"));
        storage.new(&state).unwrap();
        storage.save().unwrap();

        storage.delete(&state).unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_none());
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 0);
    }

    #[test]
    fn test_new_then_delete_before_save_is_net_zero() {
        let (_dir, storage) = temp_storage();
        let before = storage.count(Some(EntityKind::User)).unwrap();
        let user = Entity::User(User::new("a@b.com", "x"));
        storage.new(&user).unwrap();
        storage.delete(&user).unwrap();
        assert_eq!(storage.count(Some(EntityKind::User)).unwrap(), before);
    }

    #[test]
    fn test_reregister_same_identity_overwrites() {
        let (_dir, storage) = temp_storage();
        let state = Entity::State(State::new("Utah"));
        storage.new(&state).unwrap();

        let mut renamed = state.clone();
        if let Entity::State(s) = &mut renamed {
            s.name = "Deseret".into();
        }
        storage.new(&renamed).unwrap();

        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 1);
        let got = storage.get(EntityKind::State, state.id()).unwrap().unwrap();
        if let Entity::State(s) = got {
            assert_eq!(s.name, "Deseret");
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_snapshot_reload_preserves_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");

        let storage = FileStorage::new_file(&path);
        let mut user = User::new("a@b.com", "x");
        user.first_name = Some("Ada".into());
        let user = Entity::User(user);
        let state = Entity::State(State::new("California"));
        storage.new(&user).unwrap();
        storage.new(&state).unwrap();
        storage.save().unwrap();

        let fresh = FileStorage::new_file(&path);
        fresh.reload().unwrap();
        let got = fresh.get(EntityKind::User, user.id()).unwrap().unwrap();
        assert_eq!(got.to_map(), user.to_map());
        assert_eq!(got.meta(), user.meta());
        assert_eq!(fresh.count(None).unwrap(), 2);
    }

    #[test]
    fn test_reload_missing_file_is_empty() {
        let (_dir, storage) = temp_storage();
        storage.reload().unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
    }

    #[test]
    fn test_reload_skips_unrecognized_type_tags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");

        let storage = FileStorage::new_file(&path);
        let state = Entity::State(State::new("Iowa"));
        storage.new(&state).unwrap();
        storage.save().unwrap();

        // Splice a foreign entry into the snapshot by hand.
        let mut doc: Map<String, Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc.insert(
            "Dragon.123".into(),
            serde_json::json!({"__class__": "Dragon", "id": "123"}),
        );
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let fresh = FileStorage::new_file(&path);
        fresh.reload().unwrap();
        assert_eq!(fresh.count(None).unwrap(), 1);
        assert!(fresh.get(EntityKind::State, state.id()).unwrap().is_some());
    }

    #[test]
    fn test_close_is_a_callable_noop() {
        let (_dir, storage) = temp_storage();
        let state = Entity::State(State::new("Maine"));
        storage.new(&state).unwrap();
        storage.save().unwrap();
        storage.close().unwrap();
        storage.close().unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_some());
    }

    #[test]
    fn test_concurrent_saves_lose_no_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");
        let storage = Arc::new(FileStorage::new_file(&path));

        let s1 = Entity::State(State::new("Alaska"));
        let s2 = Entity::State(State::new("Hawaii"));
        storage.new(&s1).unwrap();
        storage.new(&s2).unwrap();

        let a = {
            let storage = storage.clone();
            std::thread::spawn(move || storage.save().unwrap())
        };
        let b = {
            let storage = storage.clone();
            std::thread::spawn(move || storage.save().unwrap())
        };
        a.join().unwrap();
        b.join().unwrap();

        let fresh = FileStorage::new_file(&path);
        fresh.reload().unwrap();
        assert!(fresh.get(EntityKind::State, s1.id()).unwrap().is_some());
        assert!(fresh.get(EntityKind::State, s2.id()).unwrap().is_some());
    }
}
