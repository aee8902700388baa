use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info, warn};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, Schema, Set, TransactionTrait,
};

use crate::error_handling::types::StorageError;
use crate::models::base::{format_timestamp, parse_timestamp};
use crate::models::{Amenity, City, Entity, EntityKind, EntityMeta, Place, Review, State, User};
use crate::storage::db_entities::{
    amenities, cities, place_amenities, places, reviews, states, users,
};
use crate::storage::storage_trait::Storage;

/// Relational backend over SQLite through SeaORM.
///
/// The handle owns a dedicated current-thread runtime and blocks on it
/// inside the sync trait methods. `new`/`delete` effects live in an
/// overlay (the unit of work) merged into every query, so pre-commit
/// visibility matches the file backend; `save` flushes the overlay in one
/// transaction.
pub struct DatabaseStorage {
    rt: tokio::runtime::Runtime,
    conn: Mutex<Option<DatabaseConnection>>,
    pending: Mutex<HashMap<String, Entity>>,
    removed: Mutex<HashSet<String>>,
}

fn read_err<E: std::fmt::Display>(e: E) -> StorageError {
    error!("Database read failed: {}", e);
    StorageError::ReadFailed
}

fn write_err<E: std::fmt::Display>(e: E) -> StorageError {
    error!("Database write failed: {}", e);
    StorageError::WriteFailed
}

impl DatabaseStorage {
    /// Connect to a database URL and ensure the schema exists.
    pub fn new_url(url: &str) -> Result<Self, StorageError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                error!("Failed to build storage runtime: {}", e);
                StorageError::ConnectionFailed
            })?;
        let conn = rt.block_on(async {
            let mut opts = ConnectOptions::new(url.to_owned());
            // One connection: a single logical handle per process, and
            // pre-commit reads always land on the session that staged them.
            opts.max_connections(1);
            let conn = Database::connect(opts).await.map_err(|e| {
                error!("Failed to connect to {}: {}", url, e);
                StorageError::ConnectionFailed
            })?;
            create_schema(&conn).await?;
            Ok::<_, StorageError>(conn)
        })?;
        info!("DatabaseStorage connected to {}", url);
        Ok(DatabaseStorage {
            rt,
            conn: Mutex::new(Some(conn)),
            pending: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
        })
    }

    /// Create or open an SQLite database file at the given path.
    pub fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    error!("Failed to create database dir {}: {}", parent.display(), e);
                    StorageError::WriteFailed
                })?;
            }
        }
        Self::new_url(&format!("sqlite://{}?mode=rwc", path_ref.display()))
    }

    fn conn(&self) -> Result<DatabaseConnection, StorageError> {
        self.guard(&self.conn).clone().ok_or(StorageError::Closed)
    }

    fn guard<'a, T>(&self, lock: &'a Mutex<T>) -> MutexGuard<'a, T> {
        lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn create_schema(conn: &DatabaseConnection) -> Result<(), StorageError> {
    let backend = conn.get_database_backend();
    let schema = Schema::new(backend);
    let mut statements = vec![
        schema.create_table_from_entity(states::Entity),
        schema.create_table_from_entity(cities::Entity),
        schema.create_table_from_entity(amenities::Entity),
        schema.create_table_from_entity(users::Entity),
        schema.create_table_from_entity(places::Entity),
        schema.create_table_from_entity(reviews::Entity),
        schema.create_table_from_entity(place_amenities::Entity),
    ];
    for stmt in &mut statements {
        stmt.if_not_exists();
        conn.execute(backend.build(&*stmt)).await.map_err(|e| {
            error!("Failed to create schema: {}", e);
            StorageError::WriteFailed
        })?;
    }
    Ok(())
}

fn meta_from(id: String, created_at: &str, updated_at: &str) -> Result<EntityMeta, StorageError> {
    Ok(EntityMeta {
        id,
        created_at: parse_timestamp(created_at).map_err(read_err)?,
        updated_at: parse_timestamp(updated_at).map_err(read_err)?,
    })
}

fn state_from_row(m: states::Model) -> Result<Entity, StorageError> {
    Ok(Entity::State(State {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        name: m.name,
    }))
}

fn city_from_row(m: cities::Model) -> Result<Entity, StorageError> {
    Ok(Entity::City(City {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        name: m.name,
        state_id: m.state_id,
    }))
}

fn amenity_from_row(m: amenities::Model) -> Result<Entity, StorageError> {
    Ok(Entity::Amenity(Amenity {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        name: m.name,
    }))
}

fn user_from_row(m: users::Model) -> Result<Entity, StorageError> {
    Ok(Entity::User(User {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        email: m.email,
        password: m.password,
        first_name: m.first_name,
        last_name: m.last_name,
    }))
}

fn place_from_row(m: places::Model, mut amenity_ids: Vec<String>) -> Result<Entity, StorageError> {
    amenity_ids.sort();
    Ok(Entity::Place(Place {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        city_id: m.city_id,
        user_id: m.user_id,
        name: m.name,
        description: m.description,
        number_rooms: m.number_rooms,
        number_bathrooms: m.number_bathrooms,
        max_guest: m.max_guest,
        price_by_night: m.price_by_night,
        latitude: m.latitude,
        longitude: m.longitude,
        amenity_ids,
    }))
}

fn review_from_row(m: reviews::Model) -> Result<Entity, StorageError> {
    Ok(Entity::Review(Review {
        meta: meta_from(m.id, &m.created_at, &m.updated_at)?,
        place_id: m.place_id,
        user_id: m.user_id,
        text: m.text,
    }))
}

/// Fetch every row of one kind and rebuild entities.
async fn load_kind<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
) -> Result<Vec<Entity>, StorageError> {
    match kind {
        EntityKind::State => states::Entity::find()
            .all(conn)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(state_from_row)
            .collect(),
        EntityKind::City => cities::Entity::find()
            .all(conn)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(city_from_row)
            .collect(),
        EntityKind::Amenity => amenities::Entity::find()
            .all(conn)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(amenity_from_row)
            .collect(),
        EntityKind::User => users::Entity::find()
            .all(conn)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(user_from_row)
            .collect(),
        EntityKind::Place => {
            let rows = places::Entity::find().all(conn).await.map_err(read_err)?;
            let links = place_amenities::Entity::find()
                .all(conn)
                .await
                .map_err(read_err)?;
            let mut by_place: HashMap<String, Vec<String>> = HashMap::new();
            for link in links {
                by_place.entry(link.place_id).or_default().push(link.amenity_id);
            }
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let amenity_ids = by_place.remove(&row.id).unwrap_or_default();
                out.push(place_from_row(row, amenity_ids)?);
            }
            Ok(out)
        }
        EntityKind::Review => reviews::Entity::find()
            .all(conn)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(review_from_row)
            .collect(),
    }
}

/// Fetch one row by primary key and rebuild the entity.
async fn find_one<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
    id: &str,
) -> Result<Option<Entity>, StorageError> {
    let id = id.to_owned();
    match kind {
        EntityKind::State => states::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(read_err)?
            .map(state_from_row)
            .transpose(),
        EntityKind::City => cities::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(read_err)?
            .map(city_from_row)
            .transpose(),
        EntityKind::Amenity => amenities::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(read_err)?
            .map(amenity_from_row)
            .transpose(),
        EntityKind::User => users::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(read_err)?
            .map(user_from_row)
            .transpose(),
        EntityKind::Place => {
            let row = match places::Entity::find_by_id(id.clone())
                .one(conn)
                .await
                .map_err(read_err)?
            {
                Some(row) => row,
                None => return Ok(None),
            };
            let amenity_ids = place_amenities::Entity::find()
                .filter(place_amenities::Column::PlaceId.eq(id))
                .all(conn)
                .await
                .map_err(read_err)?
                .into_iter()
                .map(|link| link.amenity_id)
                .collect();
            Ok(Some(place_from_row(row, amenity_ids)?))
        }
        EntityKind::Review => reviews::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(read_err)?
            .map(review_from_row)
            .transpose(),
    }
}

/// Insert-or-update one entity's row (and, for places, its association
/// rows) inside the open transaction.
async fn upsert_entity(txn: &DatabaseTransaction, entity: &Entity) -> Result<(), StorageError> {
    match entity {
        Entity::State(e) => {
            let row = states::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                name: Set(e.name.clone()),
            };
            states::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(states::Column::Id)
                        .update_columns([
                            states::Column::CreatedAt,
                            states::Column::UpdatedAt,
                            states::Column::Name,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;
        }
        Entity::City(e) => {
            let row = cities::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                name: Set(e.name.clone()),
                state_id: Set(e.state_id.clone()),
            };
            cities::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(cities::Column::Id)
                        .update_columns([
                            cities::Column::CreatedAt,
                            cities::Column::UpdatedAt,
                            cities::Column::Name,
                            cities::Column::StateId,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;
        }
        Entity::Amenity(e) => {
            let row = amenities::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                name: Set(e.name.clone()),
            };
            amenities::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(amenities::Column::Id)
                        .update_columns([
                            amenities::Column::CreatedAt,
                            amenities::Column::UpdatedAt,
                            amenities::Column::Name,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;
        }
        Entity::User(e) => {
            let row = users::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                email: Set(e.email.clone()),
                password: Set(e.password.clone()),
                first_name: Set(e.first_name.clone()),
                last_name: Set(e.last_name.clone()),
            };
            users::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(users::Column::Id)
                        .update_columns([
                            users::Column::CreatedAt,
                            users::Column::UpdatedAt,
                            users::Column::Email,
                            users::Column::Password,
                            users::Column::FirstName,
                            users::Column::LastName,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;
        }
        Entity::Place(e) => {
            let row = places::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                city_id: Set(e.city_id.clone()),
                user_id: Set(e.user_id.clone()),
                name: Set(e.name.clone()),
                description: Set(e.description.clone()),
                number_rooms: Set(e.number_rooms),
                number_bathrooms: Set(e.number_bathrooms),
                max_guest: Set(e.max_guest),
                price_by_night: Set(e.price_by_night),
                latitude: Set(e.latitude),
                longitude: Set(e.longitude),
            };
            places::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(places::Column::Id)
                        .update_columns([
                            places::Column::CreatedAt,
                            places::Column::UpdatedAt,
                            places::Column::CityId,
                            places::Column::UserId,
                            places::Column::Name,
                            places::Column::Description,
                            places::Column::NumberRooms,
                            places::Column::NumberBathrooms,
                            places::Column::MaxGuest,
                            places::Column::PriceByNight,
                            places::Column::Latitude,
                            places::Column::Longitude,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;

            // Replace the association rows wholesale.
            place_amenities::Entity::delete_many()
                .filter(place_amenities::Column::PlaceId.eq(e.meta.id.clone()))
                .exec(txn)
                .await
                .map_err(write_err)?;
            let links: Vec<place_amenities::ActiveModel> = e
                .amenity_ids
                .iter()
                .map(|amenity_id| place_amenities::ActiveModel {
                    place_id: Set(e.meta.id.clone()),
                    amenity_id: Set(amenity_id.clone()),
                })
                .collect();
            if !links.is_empty() {
                place_amenities::Entity::insert_many(links)
                    .exec(txn)
                    .await
                    .map_err(write_err)?;
            }
        }
        Entity::Review(e) => {
            let row = reviews::ActiveModel {
                id: Set(e.meta.id.clone()),
                created_at: Set(format_timestamp(&e.meta.created_at)),
                updated_at: Set(format_timestamp(&e.meta.updated_at)),
                place_id: Set(e.place_id.clone()),
                user_id: Set(e.user_id.clone()),
                text: Set(e.text.clone()),
            };
            reviews::Entity::insert(row)
                .on_conflict(
                    OnConflict::column(reviews::Column::Id)
                        .update_columns([
                            reviews::Column::CreatedAt,
                            reviews::Column::UpdatedAt,
                            reviews::Column::PlaceId,
                            reviews::Column::UserId,
                            reviews::Column::Text,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await
                .map_err(write_err)?;
        }
    }
    Ok(())
}

/// Delete one row by kind and id, plus any association rows touching it.
async fn remove_row(
    txn: &DatabaseTransaction,
    kind: EntityKind,
    id: &str,
) -> Result<(), StorageError> {
    let id = id.to_owned();
    match kind {
        EntityKind::State => {
            states::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
        EntityKind::City => {
            cities::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
        EntityKind::Amenity => {
            place_amenities::Entity::delete_many()
                .filter(place_amenities::Column::AmenityId.eq(id.clone()))
                .exec(txn)
                .await
                .map_err(write_err)?;
            amenities::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
        EntityKind::User => {
            users::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
        EntityKind::Place => {
            place_amenities::Entity::delete_many()
                .filter(place_amenities::Column::PlaceId.eq(id.clone()))
                .exec(txn)
                .await
                .map_err(write_err)?;
            places::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
        EntityKind::Review => {
            reviews::Entity::delete_by_id(id).exec(txn).await.map_err(write_err)?;
        }
    }
    Ok(())
}

async fn apply_unit_of_work(
    txn: &DatabaseTransaction,
    removals: &[String],
    upserts: &[Entity],
) -> Result<(), StorageError> {
    for key in removals {
        match key.split_once('.') {
            Some((name, id)) => match EntityKind::from_name(name) {
                Some(kind) => remove_row(txn, kind, id).await?,
                None => warn!("Ignoring staged removal with unknown kind: {}", key),
            },
            None => warn!("Ignoring malformed staged removal key: {}", key),
        }
    }
    for entity in upserts {
        upsert_entity(txn, entity).await?;
    }
    Ok(())
}

impl Storage for DatabaseStorage {
    fn all(&self, kind: Option<EntityKind>) -> Result<HashMap<String, Entity>, StorageError> {
        let conn = self.conn()?;
        let kinds: Vec<EntityKind> = match kind {
            Some(k) => vec![k],
            None => EntityKind::ALL.to_vec(),
        };
        let mut map = HashMap::new();
        self.rt.block_on(async {
            for k in &kinds {
                for entity in load_kind(&conn, *k).await? {
                    map.insert(entity.key(), entity);
                }
            }
            Ok::<_, StorageError>(())
        })?;

        for key in self.guard(&self.removed).iter() {
            map.remove(key);
        }
        for (key, entity) in self.guard(&self.pending).iter() {
            if kind.map_or(true, |k| entity.kind() == k) {
                map.insert(key.clone(), entity.clone());
            }
        }
        Ok(map)
    }

    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StorageError> {
        let key = kind.key_for(id);
        if self.guard(&self.removed).contains(&key) {
            return Ok(None);
        }
        if let Some(entity) = self.guard(&self.pending).get(&key) {
            return Ok(Some(entity.clone()));
        }
        let conn = self.conn()?;
        self.rt.block_on(find_one(&conn, kind, id))
    }

    fn new(&self, obj: &Entity) -> Result<(), StorageError> {
        let key = obj.key();
        // A fresh registration supersedes any staged removal of the same
        // identity.
        self.guard(&self.removed).remove(&key);
        self.guard(&self.pending).insert(key, obj.clone());
        Ok(())
    }

    fn save(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        // Both overlay locks are held across the commit, the same
        // discipline as the file backend: a concurrent new/delete waits
        // for the flush instead of racing it and getting dropped by the
        // post-commit cleanup.
        let mut pending = self.guard(&self.pending);
        let mut removed = self.guard(&self.removed);
        if pending.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let upserts: Vec<Entity> = pending.values().cloned().collect();
        let removals: Vec<String> = removed.iter().cloned().collect();

        self.rt.block_on(async {
            let txn = conn.begin().await.map_err(write_err)?;
            if let Err(e) = apply_unit_of_work(&txn, &removals, &upserts).await {
                // Prior durable state stays untouched; the overlay is kept
                // so the caller can retry or inspect.
                let _ = txn.rollback().await;
                return Err(e);
            }
            txn.commit().await.map_err(write_err)
        })?;

        pending.clear();
        removed.clear();
        debug!(
            "Committed {} upsert(s), {} removal(s)",
            upserts.len(),
            removals.len()
        );
        Ok(())
    }

    fn delete(&self, obj: &Entity) -> Result<(), StorageError> {
        let key = obj.key();
        self.guard(&self.pending).remove(&key);
        // Staged even when no durable row exists; the commit-time delete
        // then touches zero rows.
        self.guard(&self.removed).insert(key);
        Ok(())
    }

    fn count(&self, kind: Option<EntityKind>) -> Result<usize, StorageError> {
        Ok(self.all(kind)?.len())
    }

    fn reload(&self) -> Result<(), StorageError> {
        // The live set is the tables themselves; an empty database is a
        // valid empty state. Just make sure the schema is in place.
        let conn = self.conn()?;
        self.rt.block_on(create_schema(&conn))
    }

    fn close(&self) -> Result<(), StorageError> {
        if let Some(conn) = self.guard(&self.conn).take() {
            drop(conn);
            info!("DatabaseStorage closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{City, Place, State, User};
    use serde_json::Map;
    use serial_test::serial;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, DatabaseStorage) {
        let dir = TempDir::new().unwrap();
        let storage = DatabaseStorage::new_file(dir.path().join("roost.sqlite3")).unwrap();
        (dir, storage)
    }

    #[test]
    #[serial]
    fn test_get_unregistered_is_absent() {
        let (_dir, storage) = temp_db();
        for kind in EntityKind::ALL {
            assert!(storage.get(kind, "no-such-id").unwrap().is_none());
        }
    }

    #[test]
    #[serial]
    fn test_new_save_get_roundtrip() {
        let (_dir, storage) = temp_db();
        let mut user = User::new("a@b.com", "x");
        user.first_name = Some("Ada".into());
        let user = Entity::User(user);
        storage.new(&user).unwrap();
        storage.save().unwrap();

        let got = storage.get(EntityKind::User, user.id()).unwrap().unwrap();
        assert_eq!(got, user);
        assert_eq!(got.to_map(), user.to_map());
    }

    #[test]
    #[serial]
    fn test_pending_visible_before_commit() {
        let (_dir, storage) = temp_db();
        let state = Entity::State(State::new("California"));
        storage.new(&state).unwrap();

        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_some());
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 1);
        assert!(storage
            .all(Some(EntityKind::State))
            .unwrap()
            .contains_key(&state.key()));
    }

    #[test]
    #[serial]
    fn test_state_city_scenario() {
        let (_dir, storage) = temp_db();
        let state = Entity::State(State::new("California"));
        storage.new(&state).unwrap();
        storage.save().unwrap();
        let got = storage.get(EntityKind::State, state.id()).unwrap().unwrap();
        if let Entity::State(s) = &got {
            assert_eq!(s.name, "California");
        } else {
            unreachable!();
        }

        let city = Entity::City(City::new("Fremont", state.id()));
        storage.new(&city).unwrap();
        storage.save().unwrap();
        let got = storage.get(EntityKind::City, city.id()).unwrap().unwrap();
        if let Entity::City(c) = got {
            assert_eq!(c.state_id, state.id());
        } else {
            unreachable!();
        }
    }

    #[test]
    #[serial]
    fn test_new_then_delete_before_save_is_net_zero() {
        let (_dir, storage) = temp_db();
        let before = storage.count(Some(EntityKind::User)).unwrap();
        let user = Entity::User(User::new("a@b.com", "x"));
        storage.new(&user).unwrap();
        storage.delete(&user).unwrap();
        assert_eq!(storage.count(Some(EntityKind::User)).unwrap(), before);
        storage.save().unwrap();
        assert_eq!(storage.count(Some(EntityKind::User)).unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_delete_durable_visible_before_save() {
        let (_dir, storage) = temp_db();
        let state = Entity::State(State::new("Texas"));
        storage.new(&state).unwrap();
        storage.save().unwrap();

        storage.delete(&state).unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_none());
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 0);

        storage.save().unwrap();
        assert!(storage.get(EntityKind::State, state.id()).unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_count_matches_all_across_kinds() {
        let (_dir, storage) = temp_db();
        storage.new(&Entity::State(State::new("Oregon"))).unwrap();
        storage.new(&Entity::State(State::new("Nevada"))).unwrap();
        storage.new(&Entity::User(User::new("a@b.com", "x"))).unwrap();
        storage.save().unwrap();
        storage.new(&Entity::State(State::new("Idaho"))).unwrap();

        let mut total = 0;
        for kind in EntityKind::ALL {
            let n = storage.count(Some(kind)).unwrap();
            assert_eq!(n, storage.all(Some(kind)).unwrap().len());
            total += n;
        }
        assert_eq!(storage.count(None).unwrap(), total);
        assert_eq!(total, 4);
    }

    #[test]
    #[serial]
    fn test_place_amenity_links_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roost.sqlite3");

        let storage = DatabaseStorage::new_file(&path).unwrap();
        let mut place = Place::new("Loft", "city-1", "user-1");
        place.amenity_ids = vec!["am-1".into(), "am-2".into()];
        let place = Entity::Place(place);
        storage.new(&place).unwrap();
        storage.save().unwrap();
        storage.close().unwrap();

        let fresh = DatabaseStorage::new_file(&path).unwrap();
        let got = fresh.get(EntityKind::Place, place.id()).unwrap().unwrap();
        if let Entity::Place(p) = &got {
            assert_eq!(p.amenity_ids, vec!["am-1".to_string(), "am-2".to_string()]);
        } else {
            unreachable!();
        }
        assert_eq!(got.to_map(), place.to_map());
    }

    #[test]
    #[serial]
    fn test_update_preserves_created_at() {
        let (_dir, storage) = temp_db();
        let state = Entity::State(State::new("Vermont"));
        storage.new(&state).unwrap();
        storage.save().unwrap();

        let mut fetched = storage.get(EntityKind::State, state.id()).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let patch: Map<_, _> = serde_json::from_str(r#"{"name": "New Vermont"}"#).unwrap();
        fetched.apply_patch(&patch);
        storage.new(&fetched).unwrap();
        storage.save().unwrap();

        let got = storage.get(EntityKind::State, state.id()).unwrap().unwrap();
        assert_eq!(got.meta().created_at, state.meta().created_at);
        assert!(got.meta().updated_at > state.meta().updated_at);
        if let Entity::State(s) = got {
            assert_eq!(s.name, "New Vermont");
        } else {
            unreachable!();
        }
        assert_eq!(storage.count(Some(EntityKind::State)).unwrap(), 1);
    }

    #[test]
    #[serial]
    fn test_reregistration_during_save_is_not_lost() {
        let (_dir, storage) = temp_db();
        let storage = std::sync::Arc::new(storage);
        let state = State::new("Georgia");
        let id = state.meta.id.clone();
        storage.new(&Entity::State(state.clone())).unwrap();

        // Race a save against a re-registration of the same identity; the
        // fresher fields must survive to the next flush whichever side of
        // the commit the registration lands on.
        for round in 0..10 {
            let saver = {
                let storage = storage.clone();
                std::thread::spawn(move || storage.save().unwrap())
            };
            let mut updated = state.clone();
            updated.name = format!("Georgia v{}", round);
            storage.new(&Entity::State(updated)).unwrap();
            saver.join().unwrap();
        }
        storage.save().unwrap();

        let got = storage.get(EntityKind::State, &id).unwrap().unwrap();
        if let Entity::State(s) = got {
            assert_eq!(s.name, "Georgia v9");
        } else {
            unreachable!();
        }
    }

    #[test]
    #[serial]
    fn test_deleting_amenity_drops_its_links() {
        let (_dir, storage) = temp_db();
        let amenity = Entity::Amenity(crate::models::Amenity::new("wifi"));
        let mut place = Place::new("Loft", "city-1", "user-1");
        place.amenity_ids = vec![amenity.id().to_string()];
        let place = Entity::Place(place);
        storage.new(&amenity).unwrap();
        storage.new(&place).unwrap();
        storage.save().unwrap();

        storage.delete(&amenity).unwrap();
        storage.save().unwrap();

        let got = storage.get(EntityKind::Place, place.id()).unwrap().unwrap();
        if let Entity::Place(p) = got {
            assert!(p.amenity_ids.is_empty());
        } else {
            unreachable!();
        }
    }

    #[test]
    #[serial]
    fn test_close_then_use_is_an_error() {
        let (_dir, storage) = temp_db();
        storage.close().unwrap();
        storage.close().unwrap();
        assert!(matches!(
            storage.get(EntityKind::State, "x"),
            Err(StorageError::Closed)
        ));
        assert!(matches!(storage.save(), Err(StorageError::Closed)));
    }

    #[test]
    #[serial]
    fn test_close_keeps_durable_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roost.sqlite3");

        let storage = DatabaseStorage::new_file(&path).unwrap();
        let state = Entity::State(State::new("Ohio"));
        storage.new(&state).unwrap();
        storage.save().unwrap();
        storage.close().unwrap();

        let fresh = DatabaseStorage::new_file(&path).unwrap();
        assert!(fresh.get(EntityKind::State, state.id()).unwrap().is_some());
    }
}
