//! Storage Trait
//!
//! This module defines the `Storage` trait, the uniform interface every
//! persistence backend implements.
//!
//! Implementors are responsible for:
//! - Tracking the live set of entities, pending and durable alike
//! - Making `new`/`delete` effects visible to queries before the next `save`
//! - Flushing the unit of work atomically on `save`
//! - Releasing their backing resources on `close`
//!
//! Lookup misses are absent results, never errors; only durability and
//! connection problems surface as `StorageError`.

use std::collections::HashMap;

use crate::error_handling::types::StorageError;
use crate::models::{Entity, EntityKind};

/// Uniform contract over the file and database backends.
///
/// One handle is shared per process; all methods are synchronous and keyed
/// by the `"<TypeName>.<id>"` identity scheme. Per-identity lifecycle:
/// unregistered -> `new` -> pending -> `save` -> durable -> `delete` ->
/// removed; a later `new` with the same id starts a fresh pending entry.
pub trait Storage: Send + Sync {
    /// Every live entity of `kind`, or of every kind when `None`, keyed by
    /// `"<TypeName>.<id>"`. Empty map when nothing matches.
    fn all(&self, kind: Option<EntityKind>) -> Result<HashMap<String, Entity>, StorageError>;

    /// The live entity with that kind and id, absent on any miss.
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, StorageError>;

    /// Register `obj` as pending-durable. Re-registering the same identity
    /// overwrites the pending entry, it never duplicates.
    fn new(&self, obj: &Entity) -> Result<(), StorageError>;

    /// Flush pending and durable state to the backing medium. Either the
    /// whole flush succeeds, or prior durable state is left unchanged.
    fn save(&self) -> Result<(), StorageError>;

    /// Drop the matching live entity; a no-op when it is not present.
    /// Visible to `all`/`get`/`count` before the next `save`.
    fn delete(&self, obj: &Entity) -> Result<(), StorageError>;

    /// Number of live entities under the same selector semantics as `all`.
    fn count(&self, kind: Option<EntityKind>) -> Result<usize, StorageError>;

    /// Populate the live set from durable state. No durable state yields
    /// an empty live set, not an error.
    fn reload(&self) -> Result<(), StorageError>;

    /// Release the backend's session/connection/file handle. Idempotent,
    /// and never destroys already-durable data.
    fn close(&self) -> Result<(), StorageError>;
}
