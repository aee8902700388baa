//! Domain model
//!
//! The six persisted entity types and the machinery they share.
//!
//! Components:
//! - `kinds`: the closed `EntityKind` enumeration and name resolution.
//! - `base`: `EntityMeta` identity/timestamp metadata and the serialized
//!   timestamp format.
//! - `entities`: the entity structs, the tagged `Entity` union, dictionary
//!   conversion and patch whitelists.

pub mod base;
pub mod entities;
pub mod kinds;

pub use base::EntityMeta;
pub use entities::{Amenity, City, Entity, Place, Review, State, User};
pub use kinds::EntityKind;
