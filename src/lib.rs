pub mod configuration;
pub mod error_handling;
pub mod models;
pub mod storage;
pub mod web_interface;

pub use configuration::{Config, StorageBackend};
pub use models::{Entity, EntityKind};
pub use storage::storage_trait::Storage;
pub use web_interface::WebServer;
