use std::path::PathBuf;

/// The storage backend picked once at process start.
///
/// A typed value, resolved and validated while reading configuration;
/// an unrecognized backend name never gets past startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// JSON snapshot file at the given path.
    File { path: PathBuf },
    /// Relational database at the given connection URL.
    Database { url: String },
}
