use chrono::{NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serialized textual form of entity timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Render a timestamp in the serialized form.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp from the serialized form.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
}

/// Serde adapter keeping `created_at`/`updated_at` in the fixed textual form.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_timestamp(&s).map_err(serde::de::Error::custom)
    }
}

/// Identity and lifecycle metadata carried by every entity.
///
/// `id` is generated once at construction and never changes; `updated_at`
/// is refreshed through [`EntityMeta::touch`] on every successful mutation.
/// Reconstruction from a serialized map adopts all three fields verbatim
/// through serde instead of generating new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: String,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
    #[serde(with = "timestamp")]
    pub updated_at: NaiveDateTime,
}

/// Current time truncated to microseconds, so in-memory values survive a
/// trip through the textual form unchanged.
fn now() -> NaiveDateTime {
    let t = Utc::now().naive_utc();
    t.with_nanosecond(t.nanosecond() / 1000 * 1000).unwrap_or(t)
}

impl EntityMeta {
    /// Fresh metadata: a new UUIDv4 id, both timestamps set to now.
    pub fn generate() -> Self {
        let created = now();
        EntityMeta {
            id: Uuid::new_v4().to_string(),
            created_at: created,
            updated_at: created,
        }
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}
