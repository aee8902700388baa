use std::fmt;

/// The closed set of entity types the storage layer knows about.
///
/// String names are resolved case-sensitively at the API boundary; an
/// unrecognized name never reaches a backend, it simply produces an
/// absent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    State,
    City,
    Amenity,
    User,
    Place,
    Review,
}

impl EntityKind {
    /// Every supported kind, in a fixed order used by unscoped queries.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::State,
        EntityKind::City,
        EntityKind::Amenity,
        EntityKind::User,
        EntityKind::Place,
        EntityKind::Review,
    ];

    /// The type tag used in dictionary form and storage keys.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::State => "State",
            EntityKind::City => "City",
            EntityKind::Amenity => "Amenity",
            EntityKind::User => "User",
            EntityKind::Place => "Place",
            EntityKind::Review => "Review",
        }
    }

    /// Resolve a case-sensitive type name, e.g. `"State"`.
    pub fn from_name(name: &str) -> Option<EntityKind> {
        match name {
            "State" => Some(EntityKind::State),
            "City" => Some(EntityKind::City),
            "Amenity" => Some(EntityKind::Amenity),
            "User" => Some(EntityKind::User),
            "Place" => Some(EntityKind::Place),
            "Review" => Some(EntityKind::Review),
            _ => None,
        }
    }

    /// The `"<TypeName>.<id>"` key an entity of this kind lives under.
    pub fn key_for(&self, id: &str) -> String {
        format!("{}.{}", self.name(), id)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_and_case_sensitive_names() {
        assert_eq!(EntityKind::from_name("Spaceship"), None);
        assert_eq!(EntityKind::from_name("state"), None);
        assert_eq!(EntityKind::from_name(""), None);
    }

    #[test]
    fn test_key_for() {
        assert_eq!(EntityKind::City.key_for("abc"), "City.abc");
    }
}
