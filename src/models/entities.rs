use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::base::EntityMeta;
use crate::models::kinds::EntityKind;

/// A state, top of the geographic ownership chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
}

/// A city, owned by a state through `state_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    pub state_id: String,
}

/// A bookable amenity, linked to places many-to-many.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amenity {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
}

/// An account. `email` is immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// A rentable place. `city_id` and `user_id` are set at creation and never
/// patched afterwards; `amenity_ids` is the many-to-many edge list and the
/// only trace of the association in dictionary form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub city_id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub number_rooms: Option<i64>,
    #[serde(default)]
    pub number_bathrooms: Option<i64>,
    #[serde(default)]
    pub max_guest: Option<i64>,
    #[serde(default)]
    pub price_by_night: Option<i64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub amenity_ids: Vec<String>,
}

/// A review of a place by a user. Both foreign keys are creation-time only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub place_id: String,
    pub user_id: String,
    pub text: String,
}

/// One live entity of any supported kind.
///
/// The serde tag doubles as the `"__class__"` type tag of the dictionary
/// form and of the snapshot file, so serialization and the wire format
/// stay in lockstep for free.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__class__")]
pub enum Entity {
    State(State),
    City(City),
    Amenity(Amenity),
    User(User),
    Place(Place),
    Review(Review),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::State(_) => EntityKind::State,
            Entity::City(_) => EntityKind::City,
            Entity::Amenity(_) => EntityKind::Amenity,
            Entity::User(_) => EntityKind::User,
            Entity::Place(_) => EntityKind::Place,
            Entity::Review(_) => EntityKind::Review,
        }
    }

    pub fn meta(&self) -> &EntityMeta {
        match self {
            Entity::State(e) => &e.meta,
            Entity::City(e) => &e.meta,
            Entity::Amenity(e) => &e.meta,
            Entity::User(e) => &e.meta,
            Entity::Place(e) => &e.meta,
            Entity::Review(e) => &e.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut EntityMeta {
        match self {
            Entity::State(e) => &mut e.meta,
            Entity::City(e) => &mut e.meta,
            Entity::Amenity(e) => &mut e.meta,
            Entity::User(e) => &mut e.meta,
            Entity::Place(e) => &mut e.meta,
            Entity::Review(e) => &mut e.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    /// Storage key, `"<TypeName>.<id>"`.
    pub fn key(&self) -> String {
        self.kind().key_for(self.id())
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.meta_mut().touch();
    }

    /// Dictionary form: every field plus the `"__class__"` tag, timestamps
    /// in their textual representation.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // Entity always serializes to an object.
            _ => Map::new(),
        }
    }

    /// The type tag of a serialized entry, if it names a supported kind.
    pub fn tag_of(map: &Map<String, Value>) -> Option<EntityKind> {
        map.get("__class__")
            .and_then(Value::as_str)
            .and_then(EntityKind::from_name)
    }

    /// Reconstruct from dictionary form, adopting id and timestamps
    /// verbatim.
    pub fn from_map(map: Map<String, Value>) -> Result<Entity, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }

    /// Fields a PUT-style patch may touch for the given kind. Identity,
    /// foreign keys, timestamps and `email` are never in these lists.
    pub fn patchable_fields(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::State => &["name"],
            EntityKind::City => &["name"],
            EntityKind::Amenity => &["name"],
            EntityKind::User => &["password", "first_name", "last_name"],
            EntityKind::Place => &[
                "name",
                "description",
                "number_rooms",
                "number_bathrooms",
                "max_guest",
                "price_by_night",
                "latitude",
                "longitude",
            ],
            EntityKind::Review => &["text"],
        }
    }

    /// Apply a patch payload, honoring the per-kind whitelist and silently
    /// ignoring everything else. Refreshes `updated_at`.
    pub fn apply_patch(&mut self, payload: &Map<String, Value>) {
        for (field, value) in payload {
            match self {
                Entity::State(e) => {
                    if field == "name" {
                        set_string(&mut e.name, value);
                    }
                }
                Entity::City(e) => {
                    if field == "name" {
                        set_string(&mut e.name, value);
                    }
                }
                Entity::Amenity(e) => {
                    if field == "name" {
                        set_string(&mut e.name, value);
                    }
                }
                Entity::User(e) => match field.as_str() {
                    "password" => set_string(&mut e.password, value),
                    "first_name" => set_opt_string(&mut e.first_name, value),
                    "last_name" => set_opt_string(&mut e.last_name, value),
                    _ => {}
                },
                Entity::Place(e) => match field.as_str() {
                    "name" => set_string(&mut e.name, value),
                    "description" => set_opt_string(&mut e.description, value),
                    "number_rooms" => set_opt_int(&mut e.number_rooms, value),
                    "number_bathrooms" => set_opt_int(&mut e.number_bathrooms, value),
                    "max_guest" => set_opt_int(&mut e.max_guest, value),
                    "price_by_night" => set_opt_int(&mut e.price_by_night, value),
                    "latitude" => set_opt_float(&mut e.latitude, value),
                    "longitude" => set_opt_float(&mut e.longitude, value),
                    _ => {}
                },
                Entity::Review(e) => {
                    if field == "text" {
                        set_string(&mut e.text, value);
                    }
                }
            }
        }
        self.touch();
    }
}

fn set_string(slot: &mut String, value: &Value) {
    if let Some(s) = value.as_str() {
        *slot = s.to_string();
    }
}

fn set_opt_string(slot: &mut Option<String>, value: &Value) {
    match value {
        Value::Null => *slot = None,
        Value::String(s) => *slot = Some(s.clone()),
        _ => {}
    }
}

fn set_opt_int(slot: &mut Option<i64>, value: &Value) {
    match value {
        Value::Null => *slot = None,
        _ => {
            if let Some(n) = value.as_i64() {
                *slot = Some(n);
            }
        }
    }
}

fn set_opt_float(slot: &mut Option<f64>, value: &Value) {
    match value {
        Value::Null => *slot = None,
        _ => {
            if let Some(n) = value.as_f64() {
                *slot = Some(n);
            }
        }
    }
}

// Two entities are interchangeable iff same kind and same id, whatever
// their field contents at comparison time.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.id() == other.id()
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.id().hash(state);
    }
}

impl State {
    pub fn new<S: Into<String>>(name: S) -> Self {
        State {
            meta: EntityMeta::generate(),
            name: name.into(),
        }
    }
}

impl City {
    pub fn new<S: Into<String>>(name: S, state_id: S) -> Self {
        City {
            meta: EntityMeta::generate(),
            name: name.into(),
            state_id: state_id.into(),
        }
    }
}

impl Amenity {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Amenity {
            meta: EntityMeta::generate(),
            name: name.into(),
        }
    }
}

impl User {
    pub fn new<S: Into<String>>(email: S, password: S) -> Self {
        User {
            meta: EntityMeta::generate(),
            email: email.into(),
            password: password.into(),
            first_name: None,
            last_name: None,
        }
    }
}

impl Place {
    pub fn new<S: Into<String>>(name: S, city_id: S, user_id: S) -> Self {
        Place {
            meta: EntityMeta::generate(),
            city_id: city_id.into(),
            user_id: user_id.into(),
            name: name.into(),
            description: None,
            number_rooms: None,
            number_bathrooms: None,
            max_guest: None,
            price_by_night: None,
            latitude: None,
            longitude: None,
            amenity_ids: Vec::new(),
        }
    }
}

impl Review {
    pub fn new<S: Into<String>>(text: S, place_id: S, user_id: S) -> Self {
        Review {
            meta: EntityMeta::generate(),
            place_id: place_id.into(),
            user_id: user_id.into(),
            text: text.into(),
        }
    }
}
