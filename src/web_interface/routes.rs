use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use log::error;
use serde_json::{json, Map, Value};
use warp::filters::BoxedFilter;
use warp::{http::StatusCode, reply, Filter, Rejection, Reply};

use crate::error_handling::types::StorageError;
use crate::models::{Amenity, City, Entity, EntityKind, Place, Review, State, User};
use crate::storage::storage_trait::Storage;

type Store = Arc<dyn Storage>;
type Response = warp::reply::Response;

fn with_storage(storage: Store) -> impl Filter<Extract = (Store,), Error = Infallible> + Clone {
    warp::any().map(move || storage.clone())
}

/// `/api/v1/<segment>` with nothing after it.
fn collection_path(
    segment: &'static str,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path("api")
        .and(warp::path("v1"))
        .and(warp::path(segment))
        .and(warp::path::end())
}

/// `/api/v1/<segment>/<id>` with nothing after the id.
fn item_path(
    segment: &'static str,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path("api")
        .and(warp::path("v1"))
        .and(warp::path(segment))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
}

/// `/api/v1/<parent>/<id>/<child>` with nothing after the child segment.
fn nested_path(
    parent: &'static str,
    child: &'static str,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path("api")
        .and(warp::path("v1"))
        .and(warp::path(parent))
        .and(warp::path::param::<String>())
        .and(warp::path(child))
        .and(warp::path::end())
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    reply::with_status(reply::json(&json!({ "error": message })), status).into_response()
}

fn json_reply<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    reply::with_status(reply::json(value), status).into_response()
}

fn entity_reply(status: StatusCode, entity: &Entity) -> Response {
    json_reply(status, &Value::Object(entity.to_map()))
}

fn not_found() -> Response {
    error_reply(StatusCode::NOT_FOUND, "Not found")
}

fn bad_request(message: &str) -> Response {
    error_reply(StatusCode::BAD_REQUEST, message)
}

fn storage_failure(err: StorageError) -> Response {
    error!("Storage operation failed: {}", err);
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

/// Run a synchronous storage closure off the async executor. The database
/// backend blocks on its own runtime, which must not happen on a worker
/// thread of the server runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => {
            error!("Storage task failed: {}", e);
            Err(StorageError::ReadFailed)
        }
    }
}

/// The request body must be a non-empty JSON object; anything else,
/// an empty `{}` included, is "Not a JSON".
fn body_object(body: Value) -> Result<Map<String, Value>, Response> {
    match body {
        Value::Object(map) if !map.is_empty() => Ok(map),
        _ => Err(bad_request("Not a JSON")),
    }
}

/// Parse a raw body the nested-create routes receive. Those routes check
/// the parent id before looking at the body at all, so the body cannot go
/// through the deserializing filter.
fn parse_body(body: &Bytes) -> Result<Map<String, Value>, Response> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => body_object(value),
        Err(_) => Err(bad_request("Not a JSON")),
    }
}

/// A required creation field: present, a string, non-empty.
fn required_string(payload: &Map<String, Value>, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Dictionary forms in a stable order (creation time, then id).
fn sorted_dicts(map: std::collections::HashMap<String, Entity>) -> Vec<Value> {
    let mut entities: Vec<Entity> = map.into_values().collect();
    entities.sort_by(|a, b| {
        (a.meta().created_at, a.id().to_string()).cmp(&(b.meta().created_at, b.id().to_string()))
    });
    entities
        .into_iter()
        .map(|e| Value::Object(e.to_map()))
        .collect()
}

fn persist(storage: &dyn Storage, entity: &Entity) -> Result<(), StorageError> {
    storage.new(entity)?;
    storage.save()
}

async fn status_handler() -> Result<Response, Rejection> {
    Ok(json_reply(StatusCode::OK, &json!({ "status": "OK" })))
}

async fn stats_handler(storage: Store) -> Result<Response, Rejection> {
    let counts = run_blocking(move || {
        Ok((
            storage.count(Some(EntityKind::Amenity))?,
            storage.count(Some(EntityKind::City))?,
            storage.count(Some(EntityKind::Place))?,
            storage.count(Some(EntityKind::Review))?,
            storage.count(Some(EntityKind::State))?,
            storage.count(Some(EntityKind::User))?,
        ))
    })
    .await;
    match counts {
        Ok((amenities, cities, places, reviews, states, users)) => Ok(json_reply(
            StatusCode::OK,
            &json!({
                "amenities": amenities,
                "cities": cities,
                "places": places,
                "reviews": reviews,
                "states": states,
                "users": users,
            }),
        )),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn list_handler(kind: EntityKind, storage: Store) -> Result<Response, Rejection> {
    match run_blocking(move || storage.all(Some(kind))).await {
        Ok(map) => Ok(json_reply(StatusCode::OK, &Value::Array(sorted_dicts(map)))),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn get_handler(kind: EntityKind, id: String, storage: Store) -> Result<Response, Rejection> {
    match run_blocking(move || storage.get(kind, &id)).await {
        Ok(Some(entity)) => Ok(entity_reply(StatusCode::OK, &entity)),
        Ok(None) => Ok(not_found()),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn delete_handler(
    kind: EntityKind,
    id: String,
    storage: Store,
) -> Result<Response, Rejection> {
    let outcome = run_blocking(move || match storage.get(kind, &id)? {
        Some(entity) => {
            storage.delete(&entity)?;
            storage.save()?;
            Ok(true)
        }
        None => Ok(false),
    })
    .await;
    match outcome {
        Ok(true) => Ok(json_reply(StatusCode::OK, &json!({}))),
        Ok(false) => Ok(not_found()),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn update_handler(
    kind: EntityKind,
    id: String,
    body: Value,
    storage: Store,
) -> Result<Response, Rejection> {
    let payload = match body_object(body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let outcome = run_blocking(move || match storage.get(kind, &id)? {
        Some(mut entity) => {
            entity.apply_patch(&payload);
            persist(storage.as_ref(), &entity)?;
            Ok(Some(entity))
        }
        None => Ok(None),
    })
    .await;
    match outcome {
        Ok(Some(entity)) => Ok(entity_reply(StatusCode::OK, &entity)),
        Ok(None) => Ok(not_found()),
        Err(e) => Ok(storage_failure(e)),
    }
}

/// Nested listing: every entity of `kind` whose parent foreign key equals
/// the path id, after the parent itself is confirmed to exist.
async fn nested_list_handler(
    parent_kind: EntityKind,
    parent_id: String,
    kind: EntityKind,
    fk_of: fn(&Entity) -> Option<&str>,
    storage: Store,
) -> Result<Response, Rejection> {
    let outcome = run_blocking(move || {
        if storage.get(parent_kind, &parent_id)?.is_none() {
            return Ok(None);
        }
        let mut map = storage.all(Some(kind))?;
        map.retain(|_, e| fk_of(e) == Some(parent_id.as_str()));
        Ok(Some(map))
    })
    .await;
    match outcome {
        Ok(Some(map)) => Ok(json_reply(StatusCode::OK, &Value::Array(sorted_dicts(map)))),
        Ok(None) => Ok(not_found()),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn create_state_handler(body: Value, storage: Store) -> Result<Response, Rejection> {
    let payload = match body_object(body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let name = match required_string(&payload, "name") {
        Some(name) => name,
        None => return Ok(bad_request("Missing name")),
    };
    let entity = Entity::State(State::new(name));
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn create_amenity_handler(body: Value, storage: Store) -> Result<Response, Rejection> {
    let payload = match body_object(body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let name = match required_string(&payload, "name") {
        Some(name) => name,
        None => return Ok(bad_request("Missing name")),
    };
    let entity = Entity::Amenity(Amenity::new(name));
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn create_user_handler(body: Value, storage: Store) -> Result<Response, Rejection> {
    let payload = match body_object(body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let email = match required_string(&payload, "email") {
        Some(email) => email,
        None => return Ok(bad_request("Missing email")),
    };
    let password = match required_string(&payload, "password") {
        Some(password) => password,
        None => return Ok(bad_request("Missing password")),
    };
    let mut entity = Entity::User(User::new(email, password));
    // Optional fields may come along in the creation payload.
    entity.apply_patch(&payload);
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

/// The parent/reference existence check of a nested create: 404 on a
/// miss, 500 on storage failure.
async fn require_entity(storage: &Store, kind: EntityKind, id: &str) -> Result<(), Response> {
    let storage = storage.clone();
    let id = id.to_string();
    match run_blocking(move || storage.get(kind, &id)).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(not_found()),
        Err(e) => Err(storage_failure(e)),
    }
}

// The nested creates validate in the same order the endpoints always
// have: parent lookup first, then the body, then each required field
// (with referenced users resolved at their place in the sequence).

async fn create_city_handler(
    state_id: String,
    body: Bytes,
    storage: Store,
) -> Result<Response, Rejection> {
    if let Err(response) = require_entity(&storage, EntityKind::State, &state_id).await {
        return Ok(response);
    }
    let payload = match parse_body(&body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let name = match required_string(&payload, "name") {
        Some(name) => name,
        None => return Ok(bad_request("Missing name")),
    };
    let entity = Entity::City(City::new(name, state_id));
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn create_place_handler(
    city_id: String,
    body: Bytes,
    storage: Store,
) -> Result<Response, Rejection> {
    if let Err(response) = require_entity(&storage, EntityKind::City, &city_id).await {
        return Ok(response);
    }
    let payload = match parse_body(&body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let name = match required_string(&payload, "name") {
        Some(name) => name,
        None => return Ok(bad_request("Missing name")),
    };
    let user_id = match required_string(&payload, "user_id") {
        Some(user_id) => user_id,
        None => return Ok(bad_request("Missing user_id")),
    };
    if let Err(response) = require_entity(&storage, EntityKind::User, &user_id).await {
        return Ok(response);
    }
    let mut entity = Entity::Place(Place::new(name, city_id, user_id));
    entity.apply_patch(&payload);
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

async fn create_review_handler(
    place_id: String,
    body: Bytes,
    storage: Store,
) -> Result<Response, Rejection> {
    if let Err(response) = require_entity(&storage, EntityKind::Place, &place_id).await {
        return Ok(response);
    }
    let payload = match parse_body(&body) {
        Ok(map) => map,
        Err(response) => return Ok(response),
    };
    let user_id = match required_string(&payload, "user_id") {
        Some(user_id) => user_id,
        None => return Ok(bad_request("Missing user_id")),
    };
    if let Err(response) = require_entity(&storage, EntityKind::User, &user_id).await {
        return Ok(response);
    }
    let text = match required_string(&payload, "text") {
        Some(text) => text,
        None => return Ok(bad_request("Missing text")),
    };
    let entity = Entity::Review(Review::new(text, place_id, user_id));
    let stored = entity.clone();
    match run_blocking(move || persist(storage.as_ref(), &stored)).await {
        Ok(()) => Ok(entity_reply(StatusCode::CREATED, &entity)),
        Err(e) => Ok(storage_failure(e)),
    }
}

/// GET on a flat collection.
fn list_route(
    segment: &'static str,
    kind: EntityKind,
    storage: Store,
) -> BoxedFilter<(Response,)> {
    collection_path(segment)
        .and(warp::get())
        .and(with_storage(storage))
        .and_then(move |storage: Store| list_handler(kind, storage))
        .boxed()
}

/// GET/PUT/DELETE on a single item.
fn item_routes(
    segment: &'static str,
    kind: EntityKind,
    storage: Store,
) -> BoxedFilter<(Response,)> {
    let get = item_path(segment)
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(move |id: String, storage: Store| get_handler(kind, id, storage));

    let update = item_path(segment)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and_then(move |id: String, body: Value, storage: Store| {
            update_handler(kind, id, body, storage)
        });

    let delete = item_path(segment)
        .and(warp::delete())
        .and(with_storage(storage))
        .and_then(move |id: String, storage: Store| delete_handler(kind, id, storage));

    get.or(update).unify().or(delete).unify().boxed()
}

/// Every `/api/v1` route, composed over one shared storage handle.
pub fn api_routes(storage: Store) -> BoxedFilter<(Response,)> {
    let status = warp::path!("api" / "v1" / "status")
        .and(warp::get())
        .and_then(status_handler)
        .boxed();

    let stats = warp::path!("api" / "v1" / "stats")
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(stats_handler)
        .boxed();

    let create_state = collection_path("states")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and_then(create_state_handler)
        .boxed();

    let create_amenity = collection_path("amenities")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and_then(create_amenity_handler)
        .boxed();

    let create_user = collection_path("users")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_storage(storage.clone()))
        .and_then(create_user_handler)
        .boxed();

    let state_cities = nested_path("states", "cities")
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(|state_id: String, storage: Store| {
            nested_list_handler(
                EntityKind::State,
                state_id,
                EntityKind::City,
                |e| match e {
                    Entity::City(c) => Some(c.state_id.as_str()),
                    _ => None,
                },
                storage,
            )
        })
        .boxed();

    let create_city = nested_path("states", "cities")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_storage(storage.clone()))
        .and_then(create_city_handler)
        .boxed();

    let city_places = nested_path("cities", "places")
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(|city_id: String, storage: Store| {
            nested_list_handler(
                EntityKind::City,
                city_id,
                EntityKind::Place,
                |e| match e {
                    Entity::Place(p) => Some(p.city_id.as_str()),
                    _ => None,
                },
                storage,
            )
        })
        .boxed();

    let create_place = nested_path("cities", "places")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_storage(storage.clone()))
        .and_then(create_place_handler)
        .boxed();

    let place_reviews = nested_path("places", "reviews")
        .and(warp::get())
        .and(with_storage(storage.clone()))
        .and_then(|place_id: String, storage: Store| {
            nested_list_handler(
                EntityKind::Place,
                place_id,
                EntityKind::Review,
                |e| match e {
                    Entity::Review(r) => Some(r.place_id.as_str()),
                    _ => None,
                },
                storage,
            )
        })
        .boxed();

    let create_review = nested_path("places", "reviews")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_storage(storage.clone()))
        .and_then(create_review_handler)
        .boxed();

    status
        .or(stats)
        .unify()
        .or(list_route("states", EntityKind::State, storage.clone()))
        .unify()
        .or(create_state)
        .unify()
        .or(state_cities)
        .unify()
        .or(create_city)
        .unify()
        .or(item_routes("states", EntityKind::State, storage.clone()))
        .unify()
        .or(city_places)
        .unify()
        .or(create_place)
        .unify()
        .or(item_routes("cities", EntityKind::City, storage.clone()))
        .unify()
        .or(place_reviews)
        .unify()
        .or(create_review)
        .unify()
        .or(item_routes("places", EntityKind::Place, storage.clone()))
        .unify()
        .or(item_routes("reviews", EntityKind::Review, storage.clone()))
        .unify()
        .or(list_route("amenities", EntityKind::Amenity, storage.clone()))
        .unify()
        .or(create_amenity)
        .unify()
        .or(item_routes("amenities", EntityKind::Amenity, storage.clone()))
        .unify()
        .or(list_route("users", EntityKind::User, storage.clone()))
        .unify()
        .or(create_user)
        .unify()
        .or(item_routes("users", EntityKind::User, storage))
        .unify()
        .boxed()
}

/// Rejection handler: unmatched paths and methods become the API's JSON
/// 404; a body that would not deserialize becomes the 400 "Not a JSON".
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        return Ok(bad_request("Not a JSON"));
    }
    if err.is_not_found() || err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(not_found());
    }
    error!("Unhandled rejection: {:?}", err);
    Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
}
