//! Web interface
//!
//! REST surface over the storage handle: route filters in `routes`, the
//! warp server wrapper in `web_server`.

pub mod routes;
pub mod web_server;

pub use routes::api_routes;
pub use web_server::WebServer;
