use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use warp::Filter;

use crate::error_handling::types::WebError;
use crate::storage::storage_trait::Storage;
use crate::web_interface::routes::{api_routes, handle_rejection};

/// HTTP front end over a storage handle.
pub struct WebServer {
    storage: Arc<dyn Storage>,
}

impl WebServer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Serve the API until the process is stopped.
    pub async fn start(&self, addr: SocketAddr) -> Result<(), WebError> {
        let routes = api_routes(self.storage.clone()).recover(handle_rejection);

        info!("API listening on http://{}", addr);

        // Start server (warp 0.4)
        warp::serve(routes).run(addr).await;

        Ok(())
    }
}
