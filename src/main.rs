use std::path::Path;

use clap::Parser;
use log::{error, info};

use roost::configuration::config::Config;
use roost::storage;
use roost::web_interface::WebServer;

#[derive(Parser)]
#[command(name = "roost")]
#[command(version = "0.1.0")]
#[command(about = "A place-rental API over file or database storage")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(env = "ROOST_CONFIG", default_value = "roost.toml")]
    config_file: String,
}

#[tokio::main]
async fn main() {
    // Example how to log
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration from {}", args.config_file);

    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };

    let store = match storage::build(&config.backend) {
        Ok(store) => store,
        Err(e) => {
            error!("Unable to initialize the storage backend: {}", e);
            std::process::exit(1);
        }
    };

    // Hydrate from whatever durable state already exists.
    let reload_store = store.clone();
    let reloaded =
        tokio::task::spawn_blocking(move || reload_store.reload()).await;
    match reloaded {
        Ok(Ok(())) => info!("Storage reloaded"),
        Ok(Err(e)) => {
            error!("Unable to reload storage: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Storage reload task failed: {}", e);
            std::process::exit(1);
        }
    }

    let server = WebServer::new(store.clone());
    if let Err(e) = server.start(config.bind_address).await {
        error!("Web server stopped with an error: {}", e);
    }

    if let Err(e) = store.close() {
        error!("Error while closing storage: {}", e);
    }
}
