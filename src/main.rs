#[macro_use]
extern crate rocket;

use std::process;

use dotenv::dotenv;
use env_logger::Env;
use imageproxy::config::{self, AppConfig};
use log::{error, info};

#[launch]
fn rocket() -> _ {
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Load config
    let figment = config::figment();
    let config = match figment.extract::<AppConfig>() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };
    info!("Configuration loaded successfully");

    info!(
        "Starting image proxy on {}:{} (timeout {}s)",
        config.address, config.port, config.timeout
    );

    imageproxy::rocket(figment, config)
}
