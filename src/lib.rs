#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod transport;
pub mod whitelist;

use std::sync::Arc;

use log::{error, info};
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use thiserror::Error;

use cache::{CacheStore, DiskStore, MemoryStore, StoreError};
use config::{AppConfig, CacheBackend};
use transport::{CachingTransport, HttpOrigin};
use whitelist::Whitelist;

#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

pub fn build_store(config: &AppConfig) -> Result<Arc<dyn CacheStore>, StoreError> {
    match config.backend() {
        CacheBackend::Disk { path, max_bytes } => {
            let store = DiskStore::open(path.clone(), max_bytes)?;
            info!(
                "Disk cache at {} ({} of {} bytes used)",
                path.display(),
                store.total_bytes(),
                max_bytes
            );
            Ok(Arc::new(store))
        }
        CacheBackend::Memory => {
            info!("In-memory cache initialized");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn build_transport(
    config: &AppConfig,
    whitelist: Arc<Whitelist>,
) -> Result<CachingTransport, InitError> {
    let store = build_store(config)?;
    let origin = HttpOrigin::new(config.timeout(), &config.user_agent, whitelist)?;
    Ok(CachingTransport::new(Arc::new(origin), store))
}

/// Rocket instance with its state already built.
pub fn assemble(figment: Figment, whitelist: Whitelist, transport: CachingTransport) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(whitelist)
        .manage(transport)
        .mount("/", api::routes())
}

/// Rocket instance for `config`. Cache store failures abort ignition.
pub fn rocket(figment: Figment, config: AppConfig) -> Rocket<Build> {
    let whitelist = config.whitelist();
    if whitelist.is_open() {
        info!("No whitelist configured, every host is allowed");
    } else {
        info!("Whitelist holds {} host pattern(s)", whitelist.len());
    }

    let shared = Arc::new(whitelist.clone());
    rocket::custom(figment)
        .manage(whitelist)
        .attach(AdHoc::try_on_ignite("Cache transport", move |rocket| async move {
            match build_transport(&config, shared) {
                Ok(transport) => Ok(rocket.manage(transport)),
                Err(e) => {
                    error!("Failed to initialize cache transport: {}", e);
                    Err(rocket)
                }
            }
        }))
        .mount("/", api::routes())
}
