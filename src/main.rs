mod config;
mod config_sync;
mod console;
mod db;
mod message_log;
mod models;
mod mqtt_service;
mod router;
mod telemetry;

use crate::config::{Config, ConnectionSettings};
use crate::config_sync::ConfigSync;
use crate::console::{Console, ConsoleSink};
use crate::db::EventStore;
use crate::message_log::MessageLog;
use crate::mqtt_service::{RetryPolicy, SessionManager};
use crate::router::MessageRouter;
use crate::telemetry::TelemetryBuffers;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let store = match EventStore::new(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open event store: {:?}", e);
            return;
        }
    };

    if let Err(e) = store.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Event store ready at {}.", config.db_path.display());

    let settings = ConnectionSettings::load_or_default(&config.settings_path);

    let log = Arc::new(MessageLog::new());
    let (sink, events) = ConsoleSink::new(log);

    let session = SessionManager::new(
        sink.clone(),
        Duration::from_secs(config.mqtt_keep_alive_secs),
        RetryPolicy {
            max_retries: config.mqtt_max_retries,
            interval_ms: config.mqtt_retry_interval_ms,
        },
    );
    let sync = Arc::new(ConfigSync::new(session.clone(), config.topics.config.clone(), sink.clone()));
    let buffers = Arc::new(TelemetryBuffers::new());
    let router = Arc::new(MessageRouter::new(
        config.topics.clone(),
        buffers.clone(),
        store.clone(),
        sync.clone(),
        sink.clone(),
    ));

    let console = Console {
        config: config.clone(),
        settings: Mutex::new(settings),
        session: session.clone(),
        sync,
        router,
        store,
        buffers,
        sink,
    };

    console.start();

    tokio::select! {
        _ = console.run(events) => {
            info!("Console closed.");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to handle termination signal: {:?}", e);
            }
        }
    }

    info!("Shutting down...");
    session.disconnect();
    info!("Shut down successfully.");
}
