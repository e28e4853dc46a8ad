// Matrix Appservice Server
// Loads a registration file, starts the transaction listener and logs the
// event stream

use std::env;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matrix_appservice_system::{
    Appservice, AppserviceConfig, AppserviceEvent, Registration,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matrix_appservice_system=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Matrix Appservice Server (Rust-based)");

    let config = load_appservice_config()?;

    info!("🌐 Server Name: {}", config.server_name);
    info!("🏠 Homeserver: {}", config.homeserver_url);
    info!("🤖 Bot: @{}:{}", config.registration.sender_localpart, config.server_name);

    let bind_address = config.bind_address.clone();
    let appservice = Appservice::new(config).await?;

    let mut events = match appservice.take_events().await {
        Some(events) => events,
        None => {
            error!("❌ Event stream already taken");
            std::process::exit(1);
        }
    };

    if let Err(e) = appservice.begin().await {
        error!("❌ Appservice failed to start: {}", e);
        std::process::exit(1);
    }

    info!("🎯 Appservice listening on {}", bind_address);
    info!("📨 Ready for homeserver transactions");

    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(event);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    appservice.stop();
    event_logger.abort();

    Ok(())
}

fn load_appservice_config() -> Result<AppserviceConfig, Box<dyn std::error::Error>> {
    // Load configuration from environment variables with sensible defaults
    let registration_path =
        env::var("REGISTRATION_FILE").unwrap_or_else(|_| "registration.yaml".to_string());
    let registration = Registration::from_file(&registration_path)?;

    let config = AppserviceConfig {
        bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:9000".to_string()),
        server_name: env::var("SERVER_NAME").unwrap_or_else(|_| "localhost".to_string()),
        homeserver_url: env::var("HOMESERVER_URL")
            .unwrap_or_else(|_| "http://localhost:8008".to_string()),
        registration,
    };

    info!("📋 Configuration loaded:");
    info!("   Registration: {}", registration_path);
    info!("   Bind address: {}", config.bind_address);

    Ok(config)
}

fn log_event(event: AppserviceEvent) {
    match event {
        AppserviceEvent::RoomMessage { room_id, event } => {
            let body = event
                .content
                .get("body")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("<no body>");
            info!("💬 [{}] {}: {}", room_id, event.sender.as_deref().unwrap_or("?"), body);
        }
        AppserviceEvent::RoomJoin { room_id, event } => {
            info!("➕ {} joined {}", event.state_key.as_deref().unwrap_or("?"), room_id);
        }
        AppserviceEvent::RoomLeave { room_id, event } => {
            info!("➖ {} left {}", event.state_key.as_deref().unwrap_or("?"), room_id);
        }
        AppserviceEvent::RoomInvite { room_id, event } => {
            info!("✉️ {} invited to {}", event.state_key.as_deref().unwrap_or("?"), room_id);
        }
        AppserviceEvent::IntentNew(intent) => {
            info!("👤 New intent: {}", intent.user_id());
        }
        AppserviceEvent::RoomFailedDecryption { room_id, error, .. } => {
            warn!("🔒 Failed to decrypt event in {}: {}", room_id, error);
        }
        AppserviceEvent::QueryUser { user_id, responder } => {
            // This runtime provisions nothing on its own.
            info!("❓ User query for {}", user_id);
            responder.respond(None);
        }
        AppserviceEvent::QueryRoom { alias, responder } => {
            info!("❓ Room query for {}", alias);
            responder.respond(None);
        }
        _ => {}
    }
}
