// Encryption Seams
// The runtime does not implement Olm/Megolm; it routes encrypted traffic
// and MSC3202 key material through a pluggable engine and persists per-room
// settings through a crypto store

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::{DeviceLists, FallbackKeyTypes, OneTimeKeyCounts, RoomEvent};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Crypto engine not prepared")]
    NotPrepared,

    #[error("Crypto engine error: {0}")]
    Engine(String),

    #[error("Crypto store error: {0}")]
    Store(String),
}

impl CryptoError {
    pub fn status_code(&self) -> u16 {
        500
    }

    pub fn error_code(&self) -> &'static str {
        "M_UNKNOWN"
    }
}

/// Per-room encryption settings, mirroring `m.room.encryption` content plus
/// the room's history visibility. An empty config means "not encrypted".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoomCryptoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_visibility: Option<String>,
}

impl RoomCryptoConfig {
    pub fn is_encrypted(&self) -> bool {
        self.algorithm.is_some()
    }
}

/// Persistence the crypto engine and room tracker share. The runtime stores
/// per-room settings and a device id here and treats everything else as
/// opaque engine state.
#[async_trait::async_trait]
pub trait CryptoStore: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomCryptoConfig>, CryptoError>;
    async fn store_room(&self, room_id: &str, config: RoomCryptoConfig)
        -> Result<(), CryptoError>;

    async fn read_device_id(&self) -> Result<Option<String>, CryptoError>;
    async fn set_device_id(&self, device_id: &str) -> Result<(), CryptoError>;

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;
    async fn set_blob(&self, key: &str, value: Vec<u8>) -> Result<(), CryptoError>;
}

/// The encryption engine the runtime routes through. Implementations own
/// all cryptographic state; the runtime only sequences calls.
#[async_trait::async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Bootstrap the engine. Called from `begin()` with the bot's current
    /// joined rooms before any encrypted traffic is routed.
    async fn prepare(&self, joined_room_ids: Vec<String>) -> Result<(), CryptoError>;

    fn is_ready(&self) -> bool;

    /// Encrypt an outbound event, returning the wire type and content to
    /// send (normally `m.room.encrypted`).
    async fn encrypt_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<(String, Value), CryptoError>;

    /// Decrypt an inbound `m.room.encrypted` event into its plaintext form.
    async fn decrypt_event(
        &self,
        room_id: &str,
        event: &RoomEvent,
    ) -> Result<RoomEvent, CryptoError>;

    /// Feed MSC3202 key material pushed alongside a transaction.
    async fn update_sync_data(
        &self,
        device_lists: Option<&DeviceLists>,
        otk_counts: Option<&OneTimeKeyCounts>,
        unused_fallback_keys: Option<&FallbackKeyTypes>,
    ) -> Result<(), CryptoError>;
}

/// In-memory crypto store, enough for tests and single-process runs.
pub struct MemoryCryptoStore {
    rooms: tokio::sync::RwLock<std::collections::HashMap<String, RoomCryptoConfig>>,
    device_id: tokio::sync::RwLock<Option<String>>,
    blobs: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryCryptoStore {
    pub fn new() -> Self {
        Self {
            rooms: tokio::sync::RwLock::new(std::collections::HashMap::new()),
            device_id: tokio::sync::RwLock::new(None),
            blobs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryCryptoStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CryptoStore for MemoryCryptoStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomCryptoConfig>, CryptoError> {
        let rooms = self.rooms.read().await;
        Ok(rooms.get(room_id).cloned())
    }

    async fn store_room(
        &self,
        room_id: &str,
        config: RoomCryptoConfig,
    ) -> Result<(), CryptoError> {
        let mut rooms = self.rooms.write().await;
        rooms.insert(room_id.to_string(), config);
        Ok(())
    }

    async fn read_device_id(&self) -> Result<Option<String>, CryptoError> {
        Ok(self.device_id.read().await.clone())
    }

    async fn set_device_id(&self, device_id: &str) -> Result<(), CryptoError> {
        *self.device_id.write().await = Some(device_id.to_string());
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(key).cloned())
    }

    async fn set_blob(&self, key: &str, value: Vec<u8>) -> Result<(), CryptoError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_string(), value);
        Ok(())
    }
}
