// Room Encryption Tracker
// Keeps a per-room encryption-config cache current from the event stream
// and serves it to intents deciding whether to encrypt outbound sends

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::MatrixClient;
use crate::crypto::{CryptoStore, RoomCryptoConfig};

/// Watches joins and `m.room.encryption` state and refreshes the stored
/// config from the homeserver. Refreshes are deduplicated by room id and
/// never run concurrently for the same room.
pub struct RoomTracker {
    client: Arc<dyn MatrixClient>,
    store: Arc<dyn CryptoStore>,
    queued: Mutex<HashSet<String>>,
    room_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoomTracker {
    pub fn new(client: Arc<dyn MatrixClient>, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            client,
            store,
            queued: Mutex::new(HashSet::new()),
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn room_lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.room_locks.lock().await;
        locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Schedule a background refresh for the room. A refresh already queued
    /// for the same room absorbs this request.
    pub async fn queue_refresh(tracker: &Arc<RoomTracker>, room_id: &str) {
        {
            let mut queued = tracker.queued.lock().await;
            if !queued.insert(room_id.to_string()) {
                return;
            }
        }
        let tracker = tracker.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            let lock = tracker.room_lock(&room_id).await;
            let _guard = lock.lock().await;
            tracker.queued.lock().await.remove(&room_id);
            tracker.refresh(&room_id).await;
        });
    }

    /// The stored config for a room. When nothing is stored yet, one
    /// refresh runs inline and the store is re-read; an empty config means
    /// the room is not encrypted.
    pub async fn get_room_crypto_config(&self, room_id: &str) -> RoomCryptoConfig {
        match self.store.get_room(room_id).await {
            Ok(Some(config)) => return config,
            Ok(None) => {}
            Err(error) => {
                tracing::warn!("Reading crypto config for {} failed: {}", room_id, error);
                return RoomCryptoConfig::default();
            }
        }

        let lock = self.room_lock(room_id).await;
        let _guard = lock.lock().await;
        // A queued refresh may have landed while we waited for the lock.
        if let Ok(Some(config)) = self.store.get_room(room_id).await {
            return config;
        }
        self.refresh(room_id).await;
        match self.store.get_room(room_id).await {
            Ok(Some(config)) => config,
            _ => RoomCryptoConfig::default(),
        }
    }

    async fn refresh(&self, room_id: &str) {
        let mut config = match self
            .client
            .get_room_state_event(room_id, "m.room.encryption", "")
            .await
        {
            Ok(content) => match serde_json::from_value::<RoomCryptoConfig>(content) {
                Ok(config) => config,
                Err(error) => {
                    tracing::warn!(
                        "Malformed m.room.encryption content in {}: {}",
                        room_id,
                        error
                    );
                    RoomCryptoConfig::default()
                }
            },
            Err(error) if error.status_code() == 404 => RoomCryptoConfig::default(),
            Err(error) => {
                tracing::warn!("Refreshing crypto config for {} failed: {}", room_id, error);
                return;
            }
        };

        if let Ok(content) = self
            .client
            .get_room_state_event(room_id, "m.room.history_visibility", "")
            .await
        {
            config.history_visibility = content
                .get("history_visibility")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
        }

        if let Err(error) = self.store.store_room(room_id, config).await {
            tracing::warn!("Storing crypto config for {} failed: {}", room_id, error);
        }
    }
}
