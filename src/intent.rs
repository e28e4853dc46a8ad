// Intent Registry and Intents
// One lazily-created intent per virtual user: a join-aware, registration-
// aware handle through which all acting-as-user operations flow

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::client::{ClientError, ClientFactory, MatrixClient};
use crate::crypto::{CryptoEngine, CryptoError};
use crate::events::AppserviceEvent;
use crate::join_strategy::{ClientJoinAttempt, JoinStrategy, JoinStrategyError};
use crate::namespace::{NamespaceError, NamespaceMatcher};
use crate::room_tracker::RoomTracker;
use crate::storage::{StorageError, StorageProvider};

#[derive(Error, Debug)]
pub enum IntentError {
    #[error("Registration failed: {0}")]
    Registration(ClientError),

    #[error("Join failed: {0}")]
    Join(#[from] JoinStrategyError),

    #[error("Homeserver call failed: {0}")]
    Client(#[from] ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),
}

impl IntentError {
    pub fn status_code(&self) -> u16 {
        match self {
            IntentError::Registration(e) => e.status_code(),
            IntentError::Join(e) => e.status_code(),
            IntentError::Client(e) => e.status_code(),
            IntentError::Storage(e) => e.status_code(),
            IntentError::Crypto(e) => e.status_code(),
            IntentError::Namespace(e) => e.status_code(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        "M_UNKNOWN"
    }
}

/// Per-virtual-user façade. Ensures the user exists and is in the target
/// room before acting, and routes sends through the crypto engine when the
/// room calls for it.
pub struct Intent {
    user_id: String,
    client: Arc<dyn MatrixClient>,
    storage: Arc<dyn StorageProvider>,
    join_strategy: Arc<dyn JoinStrategy>,
    crypto: Option<Arc<dyn CryptoEngine>>,
    room_tracker: Option<Arc<RoomTracker>>,
    registered: AtomicBool,
    encryption_ready: AtomicBool,
    register_lock: Mutex<()>,
    joined_rooms: RwLock<HashSet<String>>,
}

impl Intent {
    fn new(
        user_id: String,
        client: Arc<dyn MatrixClient>,
        storage: Arc<dyn StorageProvider>,
        join_strategy: Arc<dyn JoinStrategy>,
        crypto: Option<Arc<dyn CryptoEngine>>,
        room_tracker: Option<Arc<RoomTracker>>,
    ) -> Self {
        Self {
            user_id,
            client,
            storage,
            join_strategy,
            crypto,
            room_tracker,
            registered: AtomicBool::new(false),
            encryption_ready: AtomicBool::new(false),
            register_lock: Mutex::new(()),
            joined_rooms: RwLock::new(HashSet::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The underlying client, impersonating this intent's user.
    pub fn client(&self) -> Arc<dyn MatrixClient> {
        self.client.clone()
    }

    pub fn is_encryption_ready(&self) -> bool {
        self.encryption_ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_encryption_ready(&self) {
        self.encryption_ready.store(true, Ordering::SeqCst);
    }

    fn localpart(&self) -> &str {
        let trimmed = self.user_id.strip_prefix('@').unwrap_or(&self.user_id);
        trimmed.split(':').next().unwrap_or(trimmed)
    }

    /// Register the user if needed. Concurrent callers coalesce on one
    /// registration request; an "already exists" answer counts as success.
    pub async fn ensure_registered(&self) -> Result<(), IntentError> {
        if self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.register_lock.lock().await;
        if self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.storage.is_user_registered(&self.user_id).await? {
            self.registered.store(true, Ordering::SeqCst);
            return Ok(());
        }

        match self.client.register(self.localpart()).await {
            Ok(()) => {}
            Err(error) if error.is_user_in_use() => {
                tracing::debug!("{} already registered on the homeserver", self.user_id);
            }
            Err(error) => return Err(IntentError::Registration(error)),
        }

        self.storage.add_registered_user(&self.user_id).await?;
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Join the room unless the cached membership already says we are in.
    /// Returns the resolved room id.
    pub async fn ensure_joined(&self, room_id_or_alias: &str) -> Result<String, IntentError> {
        let room_id = self.client.resolve_room(room_id_or_alias).await?;
        {
            let joined = self.joined_rooms.read().await;
            if joined.contains(&room_id) {
                return Ok(room_id);
            }
        }
        self.join_room(room_id_or_alias).await
    }

    /// Unconditional join through the configured join strategy.
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String, IntentError> {
        let attempt = ClientJoinAttempt::new(self.client.clone());
        let room_id = self
            .join_strategy
            .join(room_id_or_alias, &self.user_id, &attempt)
            .await?;
        self.note_joined(&room_id).await;
        Ok(room_id)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), IntentError> {
        self.client.leave_room(room_id).await?;
        self.note_left(room_id).await;
        Ok(())
    }

    /// Send an event, registering and joining first. Sends into encrypted
    /// rooms go through the crypto engine.
    pub async fn send_event(
        &self,
        room_id_or_alias: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, IntentError> {
        self.ensure_registered().await?;
        let room_id = self.ensure_joined(room_id_or_alias).await?;

        if let (Some(crypto), Some(tracker)) = (&self.crypto, &self.room_tracker) {
            let config = tracker.get_room_crypto_config(&room_id).await;
            if config.is_encrypted() {
                if !crypto.is_ready() {
                    return Err(IntentError::Crypto(CryptoError::NotPrepared));
                }
                let (wire_type, wire_content) =
                    crypto.encrypt_event(&room_id, event_type, content).await?;
                let event_id = self
                    .client
                    .send_event(&room_id, &wire_type, wire_content)
                    .await?;
                return Ok(event_id);
            }
        }

        let event_id = self.client.send_event(&room_id, event_type, content).await?;
        Ok(event_id)
    }

    /// Replace the joined-rooms cache with the homeserver's current list.
    pub async fn refresh_joined_rooms(&self) -> Result<Vec<String>, IntentError> {
        let rooms = self.client.get_joined_rooms().await?;
        let mut joined = self.joined_rooms.write().await;
        joined.clear();
        joined.extend(rooms.iter().cloned());
        Ok(rooms)
    }

    pub async fn is_joined(&self, room_id: &str) -> bool {
        self.joined_rooms.read().await.contains(room_id)
    }

    pub(crate) async fn note_joined(&self, room_id: &str) {
        self.joined_rooms.write().await.insert(room_id.to_string());
    }

    pub(crate) async fn note_left(&self, room_id: &str) {
        self.joined_rooms.write().await.remove(room_id);
    }
}

/// Owns the one-intent-per-user map. Creation is lazy; every new intent is
/// announced exactly once.
pub struct IntentRegistry {
    intents: RwLock<HashMap<String, Arc<Intent>>>,
    namespaces: Arc<NamespaceMatcher>,
    factory: Arc<dyn ClientFactory>,
    storage: Arc<dyn StorageProvider>,
    join_strategy: Arc<dyn JoinStrategy>,
    crypto: Option<Arc<dyn CryptoEngine>>,
    room_tracker: Option<Arc<RoomTracker>>,
    events_tx: mpsc::UnboundedSender<AppserviceEvent>,
}

impl IntentRegistry {
    pub fn new(
        namespaces: Arc<NamespaceMatcher>,
        factory: Arc<dyn ClientFactory>,
        storage: Arc<dyn StorageProvider>,
        join_strategy: Arc<dyn JoinStrategy>,
        crypto: Option<Arc<dyn CryptoEngine>>,
        room_tracker: Option<Arc<RoomTracker>>,
        events_tx: mpsc::UnboundedSender<AppserviceEvent>,
    ) -> Self {
        Self {
            intents: RwLock::new(HashMap::new()),
            namespaces,
            factory,
            storage,
            join_strategy,
            crypto,
            room_tracker,
            events_tx,
        }
    }

    /// The cached intent for the user, or a freshly built one. All callers
    /// observe the same intent for a given user id.
    pub async fn get_intent(&self, user_id: &str) -> Arc<Intent> {
        {
            let intents = self.intents.read().await;
            if let Some(intent) = intents.get(user_id) {
                return intent.clone();
            }
        }

        let mut intents = self.intents.write().await;
        if let Some(intent) = intents.get(user_id) {
            return intent.clone();
        }

        let intent = Arc::new(Intent::new(
            user_id.to_string(),
            self.factory.client_for(user_id),
            self.storage.clone(),
            self.join_strategy.clone(),
            self.crypto.clone(),
            self.room_tracker.clone(),
        ));
        intents.insert(user_id.to_string(), intent.clone());
        let _ = self.events_tx.send(AppserviceEvent::IntentNew(intent.clone()));
        intent
    }

    /// The intent for a user addressed by namespace suffix.
    pub async fn get_intent_for_suffix(
        &self,
        suffix: &str,
    ) -> Result<Arc<Intent>, NamespaceError> {
        let user_id = self.namespaces.user_id_for_suffix(suffix)?;
        Ok(self.get_intent(&user_id).await)
    }

    pub async fn bot_intent(&self) -> Arc<Intent> {
        self.get_intent(self.namespaces.bot_user_id()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{remote_error, MockClientFactory, MockMatrixClient};
    use crate::crypto::mock::MockCryptoEngine;
    use crate::crypto::{CryptoStore, MemoryCryptoStore, RoomCryptoConfig};
    use crate::registration::{NamespaceEntry, Namespaces, Registration};
    use crate::storage::MemoryStorageProvider;
    use serde_json::json;
    use std::time::Duration;

    fn test_registration() -> Registration {
        Registration {
            id: "bridge".to_string(),
            url: None,
            as_token: "as".to_string(),
            hs_token: "hs".to_string(),
            sender_localpart: "_bridge_bot".to_string(),
            namespaces: Namespaces {
                users: vec![NamespaceEntry {
                    exclusive: true,
                    regex: "@_bridge_.*:example.org".to_string(),
                }],
                rooms: vec![],
                aliases: vec![],
            },
            protocols: None,
            rate_limited: None,
            push_ephemeral: None,
        }
    }

    struct Harness {
        registry: Arc<IntentRegistry>,
        client: Arc<MockMatrixClient>,
        events_rx: mpsc::UnboundedReceiver<AppserviceEvent>,
    }

    fn harness() -> Harness {
        harness_with_crypto(None, None)
    }

    fn harness_with_crypto(
        crypto: Option<Arc<MockCryptoEngine>>,
        store: Option<Arc<MemoryCryptoStore>>,
    ) -> Harness {
        let namespaces = Arc::new(
            NamespaceMatcher::new(&test_registration(), "example.org").unwrap(),
        );
        let factory = MockClientFactory::new();
        let client = factory.client.clone();
        let crypto_engine = crypto.map(|engine| -> Arc<dyn CryptoEngine> { engine });
        let room_tracker = store.map(|s| {
            let tracker_client: Arc<dyn MatrixClient> = client.clone();
            Arc::new(RoomTracker::new(tracker_client, s))
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(IntentRegistry::new(
            namespaces,
            Arc::new(factory),
            Arc::new(MemoryStorageProvider::new()),
            Arc::new(crate::join_strategy::SimpleRetryStrategy::new(vec![
                Duration::ZERO,
            ])),
            crypto_engine,
            room_tracker,
            events_tx,
        ));
        Harness {
            registry,
            client,
            events_rx,
        }
    }

    fn drain_intent_new(rx: &mut mpsc::UnboundedReceiver<AppserviceEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppserviceEvent::IntentNew(intent) = event {
                seen.push(intent.user_id().to_string());
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_intent_identity() {
        let mut h = harness();

        let first = h.registry.get_intent("@_bridge_a:example.org").await;
        let second = h.registry.get_intent("@_bridge_a:example.org").await;
        let other = h.registry.get_intent("@_bridge_b:example.org").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        let announced = drain_intent_new(&mut h.events_rx);
        assert_eq!(
            announced,
            vec!["@_bridge_a:example.org", "@_bridge_b:example.org"]
        );
    }

    #[tokio::test]
    async fn test_intent_for_suffix_and_bot() {
        let h = harness();

        let by_suffix = h.registry.get_intent_for_suffix("alice").await.unwrap();
        assert_eq!(by_suffix.user_id(), "@_bridge_alice:example.org");

        let bot = h.registry.bot_intent().await;
        assert_eq!(bot.user_id(), "@_bridge_bot:example.org");
    }

    #[tokio::test]
    async fn test_ensure_registered_once() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        intent.ensure_registered().await.unwrap();
        intent.ensure_registered().await.unwrap();

        assert_eq!(h.client.count_calls("register:").await, 1);
        assert_eq!(h.client.count_calls("register:_bridge_a").await, 1);
    }

    #[tokio::test]
    async fn test_ensure_registered_skips_known_users() {
        let namespaces = Arc::new(
            NamespaceMatcher::new(&test_registration(), "example.org").unwrap(),
        );
        let factory = MockClientFactory::new();
        let client = factory.client.clone();
        let storage = Arc::new(MemoryStorageProvider::new());
        storage
            .add_registered_user("@_bridge_known:example.org")
            .await
            .unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = IntentRegistry::new(
            namespaces,
            Arc::new(factory),
            storage,
            Arc::new(crate::join_strategy::SimpleRetryStrategy::new(vec![
                Duration::ZERO,
            ])),
            None,
            None,
            events_tx,
        );

        let intent = registry.get_intent("@_bridge_known:example.org").await;
        intent.ensure_registered().await.unwrap();

        assert_eq!(client.count_calls("register:").await, 0);
    }

    #[tokio::test]
    async fn test_ensure_registered_recovers_user_in_use() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;
        *h.client.register_failure.lock().await = Some(remote_error(400, "M_USER_IN_USE"));

        intent.ensure_registered().await.unwrap();
        // Recovered and cached: no further attempt.
        intent.ensure_registered().await.unwrap();
        assert_eq!(h.client.count_calls("register:").await, 1);
    }

    #[tokio::test]
    async fn test_ensure_registered_propagates_other_errors() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;
        *h.client.register_failure.lock().await = Some(remote_error(500, "M_UNKNOWN"));

        let result = intent.ensure_registered().await;
        assert!(matches!(result, Err(IntentError::Registration(_))));

        // Not cached as registered; the next call retries.
        intent.ensure_registered().await.unwrap();
        assert_eq!(h.client.count_calls("register:").await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ensure_registered_coalesces_concurrent_callers() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let intent = intent.clone();
            tasks.push(tokio::spawn(async move { intent.ensure_registered().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.client.count_calls("register:").await, 1);
    }

    #[tokio::test]
    async fn test_ensure_joined_caches_membership() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        let room = intent.ensure_joined("!r:example.org").await.unwrap();
        assert_eq!(room, "!r:example.org");
        assert!(intent.is_joined("!r:example.org").await);

        intent.ensure_joined("!r:example.org").await.unwrap();
        assert_eq!(h.client.count_calls("join:").await, 1);
    }

    #[tokio::test]
    async fn test_ensure_joined_resolves_aliases() {
        let h = harness();
        h.client.resolve_aliases.lock().await.insert(
            "#chan:example.org".to_string(),
            "!resolved:example.org".to_string(),
        );
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        // Mark as joined under the resolved id; the alias must hit the cache.
        intent.note_joined("!resolved:example.org").await;
        let room = intent.ensure_joined("#chan:example.org").await.unwrap();

        assert_eq!(room, "!resolved:example.org");
        assert_eq!(h.client.count_calls("join:").await, 0);
    }

    #[tokio::test]
    async fn test_leave_room_clears_cache() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        intent.ensure_joined("!r:example.org").await.unwrap();
        intent.leave_room("!r:example.org").await.unwrap();
        assert!(!intent.is_joined("!r:example.org").await);

        intent.ensure_joined("!r:example.org").await.unwrap();
        assert_eq!(h.client.count_calls("join:").await, 2);
        assert_eq!(h.client.count_calls("leave:!r:example.org").await, 1);
    }

    #[tokio::test]
    async fn test_send_event_plain_room() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        let event_id = intent
            .send_event("!r:example.org", "m.room.message", json!({"body": "hi"}))
            .await
            .unwrap();

        assert_eq!(event_id, "$sent:example.org");
        assert_eq!(h.client.count_calls("register:").await, 1);
        assert_eq!(h.client.count_calls("join:").await, 1);
        assert_eq!(
            h.client.count_calls("send:!r:example.org:m.room.message").await,
            1
        );
    }

    #[tokio::test]
    async fn test_send_event_encrypted_room() {
        let crypto = Arc::new(MockCryptoEngine::new());
        let store = Arc::new(MemoryCryptoStore::new());
        store
            .store_room(
                "!enc:example.org",
                RoomCryptoConfig {
                    algorithm: Some("m.megolm.v1.aes-sha2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let h = harness_with_crypto(Some(crypto.clone()), Some(store));
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        intent
            .send_event("!enc:example.org", "m.room.message", json!({"body": "hi"}))
            .await
            .unwrap();

        assert_eq!(
            crypto.encrypted.lock().await.as_slice(),
            &[("!enc:example.org".to_string(), "m.room.message".to_string())]
        );
        assert_eq!(
            h.client
                .count_calls("send:!enc:example.org:m.room.encrypted")
                .await,
            1
        );
        assert_eq!(
            h.client
                .count_calls("send:!enc:example.org:m.room.message")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_send_event_encrypted_room_engine_not_ready() {
        let crypto = Arc::new(MockCryptoEngine::new());
        crypto
            .ready
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let store = Arc::new(MemoryCryptoStore::new());
        store
            .store_room(
                "!enc:example.org",
                RoomCryptoConfig {
                    algorithm: Some("m.megolm.v1.aes-sha2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let h = harness_with_crypto(Some(crypto), Some(store));
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;

        let result = intent
            .send_event("!enc:example.org", "m.room.message", json!({"body": "hi"}))
            .await;
        assert!(matches!(
            result,
            Err(IntentError::Crypto(CryptoError::NotPrepared))
        ));
    }

    #[tokio::test]
    async fn test_refresh_joined_rooms_replaces_cache() {
        let h = harness();
        let intent = h.registry.get_intent("@_bridge_a:example.org").await;
        intent.note_joined("!stale:example.org").await;

        *h.client.joined_rooms.lock().await = vec!["!fresh:example.org".to_string()];
        let rooms = intent.refresh_joined_rooms().await.unwrap();

        assert_eq!(rooms, vec!["!fresh:example.org"]);
        assert!(intent.is_joined("!fresh:example.org").await);
        assert!(!intent.is_joined("!stale:example.org").await);
    }
}
