// Matrix Appservice System - Rust Application Service Runtime
// Receives homeserver transaction pushes and mediates outbound requests on
// behalf of the bot and namespaced virtual users

pub mod client;
pub mod crypto;
mod dispatch;
pub mod error;
pub mod events;
pub mod intent;
pub mod join_strategy;
pub mod namespace;
pub mod preprocessor;
pub mod registration;
pub mod room_tracker;
pub mod storage;

// Re-exports for clean API
pub use client::{ClientError, ClientFactory, HttpClientFactory, MatrixClient};
pub use crypto::{CryptoEngine, CryptoError, CryptoStore, MemoryCryptoStore, RoomCryptoConfig};
pub use error::{AppserviceError, Result};
pub use events::{
    AppserviceEvent, DeviceLists, MembershipState, QueryResponder, RoomEvent, Transaction,
    UserQueryResponse,
};
pub use intent::{Intent, IntentError, IntentRegistry};
pub use join_strategy::{AppserviceJoinStrategy, JoinStrategy, SimpleRetryStrategy};
pub use namespace::{NamespaceError, NamespaceMatcher};
pub use preprocessor::{EventKind, EventPreprocessor, PreprocessorError};
pub use registration::{Namespaces, Registration};
pub use room_tracker::RoomTracker;
pub use storage::{MemoryStorageProvider, StorageError, StorageProvider};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tower_http::trace::TraceLayer;

use preprocessor::PreprocessorPipeline;
use storage::{DedupStore, DEFAULT_TRANSACTION_CAPACITY};

/// Runtime configuration for the appservice
#[derive(Debug, Clone)]
pub struct AppserviceConfig {
    /// Address the transaction listener binds to, e.g. `0.0.0.0:9000`.
    pub bind_address: String,
    /// The homeserver's server name, used to derive full user-IDs.
    pub server_name: String,
    /// Base URL of the homeserver's client-server API.
    pub homeserver_url: String,
    pub registration: Registration,
}

/// Builder for an [`Appservice`], with pluggable storage, client factory,
/// join strategy and crypto seams.
pub struct AppserviceBuilder {
    config: AppserviceConfig,
    storage: Option<Arc<dyn StorageProvider>>,
    client_factory: Option<Arc<dyn ClientFactory>>,
    join_strategy: Option<Arc<dyn JoinStrategy>>,
    crypto_engine: Option<Arc<dyn CryptoEngine>>,
    crypto_store: Option<Arc<dyn CryptoStore>>,
}

impl AppserviceBuilder {
    pub fn new(config: AppserviceConfig) -> Self {
        Self {
            config,
            storage: None,
            client_factory: None,
            join_strategy: None,
            crypto_engine: None,
            crypto_store: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }

    pub fn join_strategy(mut self, strategy: Arc<dyn JoinStrategy>) -> Self {
        self.join_strategy = Some(strategy);
        self
    }

    pub fn crypto(mut self, engine: Arc<dyn CryptoEngine>, store: Arc<dyn CryptoStore>) -> Self {
        self.crypto_engine = Some(engine);
        self.crypto_store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Appservice> {
        let config = Arc::new(self.config);
        let namespaces = Arc::new(NamespaceMatcher::new(
            &config.registration,
            &config.server_name,
        )?);

        let client_factory: Arc<dyn ClientFactory> = match self.client_factory {
            Some(factory) => factory,
            None => Arc::new(HttpClientFactory::new(
                &config.homeserver_url,
                &config.registration.as_token,
            )?),
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorageProvider::new()));

        let bot_client = client_factory.client_for(namespaces.bot_user_id());
        let room_tracker = self
            .crypto_store
            .map(|store| Arc::new(RoomTracker::new(bot_client.clone(), store)));

        let join_strategy: Arc<dyn JoinStrategy> = match self.join_strategy {
            Some(strategy) => strategy,
            None => Arc::new(AppserviceJoinStrategy::new(
                namespaces.bot_user_id().to_string(),
                bot_client.clone(),
                Some(Arc::new(SimpleRetryStrategy::default())),
            )),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let intents = Arc::new(IntentRegistry::new(
            namespaces.clone(),
            client_factory,
            storage.clone(),
            join_strategy,
            self.crypto_engine.clone(),
            room_tracker.clone(),
            events_tx.clone(),
        ));
        let dedup = Arc::new(DedupStore::new(DEFAULT_TRANSACTION_CAPACITY, storage.clone()));
        let (shutdown, _) = watch::channel(false);

        let appservice = Appservice {
            config,
            namespaces,
            storage,
            intents,
            dedup,
            preprocessors: Arc::new(RwLock::new(PreprocessorPipeline::new())),
            bot_client,
            crypto: self.crypto_engine,
            room_tracker,
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            receiver_taken: Arc::new(AtomicBool::new(false)),
            key_claim_enabled: Arc::new(AtomicBool::new(false)),
            key_query_enabled: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
        };

        // The bot intent exists from startup; everything else is lazy.
        appservice.intents.bot_intent().await;
        Ok(appservice)
    }
}

/// Main appservice instance
/// Coordinates the namespace matcher, intent registry, dedup store and the
/// homeserver-facing transaction listener
#[derive(Clone)]
pub struct Appservice {
    config: Arc<AppserviceConfig>,
    namespaces: Arc<NamespaceMatcher>,
    storage: Arc<dyn StorageProvider>,
    intents: Arc<IntentRegistry>,
    dedup: Arc<DedupStore>,
    preprocessors: Arc<RwLock<PreprocessorPipeline>>,
    bot_client: Arc<dyn MatrixClient>,
    crypto: Option<Arc<dyn CryptoEngine>>,
    room_tracker: Option<Arc<RoomTracker>>,
    events_tx: mpsc::UnboundedSender<AppserviceEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<AppserviceEvent>>>>,
    receiver_taken: Arc<AtomicBool>,
    key_claim_enabled: Arc<AtomicBool>,
    key_query_enabled: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Appservice {
    pub async fn new(config: AppserviceConfig) -> Result<Self> {
        AppserviceBuilder::new(config).build().await
    }

    pub fn builder(config: AppserviceConfig) -> AppserviceBuilder {
        AppserviceBuilder::new(config)
    }

    pub fn registration(&self) -> &Registration {
        &self.config.registration
    }

    pub fn namespaces(&self) -> &NamespaceMatcher {
        &self.namespaces
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// The bot's own intent.
    pub async fn bot_intent(&self) -> Arc<Intent> {
        self.intents.bot_intent().await
    }

    pub(crate) fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub(crate) fn bot_client(&self) -> Arc<dyn MatrixClient> {
        self.bot_client.clone()
    }

    pub(crate) fn crypto(&self) -> Option<&Arc<dyn CryptoEngine>> {
        self.crypto.as_ref()
    }

    pub(crate) fn room_tracker(&self) -> Option<Arc<RoomTracker>> {
        self.room_tracker.clone()
    }

    /// Take the event stream. There is exactly one; the first caller owns it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AppserviceEvent>> {
        let mut slot = self.events_rx.lock().await;
        let receiver = slot.take();
        if receiver.is_some() {
            self.receiver_taken.store(true, Ordering::SeqCst);
        }
        receiver
    }

    pub(crate) fn emit(&self, event: AppserviceEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Emit a query event and wait for its one-shot answer. `None` when no
    /// listener exists or the listener dropped the responder.
    pub(crate) async fn query<T>(
        &self,
        build: impl FnOnce(QueryResponder<T>) -> AppserviceEvent,
    ) -> Option<T> {
        if !self.receiver_taken.load(Ordering::SeqCst) {
            return None;
        }
        let (responder, rx) = QueryResponder::channel();
        if self.events_tx.send(build(responder)).is_err() {
            return None;
        }
        rx.await.ok()
    }

    /// Register an event preprocessor. Runs after all previously added ones.
    pub async fn add_preprocessor(&self, preprocessor: Arc<dyn EventPreprocessor>) {
        self.preprocessors.write().await.add(preprocessor);
    }

    pub(crate) async fn run_preprocessors(
        &self,
        event: &mut RoomEvent,
        kind: EventKind,
    ) -> std::result::Result<(), PreprocessorError> {
        let pipeline = self.preprocessors.read().await;
        if pipeline.is_empty() {
            return Ok(());
        }
        pipeline.run(event, self.bot_client.as_ref(), kind).await
    }

    /// Expose the MSC3983 key-claim endpoint to the homeserver.
    pub fn enable_key_claim_forwarding(&self) {
        self.key_claim_enabled.store(true, Ordering::SeqCst);
    }

    /// Expose the MSC3984 key-query endpoint to the homeserver.
    pub fn enable_key_query_forwarding(&self) {
        self.key_query_enabled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn key_claim_enabled(&self) -> bool {
        self.key_claim_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn key_query_enabled(&self) -> bool {
        self.key_query_enabled.load(Ordering::SeqCst)
    }

    /// The homeserver-facing router: canonical `/_matrix/app/v1` paths plus
    /// the legacy un-prefixed forms, all behind hs_token authentication.
    pub fn create_router(&self) -> Router {
        let routes: Router<Appservice> = Router::new()
            .route("/transactions/:txn_id", put(dispatch::handle_transaction))
            .route("/users/:user_id", get(dispatch::handle_user_query))
            .route("/rooms/:room_alias", get(dispatch::handle_room_query))
            .route(
                "/thirdparty/protocol/:protocol",
                get(dispatch::handle_thirdparty_protocol),
            )
            .route(
                "/thirdparty/user/:protocol",
                get(dispatch::handle_thirdparty_user_remote),
            )
            .route(
                "/thirdparty/user",
                get(dispatch::handle_thirdparty_user_matrix),
            )
            .route(
                "/thirdparty/location/:protocol",
                get(dispatch::handle_thirdparty_location_remote),
            )
            .route(
                "/thirdparty/location",
                get(dispatch::handle_thirdparty_location_matrix),
            )
            .route(
                "/unstable/org.matrix.msc3983/keys/claim",
                post(dispatch::handle_key_claim),
            )
            .route(
                "/unstable/org.matrix.msc3984/keys/query",
                post(dispatch::handle_key_query),
            );

        Router::new()
            .nest("/_matrix/app/v1", routes.clone())
            .merge(routes)
            .fallback(dispatch::unknown_endpoint)
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                dispatch::authenticate,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Start serving. Registers the bot, bootstraps the crypto engine when
    /// one is plugged in, then binds the listener and returns.
    pub async fn begin(&self) -> Result<()> {
        let bot = self.intents.bot_intent().await;
        bot.ensure_registered().await?;

        if let Some(crypto) = &self.crypto {
            let joined_rooms = match bot.refresh_joined_rooms().await {
                Ok(rooms) => rooms,
                Err(error) => {
                    tracing::warn!("Could not fetch bot joined rooms: {}", error);
                    Vec::new()
                }
            };
            crypto.prepare(joined_rooms).await?;
            bot.mark_encryption_ready();
            tracing::info!("Crypto engine prepared");
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| AppserviceError::NetworkError(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AppserviceError::NetworkError(e.to_string()))?;
        tracing::info!("Appservice listening on {}", local_addr);

        let router = self.create_router();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Appservice listener failed: {}", error);
            }
        });

        Ok(())
    }

    /// Stop accepting new requests. In-flight handlers finish.
    pub fn stop(&self) {
        tracing::info!("Stopping appservice listener");
        let _ = self.shutdown.send(true);
    }
}
