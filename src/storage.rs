// Appservice Storage
// Small key/value + set interface the runtime persists through, plus the
// bounded transaction dedup store layered on top of it

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Error types for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn status_code(&self) -> u16 {
        500
    }

    pub fn error_code(&self) -> &'static str {
        "M_UNKNOWN"
    }
}

/// Storage provider trait for different persistence backends
#[async_trait::async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn is_user_registered(&self, user_id: &str) -> Result<bool, StorageError>;
    async fn add_registered_user(&self, user_id: &str) -> Result<(), StorageError>;

    async fn is_transaction_completed(&self, txn_id: &str) -> Result<bool, StorageError>;
    async fn set_transaction_completed(&self, txn_id: &str) -> Result<(), StorageError>;
}

/// In-memory storage provider. The transaction set is capped the same way
/// the dedup layer caps its own copy, so neither side grows without bound.
pub struct MemoryStorageProvider {
    values: RwLock<HashMap<String, String>>,
    registered_users: RwLock<HashSet<String>>,
    transactions: RwLock<BoundedSet>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            registered_users: RwLock::new(HashSet::new()),
            transactions: RwLock::new(BoundedSet::new(DEFAULT_TRANSACTION_CAPACITY)),
        }
    }
}

impl Default for MemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.read().await;
        Ok(values.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn is_user_registered(&self, user_id: &str) -> Result<bool, StorageError> {
        let users = self.registered_users.read().await;
        Ok(users.contains(user_id))
    }

    async fn add_registered_user(&self, user_id: &str) -> Result<(), StorageError> {
        let mut users = self.registered_users.write().await;
        users.insert(user_id.to_string());
        Ok(())
    }

    async fn is_transaction_completed(&self, txn_id: &str) -> Result<bool, StorageError> {
        let transactions = self.transactions.read().await;
        Ok(transactions.contains(txn_id))
    }

    async fn set_transaction_completed(&self, txn_id: &str) -> Result<(), StorageError> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(txn_id);
        Ok(())
    }
}

/// How many recent transaction ids are remembered. Re-deliveries arrive
/// promptly, so a small window is enough to suppress them.
pub const DEFAULT_TRANSACTION_CAPACITY: usize = 128;

/// FIFO set with oldest-entry eviction.
struct BoundedSet {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashSet<String>,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashSet::with_capacity(capacity),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.entries.contains(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.entries.insert(id.to_string());
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Transaction dedup store. Owns the in-memory bound; the storage provider
/// is consulted first and written through, so a persistent backend can
/// recognize re-deliveries across restarts.
pub struct DedupStore {
    recent: RwLock<BoundedSet>,
    storage: Arc<dyn StorageProvider>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DedupStore {
    pub fn new(capacity: usize, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            recent: RwLock::new(BoundedSet::new(capacity)),
            storage,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, txn_id: &str) -> bool {
        {
            let recent = self.recent.read().await;
            if recent.contains(txn_id) {
                return true;
            }
        }
        match self.storage.is_transaction_completed(txn_id).await {
            Ok(completed) => completed,
            Err(error) => {
                tracing::warn!("Dedup lookup for {} failed: {}", txn_id, error);
                false
            }
        }
    }

    pub async fn mark(&self, txn_id: &str) {
        {
            let mut recent = self.recent.write().await;
            recent.insert(txn_id);
        }
        if let Err(error) = self.storage.set_transaction_completed(txn_id).await {
            tracing::warn!("Persisting completed transaction {} failed: {}", txn_id, error);
        }
    }

    /// Serialize re-entrant deliveries of the same transaction id: the
    /// second delivery waits until the first is marked complete.
    pub async fn acquire(&self, txn_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(txn_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the in-flight lock once a delivery settles. Late duplicates
    /// are caught by the marked-complete check instead.
    pub async fn release(&self, txn_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(txn_id);
    }
}
