#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gdpr_storage::{
    MemoryStore, PolicyServiceConfig, PolicyServiceConnection, ShardConnection, StorageError,
    StoreFlavor,
};
use parking_lot::Mutex;
use tracing::info;

use crate::config::DispatchConfig;
use crate::error::DispatchError;

/// One partition of the backing store and the single connection that owns it.
/// Callers routed to the same shard serialize on the connection.
pub struct Shard {
    index: usize,
    endpoint: String,
    flavor: StoreFlavor,
    conn: Mutex<Box<dyn ShardConnection>>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("endpoint", &self.endpoint)
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl Shard {
    pub fn new(index: usize, conn: Box<dyn ShardConnection>) -> Self {
        Self {
            index,
            endpoint: conn.endpoint().to_string(),
            flavor: conn.flavor(),
            conn: Mutex::new(conn),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn flavor(&self) -> StoreFlavor {
        self.flavor
    }

    pub fn with_connection<R>(&self, f: impl FnOnce(&mut dyn ShardConnection) -> R) -> R {
        let mut guard = self.conn.lock();
        f(&mut **guard)
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        self.with_connection(|c| c.commit())
    }

    pub fn close(&self) -> Result<(), StorageError> {
        self.with_connection(|c| c.close())
    }

    pub fn is_closed(&self) -> bool {
        self.with_connection(|c| c.is_closed())
    }
}

/// Opens the connection for one configured endpoint.
pub trait ShardConnector: Send + Sync {
    fn connect(
        &self,
        shard_index: usize,
        endpoint: &str,
        config: &DispatchConfig,
    ) -> Result<Box<dyn ShardConnection>, DispatchError>;
}

/// Connects `mem://<name>` endpoints to named in-process stores (created on
/// first use) and `http(s)://` endpoints to the policy service.
#[derive(Debug, Default)]
pub struct DefaultConnector {
    stores: Mutex<BTreeMap<String, MemoryStore>>,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-registers `store` so the caller keeps a handle on its tables.
    pub fn with_store(self, store: MemoryStore) -> Self {
        self.stores.lock().insert(store.name().to_string(), store);
        self
    }

    pub fn store(&self, name: &str) -> Option<MemoryStore> {
        self.stores.lock().get(name).cloned()
    }
}

impl ShardConnector for DefaultConnector {
    fn connect(
        &self,
        shard_index: usize,
        endpoint: &str,
        config: &DispatchConfig,
    ) -> Result<Box<dyn ShardConnection>, DispatchError> {
        match StoreFlavor::from_endpoint(endpoint) {
            Some(StoreFlavor::Memory) => {
                let name = endpoint.trim().trim_start_matches("mem://").to_string();
                if name.is_empty() {
                    return Err(DispatchError::Configuration(format!(
                        "shard {shard_index}: memory endpoint needs a store name"
                    )));
                }
                let store = self
                    .stores
                    .lock()
                    .entry(name.clone())
                    .or_insert_with(|| MemoryStore::new(name))
                    .clone();
                Ok(Box::new(store.connect(config.auto_commit)))
            }
            Some(StoreFlavor::PolicyService) => Ok(Box::new(PolicyServiceConnection::open(
                PolicyServiceConfig::new(endpoint.trim())
                    .with_credentials(config.credentials.clone()),
            ))),
            None => Err(DispatchError::Configuration(format!(
                "shard {shard_index}: unsupported endpoint {endpoint:?}"
            ))),
        }
    }
}

/// Shard set fixed at startup; index `i` owns `config.endpoints[i]`.
#[derive(Debug)]
pub struct ShardPool {
    shards: Vec<Arc<Shard>>,
}

impl ShardPool {
    pub fn open(
        config: &DispatchConfig,
        connector: &dyn ShardConnector,
    ) -> Result<Self, DispatchError> {
        let mut shards = Vec::with_capacity(config.endpoints.len());
        for (shard_index, endpoint) in config.endpoints.iter().enumerate() {
            let conn = connector.connect(shard_index, endpoint, config)?;
            info!(shard_index, endpoint = %endpoint, flavor = conn.flavor().as_str(), "shard opened");
            shards.push(Arc::new(Shard::new(shard_index, conn)));
        }
        if shards.is_empty() {
            return Err(DispatchError::Configuration(
                "shard pool must not be empty".to_string(),
            ));
        }
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Shard>> {
        self.shards.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.iter()
    }
}
