//!
//! src/cache.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Response cache: the key->ttl store abstraction, an in-memory moka store,
//! versioned batch keys and the read-through wrapper used by every endpoint
//!

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::form_urlencoded::byte_serialize;

use crate::aggregate::distinct;
use crate::errors::AggregatorError;
use crate::types::Identifier;

/// Generic key -> bytes store with per entry ttl. Expiry is the store's job;
/// it may also evict early, so readers must tolerate a miss at any time
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AggregatorError>;

    /// ttl of 0 keeps the entry until evicted
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64)
        -> Result<(), AggregatorError>;
}

#[derive(Clone)]
struct StoredValue {
    bytes: Arc<[u8]>,
    ttl: Option<Duration>
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant)
        -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process store, bounded by entry count
#[derive(Clone)]
pub struct MemoryStore {
    cache: MokaCache<String, StoredValue>
}

impl MemoryStore {
    pub fn new(max_entries: u64) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        debug!(max_entries, "cache.memory.created");
        Self { cache }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AggregatorError> {
        Ok(self.cache.get(key).await.map(|v| v.bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64)
        -> Result<(), AggregatorError> {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        let stored = StoredValue { bytes: Arc::from(value), ttl };
        self.cache.insert(key.to_string(), stored).await;
        Ok(())
    }
}

/// Which aggregation a cached blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ProfileInfo,
    RecentTracks,
    Compatibility,
    Stations,
    UserInfo
}

impl Endpoint {
    /// Path segment under /aggregate/
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::ProfileInfo   => "profile-info",
            Endpoint::RecentTracks  => "recent-tracks",
            Endpoint::Compatibility => "compatibility",
            Endpoint::Stations      => "stations",
            Endpoint::UserInfo      => "user-info"
        }
    }

    /// Bump when the cached shape of an endpoint changes
    pub fn version(self) -> u8 {
        match self {
            Endpoint::ProfileInfo   => 3,
            Endpoint::RecentTracks  => 3,
            Endpoint::Compatibility => 3,
            Endpoint::Stations      => 2,
            Endpoint::UserInfo      => 2
        }
    }
}

/// Deterministic key for one batch request. Identifiers are de-duplicated
/// and sorted, so the same set always maps to the same key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub endpoint: Endpoint,
    pub ids: Vec<Identifier>,
    pub subject: Option<Identifier>
}

impl CacheKey {
    pub fn new(endpoint: Endpoint, ids: &[Identifier], subject: Option<&Identifier>) -> Self {
        Self { endpoint, ids: distinct(ids), subject: subject.cloned() }
    }
}

// Components are form-encoded so `:`, `=` and `,` inside an identifier can
// never be mistaken for separators
fn encode(id: &Identifier) -> String {
    byte_serialize(id.as_str().as_bytes()).collect()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.endpoint.path(), self.endpoint.version())?;
        if let Some(subject) = &self.subject {
            write!(f, ":subject={}", encode(subject))?;
        }
        if !self.ids.is_empty() {
            let joined = self.ids.iter()
                .map(encode)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, ":ids={joined}")?;
        }
        Ok(())
    }
}

/// What a producer hands back: the value and whether it is complete
/// enough to be cached under the endpoint's policy
#[derive(Debug)]
pub struct Produced<R> {
    pub value: R,
    pub complete: bool
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
    Bypass
}

impl Lookup {
    pub fn as_str(self) -> &'static str {
        match self {
            Lookup::Hit    => "hit",
            Lookup::Miss   => "miss",
            Lookup::Bypass => "bypass"
        }
    }
}

/// Encoded json body, either straight from the store or freshly produced
#[derive(Debug, Clone)]
pub struct CachedBody {
    pub body: Vec<u8>,
    pub lookup: Lookup
}

impl CachedBody {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, AggregatorError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Clone)]
pub struct ReadThrough {
    store: Arc<dyn CacheStore>,
    writes: TaskTracker,
    // settle closes and reopens the shared tracker, one caller at a time
    settling: Arc<Mutex<()>>
}

impl ReadThrough {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store, writes: TaskTracker::new(), settling: Arc::new(Mutex::new(())) }
    }

    /// Serves `key` from the store, or runs `produce` and stores its value
    /// when it reports completeness. Bypass never touches the store
    pub async fn cached<R, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_seconds: u64,
        bypass: bool,
        produce: F
    ) -> Result<CachedBody, AggregatorError>
    where
        R: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Produced<R>, AggregatorError>>
    {
        let key = key.to_string();

        if bypass {
            info!(key = %key, "cache.bypass");
            let produced = produce().await?;
            let body = serde_json::to_vec(&produced.value)?;
            return Ok( CachedBody { body, lookup: Lookup::Bypass } );
        }

        match self.store.get(&key).await {
            Ok(Some(body)) => {
                info!(key = %key, bytes = body.len(), "cache.hit");
                return Ok( CachedBody { body, lookup: Lookup::Hit } );
            }
            Ok(None) => debug!(key = %key, "cache.miss"),
            Err(e) => warn!(key = %key, error = %e, "cache.get.failed"),
        }

        let produced = produce().await?;
        let body = serde_json::to_vec(&produced.value)?;

        if produced.complete {
            let store = self.store.clone();
            let value = body.clone();
            self.writes.spawn(async move {
                match store.set(&key, value, ttl_seconds).await {
                    Ok(()) => info!(key = %key, ttl = ttl_seconds, "cache.write"),
                    Err(e) => warn!(key = %key, error = %e, "cache.write.failed"),
                }
            });
        } else {
            warn!(key = %key, "cache.write.skipped");
        }

        Ok( CachedBody { body, lookup: Lookup::Miss } )
    }

    /// Waits for every write spawned so far. Safe to call concurrently
    pub async fn settle(&self) {
        let _settling = self.settling.lock().await;
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }
}
