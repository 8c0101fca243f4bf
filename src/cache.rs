//! Best-effort response cache.
//!
//! `CacheStore` is the raw, fallible key-value interface with a Redis
//! implementation. `ResponseCache` sits on top of it, speaks in
//! `NormalizedPackageData`, and swallows every backend failure: a broken
//! cache only ever looks like a miss.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CacheError, InsightError};
use crate::models::{LookupKey, NormalizedPackageData};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Releases backend resources. Called once on process shutdown.
    async fn shutdown(&self) {}
}

pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Slot {
    /// Bumped on every successful dial.
    generation: u64,
    conn: Option<MultiplexedConnection>,
}

/// Redis-backed store. The connection is opened on first use and reopened
/// after the previous one drops. Dialling and every command are bounded by
/// `timeout`, so a stalled server looks like any other cache failure.
pub struct RedisCacheStore {
    client: redis::Client,
    timeout: Duration,
    slot: Mutex<Slot>,
}

impl RedisCacheStore {
    /// Parses the URL only; nothing is dialled until the first operation.
    pub fn new(url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            timeout: DEFAULT_REDIS_TIMEOUT,
            slot: Mutex::new(Slot::default()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    /// The slot lock is held while dialling, so concurrent first callers
    /// wait for the same attempt instead of opening their own connection.
    async fn connection(&self) -> Result<(u64, MultiplexedConnection), CacheError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.conn.as_ref() {
            return Ok((slot.generation, conn.clone()));
        }

        let conn = self
            .bounded("connect", self.client.get_multiplexed_async_connection())
            .await?;
        slot.generation += 1;
        slot.conn = Some(conn.clone());
        info!("Redis connected successfully");
        Ok((slot.generation, conn))
    }

    /// Drops the connection dialled as `generation`, unless it has already
    /// been replaced by a newer one.
    async fn forget(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation == generation && slot.conn.take().is_some() {
            debug!("Forgot Redis connection #{}", generation);
        }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let (generation, conn) = self.connection().await?;
        let result = self.bounded(operation, command(conn)).await;
        if let Err(e) = &result {
            if e.is_connection_failure() {
                self.forget(generation).await;
            }
        }
        result
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.run("GET", |mut conn| async move {
            let value: RedisResult<Option<String>> = conn.get(key).await;
            value
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let seconds = ttl.as_secs().max(1);
        self.run("SETEX", |mut conn| async move {
            let reply: RedisResult<()> = conn.set_ex(key, value, seconds).await;
            reply
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.run("DEL", |mut conn| async move {
            let removed: RedisResult<i64> = conn.del(key).await;
            removed.map(|_| ())
        })
        .await
    }

    async fn shutdown(&self) {
        let Some(mut conn) = self.slot.lock().await.conn.take() else {
            return;
        };
        let quit = async {
            let reply: RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
            reply
        };
        match self.bounded("QUIT", quit).await {
            Ok(()) => info!("Redis connection closed"),
            Err(e) => warn!("Redis QUIT failed: {}", e),
        }
    }
}

/// Typed, failure-swallowing view over an optional `CacheStore`.
#[derive(Clone)]
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store: Some(store),
            ttl,
        }
    }

    /// Every `get` misses and every `set` is dropped.
    pub fn disabled() -> Self {
        Self {
            store: None,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &LookupKey) -> Option<NormalizedPackageData> {
        let store = self.store.as_ref()?;
        let cache_key = key.cache_key();

        let raw = match store.get(&cache_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Cache GET error for {}: {}", cache_key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", cache_key, e);
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set(&self, key: &LookupKey, value: &NormalizedPackageData, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let cache_key = key.cache_key();

        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Cache encode error for {}: {}", cache_key, e);
                return;
            }
        };

        if let Err(e) = store.set(&cache_key, &encoded, ttl).await {
            warn!("Cache SET error for {}: {}", cache_key, e);
        }
    }

    pub async fn delete(&self, key: &LookupKey) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let cache_key = key.cache_key();
        if let Err(e) = store.delete(&cache_key).await {
            warn!("Cache DEL error for {}: {}", cache_key, e);
        }
    }

    pub async fn shutdown(&self) {
        if let Some(store) = self.store.as_ref() {
            store.shutdown().await;
        }
    }
}

/// Cache-aside around `compute`: a hit returns the stored record, a miss
/// runs `compute` and stores its successful result. Errors are never cached.
pub async fn cache_aside<F, Fut>(
    cache: &ResponseCache,
    key: &LookupKey,
    compute: F,
) -> Result<NormalizedPackageData, InsightError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<NormalizedPackageData, InsightError>>,
{
    if let Some(hit) = cache.get(key).await {
        debug!("Cache hit for {}", key.identity());
        return Ok(hit);
    }
    debug!("Cache miss for {}", key.identity());

    let data = compute().await?;
    cache.set(key, &data, cache.ttl()).await;
    Ok(data)
}


#[cfg(test)]
mod tests {
    use super::memory::{BrokenCacheStore, InMemoryCacheStore};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> LookupKey {
        LookupKey::new("npm", "express", "4.18.2").unwrap()
    }

    fn record() -> NormalizedPackageData {
        NormalizedPackageData {
            ecosystem: "npm".into(),
            name: "express".into(),
            version: "4.18.2".into(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_returns_identical_record_until_ttl() {
        let store = Arc::new(InMemoryCacheStore::default());
        let cache = ResponseCache::new(store.clone(), DEFAULT_TTL);

        cache.set(&key(), &record(), Duration::from_secs(60)).await;
        assert_eq!(cache.get(&key()).await, Some(record()));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&key()).await, Some(record()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&key()).await, None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let cache = ResponseCache::new(Arc::new(InMemoryCacheStore::default()), DEFAULT_TTL);
        cache.set(&key(), &record(), DEFAULT_TTL).await;
        cache.delete(&key()).await;
        assert_eq!(cache.get(&key()).await, None);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss_and_is_removed() {
        let store = Arc::new(InMemoryCacheStore::default());
        store
            .insert_raw(&key().cache_key(), "{not json", DEFAULT_TTL)
            .await;
        let cache = ResponseCache::new(store.clone(), DEFAULT_TTL);

        assert_eq!(cache.get(&key()).await, None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_cache_aside_computes_once() {
        let cache = ResponseCache::new(Arc::new(InMemoryCacheStore::default()), DEFAULT_TTL);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let data = cache_aside(&cache, &key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(record())
            })
            .await
            .unwrap();
            assert_eq!(data, record());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_aside_does_not_cache_errors() {
        let store = Arc::new(InMemoryCacheStore::default());
        let cache = ResponseCache::new(store.clone(), DEFAULT_TTL);

        let result = cache_aside(&cache, &key(), || async {
            Err(InsightError::Unavailable("down".into()))
        })
        .await;
        assert_eq!(result, Err(InsightError::Unavailable("down".into())));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_to_miss() {
        let cache = ResponseCache::new(Arc::new(BrokenCacheStore), DEFAULT_TTL);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let data = cache_aside(&cache, &key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(record())
            })
            .await
            .unwrap();
            assert_eq!(data, record());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_computes() {
        let cache = ResponseCache::disabled();
        assert!(!cache.is_enabled());
        cache.set(&key(), &record(), DEFAULT_TTL).await;
        assert_eq!(cache.get(&key()).await, None);
    }

    mod redis_store_tests {
        use super::*;
        use std::net::SocketAddr;
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::sync::watch;
        use tokio::task::JoinSet;

        /// Local stand-in for a Redis server that counts accepted sockets.
        struct FakeRedis {
            addr: SocketAddr,
            accepts: Arc<AtomicUsize>,
            hangup: watch::Sender<u64>,
        }

        impl FakeRedis {
            /// `silent` servers accept connections and never answer.
            async fn start(silent: bool) -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let accepts = Arc::new(AtomicUsize::new(0));
                let (hangup, hangup_rx) = watch::channel(0u64);

                let counter = accepts.clone();
                tokio::spawn(async move {
                    while let Ok((socket, _)) = listener.accept().await {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let mut hangup_rx = hangup_rx.clone();
                        hangup_rx.borrow_and_update();
                        tokio::spawn(async move {
                            if silent {
                                let _held = socket;
                                let _ = hangup_rx.changed().await;
                                return;
                            }
                            tokio::select! {
                                _ = answer(socket) => {}
                                _ = hangup_rx.changed() => {}
                            }
                        });
                    }
                });

                Self {
                    addr,
                    accepts,
                    hangup,
                }
            }

            fn store(&self) -> RedisCacheStore {
                RedisCacheStore::new(&format!("redis://{}", self.addr))
                    .unwrap()
                    .with_timeout(Duration::from_millis(200))
            }

            fn accepts(&self) -> usize {
                self.accepts.load(Ordering::SeqCst)
            }

            /// Closes every open client socket.
            fn drop_connections(&self) {
                self.hangup.send_modify(|n| *n += 1);
            }
        }

        /// Minimal RESP2 responder: GET always misses, DEL removes one key,
        /// everything else is OK.
        async fn answer(socket: TcpStream) -> std::io::Result<()> {
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            let mut line = String::new();

            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                let argc: usize = line.trim().trim_start_matches('*').parse().unwrap_or(0);

                let mut command = String::new();
                for i in 0..argc {
                    line.clear();
                    reader.read_line(&mut line).await?;
                    let len: usize = line.trim().trim_start_matches('$').parse().unwrap_or(0);
                    let mut arg = vec![0; len + 2];
                    reader.read_exact(&mut arg).await?;
                    if i == 0 {
                        command = String::from_utf8_lossy(&arg[..len]).to_uppercase();
                    }
                }

                let reply: &[u8] = match command.as_str() {
                    "GET" => b"$-1\r\n",
                    "DEL" => b":1\r\n",
                    _ => b"+OK\r\n",
                };
                write.write_all(reply).await?;
            }
        }

        #[tokio::test]
        async fn test_stalled_server_degrades_to_miss() {
            let server = FakeRedis::start(true).await;
            let cache = ResponseCache::new(Arc::new(server.store()), DEFAULT_TTL);
            let calls = AtomicUsize::new(0);

            let k = key();
            let lookup = cache_aside(&cache, &k, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(record())
            });
            let data = tokio::time::timeout(Duration::from_secs(5), lookup)
                .await
                .expect("lookup must not wait on a stalled cache")
                .unwrap();

            assert_eq!(data, record());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_stalled_server_reports_timeout() {
            let server = FakeRedis::start(true).await;
            let store = server.store();

            let result = tokio::time::timeout(Duration::from_secs(5), store.get("k"))
                .await
                .unwrap();
            assert!(matches!(result, Err(CacheError::Timeout { .. })));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_first_use_opens_one_connection() {
            let server = FakeRedis::start(false).await;
            let cache = ResponseCache::new(Arc::new(server.store()), DEFAULT_TTL);

            let mut lookups = JoinSet::new();
            for _ in 0..16 {
                let cache = cache.clone();
                lookups.spawn(async move { cache.get(&key()).await });
            }
            while let Some(result) = lookups.join_next().await {
                assert_eq!(result.unwrap(), None);
            }

            assert_eq!(server.accepts(), 1);
        }

        #[tokio::test]
        async fn test_commands_reuse_the_connection() {
            let server = FakeRedis::start(false).await;
            let store = server.store();

            store.set("k", "v", DEFAULT_TTL).await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), None);
            store.delete("k").await.unwrap();

            assert_eq!(server.accepts(), 1);
        }

        #[tokio::test]
        async fn test_reconnects_after_server_drops_connection() {
            let server = FakeRedis::start(false).await;
            let store = server.store();

            store.get("k").await.unwrap();
            assert_eq!(server.accepts(), 1);

            server.drop_connections();
            let mut recovered = false;
            for _ in 0..10 {
                if store.get("k").await.is_ok() && server.accepts() == 2 {
                    recovered = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            assert!(recovered, "store never redialled after the drop");
            assert_eq!(server.accepts(), 2);
        }

        #[tokio::test]
        async fn test_stale_failure_keeps_newer_connection() {
            let server = FakeRedis::start(false).await;
            let store = server.store();

            let (first, _) = store.connection().await.unwrap();
            store.forget(first).await;
            let (second, _) = store.connection().await.unwrap();
            assert_eq!(server.accepts(), 2);
            assert!(second > first);

            // A late failure report from the first connection.
            store.forget(first).await;

            let (current, _) = store.connection().await.unwrap();
            assert_eq!(current, second);
            assert_eq!(server.accepts(), 2);
        }

        #[tokio::test]
        async fn test_shutdown_closes_connection() {
            let server = FakeRedis::start(false).await;
            let store = server.store();

            store.get("k").await.unwrap();
            store.shutdown().await;
            store.get("k").await.unwrap();

            assert_eq!(server.accepts(), 2);
        }
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_swallowed() {
        let store = RedisCacheStore::new("redis://127.0.0.1:1").unwrap();
        assert!(store.get("k").await.is_err());

        let cache = ResponseCache::new(Arc::new(store), DEFAULT_TTL);
        assert_eq!(cache.get(&key()).await, None);
        cache.set(&key(), &record(), DEFAULT_TTL).await;
        cache.shutdown().await;
    }
}
