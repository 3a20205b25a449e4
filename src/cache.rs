//! Best-effort response cache.
//!
//! The rest of the backend only sees [`ResponseCache`]; which implementation
//! sits behind it is decided once in [`connect_cache`]. No implementation ever
//! returns an error: a broken backend behaves like an empty cache.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{info, warn};

use crate::config::{CacheBackend, CacheSettings};

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on a single GET or SET. A server that accepts the socket but never
/// answers costs one miss per request, never a stuck request.
const REDIS_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Short label reported by the health endpoint.
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String, ttl: Duration);
}

/// Builds the cache selected by the settings. A Redis server that cannot be
/// reached at startup degrades to [`NoopCache`].
pub async fn connect_cache(settings: &CacheSettings) -> Arc<dyn ResponseCache> {
    match (settings.backend, settings.redis_url.as_deref()) {
        (CacheBackend::Redis, Some(url)) => match RedisCache::connect(url).await {
            Ok(cache) => {
                info!("response cache backed by redis");
                Arc::new(cache)
            }
            Err(err) => {
                warn!(error = %err, "redis unavailable, response cache disabled");
                Arc::new(NoopCache)
            }
        },
        (CacheBackend::Memory, _) => {
            info!("response cache kept in process memory");
            Arc::new(MemoryCache::new())
        }
        _ => {
            info!("response cache disabled");
            Arc::new(NoopCache)
        }
    }
}

/// Accepts every write and misses every read.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
    fn backend_name(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) {}
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process cache with per-entry expiry. Expired entries are dropped lazily
/// on the next read of the same key.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
    }
}

/// Redis-backed cache. `ConnectionManager` reconnects on its own, so a
/// temporarily unreachable server only costs misses.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(REDIS_CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {url}"))??;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let reply = tokio::time::timeout(REDIS_COMMAND_TIMEOUT, conn.get::<_, Option<String>>(key)).await;
        match reply {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(key, error = %err, "redis GET failed");
                None
            }
            Err(_) => {
                warn!(key, timeout = ?REDIS_COMMAND_TIMEOUT, "redis GET timed out");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value).arg("EX").arg(secs);
        let reply: Result<redis::RedisResult<()>, _> =
            tokio::time::timeout(REDIS_COMMAND_TIMEOUT, command.query_async(&mut conn)).await;
        match reply {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(key, error = %err, "redis SET failed"),
            Err(_) => warn!(key, timeout = ?REDIS_COMMAND_TIMEOUT, "redis SET timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, tcp::OwnedReadHalf},
    };

    /// Just enough of a RESP2 server for the connection manager: records every
    /// command, serves GET/SET from a map and answers anything else with `+OK`.
    #[derive(Default)]
    struct FakeRedis {
        commands: parking_lot::Mutex<Vec<Vec<String>>>,
        values: parking_lot::Mutex<HashMap<String, String>>,
        silent: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl FakeRedis {
        fn reply(&self, command: &[String]) -> String {
            self.commands.lock().push(command.to_vec());
            let name = command
                .first()
                .map(|name| name.to_ascii_uppercase())
                .unwrap_or_default();
            match name.as_str() {
                "GET" if self.fail_reads.load(Ordering::SeqCst) => {
                    "-ERR backend exploded\r\n".to_string()
                }
                "GET" => match command
                    .get(1)
                    .and_then(|key| self.values.lock().get(key).cloned())
                {
                    Some(value) => format!("${}\r\n{}\r\n", value.len(), value),
                    None => "$-1\r\n".to_string(),
                },
                "SET" => {
                    if let [_, key, value, ..] = command {
                        self.values.lock().insert(key.clone(), value.clone());
                    }
                    "+OK\r\n".to_string()
                }
                _ => "+OK\r\n".to_string(),
            }
        }
    }

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            parts.push(String::from_utf8(buf).ok()?);
        }
        Some(parts)
    }

    async fn spawn_fake_redis() -> (Arc<FakeRedis>, CacheSettings) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let fake = Arc::new(FakeRedis::default());
        let server = fake.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    while let Some(command) = read_command(&mut reader).await {
                        if server.silent.load(Ordering::SeqCst) {
                            continue;
                        }
                        let reply = server.reply(&command);
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let settings = CacheSettings {
            backend: CacheBackend::Redis,
            redis_url: Some(format!("redis://{addr}")),
        };
        (fake, settings)
    }

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = NoopCache;
        cache
            .set("key", "value".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("key", "value".into(), Duration::from_secs(1)).await;
        assert_eq!(cache.get("key").await.as_deref(), Some("value"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("key").await, None);
        assert!(cache.entries.read().is_empty());
    }

    #[tokio::test]
    async fn memory_cache_overwrites_whole_value() {
        let cache = MemoryCache::new();
        cache.set("key", "first".into(), Duration::from_secs(60)).await;
        cache.set("key", "second".into(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("key").await.as_deref(), Some("second"));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn disabled_backend_yields_noop() {
        let cache = connect_cache(&CacheSettings {
            backend: CacheBackend::None,
            redis_url: None,
        })
        .await;
        assert_eq!(cache.backend_name(), "none");
    }

    #[tokio::test]
    async fn unreachable_redis_degrades_to_noop() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache = connect_cache(&CacheSettings {
            backend: CacheBackend::Redis,
            redis_url: Some(format!("redis://{addr}")),
        })
        .await;
        assert_eq!(cache.backend_name(), "none");
        assert_eq!(cache.get("anything").await, None);
    }

    #[tokio::test]
    async fn redis_round_trip_uses_set_with_expiry() {
        let (fake, settings) = spawn_fake_redis().await;
        let cache = connect_cache(&settings).await;
        assert_eq!(cache.backend_name(), "redis");

        cache
            .set("catalog:channel-items", "[1,2]".into(), Duration::from_secs(3600))
            .await;
        assert_eq!(
            cache.get("catalog:channel-items").await.as_deref(),
            Some("[1,2]")
        );
        assert_eq!(cache.get("missing").await, None);

        let expected: Vec<String> = ["SET", "catalog:channel-items", "[1,2]", "EX", "3600"]
            .iter()
            .map(|part| part.to_string())
            .collect();
        assert!(fake.commands.lock().contains(&expected));
    }

    #[tokio::test]
    async fn redis_error_reply_is_a_miss() {
        let (fake, settings) = spawn_fake_redis().await;
        let cache = connect_cache(&settings).await;
        cache.set("key", "value".into(), Duration::from_secs(60)).await;

        fake.fail_reads.store(true, Ordering::SeqCst);
        assert_eq!(cache.get("key").await, None);

        fake.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(cache.get("key").await.as_deref(), Some("value"));
    }

    #[tokio::test]
    async fn silent_redis_costs_a_bounded_miss() {
        let (fake, settings) = spawn_fake_redis().await;
        let cache = connect_cache(&settings).await;
        assert_eq!(cache.backend_name(), "redis");
        fake.silent.store(true, Ordering::SeqCst);

        let limit = REDIS_COMMAND_TIMEOUT + Duration::from_secs(2);
        let started = Instant::now();
        let value = tokio::time::timeout(limit, cache.get("key"))
            .await
            .expect("GET must not hang on a silent server");
        assert_eq!(value, None);

        tokio::time::timeout(limit, cache.set("key", "value".into(), Duration::from_secs(60)))
            .await
            .expect("SET must not hang on a silent server");
        assert!(started.elapsed() < limit * 2);
    }
}
