//! Response cache for model calls
//!
//! Opt-in LRU cache with TTL in front of any [`ModelClient`]. Only
//! successful replies are cached. Repeated stability runs sample model
//! variance, so the runner leaves this off unless asked.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{ModelCallError, ModelClient, ModelReply, ModelRequest};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Time-to-live for entries
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    reply: ModelReply,
    inserted: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<[u8; 32], CacheEntry>,
    tick: u64,
    stats: CacheStats,
}

/// Collapse whitespace so formatting noise does not defeat the cache
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key over model, normalised prompts and temperature at 2 dp
pub fn cache_key(request: &ModelRequest) -> [u8; 32] {
    let temperature = (f64::from(request.temperature) * 100.0).round() as i64;
    let mut hasher = blake3::Hasher::new();
    hasher.update(request.model_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize(&request.system_prompt).as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize(&request.user_prompt).as_bytes());
    hasher.update(&[0]);
    hasher.update(&temperature.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// [`ModelClient`] decorator with an in-memory LRU + TTL cache
pub struct CachedModelClient<C> {
    inner: C,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl<C: ModelClient> CachedModelClient<C> {
    pub fn new(inner: C, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self.state.lock() {
            Ok(state) => CacheStats {
                size: state.entries.len(),
                ..state.stats
            },
            Err(poisoned) => poisoned.into_inner().stats,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
        }
    }

    fn lookup(&self, key: &[u8; 32]) -> Option<ModelReply> {
        let mut state = self.state.lock().ok()?;
        state.tick += 1;
        let tick = state.tick;

        let ttl = self.config.ttl;
        match state.entries.get(key).map(|entry| entry.inserted.elapsed() > ttl) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(true) => {
                state.entries.remove(key);
                state.stats.evictions += 1;
                state.stats.misses += 1;
                return None;
            }
            Some(false) => {}
        }

        state.stats.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.reply.clone())
    }

    fn store(&self, key: [u8; 32], reply: &ModelReply) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.tick += 1;
        let tick = state.tick;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                state.stats.evictions += 1;
            }
        }
        if self.config.capacity > 0 {
            state.entries.insert(
                key,
                CacheEntry {
                    reply: reply.clone(),
                    inserted: Instant::now(),
                    last_used: tick,
                },
            );
        }
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for CachedModelClient<C> {
    async fn invoke(
        &self,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelReply, ModelCallError> {
        let key = cache_key(request);
        if let Some(reply) = self.lookup(&key) {
            debug!(model_id = %request.model_id, "Response cache hit");
            return Ok(reply);
        }

        let reply = self.inner.invoke(request, timeout).await?;
        self.store(key, &reply);
        Ok(reply)
    }
}
