// Query Cache - content-addressed results with TTL, LRU eviction and push invalidation
//
// Entries live in a sharded map so unrelated keys never contend on one lock.
// Concurrent misses for the same key are collapsed by a per-key load gate.
// A generation counter keeps loads that straddle `invalidate_all` from
// repopulating the cache with pre-mutation results.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::GraphMutationListener;
use crate::errors::QueryError;
use crate::observability::{
    log_operation, record_cache_entries, record_timeout, Operation, OperationContext,
};
use crate::query_validation::{segments, Segment};
use crate::types::{
    CacheKey, GraphQueryStatement, QueryResult, RequestDeadline, TruncationReason,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup reports `CacheUnavailable` and nothing is stored
    pub enabled: bool,
    #[serde(with = "crate::config::duration_string")]
    pub ttl: Duration,
    pub max_entries: usize,
    #[serde(with = "crate::config::duration_string")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30),
            max_entries: 1024,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: QueryResult,
    stored_at: Instant,
    expires_at: Instant,
    hit_count: u64,
    /// Logical clock value of the last read or write
    last_access: u64,
}

/// Where a result handed out by [`QueryCache::get_or_load`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The cache was unavailable and the loader ran without it
    Bypassed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Whitespace-insensitive form of a statement; literals are kept verbatim
pub fn normalize_statement_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for segment in segments(text) {
        match segment {
            Segment::Code(code) => push_code(&mut out, code, &mut pending_space),
            Segment::Literal(literal) => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push_str(literal);
            }
            Segment::Comment => pending_space = true,
        }
    }
    out
}

fn push_code(out: &mut String, code: &str, pending_space: &mut bool) {
    for ch in code.chars() {
        if ch.is_whitespace() {
            *pending_space = true;
        } else {
            if *pending_space && !out.is_empty() {
                out.push(' ');
            }
            *pending_space = false;
            out.push(ch);
        }
    }
}

/// Digest of normalized text, parameters sorted by name, and the result limit
pub fn cache_key(statement: &GraphQueryStatement) -> CacheKey {
    let mut params: Vec<_> = statement.parameters().iter().collect();
    params.sort_by(|a, b| a.0.cmp(b.0));

    let mut material = String::from("v1\n");
    material.push_str(&normalize_statement_text(statement.text()));
    material.push('\n');
    for (name, value) in params {
        material.push_str(name);
        material.push('=');
        value.write_canonical(&mut material);
        material.push('\n');
    }
    material.push_str("limit=");
    material.push_str(&statement.options().result_limit.to_string());

    let digest = Sha256::digest(material.as_bytes());
    CacheKey::from_digest(hex::encode(digest))
}

/// One caller's share of a key's load lock
///
/// Dropping it, on any path including a dropped future, removes the lock
/// from the map once no other caller holds it.
struct LoadGate<'a> {
    loads: &'a DashMap<CacheKey, Arc<Mutex<()>>>,
    key: CacheKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> LoadGate<'a> {
    fn join(loads: &'a DashMap<CacheKey, Arc<Mutex<()>>>, key: CacheKey) -> Self {
        let lock = loads
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self { loads, key, lock }
    }
}

impl Drop for LoadGate<'_> {
    fn drop(&mut self) {
        // The map and this gate hold the last two references
        self.loads.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

pub struct QueryCache {
    config: CacheConfig,
    entries: DashMap<CacheKey, CacheEntry>,
    loads: DashMap<CacheKey, Arc<Mutex<()>>>,
    generation: AtomicU64,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            loads: DashMap::new(),
            generation: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a cached result
    ///
    /// Fails with `CacheUnavailable` when the cache is disabled; callers treat
    /// that as a miss.
    pub fn lookup(&self, statement: &GraphQueryStatement) -> Result<Option<QueryResult>, QueryError> {
        if !self.config.enabled {
            return Err(QueryError::CacheUnavailable {
                reason: "cache disabled by configuration".to_string(),
            });
        }
        Ok(self.lookup_key(&cache_key(statement)))
    }

    /// Cached result, or `None` on miss, expiry or an unavailable cache
    pub fn get(&self, statement: &GraphQueryStatement) -> Option<QueryResult> {
        self.lookup(statement).ok().flatten()
    }

    fn lookup_key(&self, key: &CacheKey) -> Option<QueryResult> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.hit_count += 1;
                entry.last_access = self.tick();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired && self.entries.remove_if(key, |_, e| e.expires_at <= now).is_some() {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result. Returns whether it was stored.
    ///
    /// Skipped when the cache is disabled, the TTL is zero, or the result was
    /// cut short by a timeout.
    pub fn put(&self, statement: &GraphQueryStatement, result: &QueryResult) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        self.put_at_generation(cache_key(statement), result, generation)
    }

    fn put_at_generation(&self, key: CacheKey, result: &QueryResult, generation: u64) -> bool {
        if !self.config.enabled || self.config.ttl.is_zero() || self.config.max_entries == 0 {
            return false;
        }
        if result.truncation_reason == Some(TruncationReason::Timeout) {
            debug!(key = %key, "Not caching result truncated by timeout");
            return false;
        }
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(key = %key, "Graph mutated during load, not caching");
            return false;
        }

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.config.max_entries {
                if !self.evict_least_recently_used() {
                    break;
                }
            }
        }

        let stored_at = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                result: result.clone(),
                stored_at,
                expires_at: stored_at + self.config.ttl,
                hit_count: 0,
                last_access: self.tick(),
            },
        );

        // An invalidation may have slipped in between the check and the insert
        if self.generation.load(Ordering::Acquire) != generation {
            self.entries.remove_if(&key, |_, e| e.stored_at == stored_at);
            return false;
        }
        record_cache_entries(self.entries.len());
        true
    }

    fn evict_least_recently_used(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.last_access)
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                if self.entries.remove(&key).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Evicted least recently used entry");
                }
                true
            }
            None => false,
        }
    }

    /// Serve from cache, or run `loader` once per key among concurrent callers
    ///
    /// Waiting behind another caller's load counts against this caller's
    /// statement timeout and stops early if `deadline` is cancelled. The
    /// loader is handed the time already spent waiting. Its successful
    /// result is stored unless the graph was invalidated while it ran.
    /// Failed or dropped loads store nothing.
    pub async fn get_or_load<F, Fut>(
        &self,
        statement: &GraphQueryStatement,
        deadline: &RequestDeadline,
        loader: F,
    ) -> Result<(QueryResult, CacheStatus), QueryError>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<QueryResult, QueryError>>,
    {
        let started = tokio::time::Instant::now();
        match self.lookup(statement) {
            Ok(Some(hit)) => return Ok((hit, CacheStatus::Hit)),
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "Cache unavailable, loading directly");
                return loader(Duration::ZERO)
                    .await
                    .map(|result| (result, CacheStatus::Bypassed));
            }
        }

        let key = cache_key(statement);
        let gate = LoadGate::join(&self.loads, key.clone());
        let budget = match deadline.remaining() {
            Some(remaining) => statement.options().timeout.min(remaining),
            None => statement.options().timeout,
        };

        let _held = tokio::select! {
            biased;
            _ = deadline.cancellation().cancelled() => {
                return Err(QueryError::cancelled("cache wait"));
            }
            held = gate.lock.lock() => held,
            _ = tokio::time::sleep_until(started + budget) => {
                let query_id = Uuid::new_v4().to_string();
                warn!(query_id = %query_id, "Gave up waiting {:?} for a concurrent load", budget);
                record_timeout();
                return Err(QueryError::ExecutionTimeout {
                    timeout_ms: budget.as_millis() as u64,
                    query_id,
                });
            }
        };

        // Another caller may have filled the entry while we waited
        if let Some(hit) = self.lookup_key(&key) {
            return Ok((hit, CacheStatus::Hit));
        }
        let generation = self.generation.load(Ordering::Acquire);
        let loaded = loader(started.elapsed()).await;
        if let Ok(result) = &loaded {
            self.put_at_generation(key, result, generation);
        }
        loaded.map(|result| (result, CacheStatus::Miss))
    }

    /// Keys with a load in progress or callers queued behind one
    pub fn pending_loads(&self) -> usize {
        self.loads.len()
    }

    /// Drop every entry. Returns the number of entries removed.
    pub fn invalidate_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.entries.len();
        self.entries.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        record_cache_entries(0);
        log_operation::<QueryError>(
            &OperationContext::new("cache.invalidate"),
            &Operation::CacheInvalidate { entries: removed },
            Ok(()),
        );
        info!("Query cache invalidated ({} entries dropped)", removed);
        removed
    }

    /// Remove expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            record_cache_entries(self.entries.len());
        }
        removed
    }

    /// Start the passive expiration sweep
    ///
    /// The task holds only a weak handle and exits once the cache is dropped.
    pub fn spawn_expiration_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("Query cache dropped, stopping expiration sweeper");
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Expiration sweep removed {} entries", purged);
                }
            }
        })
    }

    /// Number of hits served for a statement's current entry
    pub fn hit_count(&self, statement: &GraphQueryStatement) -> Option<u64> {
        self.entries
            .get(&cache_key(statement))
            .map(|entry| entry.hit_count)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

impl GraphMutationListener for QueryCache {
    fn on_graph_mutated(&self) {
        self.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStats, GraphValue, Record};
    use std::sync::atomic::AtomicUsize;

    fn statement(text: &str) -> GraphQueryStatement {
        GraphQueryStatement::new(text).unwrap()
    }

    fn result_with(rows: usize, truncation: Option<TruncationReason>) -> QueryResult {
        let rows = (0..rows)
            .map(|i| {
                let mut record = Record::new();
                record.insert("n".to_string(), GraphValue::Int(i as i64));
                record
            })
            .collect();
        QueryResult::new(rows, 3, truncation, ExecutionStats::default())
    }

    fn cache_with(ttl: Duration, max_entries: usize) -> QueryCache {
        QueryCache::new(CacheConfig {
            ttl,
            max_entries,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_put_then_get() {
        let cache = QueryCache::default();
        let s = statement("MATCH (n:Method) RETURN n");
        let r = result_with(2, None);
        assert!(cache.put(&s, &r));
        assert_eq!(cache.get(&s), Some(r));
        assert_eq!(cache.hit_count(&s), Some(1));
    }

    #[test]
    fn test_key_ignores_whitespace_and_parameter_order() {
        let a = statement("MATCH (n:Method)\n  WHERE n.name = $name AND n.visibility = $vis RETURN n")
            .with_param("name", "save")
            .unwrap()
            .with_param("vis", "PUBLIC")
            .unwrap();
        let b = statement("MATCH  (n:Method) WHERE n.name = $name   AND n.visibility = $vis\tRETURN n")
            .with_param("vis", "PUBLIC")
            .unwrap()
            .with_param("name", "save")
            .unwrap();
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn test_key_keeps_literal_whitespace_and_limit() {
        let a = statement("MATCH (n) WHERE n.name = 'a  b' RETURN n");
        let b = statement("MATCH (n) WHERE n.name = 'a b' RETURN n");
        assert_ne!(cache_key(&a), cache_key(&b));

        let limited = statement("MATCH (n) RETURN n").with_result_limit(5);
        assert_ne!(cache_key(&limited), cache_key(&statement("MATCH (n) RETURN n")));
    }

    #[test]
    fn test_timeout_truncated_results_are_not_stored() {
        let cache = QueryCache::default();
        let s = statement("MATCH (n:Method) RETURN n");
        assert!(!cache.put(&s, &result_with(1, Some(TruncationReason::Timeout))));
        assert!(cache.get(&s).is_none());

        assert!(cache.put(&s, &result_with(1, Some(TruncationReason::ResultLimit))));
        assert!(cache.get(&s).is_some());
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let cache = cache_with(Duration::ZERO, 10);
        let s = statement("MATCH (n:Method) RETURN n");
        assert!(!cache.put(&s, &result_with(1, None)));
        assert!(cache.get(&s).is_none());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = QueryCache::default();
        let s = statement("MATCH (n:Method) RETURN n");
        cache.put(&s, &result_with(1, None));
        cache.on_graph_mutated();
        assert!(cache.get(&s).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache_with(Duration::from_secs(60), 2);
        let a = statement("MATCH (a:Method) RETURN a");
        let b = statement("MATCH (b:Method) RETURN b");
        let c = statement("MATCH (c:Method) RETURN c");
        cache.put(&a, &result_with(1, None));
        cache.put(&b, &result_with(1, None));
        // touch `a` so `b` becomes the eviction candidate
        assert!(cache.get(&a).is_some());
        cache.put(&c, &result_with(1, None));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = cache_with(Duration::from_millis(30), 10);
        let s = statement("MATCH (n:Method) RETURN n");
        cache.put(&s, &result_with(1, None));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(&s).is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_disabled_cache_reports_unavailable() {
        let cache = QueryCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let s = statement("MATCH (n:Method) RETURN n");
        assert!(!cache.put(&s, &result_with(1, None)));
        assert!(matches!(
            cache.lookup(&s),
            Err(QueryError::CacheUnavailable { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_load_once() {
        let cache = Arc::new(QueryCache::default());
        let loads = Arc::new(AtomicUsize::new(0));
        let s = statement("MATCH (n:Method) RETURN n");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(result_with(3, None))
                    })
                    .await
            }));
        }

        for handle in handles {
            let (result, _) = handle.await.unwrap().unwrap();
            assert_eq!(result.len(), 3);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pending_loads(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_times_out_on_its_own_budget() {
        let cache = Arc::new(QueryCache::default());
        let s = statement("MATCH (n:Method) RETURN n").with_timeout(Duration::from_millis(100));

        let first = {
            let cache = Arc::clone(&cache);
            let s = s.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(result_with(1, None))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let err = cache
            .get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                Ok(result_with(1, None))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ExecutionTimeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_millis(400));

        first.abort();
        let _ = first.await;
        assert_eq!(cache.pending_loads(), 0);
    }

    #[tokio::test]
    async fn test_loader_is_charged_for_the_wait() {
        let cache = Arc::new(QueryCache::default());
        let s = statement("MATCH (n:Method) RETURN n");

        let slow = {
            let cache = Arc::clone(&cache);
            let s = s.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Err(QueryError::cancelled("execution"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_, status) = cache
            .get_or_load(&s, &RequestDeadline::unbounded(), |waited| async move {
                assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
                Ok(result_with(1, None))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert!(slow.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_waiter_returns_promptly() {
        let cache = Arc::new(QueryCache::default());
        let s = statement("MATCH (n:Method) RETURN n");

        let first = {
            let cache = Arc::clone(&cache);
            let s = s.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(result_with(1, None))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let deadline = RequestDeadline::unbounded();
        let canceller = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = cache
            .get_or_load(&s, &deadline, |_| async { Ok(result_with(1, None)) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));

        first.abort();
        let _ = first.await;
    }

    #[tokio::test]
    async fn test_dropped_load_releases_its_gate() {
        let cache = QueryCache::default();
        let s = statement("MATCH (n:Method) RETURN n");

        let dropped = tokio::time::timeout(
            Duration::from_millis(30),
            cache.get_or_load(&s, &RequestDeadline::unbounded(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(result_with(1, None))
            }),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(cache.pending_loads(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_load_straddling_invalidation_is_not_cached() {
        let cache = Arc::new(QueryCache::default());
        let s = statement("MATCH (n:Method) RETURN n");

        let inner = Arc::clone(&cache);
        let (result, status) = cache
            .get_or_load(&s, &RequestDeadline::unbounded(), |_| async move {
                inner.invalidate_all();
                Ok(result_with(1, None))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(result.len(), 1);
        assert!(cache.get(&s).is_none());
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = QueryCache::default();
        let s = statement("MATCH (n:Method) RETURN n");
        let err = cache
            .get_or_load(&s, &RequestDeadline::unbounded(), |_| async { Err(QueryError::cancelled("execution")) })
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::cancelled("execution"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_purges_and_stops_when_dropped() {
        let cache = Arc::new(QueryCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(20),
            ..CacheConfig::default()
        }));
        let handle = cache.spawn_expiration_sweeper();
        cache.put(&statement("MATCH (n:Method) RETURN n"), &result_with(1, None));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop once the cache is dropped")
            .unwrap();
    }

    #[test]
    fn test_normalization() {
        assert_eq!(
            normalize_statement_text("  MATCH (n)\n\tRETURN   n  "),
            "MATCH (n) RETURN n"
        );
        assert_eq!(
            normalize_statement_text("RETURN 'a   b' // trailing"),
            "RETURN 'a   b'"
        );
    }
}
