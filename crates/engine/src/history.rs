//! History acquisition: shared cache and fetch coordinator
//!
//! One `HistoryCoordinator` is built per process and handed to every session
//! by `Arc`. It owns the only rate-limit breaker and request throttle for the
//! upstream source, so concurrent sessions back off together:
//!
//! - fresh cache entries are served without touching upstream;
//! - identical concurrent requests share one pending computation;
//! - all upstream calls are serialized through a FIFO mutex and paced by a
//!   minimum interval;
//! - a rate-limit signal blocks every request until the retry time.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CollaboratorError, FetchError};
use crate::types::{normalize_resolution, timeframe_ms, Kline};

// ============================================================================
// Source contract
// ============================================================================

/// Upstream bar provider
#[async_trait]
pub trait HistorySource: Send + Sync {
    fn name(&self) -> &str;

    /// Bars with open time in `[from_ms, to_ms]`, oldest first, at most `limit`
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, CollaboratorError>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub symbol: String,
    pub timeframe: String,
    pub from_ms: i64,
    pub to_ms: i64,
}

/// A bar series as served by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedSeries {
    pub symbol: String,
    pub timeframe: String,
    pub from_ms: i64,
    pub to_ms: i64,
    pub fetched_at_ms: i64,
    pub chunks: u32,
    pub from_cache: bool,
    pub source: String,
    pub bars: Arc<Vec<Kline>>,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Entries younger than this are served from cache
    pub ttl: Duration,
    /// Entries older than this are evicted
    pub max_age: Duration,
    pub max_entries: usize,
    pub chunk_bars: usize,
    pub max_chunks: u32,
    pub min_interval: Duration,
    pub default_backoff: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_age: Duration::from_secs(6 * 3600),
            max_entries: 64,
            chunk_bars: 1000,
            max_chunks: 50,
            min_interval: Duration::from_millis(250),
            default_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    timeframe: String,
    from_ms: i64,
    to_ms: i64,
}

type PendingFetch = Shared<BoxFuture<'static, Result<CachedSeries, FetchError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct HistoryCoordinator {
    source: Arc<dyn HistorySource>,
    config: HistoryConfig,
    cache: Mutex<HashMap<CacheKey, CachedSeries>>,
    pending: Mutex<HashMap<CacheKey, PendingFetch>>,
    /// FIFO chain for upstream calls; holds the time of the last call
    upstream: tokio::sync::Mutex<Option<Instant>>,
    blocked_until_ms: AtomicI64,
}

impl HistoryCoordinator {
    pub fn new(source: Arc<dyn HistorySource>, config: HistoryConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            upstream: tokio::sync::Mutex::new(None),
            blocked_until_ms: AtomicI64::new(0),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Epoch ms until which upstream calls are refused (0 = open)
    pub fn blocked_until_ms(&self) -> i64 {
        self.blocked_until_ms.load(Ordering::SeqCst)
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Extend the breaker to `retry_at_ms`, or now + default backoff
    pub fn note_rate_limit(&self, retry_at_ms: Option<i64>) -> i64 {
        let until = retry_at_ms
            .unwrap_or_else(|| now_ms() + self.config.default_backoff.as_millis() as i64);
        let previous = self.blocked_until_ms.fetch_max(until, Ordering::SeqCst);
        let effective = previous.max(until);
        warn!(
            source = %self.source.name(),
            blocked_until_ms = effective,
            "History source rate limited, breaker extended"
        );
        effective
    }

    fn check_breaker(&self) -> Result<(), FetchError> {
        let blocked_until_ms = self.blocked_until_ms();
        let remaining = blocked_until_ms - now_ms();
        if remaining > 0 {
            let retry_in_secs = ((remaining + 999) / 1000).max(1) as u64;
            return Err(FetchError::RateLimited {
                retry_in_secs,
                blocked_until_ms,
            });
        }
        Ok(())
    }

    /// Fetch a bar series, from cache when fresh
    pub async fn fetch(self: &Arc<Self>, request: HistoryRequest) -> Result<CachedSeries, FetchError> {
        let key = self.cache_key(&request)?;

        if let Some(hit) = self.fresh_entry(&key) {
            debug!(symbol = %key.symbol, timeframe = %key.timeframe, "History cache hit");
            return Ok(hit);
        }
        self.check_breaker()?;

        let shared = {
            let mut pending = lock(&self.pending);
            match pending.get(&key) {
                Some(existing) => {
                    debug!(symbol = %key.symbol, "Joining in-flight history fetch");
                    existing.clone()
                }
                None => {
                    // The load runs detached so it always releases `upstream`
                    // and clears its pending entry, even if every waiter is dropped.
                    let this = Arc::clone(self);
                    let load_key = key.clone();
                    let handle = tokio::spawn(async move {
                        let result = this.load(&load_key).await;
                        lock(&this.pending).remove(&load_key);
                        result
                    });
                    let fut = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(FetchError::Upstream(format!("history load task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        shared.await
    }

    fn cache_key(&self, request: &HistoryRequest) -> Result<CacheKey, FetchError> {
        let symbol = request.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(FetchError::InvalidRequest("symbol is required".to_string()));
        }
        let timeframe = normalize_resolution(&request.timeframe).ok_or_else(|| {
            FetchError::InvalidRequest(format!("unsupported resolution {:?}", request.timeframe))
        })?;
        let bar_ms = timeframe_ms(&timeframe).unwrap_or(1);
        let from_ms = request.from_ms - request.from_ms.rem_euclid(bar_ms);
        let to_ms = request.to_ms - request.to_ms.rem_euclid(bar_ms);
        if from_ms >= to_ms {
            return Err(FetchError::InvalidRequest(format!(
                "empty range {}..{}",
                request.from_ms, request.to_ms
            )));
        }
        Ok(CacheKey {
            symbol,
            timeframe,
            from_ms,
            to_ms,
        })
    }

    fn fresh_entry(&self, key: &CacheKey) -> Option<CachedSeries> {
        let cache = lock(&self.cache);
        let entry = cache.get(key)?;
        let age = now_ms() - entry.fetched_at_ms;
        if age < self.config.ttl.as_millis() as i64 {
            Some(CachedSeries {
                from_cache: true,
                ..entry.clone()
            })
        } else {
            None
        }
    }

    /// Serialized upstream load: page backward from `to` in fixed chunks
    async fn load(&self, key: &CacheKey) -> Result<CachedSeries, FetchError> {
        let mut last_call = self.upstream.lock().await;

        // Filled while we waited in line
        if let Some(hit) = self.fresh_entry(key) {
            return Ok(hit);
        }

        let bar_ms = timeframe_ms(&key.timeframe).unwrap_or(1);
        let span = (self.config.chunk_bars.max(1) as i64 - 1) * bar_ms;
        let mut merged: BTreeMap<i64, Kline> = BTreeMap::new();
        let mut cursor = key.to_ms;
        let mut chunks = 0u32;

        while chunks < self.config.max_chunks {
            self.check_breaker()?;
            if let Some(previous) = *last_call {
                let ready_at = previous + self.config.min_interval;
                if ready_at > Instant::now() {
                    tokio::time::sleep_until(ready_at).await;
                }
            }

            let chunk_from = (cursor - span).max(key.from_ms);
            let result = self
                .source
                .fetch_bars(
                    &key.symbol,
                    &key.timeframe,
                    chunk_from,
                    cursor,
                    self.config.chunk_bars,
                )
                .await;
            *last_call = Some(Instant::now());
            chunks += 1;

            let bars = match result {
                Ok(bars) => bars,
                Err(CollaboratorError::RateLimited { retry_after }) => {
                    let retry_at = retry_after.map(|d| now_ms() + d.as_millis() as i64);
                    self.note_rate_limit(retry_at);
                    return Err(self.check_breaker().err().unwrap_or(FetchError::RateLimited {
                        retry_in_secs: 1,
                        blocked_until_ms: self.blocked_until_ms(),
                    }));
                }
                Err(e) => return Err(FetchError::Upstream(e.to_string())),
            };

            if bars.is_empty() {
                break;
            }
            for kline in bars {
                if kline.open_time >= key.from_ms && kline.open_time <= key.to_ms {
                    merged.insert(kline.open_time, kline);
                }
            }
            if chunk_from <= key.from_ms {
                break;
            }
            cursor = chunk_from - bar_ms;
        }

        if chunks >= self.config.max_chunks {
            warn!(
                symbol = %key.symbol,
                max_chunks = self.config.max_chunks,
                "History paging stopped at chunk guard"
            );
        }
        if merged.is_empty() {
            return Err(FetchError::Empty {
                symbol: key.symbol.clone(),
                timeframe: key.timeframe.clone(),
            });
        }

        let series = CachedSeries {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            from_ms: key.from_ms,
            to_ms: key.to_ms,
            fetched_at_ms: now_ms(),
            chunks,
            from_cache: false,
            source: self.source.name().to_string(),
            bars: Arc::new(merged.into_values().collect()),
        };
        info!(
            symbol = %series.symbol,
            timeframe = %series.timeframe,
            bars = series.bars.len(),
            chunks,
            "History fetched"
        );

        self.store(key.clone(), series.clone());
        Ok(series)
    }

    fn store(&self, key: CacheKey, series: CachedSeries) {
        let mut cache = lock(&self.cache);
        cache.insert(key, series);

        let cutoff = now_ms() - self.config.max_age.as_millis() as i64;
        cache.retain(|_, entry| entry.fetched_at_ms >= cutoff);

        while cache.len() > self.config.max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at_ms)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    cache.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{make_bars, ScriptedSource};
    use crate::types::MINUTE_MS;

    const HOUR_MS: i64 = 60 * MINUTE_MS;
    const T0: i64 = 1_700_000_000_000 - (1_700_000_000_000 % HOUR_MS);

    fn fast_config() -> HistoryConfig {
        HistoryConfig {
            min_interval: Duration::from_millis(1),
            ..HistoryConfig::default()
        }
    }

    fn request(from_ms: i64, to_ms: i64) -> HistoryRequest {
        HistoryRequest {
            symbol: "btcusdt".to_string(),
            timeframe: "H1".to_string(),
            from_ms,
            to_ms,
        }
    }

    #[tokio::test]
    async fn test_second_fetch_served_from_cache() {
        let source = Arc::new(ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 48)));
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), fast_config()));

        let first = coordinator.fetch(request(T0, T0 + 47 * HOUR_MS)).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.bars.len(), 48);
        assert_eq!(first.timeframe, "1h");

        let second = coordinator.fetch(request(T0, T0 + 47 * HOUR_MS)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_repeat_fetch_with_retry_estimate() {
        let source = Arc::new(ScriptedSource::rate_limited(Duration::from_secs(10)));
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), fast_config()));

        let first = coordinator.fetch(request(T0, T0 + 10 * HOUR_MS)).await;
        assert!(matches!(first, Err(FetchError::RateLimited { .. })));

        let second = coordinator
            .fetch(request(T0, T0 + 10 * HOUR_MS))
            .await
            .unwrap_err();
        match &second {
            FetchError::RateLimited { retry_in_secs, .. } => {
                assert!(*retry_in_secs >= 1 && *retry_in_secs <= 10);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(second.to_string().contains("retry in"));
        // blocked requests never reach upstream
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_only_moves_forward() {
        let source = Arc::new(ScriptedSource::with_bars(vec![]));
        let coordinator = HistoryCoordinator::new(source, fast_config());
        let later = now_ms() + 60_000;
        coordinator.note_rate_limit(Some(later));
        coordinator.note_rate_limit(Some(now_ms() + 1_000));
        assert_eq!(coordinator.blocked_until_ms(), later);
    }

    #[tokio::test]
    async fn test_paging_merges_overlapping_chunks() {
        let source = Arc::new(
            ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 25)).with_overlap(2),
        );
        let config = HistoryConfig {
            chunk_bars: 10,
            ..fast_config()
        };
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), config));

        let series = coordinator.fetch(request(T0, T0 + 24 * HOUR_MS)).await.unwrap();
        assert_eq!(series.bars.len(), 25);
        assert_eq!(series.chunks, 3);
        assert!(series
            .bars
            .windows(2)
            .all(|w| w[0].open_time < w[1].open_time));
    }

    #[tokio::test]
    async fn test_paging_stops_at_chunk_guard() {
        let source = Arc::new(ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 100)));
        let config = HistoryConfig {
            chunk_bars: 10,
            max_chunks: 3,
            ..fast_config()
        };
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), config));

        let series = coordinator.fetch(request(T0, T0 + 99 * HOUR_MS)).await.unwrap();
        assert_eq!(source.calls(), 3);
        assert_eq!(series.bars.len(), 30);
        assert_eq!(series.bars[0].open_time, T0 + 70 * HOUR_MS);
    }

    #[tokio::test]
    async fn test_empty_chunk_ends_paging() {
        // only the most recent 5 bars exist
        let source = Arc::new(ScriptedSource::with_bars(make_bars(T0 + 95 * HOUR_MS, HOUR_MS, 5)));
        let config = HistoryConfig {
            chunk_bars: 5,
            ..fast_config()
        };
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), config));

        let series = coordinator.fetch(request(T0, T0 + 99 * HOUR_MS)).await.unwrap();
        assert_eq!(series.bars.len(), 5);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_fetches_reach_source_once() {
        let source = Arc::new(
            ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 24))
                .with_delay(Duration::from_millis(50)),
        );
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), fast_config()));

        let (a, b, c) = tokio::join!(
            coordinator.fetch(request(T0, T0 + 23 * HOUR_MS)),
            coordinator.fetch(request(T0, T0 + 23 * HOUR_MS)),
            coordinator.fetch(request(T0, T0 + 23 * HOUR_MS)),
        );
        assert_eq!(a.unwrap().bars.len(), 24);
        assert_eq!(b.unwrap().bars.len(), 24);
        assert_eq!(c.unwrap().bars.len(), 24);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_block_other_keys() {
        let source = Arc::new(
            ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 24))
                .with_delay(Duration::from_millis(100)),
        );
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), fast_config()));

        let abandoned = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.fetch(request(T0, T0 + 23 * HOUR_MS)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();

        let mut other = request(T0, T0 + 23 * HOUR_MS);
        other.symbol = "ethusdt".to_string();
        let series = tokio::time::timeout(Duration::from_secs(2), coordinator.fetch(other))
            .await
            .expect("fetch for another key must not hang")
            .unwrap();
        assert_eq!(series.symbol, "ETHUSDT");
        assert_eq!(series.bars.len(), 24);

        // the abandoned load still ran to completion and was cached
        let again = coordinator.fetch(request(T0, T0 + 23 * HOUR_MS)).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(source.calls(), 2);
        assert!(lock(&coordinator.pending).is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let source = Arc::new(ScriptedSource::with_bars(make_bars(T0, HOUR_MS, 48)));
        let config = HistoryConfig {
            max_entries: 2,
            ..fast_config()
        };
        let coordinator = Arc::new(HistoryCoordinator::new(source.clone(), config));

        for offset in 0..3 {
            coordinator
                .fetch(request(T0 + offset * HOUR_MS, T0 + 40 * HOUR_MS))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coordinator.cache_len(), 2);

        // the first key was evicted, so it goes upstream again
        let calls = source.calls();
        let again = coordinator.fetch(request(T0, T0 + 40 * HOUR_MS)).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(source.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let source = Arc::new(ScriptedSource::with_bars(vec![]));
        let coordinator = Arc::new(HistoryCoordinator::new(source, fast_config()));

        let mut bad_tf = request(T0, T0 + HOUR_MS);
        bad_tf.timeframe = "W1".to_string();
        assert!(matches!(
            coordinator.fetch(bad_tf).await,
            Err(FetchError::InvalidRequest(_))
        ));
        assert!(matches!(
            coordinator.fetch(request(T0 + HOUR_MS, T0)).await,
            Err(FetchError::InvalidRequest(_))
        ));
        assert!(matches!(
            coordinator.fetch(request(T0, T0 + HOUR_MS)).await,
            Err(FetchError::Empty { .. })
        ));
    }
}
