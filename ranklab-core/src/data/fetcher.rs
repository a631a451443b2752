//! Plan execution — batching, bounded concurrency, read-through caching,
//! and retry with exponential backoff.
//!
//! One fetcher is shared process-wide: concurrent runs go through the same
//! per-source token buckets and the same cache, which is exactly the
//! isolation boundary the orchestrator expects.

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::cache::{cache_key, FetchCache};
use super::provider::{BatchRequest, FetchError, MarketDataProvider};
use super::rate_limit::TokenBucket;
use crate::catalog::FetchPlan;
use crate::frame::{EntityId, FactorFrame};

/// Fetcher policy knobs.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Retry attempts after the first try, transient failures only.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// How long a batch will wait on the token bucket before counting the
    /// attempt as a transient failure.
    pub rate_acquire_timeout: Duration,
    /// Bounded concurrency for batch fetches.
    pub workers: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            rate_acquire_timeout: Duration::from_secs(30),
            workers: 8,
        }
    }
}

/// A batch that failed after the full retry policy ran.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub source: String,
    pub entities: Vec<EntityId>,
    pub error: FetchError,
}

/// Result of executing a plan: the merged frame plus per-batch failures the
/// caller may tolerate.
#[derive(Debug)]
pub struct FetchOutcome {
    pub frame: FactorFrame,
    pub failures: Vec<BatchFailure>,
    pub batches_total: usize,
}

impl FetchOutcome {
    /// True when not a single batch produced data.
    pub fn is_total_failure(&self) -> bool {
        self.batches_total > 0 && self.failures.len() == self.batches_total
    }
}

/// The rate-limited, cached, retrying fetch service.
pub struct DataFetcher {
    provider: Arc<dyn MarketDataProvider>,
    cache: Arc<FetchCache>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    config: FetcherConfig,
    pool: rayon::ThreadPool,
}

impl DataFetcher {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        cache: Arc<FetchCache>,
        config: FetcherConfig,
    ) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("fetch-{i}"))
            .build()
            .expect("failed to build fetch pool");

        Self {
            provider,
            cache,
            buckets: Mutex::new(HashMap::new()),
            config,
            pool,
        }
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    fn bucket_for(&self, source: &str, policy: crate::catalog::RatePolicy) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(policy)))
            .clone()
    }

    /// Execute a plan for the given entities.
    pub fn fetch(&self, plan: &FetchPlan, entities: &[EntityId]) -> FetchOutcome {
        self.fetch_with_progress(plan, entities, &|_, _| {})
    }

    /// Execute a plan, reporting `(batches_done, batches_total)` as each
    /// batch resolves.
    pub fn fetch_with_progress(
        &self,
        plan: &FetchPlan,
        entities: &[EntityId],
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> FetchOutcome {
        // Sorted batch members keep cache keys canonical.
        let mut sorted_entities = entities.to_vec();
        sorted_entities.sort();
        sorted_entities.dedup();

        struct Job<'a> {
            fetch_index: usize,
            batch: &'a [EntityId],
        }

        let mut jobs = Vec::new();
        for (fetch_index, fetch) in plan.fetches.iter().enumerate() {
            for batch in sorted_entities.chunks(fetch.descriptor.max_batch.max(1)) {
                jobs.push(Job { fetch_index, batch });
            }
        }
        let batches_total = jobs.len();

        let done = std::sync::atomic::AtomicUsize::new(0);
        let results: Vec<Result<Arc<FactorFrame>, BatchFailure>> = self.pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let fetch = &plan.fetches[job.fetch_index];
                    let key = cache_key(&fetch.descriptor.name, &fetch.params, job.batch);
                    let result = self
                        .cache
                        .get_or_fetch(&key, || self.fetch_batch_with_retry(fetch, job.batch))
                        .map_err(|error| BatchFailure {
                            source: fetch.descriptor.name.clone(),
                            entities: job.batch.to_vec(),
                            error,
                        });
                    let n = done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    progress(n, batches_total);
                    result
                })
                .collect()
        });

        let mut frame = FactorFrame::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(batch_frame) => frame.merge(&batch_frame),
                Err(failure) => failures.push(failure),
            }
        }
        frame.sort_rows();

        FetchOutcome {
            frame,
            failures,
            batches_total,
        }
    }

    /// One batch through the token bucket and the retry policy.
    fn fetch_batch_with_retry(
        &self,
        fetch: &crate::catalog::SourceFetch,
        batch: &[EntityId],
    ) -> Result<FactorFrame, FetchError> {
        let source = &fetch.descriptor.name;
        let bucket = self.bucket_for(source, fetch.descriptor.rate);
        let request = BatchRequest {
            descriptor: &fetch.descriptor,
            fields: &fetch.fields,
            params: &fetch.params,
            entities: batch,
        };

        let mut last_error = String::from("no attempts made");

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.base_delay * 2u32.pow(attempt - 1);
                std::thread::sleep(delay);
            }

            if !bucket.acquire(self.config.rate_acquire_timeout) {
                last_error = "rate limiter acquisition timed out".to_string();
                continue;
            }

            match self.provider.fetch_batch(&request) {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                }
                Err(e) => {
                    return Err(FetchError::Permanent {
                        source_name: source.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        Err(FetchError::Transient {
            source_name: source.clone(),
            attempts: self.config.max_retries + 1,
            last: last_error,
        })
    }
}
