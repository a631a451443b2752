//! Provider trait and the fetch failure taxonomy.
//!
//! Providers do one thing: turn a single batch request into a frame. Rate
//! limiting, caching, batching, and retry all live above this trait in the
//! fetcher, so implementations stay small and mockable.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::catalog::DataSourceDescriptor;
use crate::frame::{EntityId, FactorFrame};

/// One provider call: a source, the fields wanted, canonical params, and a
/// batch of entity ids no larger than the source's `max_batch`.
#[derive(Debug)]
pub struct BatchRequest<'a> {
    pub descriptor: &'a DataSourceDescriptor,
    pub fields: &'a [String],
    pub params: &'a BTreeMap<String, String>,
    pub entities: &'a [EntityId],
}

/// Raw provider failures, classified for the retry policy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("response schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::Unavailable(_)
                | ProviderError::RateLimited { .. }
        )
    }
}

/// What the fetcher surfaces to callers once its own policy has run.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transient failure fetching '{source_name}' after {attempts} attempts: {last}")]
    Transient {
        source_name: String,
        attempts: u32,
        last: String,
    },

    #[error("permanent failure fetching '{source_name}': {reason}")]
    Permanent { source_name: String, reason: String },
}

impl FetchError {
    pub fn source(&self) -> &str {
        match self {
            FetchError::Transient { source_name, .. } | FetchError::Permanent { source_name, .. } => {
                source_name
            }
        }
    }
}

/// A market-data provider. Implementations must be callable from multiple
/// fetch workers at once.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch one batch. The returned frame carries one row per
    /// (entity, date) with the requested fields as columns; missing cells
    /// are NaN.
    fn fetch_batch(&self, request: &BatchRequest<'_>) -> Result<FactorFrame, ProviderError>;
}
