//! Deterministic synthetic provider for tests, demos, and factor test-runs.
//!
//! Every cell is a pure function of (source, entity, field, date): the same
//! request always produces the same table, with no network involved. Values
//! are drawn from a seeded RNG so they look like plausible market data
//! without being constant.

use chrono::{Duration as ChronoDuration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use super::provider::{BatchRequest, MarketDataProvider, ProviderError};
use crate::frame::FactorFrame;

/// Offline provider generating seeded pseudo-data.
#[derive(Debug, Default)]
pub struct SyntheticProvider {
    /// Mixed into every cell seed so tests can force distinct datasets.
    pub seed: u64,
}

impl SyntheticProvider {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn cell_value(&self, entity: &str, field: &str, date: NaiveDate) -> f64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(entity.as_bytes());
        hasher.update(field.as_bytes());
        hasher.update(date.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest.as_bytes()[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));

        // Field-flavored ranges keep the numbers recognizable in demos.
        match field {
            "pe" => rng.gen_range(4.0..60.0),
            "pb" => rng.gen_range(0.5..12.0),
            "dividend_yield" => rng.gen_range(0.0..0.08),
            "market_cap" => rng.gen_range(1e9..3e12),
            "close" => rng.gen_range(10.0..800.0),
            "volume" => rng.gen_range(1e5..5e7),
            "turnover" => rng.gen_range(0.001..0.2),
            _ => rng.gen_range(-1.0..1.0),
        }
    }

    fn window(params: &BTreeMap<String, String>) -> Result<Vec<NaiveDate>, ProviderError> {
        let end = params
            .get("date")
            .ok_or_else(|| ProviderError::Rejected("missing 'date' param".into()))
            .and_then(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| ProviderError::Rejected(format!("bad 'date' param: {e}")))
            })?;

        let lookback: i64 = params
            .get("lookback_days")
            .map(|raw| {
                raw.parse()
                    .map_err(|e| ProviderError::Rejected(format!("bad 'lookback_days': {e}")))
            })
            .transpose()?
            .unwrap_or(1)
            .max(1);

        Ok((0..lookback)
            .rev()
            .map(|offset| end - ChronoDuration::days(offset))
            .collect())
    }
}

impl MarketDataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch_batch(&self, request: &BatchRequest<'_>) -> Result<FactorFrame, ProviderError> {
        let dates = Self::window(request.params)?;

        let mut frame = FactorFrame::new();
        for entity in request.entities {
            for date in &dates {
                let values: BTreeMap<String, f64> = request
                    .fields
                    .iter()
                    .map(|f| (f.clone(), self.cell_value(entity, f, *date)))
                    .collect();
                frame.push_row(entity, *date, &values);
            }
        }
        Ok(frame)
    }
}
