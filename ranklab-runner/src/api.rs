//! The engine facade exposed to UI/CLI/API layers.
//!
//! Six operations: `validate`, `test_run`, `run_strategy` (non-blocking),
//! `progress`, `result`, `cancel`. All payloads are serde-structured
//! records; the engine owns the process-wide fetcher (rate limiter +
//! cache) and the run registry.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use ranklab_core::catalog::{resolve, CatalogStore, RequestArgs, ResolveError, SelectionSpec};
use ranklab_core::data::{DataFetcher, FetchCache, MarketDataProvider};
use ranklab_core::domain::DefinitionStore;
use ranklab_core::dsl::{self, CompiledFactor, ExecLimits, ValidationReport};
use ranklab_core::frame::EntityId;
use ranklab_core::standardize::{standardize_group, Direction, GroupDiagnostics, StandardizeConfig};
use ranklab_core::universe::Universe;

use crate::config::RunnerConfig;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::registry::RunRegistry;
use crate::run::{ProgressSnapshot, RunResultView};

/// Inputs for a factor test-run against a sample universe.
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    pub code: String,
    pub selection: SelectionSpec,
    pub sample_universe: Vec<EntityId>,
    pub args: RequestArgs,
    pub direction: Direction,
    pub standardize: StandardizeConfig,
}

/// One sample output row: raw and standardized factor value.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub raw: f64,
    pub standardized: f64,
}

/// Result of a test-run: sample rows plus per-group diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TestRunReport {
    pub fields_used: Vec<String>,
    pub rows: Vec<SampleRow>,
    pub diagnostics: BTreeMap<NaiveDate, GroupDiagnostics>,
    /// Entities whose execution failed, with the structured error text.
    pub failures: Vec<(EntityId, String)>,
}

#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("code failed validation with {} error(s)", .0.errors.len())]
    Invalid(ValidationReport),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("sample universe is empty")]
    EmptySample,

    #[error("no data fetched for the sample universe")]
    NoData,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("strategy '{0}' not found")]
    UnknownStrategy(String),
}

/// The engine: shared services plus the run registry.
pub struct Engine {
    definitions: Arc<dyn DefinitionStore>,
    catalog: Arc<dyn CatalogStore>,
    fetcher: Arc<DataFetcher>,
    registry: Arc<RunRegistry>,
    orchestrator: Arc<Orchestrator>,
    exec_limits: ExecLimits,
}

impl Engine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        definitions: Arc<dyn DefinitionStore>,
        provider: Arc<dyn MarketDataProvider>,
        universe: Universe,
        config: RunnerConfig,
    ) -> Self {
        let cache = Arc::new(FetchCache::new(config.cache_ttl(), config.cache_capacity));
        let fetcher = Arc::new(DataFetcher::new(provider, cache, config.fetcher_config()));
        let exec_limits = config.exec_limits();
        let orchestrator = Arc::new(Orchestrator::new(
            catalog.clone(),
            definitions.clone(),
            fetcher.clone(),
            Arc::new(universe),
            config,
        ));

        Self {
            definitions,
            catalog,
            fetcher,
            registry: Arc::new(RunRegistry::new()),
            orchestrator,
            exec_limits,
        }
    }

    /// Static safety analysis only — no execution, no fetches.
    pub fn validate(&self, code: &str, selection: &SelectionSpec) -> ValidationReport {
        dsl::validate(code, selection)
    }

    /// Validate, fetch a sample, execute, standardize — synchronously.
    pub fn test_run(&self, request: &TestRunRequest) -> Result<TestRunReport, TestRunError> {
        if request.sample_universe.is_empty() {
            return Err(TestRunError::EmptySample);
        }

        let compiled = CompiledFactor::compile(&request.code, &request.selection)
            .map_err(TestRunError::Invalid)?;
        let plan = resolve(self.catalog.as_ref(), &request.selection, &request.args)?;

        let outcome = self.fetcher.fetch(&plan, &request.sample_universe);
        if outcome.is_total_failure() || outcome.frame.is_empty() {
            return Err(TestRunError::NoData);
        }

        let axis = outcome.frame.date_axis();
        let mut failures = Vec::new();
        let mut series_per_entity: BTreeMap<EntityId, Vec<f64>> = BTreeMap::new();

        for entity in &request.sample_universe {
            let view = outcome.frame.entity_view(entity, &axis);
            if view.is_all_missing() {
                failures.push((entity.clone(), "no data fetched".to_string()));
                continue;
            }
            match compiled.execute(&view, &BTreeMap::new(), &self.exec_limits) {
                Ok(series) => {
                    series_per_entity.insert(entity.clone(), series);
                }
                Err(e) => failures.push((entity.clone(), e.to_string())),
            }
        }

        // Standardize each cross-sectional group (one per date).
        let mut rows = Vec::new();
        let mut diagnostics = BTreeMap::new();
        for (i, date) in axis.iter().enumerate() {
            let members: Vec<&EntityId> = series_per_entity.keys().collect();
            let raw: Vec<f64> = members.iter().map(|e| series_per_entity[*e][i]).collect();
            let (scaled, diag) =
                standardize_group(&raw, request.direction, &request.standardize);
            diagnostics.insert(*date, diag);

            for ((entity, raw), standardized) in members.into_iter().zip(raw.iter()).zip(scaled) {
                rows.push(SampleRow {
                    entity_id: entity.clone(),
                    date: *date,
                    raw: *raw,
                    standardized,
                });
            }
        }

        Ok(TestRunReport {
            fields_used: compiled.fields_used.clone(),
            rows,
            diagnostics,
            failures,
        })
    }

    /// Start a strategy run on a worker thread; returns the run id
    /// immediately.
    pub fn run_strategy(
        &self,
        strategy_id: &str,
        request: RunRequest,
    ) -> Result<String, StartError> {
        if self.definitions.strategy(strategy_id).is_none() {
            return Err(StartError::UnknownStrategy(strategy_id.to_string()));
        }

        let handle = self.registry.create(strategy_id);
        let run_id = handle.run_id.clone();

        let orchestrator = self.orchestrator.clone();
        let strategy_id = strategy_id.to_string();
        std::thread::Builder::new()
            .name(format!("run-{run_id}"))
            .spawn(move || {
                orchestrator.execute_run(&strategy_id, &request, &handle);
            })
            .expect("failed to spawn run worker");

        Ok(run_id)
    }

    pub fn progress(&self, run_id: &str) -> Option<ProgressSnapshot> {
        self.registry.get(run_id).map(|h| h.snapshot())
    }

    pub fn result(&self, run_id: &str) -> Option<RunResultView> {
        self.registry.get(run_id).map(|h| h.result_view())
    }

    /// Flag a run cancelled. Honored between stage boundaries.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.registry.cancel(run_id)
    }

    /// The process-wide fetcher (shared rate limiter and cache).
    pub fn fetcher(&self) -> &DataFetcher {
        &self.fetcher
    }
}
