//! The six-stage run pipeline.
//!
//! `Initialization → UniverseFiltering → DataFetching → FactorExecution →
//! RankingSelection → Finalization`, strictly sequential. Failures below
//! the run level (a fetch batch, one factor on one entity) downgrade to
//! warnings; only conditions that make the output meaningless — empty
//! universe, no data at all, every factor failing everywhere — escalate to
//! a terminal `Failed`.
//!
//! Cancellation and the run deadline are honored between stage boundaries;
//! in-flight work units are not force-killed, their results are discarded.

use chrono::NaiveDate;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use ranklab_core::catalog::{resolve, CatalogStore, FetchPlan, RequestArgs};
use ranklab_core::data::DataFetcher;
use ranklab_core::domain::{DefinitionStore, FactorDefinition, StrategyDefinition};
use ranklab_core::dsl::{CompiledFactor, ExecLimits};
use ranklab_core::frame::{EntityId, FactorFrame};
use ranklab_core::standardize::standardize_group;
use ranklab_core::universe::{Universe, UniverseFilter};

use crate::config::RunnerConfig;
use crate::run::{RunHandle, Stage};
use crate::scoring::{composite_scores, rank_rows, RunOutcome, StandardizedFactor};

/// Per-run request parameters.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Request-supplied selection args; must carry the scoring `date`.
    pub args: RequestArgs,
    /// Overrides the strategy's universe filter when present.
    pub universe_override: Option<UniverseFilter>,
    /// Overrides the configured run deadline when present.
    pub deadline: Option<Duration>,
}

/// Fatal run conditions — each produces a specific terminal message.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("strategy '{0}' not found")]
    UnknownStrategy(String),

    #[error("strategy '{strategy}' references unknown factor '{factor}'")]
    UnknownFactor { strategy: String, factor: String },

    #[error("request args missing 'date'")]
    MissingDate,

    #[error("bad 'date' request arg: {0}")]
    BadDate(String),

    #[error("no enabled factor compiled and resolved; nothing to run")]
    NoRunnableFactors,

    #[error("empty universe after filtering ({filter})")]
    EmptyUniverse { filter: String },

    #[error("no data fetched: every batch of every factor failed")]
    NoData,

    #[error("all factors failed for all entities; no composite scores produced")]
    AllFactorsFailed,
}

/// Why a pipeline stopped before Finalization.
enum Interrupt {
    Cancelled,
    Deadline(Stage),
    Fatal(OrchestrationError),
}

impl From<OrchestrationError> for Interrupt {
    fn from(e: OrchestrationError) -> Self {
        Interrupt::Fatal(e)
    }
}

/// One enabled factor, compiled and resolved, ready to fetch and execute.
struct RunnableFactor {
    definition: Arc<FactorDefinition>,
    weight: f64,
    compiled: CompiledFactor,
    plan: FetchPlan,
    frame: Option<FactorFrame>,
}

/// The run pipeline executor. One orchestrator serves many runs; it holds
/// only shared services and configuration.
pub struct Orchestrator {
    catalog: Arc<dyn CatalogStore>,
    definitions: Arc<dyn DefinitionStore>,
    fetcher: Arc<DataFetcher>,
    universe: Arc<Universe>,
    config: RunnerConfig,
    exec_pool: rayon::ThreadPool,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        definitions: Arc<dyn DefinitionStore>,
        fetcher: Arc<DataFetcher>,
        universe: Arc<Universe>,
        config: RunnerConfig,
    ) -> Self {
        let exec_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.exec_workers.max(1))
            .thread_name(|i| format!("factor-exec-{i}"))
            .build()
            .expect("failed to build execution pool");

        Self {
            catalog,
            definitions,
            fetcher,
            universe,
            config,
            exec_pool,
        }
    }

    /// Drive one run to a terminal status on the caller's thread.
    pub fn execute_run(&self, strategy_id: &str, request: &RunRequest, handle: &RunHandle) {
        match self.run_pipeline(strategy_id, request, handle) {
            Ok(outcome) => {
                handle.info(format!(
                    "run completed: {} entities scored, top {} returned",
                    outcome.entities_scored,
                    outcome.top_n.len()
                ));
                handle.complete(outcome);
            }
            Err(Interrupt::Cancelled) => {
                handle.info("run cancelled; in-flight results discarded");
                handle.mark_cancelled();
            }
            Err(Interrupt::Deadline(stage)) => {
                handle.fail(format!(
                    "run deadline exceeded during {} (timeout)",
                    stage.name()
                ));
            }
            Err(Interrupt::Fatal(e)) => handle.fail(e.to_string()),
        }
    }

    fn run_pipeline(
        &self,
        strategy_id: &str,
        request: &RunRequest,
        handle: &RunHandle,
    ) -> Result<RunOutcome, Interrupt> {
        let deadline = request
            .deadline
            .or_else(|| self.config.run_deadline())
            .map(|d| Instant::now() + d);

        let checkpoint = |stage: Stage| -> Result<(), Interrupt> {
            if handle.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(Interrupt::Deadline(stage));
                }
            }
            Ok(())
        };

        // ── Stage 1: Initialization ─────────────────────────────────
        let strategy = self
            .definitions
            .strategy(strategy_id)
            .ok_or_else(|| OrchestrationError::UnknownStrategy(strategy_id.to_string()))?;
        let as_of = parse_as_of(&request.args)?;

        let mut factors = self.load_factors(&strategy, request, handle)?;
        handle.info(format!(
            "strategy '{}': {} runnable factors, scoring as of {as_of}",
            strategy.name,
            factors.len()
        ));
        handle.finish_stage();
        checkpoint(Stage::Initialization)?;

        // ── Stage 2: UniverseFiltering ──────────────────────────────
        handle.enter_stage(Stage::UniverseFiltering);
        let filter = request
            .universe_override
            .clone()
            .unwrap_or_else(|| strategy.universe.clone());
        let entities = self.universe.apply_filter(&filter);
        if entities.is_empty() {
            return Err(OrchestrationError::EmptyUniverse {
                filter: describe_filter(&filter),
            }
            .into());
        }
        handle.info(format!(
            "universe: {} entities ({})",
            entities.len(),
            describe_filter(&filter)
        ));
        handle.finish_stage();
        checkpoint(Stage::UniverseFiltering)?;

        // ── Stage 3: DataFetching ───────────────────────────────────
        handle.enter_stage(Stage::DataFetching);
        self.fetch_stage(&mut factors, &entities, handle)?;
        handle.finish_stage();
        checkpoint(Stage::DataFetching)?;

        // ── Stage 4: FactorExecution ────────────────────────────────
        handle.enter_stage(Stage::FactorExecution);
        let (raw_values, failure_count) = self.execution_stage(&factors, &entities, as_of, handle);
        if raw_values.values().all(|m| m.is_empty()) {
            return Err(OrchestrationError::AllFactorsFailed.into());
        }
        handle.finish_stage();
        checkpoint(Stage::FactorExecution)?;

        // ── Stage 5: RankingSelection ───────────────────────────────
        handle.enter_stage(Stage::RankingSelection);
        handle.set_units(factors.len());
        let mut standardized = Vec::new();
        for factor in &factors {
            if let Some(raw) = raw_values.get(&factor.definition.id) {
                standardized.push(standardize_factor(factor, raw, &strategy));
            }
            handle.unit_done();
        }

        let rows = composite_scores(&standardized, &entities, as_of);
        if rows.is_empty() {
            return Err(OrchestrationError::AllFactorsFailed.into());
        }
        let ranked = rank_rows(rows);
        handle.finish_stage();
        checkpoint(Stage::RankingSelection)?;

        // ── Stage 6: Finalization ───────────────────────────────────
        handle.enter_stage(Stage::Finalization);
        let entities_scored = ranked.len();
        let top_n = if strategy.top_n > 0 {
            strategy.top_n
        } else {
            self.config.default_top_n
        };
        let outcome = RunOutcome {
            as_of: Some(as_of),
            top_n: ranked.into_iter().take(top_n).collect(),
            entities_scored,
            entities_excluded: entities.len() - entities_scored,
            factor_failures: failure_count,
        };
        handle.finish_stage();
        Ok(outcome)
    }

    /// Resolve the strategy's enabled factors into runnable units. A factor
    /// that no longer compiles or resolves is excluded with a warning; a
    /// missing definition is fatal (configuration, not data).
    fn load_factors(
        &self,
        strategy: &StrategyDefinition,
        request: &RunRequest,
        handle: &RunHandle,
    ) -> Result<Vec<RunnableFactor>, Interrupt> {
        let mut factors = Vec::new();

        for slot in strategy.enabled_factors() {
            let definition = self.definitions.factor(&slot.factor_id).ok_or_else(|| {
                OrchestrationError::UnknownFactor {
                    strategy: strategy.id.clone(),
                    factor: slot.factor_id.clone(),
                }
            })?;

            let compiled = match CompiledFactor::compile(&definition.code, &definition.selection) {
                Ok(c) => c,
                Err(report) => {
                    handle.warn(format!(
                        "factor '{}' excluded: failed validation ({} errors)",
                        slot.factor_id,
                        report.errors.len()
                    ));
                    continue;
                }
            };

            let plan = match resolve(
                self.catalog.as_ref(),
                &definition.selection,
                &request.args,
            ) {
                Ok(p) => p,
                Err(e) => {
                    handle.warn(format!(
                        "factor '{}' excluded: selection did not resolve: {e}",
                        slot.factor_id
                    ));
                    continue;
                }
            };

            factors.push(RunnableFactor {
                definition,
                weight: slot.weight,
                compiled,
                plan,
                frame: None,
            });
        }

        if factors.is_empty() {
            return Err(OrchestrationError::NoRunnableFactors.into());
        }
        Ok(factors)
    }

    /// Fetch every runnable factor's plan, tolerating partial failures.
    fn fetch_stage(
        &self,
        factors: &mut [RunnableFactor],
        entities: &[EntityId],
        handle: &RunHandle,
    ) -> Result<(), Interrupt> {
        let total_batches: usize = factors
            .iter()
            .map(|f| {
                f.plan
                    .fetches
                    .iter()
                    .map(|s| entities.len().div_ceil(s.descriptor.max_batch.max(1)))
                    .sum::<usize>()
            })
            .sum();
        handle.set_units(total_batches);

        for factor in factors.iter_mut() {
            let outcome =
                self.fetcher
                    .fetch_with_progress(&factor.plan, entities, &|_, _| handle.unit_done());

            for failure in &outcome.failures {
                handle.warn(format!(
                    "fetch failed for source '{}' ({} entities): {}",
                    failure.source,
                    failure.entities.len(),
                    failure.error
                ));
            }

            if outcome.is_total_failure() {
                handle.warn(format!(
                    "factor '{}' excluded: every fetch batch failed",
                    factor.definition.id
                ));
            } else {
                factor.frame = Some(outcome.frame);
            }
        }

        if factors.iter().all(|f| f.frame.is_none()) {
            return Err(OrchestrationError::NoData.into());
        }
        Ok(())
    }

    /// Run every (factor, entity) pair under the sandbox ceilings with
    /// bounded concurrency. Returns raw factor values per factor id plus
    /// the failure count. Individual failures are warnings, never fatal
    /// here.
    fn execution_stage(
        &self,
        factors: &[RunnableFactor],
        entities: &[EntityId],
        as_of: NaiveDate,
        handle: &RunHandle,
    ) -> (BTreeMap<String, BTreeMap<EntityId, f64>>, usize) {
        let limits: ExecLimits = self.config.exec_limits();

        struct Unit<'a> {
            factor: &'a RunnableFactor,
            axis: Arc<Vec<NaiveDate>>,
            entity: &'a EntityId,
        }

        let mut units = Vec::new();
        for factor in factors {
            if let Some(frame) = &factor.frame {
                let axis = Arc::new(frame.date_axis());
                for entity in entities {
                    units.push(Unit {
                        factor,
                        axis: axis.clone(),
                        entity,
                    });
                }
            }
        }
        handle.set_units(units.len());

        type UnitResult = Result<(String, EntityId, f64), (String, EntityId, String)>;
        let results: Vec<Option<UnitResult>> = self.exec_pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    // Cancelled runs discard in-flight work.
                    if handle.is_cancelled() {
                        return None;
                    }
                    let factor_id = unit.factor.definition.id.clone();
                    let frame = unit.factor.frame.as_ref().expect("units have frames");
                    let view = frame.entity_view(unit.entity, &unit.axis);

                    let result = if view.is_all_missing() {
                        Err((factor_id, unit.entity.clone(), "no data fetched".to_string()))
                    } else {
                        match unit.factor.compiled.execute(
                            &view,
                            &unit.factor.definition.params,
                            &limits,
                        ) {
                            Ok(series) => {
                                let value = value_at(&unit.axis, &series, as_of);
                                Ok((factor_id, unit.entity.clone(), value))
                            }
                            Err(e) => Err((factor_id, unit.entity.clone(), e.to_string())),
                        }
                    };
                    handle.unit_done();
                    Some(result)
                })
                .collect()
        });

        let mut raw_values: BTreeMap<String, BTreeMap<EntityId, f64>> = BTreeMap::new();
        for factor in factors {
            if factor.frame.is_some() {
                raw_values.insert(factor.definition.id.clone(), BTreeMap::new());
            }
        }

        let mut failures = 0;
        for result in results.into_iter().flatten() {
            match result {
                Ok((factor_id, entity, value)) => {
                    raw_values
                        .entry(factor_id)
                        .or_default()
                        .insert(entity, value);
                }
                Err((factor_id, entity, message)) => {
                    failures += 1;
                    handle.warn(format!(
                        "factor '{factor_id}' failed for entity '{entity}': {message}"
                    ));
                }
            }
        }

        (raw_values, failures)
    }
}

/// Standardize one factor's cross-section over the entities it succeeded
/// for. Entities the factor failed on stay absent, so the fill policy never
/// resurrects them — exclusion and missing-value fill are different
/// channels.
fn standardize_factor(
    factor: &RunnableFactor,
    raw: &BTreeMap<EntityId, f64>,
    strategy: &StrategyDefinition,
) -> StandardizedFactor {
    let members: Vec<&EntityId> = raw.keys().collect();
    let values: Vec<f64> = members.iter().map(|e| raw[*e]).collect();
    let (scaled, _) = standardize_group(
        &values,
        factor.definition.direction,
        &strategy.standardize,
    );

    let values: BTreeMap<EntityId, f64> = members
        .into_iter()
        .zip(scaled)
        .filter(|(_, v)| v.is_finite())
        .map(|(e, v)| (e.clone(), v))
        .collect();

    StandardizedFactor {
        factor_id: factor.definition.id.clone(),
        weight: factor.weight,
        values,
    }
}

/// The factor value for scoring: the series value at the as-of date, or
/// the final window value when the provider's axis ends earlier.
fn value_at(axis: &[NaiveDate], series: &[f64], as_of: NaiveDate) -> f64 {
    axis.iter()
        .position(|d| *d == as_of)
        .and_then(|i| series.get(i))
        .or_else(|| series.last())
        .copied()
        .unwrap_or(f64::NAN)
}

fn parse_as_of(args: &RequestArgs) -> Result<NaiveDate, OrchestrationError> {
    let raw = args.get("date").ok_or(OrchestrationError::MissingDate)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| OrchestrationError::BadDate(format!("{raw}: {e}")))
}

fn describe_filter(filter: &UniverseFilter) -> String {
    match filter {
        UniverseFilter::Explicit { ids } => format!("explicit list of {} ids", ids.len()),
        UniverseFilter::Category { name } => format!("category '{name}'"),
        UniverseFilter::All => "all entities".to_string(),
    }
}
