//! RankLab CLI — validate factors, test-run them, execute strategy runs.
//!
//! Commands:
//! - `validate` — static safety analysis of a factor code file
//! - `test-run` — execute a factor against a sample universe and print
//!   sample rows plus per-group diagnostics
//! - `run` — execute a strategy spec end to end, polling progress, and
//!   export the ranked output
//! - `catalog` — list the data sources the resolver knows about

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ranklab_core::catalog::{
    CatalogStore, InMemoryCatalog, ParamBinding, RequestArgs, SelectionSpec,
};
use ranklab_core::data::{HttpProvider, MarketDataProvider, SyntheticProvider};
use ranklab_core::domain::{FactorDefinition, InMemoryDefinitions, StrategyDefinition};
use ranklab_core::standardize::{Direction, FillPolicy, ScaleMethod, StandardizeConfig};
use ranklab_core::universe::{Universe, UniverseFilter};
use ranklab_runner::orchestrator::RunRequest;
use ranklab_runner::{export, Engine, RunStatus, RunnerConfig, TestRunRequest};

#[derive(Parser)]
#[command(
    name = "ranklab",
    about = "RankLab CLI — factor validation, test-runs, and strategy runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically validate a factor code file against a selection.
    Validate {
        /// Path to the factor code file.
        code: PathBuf,

        /// Data source the selection draws from.
        #[arg(long)]
        source: String,

        /// Requested fields, comma separated (e.g. pe,pb).
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
    /// Execute a factor against a sample universe and print diagnostics.
    TestRun {
        /// Path to the factor code file.
        code: PathBuf,

        /// Data source the selection draws from.
        #[arg(long)]
        source: String,

        /// Requested fields, comma separated.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Sample entities, comma separated (e.g. AAPL,MSFT).
        #[arg(long, value_delimiter = ',')]
        entities: Vec<String>,

        /// Scoring date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Window length in days for time-series operators.
        #[arg(long, default_value_t = 20)]
        lookback: u32,
    },
    /// Run a strategy spec end to end and export the ranked output.
    Run {
        /// Path to a strategy spec TOML file.
        #[arg(long)]
        spec: PathBuf,

        /// Scoring date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Universe TOML file. Defaults to a built-in demo universe.
        #[arg(long)]
        universe: Option<PathBuf>,

        /// Catalog TOML file. Defaults to a built-in demo catalog.
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Market-data endpoint; omit to use the offline synthetic provider.
        #[arg(long)]
        base_url: Option<String>,

        /// Output directory for result artifacts.
        #[arg(long, default_value = "results")]
        out_dir: PathBuf,
    },
    /// List the data sources the resolver knows about.
    Catalog {
        /// Catalog TOML file. Defaults to a built-in demo catalog.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Validate {
            code,
            source,
            fields,
        } => cmd_validate(&code, &source, &fields),
        Commands::TestRun {
            code,
            source,
            fields,
            entities,
            date,
            lookback,
        } => cmd_test_run(&code, &source, &fields, entities, &date, lookback),
        Commands::Run {
            spec,
            date,
            universe,
            catalog,
            base_url,
            out_dir,
        } => cmd_run(&spec, &date, universe, catalog, base_url, &out_dir),
        Commands::Catalog { catalog } => cmd_catalog(catalog),
    }
}

fn load_catalog(path: Option<&Path>) -> Result<InMemoryCatalog> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).context("read catalog file")?;
            InMemoryCatalog::from_toml(&content).map_err(|e| anyhow::anyhow!(e))
        }
        None => Ok(InMemoryCatalog::default_demo()),
    }
}

fn load_universe(path: Option<&Path>) -> Result<Universe> {
    match path {
        Some(p) => Universe::from_file(p).map_err(|e| anyhow::anyhow!(e)),
        None => Ok(Universe::default_demo()),
    }
}

fn selection_for(source: &str, fields: &[String]) -> SelectionSpec {
    let refs: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
    SelectionSpec::single(source, &refs).with_param(
        source,
        "date",
        ParamBinding::Request { arg: "date".into() },
    )
}

fn cmd_validate(code_path: &Path, source: &str, fields: &[String]) -> Result<()> {
    let code = std::fs::read_to_string(code_path).context("read factor code file")?;
    let selection = selection_for(source, fields);
    let report = ranklab_core::dsl::validate(&code, &selection);

    if report.ok {
        println!("OK — fields used: {}", report.fields_used.join(", "));
        Ok(())
    } else {
        for error in &report.errors {
            println!("ERROR: {error}");
        }
        bail!("{} validation error(s)", report.errors.len());
    }
}

fn cmd_test_run(
    code_path: &Path,
    source: &str,
    fields: &[String],
    entities: Vec<String>,
    date: &str,
    lookback: u32,
) -> Result<()> {
    let code = std::fs::read_to_string(code_path).context("read factor code file")?;
    let selection = selection_for(source, fields).with_param(
        source,
        "lookback_days",
        ParamBinding::Fixed {
            value: lookback.to_string(),
        },
    );

    let engine = Engine::new(
        Arc::new(InMemoryCatalog::default_demo()),
        Arc::new(InMemoryDefinitions::new()),
        Arc::new(SyntheticProvider::new(42)),
        Universe::default_demo(),
        RunnerConfig::default(),
    );

    let report = engine.test_run(&TestRunRequest {
        code,
        selection,
        sample_universe: entities,
        args: RequestArgs::new().with("date", date),
        direction: Direction::HigherIsBetter,
        standardize: StandardizeConfig::default(),
    })?;

    println!("fields used: {}", report.fields_used.join(", "));
    println!("\n{:<8} {:<12} {:>12} {:>12}", "entity", "date", "raw", "std");
    for row in report.rows.iter().take(40) {
        println!(
            "{:<8} {:<12} {:>12.4} {:>12.4}",
            row.entity_id, row.date.to_string(), row.raw, row.standardized
        );
    }
    if report.rows.len() > 40 {
        println!("... ({} rows total)", report.rows.len());
    }

    println!("\nper-group diagnostics:");
    for (date, diag) in &report.diagnostics {
        println!(
            "  {date}: n={} mean={:.4} std={:.4} skew={:.3} kurt={:.3} clipped={}/{} filled={}",
            diag.valid,
            diag.mean,
            diag.std,
            diag.skewness,
            diag.kurtosis,
            diag.clipped_low,
            diag.clipped_high,
            diag.filled
        );
    }

    for (entity, error) in &report.failures {
        println!("FAILED {entity}: {error}");
    }
    Ok(())
}

// ── strategy spec file ──────────────────────────────────────────────

/// TOML shape of a strategy spec the CLI can run without a definition
/// store behind it.
#[derive(Debug, Deserialize)]
struct StrategySpec {
    strategy: StrategySection,
    #[serde(rename = "factor")]
    factors: Vec<FactorSection>,
}

#[derive(Debug, Deserialize)]
struct StrategySection {
    id: String,
    name: String,
    #[serde(default = "default_top_n")]
    top_n: usize,
    /// "all", "category:<name>", or "ids:A,B,C".
    #[serde(default = "default_universe")]
    universe: String,
    /// zscore | robust_zscore | rank | minmax
    #[serde(default = "default_method")]
    method: String,
}

fn default_top_n() -> usize {
    20
}

fn default_universe() -> String {
    "all".into()
}

fn default_method() -> String {
    "zscore".into()
}

#[derive(Debug, Deserialize)]
struct FactorSection {
    id: String,
    code: String,
    weight: f64,
    #[serde(default)]
    lower_is_better: bool,
    source: String,
    fields: Vec<String>,
    #[serde(default)]
    params: BTreeMap<String, f64>,
}

fn parse_universe_filter(raw: &str) -> Result<UniverseFilter> {
    if raw == "all" {
        return Ok(UniverseFilter::All);
    }
    if let Some(name) = raw.strip_prefix("category:") {
        return Ok(UniverseFilter::Category { name: name.into() });
    }
    if let Some(ids) = raw.strip_prefix("ids:") {
        return Ok(UniverseFilter::Explicit {
            ids: ids.split(',').map(str::to_string).collect(),
        });
    }
    bail!("bad universe filter '{raw}' (expected all | category:<name> | ids:<A,B,...>)");
}

fn parse_method(raw: &str) -> Result<ScaleMethod> {
    Ok(match raw {
        "zscore" => ScaleMethod::ZScore,
        "robust_zscore" => ScaleMethod::RobustZScore,
        "rank" => ScaleMethod::Rank,
        "minmax" => ScaleMethod::MinMax,
        other => bail!("unknown scale method '{other}'"),
    })
}

fn cmd_run(
    spec_path: &Path,
    date: &str,
    universe_path: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    base_url: Option<String>,
    out_dir: &Path,
) -> Result<()> {
    let spec: StrategySpec = toml::from_str(
        &std::fs::read_to_string(spec_path).context("read strategy spec file")?,
    )
    .context("parse strategy spec TOML")?;

    let catalog = load_catalog(catalog_path.as_deref())?;
    let universe = load_universe(universe_path.as_deref())?;
    let provider: Arc<dyn MarketDataProvider> = match base_url {
        Some(url) => Arc::new(HttpProvider::new(url)),
        None => Arc::new(SyntheticProvider::new(42)),
    };

    // Build the in-memory definition store from the spec.
    let mut definitions = InMemoryDefinitions::new();
    let mut weights = Vec::new();
    for factor in &spec.factors {
        let selection = selection_for(&factor.source, &factor.fields);
        let report = ranklab_core::dsl::validate(&factor.code, &selection);
        if !report.ok {
            for error in &report.errors {
                eprintln!("ERROR in factor '{}': {error}", factor.id);
            }
            bail!("factor '{}' failed validation", factor.id);
        }

        definitions.insert_factor(FactorDefinition {
            id: factor.id.clone(),
            name: factor.id.clone(),
            code: factor.code.clone(),
            fields_used: report.fields_used,
            direction: if factor.lower_is_better {
                Direction::LowerIsBetter
            } else {
                Direction::HigherIsBetter
            },
            selection,
            params: factor.params.clone(),
        });
        weights.push((factor.id.clone(), factor.weight, true));
    }

    let standardize = StandardizeConfig {
        winsorize: Some((0.01, 0.99)),
        fill: FillPolicy::Median,
        method: parse_method(&spec.strategy.method)?,
    };
    let strategy = StrategyDefinition::new(
        &spec.strategy.id,
        &spec.strategy.name,
        weights,
        standardize,
        parse_universe_filter(&spec.strategy.universe)?,
        spec.strategy.top_n,
    )
    .map_err(|e| anyhow::anyhow!("strategy weights: {e}"))?;
    let strategy_id = strategy.id.clone();
    definitions.insert_strategy(strategy);

    let engine = Engine::new(
        Arc::new(catalog),
        Arc::new(definitions),
        provider,
        universe,
        RunnerConfig::default(),
    );

    let run_id = engine.run_strategy(
        &strategy_id,
        RunRequest {
            args: RequestArgs::new().with("date", date),
            universe_override: None,
            deadline: None,
        },
    )?;
    println!("run {run_id} started");

    // Poll progress until terminal.
    let view = loop {
        let snapshot = engine
            .progress(&run_id)
            .context("run disappeared from registry")?;
        println!(
            "  [{:>5.1}%] {}",
            snapshot.percent,
            snapshot.stage.name()
        );
        if snapshot.status.is_terminal() {
            break engine.result(&run_id).context("missing result")?;
        }
        std::thread::sleep(Duration::from_millis(200));
    };

    match view.status {
        RunStatus::Completed => {
            let outcome = view.outcome.context("completed run has an outcome")?;
            println!(
                "\ncompleted: {} scored, {} excluded, {} factor failures",
                outcome.entities_scored, outcome.entities_excluded, outcome.factor_failures
            );
            println!("\n{:<6} {:<8} {:>10}", "rank", "entity", "score");
            for row in &outcome.top_n {
                println!("{:<6} {:<8} {:>10.4}", row.rank, row.entity_id, row.score);
            }

            std::fs::create_dir_all(out_dir).context("create output directory")?;
            let json = export::export_json(&outcome)?;
            std::fs::write(out_dir.join(format!("{run_id}.json")), json)?;
            let csv = export::export_scores_csv(&outcome.top_n)?;
            std::fs::write(out_dir.join(format!("{run_id}.csv")), csv)?;
            export::write_scores_parquet(&outcome.top_n, &out_dir.join(format!("{run_id}.parquet")))?;
            println!("\nartifacts written to {}", out_dir.display());
            Ok(())
        }
        RunStatus::Failed => {
            for log in engine.progress(&run_id).context("progress")?.logs {
                println!("  {:?} [{}] {}", log.level, log.stage.name(), log.message);
            }
            bail!(
                "run failed: {}",
                view.failure.unwrap_or_else(|| "unknown".into())
            )
        }
        RunStatus::Cancelled => bail!("run was cancelled"),
        RunStatus::Running => unreachable!("polled until terminal"),
    }
}

fn cmd_catalog(catalog_path: Option<PathBuf>) -> Result<()> {
    let catalog = load_catalog(catalog_path.as_deref())?;
    for name in catalog.source_names() {
        let descriptor = catalog.get(&name).context("listed source exists")?;
        println!(
            "{name} ({:?}): fields [{}], params [{}], {} qps, batch {}",
            descriptor.axis,
            descriptor.fields.join(", "),
            descriptor
                .params
                .iter()
                .map(|p| if p.required {
                    format!("{}*", p.name)
                } else {
                    p.name.clone()
                })
                .collect::<Vec<_>>()
                .join(", "),
            descriptor.rate.qps,
            descriptor.max_batch
        );
    }
    Ok(())
}
