//! Criterion benchmarks for RankLab hot paths.
//!
//! Benchmarks:
//! 1. Cross-sectional standardization (all four scale methods)
//! 2. Factor DSL execution (compile once, execute per entity)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use ranklab_core::catalog::SelectionSpec;
use ranklab_core::dsl::{CompiledFactor, ExecLimits};
use ranklab_core::frame::EntityView;
use ranklab_core::standardize::{
    standardize_group, Direction, FillPolicy, ScaleMethod, StandardizeConfig,
};

fn make_group(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = i as f64;
            (x * 0.37).sin() * 25.0 + x * 0.01
        })
        .collect()
}

fn bench_standardize(c: &mut Criterion) {
    let mut group = c.benchmark_group("standardize_group");
    let values = make_group(2_000);

    for method in [
        ScaleMethod::ZScore,
        ScaleMethod::RobustZScore,
        ScaleMethod::Rank,
        ScaleMethod::MinMax,
    ] {
        let config = StandardizeConfig {
            winsorize: Some((0.01, 0.99)),
            fill: FillPolicy::Median,
            method,
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{method:?}")),
            &config,
            |b, config| {
                b.iter(|| {
                    standardize_group(black_box(&values), Direction::HigherIsBetter, config)
                })
            },
        );
    }
    group.finish();
}

fn bench_factor_execution(c: &mut Criterion) {
    let selection = SelectionSpec::single("price_history", &["close", "volume"]);
    let factor = CompiledFactor::compile(
        r#"
            use series;
            fn momentum(data, params) {
                let px = data["close"];
                series::delta(px, 20) / series::rolling_std(px, 20)
            }
        "#,
        &selection,
    )
    .expect("benchmark factor validates");

    let n = 252;
    let dates: Vec<chrono::NaiveDate> = (0..n)
        .map(|i| {
            chrono::NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i as i64)
        })
        .collect();
    let view = EntityView {
        entity: "AAA".into(),
        dates,
        fields: BTreeMap::from([
            ("close".to_string(), make_group(n)),
            ("volume".to_string(), make_group(n)),
        ]),
    };

    let params = BTreeMap::new();
    let limits = ExecLimits::default();

    c.bench_function("factor_execute_252d", |b| {
        b.iter(|| factor.execute(black_box(&view), &params, &limits).unwrap())
    });
}

criterion_group!(benches, bench_standardize, bench_factor_execution);
criterion_main!(benches);
