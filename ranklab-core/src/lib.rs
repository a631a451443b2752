//! RankLab Core — catalog & selection resolver, data fetcher, factor DSL
//! sandbox, standardizer.
//!
//! This crate contains the leaves of the scoring engine:
//! - Catalog of data-source descriptors and the selection resolver
//! - Rate-limited, cached, retrying data fetcher over provider traits
//! - Factor DSL: pest grammar, static validator, sandboxed interpreter
//! - Cross-sectional standardizer with diagnostics
//! - Factor/strategy definitions and the read-only store traits
//!
//! Orchestration (runs, stages, progress, ranking) lives in
//! `ranklab-runner`.

pub mod catalog;
pub mod data;
pub mod domain;
pub mod dsl;
pub mod frame;
pub mod standardize;
pub mod universe;
