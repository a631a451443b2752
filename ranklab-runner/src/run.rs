//! Execution-run state: stage machine, progress tracking, structured logs,
//! and cancellation.
//!
//! Stage transitions are monotonic — a run never revisits a stage. The
//! progress tracker accepts atomic unit increments from concurrent workers;
//! everything else sits behind one short-held mutex.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::scoring::RunOutcome;

/// The six pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Initialization,
    UniverseFiltering,
    DataFetching,
    FactorExecution,
    RankingSelection,
    Finalization,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Initialization,
        Stage::UniverseFiltering,
        Stage::DataFetching,
        Stage::FactorExecution,
        Stage::RankingSelection,
        Stage::Finalization,
    ];

    /// Contribution of this stage to overall percent-complete.
    pub fn weight(&self) -> u32 {
        match self {
            Stage::Initialization => 5,
            Stage::UniverseFiltering => 10,
            Stage::DataFetching => 40,
            Stage::FactorExecution => 35,
            Stage::RankingSelection => 8,
            Stage::Finalization => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Initialization => "Initialization",
            Stage::UniverseFiltering => "UniverseFiltering",
            Stage::DataFetching => "DataFetching",
            Stage::FactorExecution => "FactorExecution",
            Stage::RankingSelection => "RankingSelection",
            Stage::Finalization => "Finalization",
        }
    }
}

/// Terminal and in-flight run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One append-only log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    pub at: NaiveDateTime,
}

/// Point-in-time view handed to `progress()` callers.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub stage: Stage,
    pub percent: f64,
    pub logs: Vec<LogEntry>,
}

/// Terminal view handed to `result()` callers.
#[derive(Debug, Clone, Serialize)]
pub struct RunResultView {
    pub run_id: String,
    pub status: RunStatus,
    pub outcome: Option<RunOutcome>,
    pub failure: Option<String>,
}

struct RunState {
    status: RunStatus,
    stage: Stage,
    /// Σ weight of finished stages.
    completed_weight: u32,
    logs: Vec<LogEntry>,
    outcome: Option<RunOutcome>,
    failure: Option<String>,
}

/// Shared handle for one run: the worker writes, `progress()` readers poll.
pub struct RunHandle {
    pub run_id: String,
    state: Mutex<RunState>,
    cancelled: AtomicBool,
    stage_done: AtomicUsize,
    stage_total: AtomicUsize,
}

impl RunHandle {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            state: Mutex::new(RunState {
                status: RunStatus::Running,
                stage: Stage::Initialization,
                completed_weight: 0,
                logs: Vec::new(),
                outcome: None,
                failure: None,
            }),
            cancelled: AtomicBool::new(false),
            stage_done: AtomicUsize::new(0),
            stage_total: AtomicUsize::new(0),
        }
    }

    // ── stage machine ───────────────────────────────────────────────

    /// Enter a stage. Transitions only move forward; the previous stage's
    /// weight is banked first.
    pub fn enter_stage(&self, stage: Stage) {
        let mut state = self.state.lock().unwrap();
        if stage <= state.stage && stage != Stage::Initialization {
            return; // monotonic: never revisit
        }
        state.stage = stage;
        drop(state);
        self.stage_done.store(0, Ordering::SeqCst);
        self.stage_total.store(0, Ordering::SeqCst);
    }

    /// Bank the current stage's full weight.
    pub fn finish_stage(&self) {
        let mut state = self.state.lock().unwrap();
        state.completed_weight += state.stage.weight();
        drop(state);
        self.stage_done.store(0, Ordering::SeqCst);
        self.stage_total.store(0, Ordering::SeqCst);
    }

    /// Declare how many work units the current stage has.
    pub fn set_units(&self, total: usize) {
        self.stage_total.store(total, Ordering::SeqCst);
        self.stage_done.store(0, Ordering::SeqCst);
    }

    /// Atomic increment from any worker.
    pub fn unit_done(&self) {
        self.stage_done.fetch_add(1, Ordering::SeqCst);
    }

    // ── logs ────────────────────────────────────────────────────────

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let stage = state.stage;
        state.logs.push(LogEntry {
            level,
            stage,
            message: message.into(),
            at: chrono::Local::now().naive_local(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    // ── cancellation & termination ──────────────────────────────────

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn complete(&self, outcome: RunOutcome) {
        let mut state = self.state.lock().unwrap();
        state.status = RunStatus::Completed;
        state.completed_weight = Stage::ALL.iter().map(Stage::weight).sum();
        state.outcome = Some(outcome);
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.lock().unwrap();
        state.status = RunStatus::Failed;
        let stage = state.stage;
        state.logs.push(LogEntry {
            level: LogLevel::Error,
            stage,
            message: message.clone(),
            at: chrono::Local::now().naive_local(),
        });
        state.failure = Some(message);
    }

    pub fn mark_cancelled(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = RunStatus::Cancelled;
    }

    // ── views ───────────────────────────────────────────────────────

    pub fn status(&self) -> RunStatus {
        self.state.lock().unwrap().status
    }

    /// Overall percent = Σ(finished weights) + current stage weight ×
    /// (units done / units total).
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock().unwrap();
        let total_weight: u32 = Stage::ALL.iter().map(Stage::weight).sum();

        let percent = match state.status {
            RunStatus::Completed => 100.0,
            _ => {
                let done = self.stage_done.load(Ordering::SeqCst) as f64;
                let total = self.stage_total.load(Ordering::SeqCst) as f64;
                let frac = if total > 0.0 {
                    (done / total).min(1.0)
                } else {
                    0.0
                };
                let weighted = state.completed_weight as f64 + state.stage.weight() as f64 * frac;
                100.0 * weighted / total_weight as f64
            }
        };

        ProgressSnapshot {
            run_id: self.run_id.clone(),
            status: state.status,
            stage: state.stage,
            percent,
            logs: state.logs.clone(),
        }
    }

    pub fn result_view(&self) -> RunResultView {
        let state = self.state.lock().unwrap();
        RunResultView {
            run_id: self.run_id.clone(),
            status: state.status,
            outcome: state.outcome.clone(),
            failure: state.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_weights_sum_to_100() {
        let total: u32 = Stage::ALL.iter().map(Stage::weight).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn progress_is_weighted_by_stage() {
        let handle = RunHandle::new("r1".into());

        // Finish Initialization (5%), enter UniverseFiltering.
        handle.finish_stage();
        handle.enter_stage(Stage::UniverseFiltering);
        assert!((handle.snapshot().percent - 5.0).abs() < 1e-9);

        // Half of DataFetching adds 20 on top of 15.
        handle.finish_stage();
        handle.enter_stage(Stage::DataFetching);
        handle.set_units(4);
        handle.unit_done();
        handle.unit_done();
        assert!((handle.snapshot().percent - 35.0).abs() < 1e-9);
    }

    #[test]
    fn stage_transitions_are_monotonic() {
        let handle = RunHandle::new("r1".into());
        handle.enter_stage(Stage::FactorExecution);
        handle.enter_stage(Stage::DataFetching); // ignored
        assert_eq!(handle.snapshot().stage, Stage::FactorExecution);
    }

    #[test]
    fn completion_pins_percent_at_100() {
        let handle = RunHandle::new("r1".into());
        handle.complete(RunOutcome::default());
        let snap = handle.snapshot();
        assert_eq!(snap.status, RunStatus::Completed);
        assert!((snap.percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn failure_appends_error_log() {
        let handle = RunHandle::new("r1".into());
        handle.fail("empty universe after filtering");
        let snap = handle.snapshot();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.logs.len(), 1);
        assert_eq!(snap.logs[0].level, LogLevel::Error);
        assert!(handle.result_view().failure.unwrap().contains("empty universe"));
    }

    #[test]
    fn cancellation_flag_roundtrip() {
        let handle = RunHandle::new("r1".into());
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.mark_cancelled();
        assert_eq!(handle.status(), RunStatus::Cancelled);
    }

    #[test]
    fn logs_keep_insertion_order() {
        let handle = RunHandle::new("r1".into());
        handle.info("first");
        handle.warn("second");
        handle.info("third");
        let logs = handle.snapshot().logs;
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }
}
