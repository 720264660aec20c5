//! Scripted collaborators for unit tests

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ParamGrid;
use crate::error::CollaboratorError;
use crate::history::HistorySource;
use crate::optimizer::{
    Candidate, EvaluationRequest, Optimizer, OptimizerResults, OptimizerRunRequest,
    RefinementRequest, RunState, RunStatus,
};
use crate::types::{timeframe_ms, Kline, Metrics};

/// `count` bars starting at `start_ms`, drifting upward with a small zigzag
pub fn make_bars(start_ms: i64, step_ms: i64, count: usize) -> Vec<Kline> {
    (0..count)
        .map(|i| {
            let base = Decimal::from(100 + i as i64) + if i % 2 == 0 { dec!(0) } else { dec!(0.5) };
            Kline {
                open_time: start_ms + i as i64 * step_ms,
                open: base,
                high: base + dec!(1),
                low: base - dec!(1),
                close: base + dec!(0.25),
                volume: dec!(1000),
                close_time: start_ms + (i as i64 + 1) * step_ms - 1,
            }
        })
        .collect()
}

pub fn metrics(drawdown: Decimal) -> Metrics {
    Metrics {
        total_trades: 50,
        net_pnl: dec!(420),
        win_rate: dec!(56),
        profit_factor: dec!(1.6),
        sharpe_ratio: dec!(1.3),
        max_drawdown: drawdown,
    }
}

pub fn candidate(score: Decimal, drawdown: Decimal) -> Candidate {
    Candidate {
        params: serde_json::json!({ "period": 14, "threshold": score.to_string() }),
        metrics: metrics(drawdown),
        train_metrics: None,
        score,
        penalties: BTreeMap::new(),
    }
}

// ============================================================================
// History source
// ============================================================================

pub struct ScriptedSource {
    bars: Vec<Kline>,
    rate_limit: Mutex<Option<Duration>>,
    overlap: usize,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn with_bars(bars: Vec<Kline>) -> Self {
        Self {
            bars,
            rate_limit: Mutex::new(None),
            overlap: 0,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        let source = Self::with_bars(vec![]);
        *source.rate_limit.lock().unwrap() = Some(retry_after);
        source
    }

    /// Return this many extra bars past the end of each requested chunk
    pub fn with_overlap(mut self, bars: usize) -> Self {
        self.overlap = bars;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistorySource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_bars(
        &self,
        _symbol: &str,
        timeframe: &str,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<Kline>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(retry_after) = *self.rate_limit.lock().unwrap() {
            return Err(CollaboratorError::RateLimited {
                retry_after: Some(retry_after),
            });
        }

        let extra = self.overlap as i64 * timeframe_ms(timeframe).unwrap_or(0);
        Ok(self
            .bars
            .iter()
            .filter(|k| k.open_time >= from_ms && k.open_time <= to_ms + extra)
            .take(limit + self.overlap)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Optimizer
// ============================================================================

type DrawdownRule = (Box<dyn Fn(&EvaluationRequest) -> bool + Send + Sync>, Decimal);
type RefineRule = Box<dyn Fn(&RefinementRequest) -> Option<ParamGrid> + Send + Sync>;

pub struct ScriptedOptimizer {
    /// Round results per experiment; the last one repeats
    candidates: Vec<Candidate>,
    round_state: RunState,
    polls_before_done: usize,
    drawdown_rules: Vec<DrawdownRule>,
    refine: Option<RefineRule>,
    start_failures: Mutex<VecDeque<CollaboratorError>>,
    panic_on_start: AtomicBool,
    starts: AtomicUsize,
    status_calls: AtomicUsize,
    results_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
}

impl ScriptedOptimizer {
    pub fn new(candidate: Candidate) -> Self {
        Self::with_candidates(vec![candidate])
    }

    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            round_state: RunState::Completed,
            polls_before_done: 0,
            drawdown_rules: Vec::new(),
            refine: None,
            start_failures: Mutex::new(VecDeque::new()),
            panic_on_start: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            results_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_round_state(mut self, state: RunState) -> Self {
        self.round_state = state;
        self
    }

    pub fn with_polls_before_done(mut self, polls: usize) -> Self {
        self.polls_before_done = polls;
        self
    }

    /// Report `drawdown` for evaluations matching `when`
    pub fn with_drawdown_when(
        mut self,
        when: impl Fn(&EvaluationRequest) -> bool + Send + Sync + 'static,
        drawdown: Decimal,
    ) -> Self {
        self.drawdown_rules.push((Box::new(when), drawdown));
        self
    }

    pub fn with_refine(
        mut self,
        refine: impl Fn(&RefinementRequest) -> Option<ParamGrid> + Send + Sync + 'static,
    ) -> Self {
        self.refine = Some(Box::new(refine));
        self
    }

    /// Fail the next `starts.len()` round starts with these errors
    pub fn with_start_failures(self, failures: Vec<CollaboratorError>) -> Self {
        *self.start_failures.lock().unwrap() = failures.into();
        self
    }

    pub fn panicking(self) -> Self {
        self.panic_on_start.store(true, Ordering::SeqCst);
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Optimizer for ScriptedOptimizer {
    async fn start(&self, _request: &OptimizerRunRequest) -> Result<String, CollaboratorError> {
        if self.panic_on_start.load(Ordering::SeqCst) {
            panic!("scripted optimizer exploded");
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.start_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(format!("run-{n}"))
    }

    async fn status(&self, _run_id: &str) -> Result<RunStatus, CollaboratorError> {
        let n = self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = if n < self.polls_before_done {
            RunState::Running
        } else {
            self.round_state
        };
        Ok(RunStatus {
            state,
            progress: if state == RunState::Completed { 100.0 } else { 50.0 },
            error: (state == RunState::Failed).then(|| "worker crashed".to_string()),
        })
    }

    async fn results(&self, _run_id: &str) -> Result<OptimizerResults, CollaboratorError> {
        let n = self.results_calls.fetch_add(1, Ordering::SeqCst);
        let index = (n / 2).min(self.candidates.len().saturating_sub(1));
        let best = self.candidates.get(index).cloned();
        Ok(OptimizerResults {
            evaluated: 12,
            total_combos: 12,
            pareto: best.iter().cloned().collect(),
            recommended: None,
            ranked: best.into_iter().collect(),
            diagnostics: serde_json::Value::Null,
        })
    }

    async fn refine(
        &self,
        request: &RefinementRequest,
    ) -> Result<Option<ParamGrid>, CollaboratorError> {
        Ok(self.refine.as_ref().and_then(|f| f(request)))
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Metrics, CollaboratorError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        let base = self
            .candidates
            .first()
            .map(|c| c.metrics.clone())
            .unwrap_or_default();
        let drawdown = self
            .drawdown_rules
            .iter()
            .find(|(when, _)| when(request))
            .map(|(_, dd)| *dd)
            .unwrap_or(base.max_drawdown);
        Ok(Metrics {
            max_drawdown: drawdown,
            ..base
        })
    }
}
