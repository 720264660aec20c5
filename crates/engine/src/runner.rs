//! Research autopilot: session lifecycle and the per-experiment run loop
//!
//! `ResearchAutopilot::start` validates a config, persists a `running`
//! session and spawns its run loop under a supervisor task. Each session's
//! mutable state is owned by its run task; the registry keeps only the
//! cancellation flag, a `watch` channel of the live record and the
//! supervisor handle.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::champion::ChampionRecord;
use crate::config::{normalize, ParamGrid, ResearchConfig};
use crate::error::{AutopilotError, ExperimentError};
use crate::export::{dashboard_series, SessionExport};
use crate::fingerprint::{experiment_fingerprint, params_hash};
use crate::history::{CachedSeries, HistoryCoordinator, HistoryRequest};
use crate::ledger::Ledger;
use crate::optimizer::{run_round, Optimizer, OptimizerRunRequest, RefinementRequest};
use crate::regime::{check_target_regime, evaluate_gate, RegimeClassifier, RegimeEvaluation};
use crate::registry;
use crate::robustness::{evaluate_robustness, RobustnessInput};
use crate::session::{
    experiment_id, new_session_id, ExperimentRecord, ResearchSession, SessionStatus, SessionStep,
    StepKind,
};
use crate::types::{Decision, DAY_MS};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session plus its experiment audit records
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionResults {
    pub session: ResearchSession,
    pub experiments: Vec<ExperimentRecord>,
}

struct ActiveSession {
    cancel: Arc<AtomicBool>,
    live: Arc<watch::Sender<ResearchSession>>,
    #[allow(dead_code)]
    supervisor: JoinHandle<()>,
}

type ActiveRegistry = Arc<Mutex<HashMap<String, ActiveSession>>>;

/// Collaborators shared by every session run
#[derive(Clone)]
struct RunContext {
    history: Arc<HistoryCoordinator>,
    optimizer: Arc<dyn Optimizer>,
    classifier: Arc<dyn RegimeClassifier>,
    ledger: Arc<dyn Ledger>,
}

// ============================================================================
// Public API
// ============================================================================

pub struct ResearchAutopilot {
    ctx: RunContext,
    active: ActiveRegistry,
}

impl ResearchAutopilot {
    pub fn new(
        history: Arc<HistoryCoordinator>,
        optimizer: Arc<dyn Optimizer>,
        classifier: Arc<dyn RegimeClassifier>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            ctx: RunContext {
                history,
                optimizer,
                classifier,
                ledger,
            },
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ctx.ledger)
    }

    pub fn history(&self) -> Arc<HistoryCoordinator> {
        Arc::clone(&self.ctx.history)
    }

    /// Validate `config`, persist a running session and launch its run loop
    pub async fn start(&self, mut config: ResearchConfig) -> Result<ResearchSession, AutopilotError> {
        if config.grid.is_none() {
            if let Some(preset) = config.preset.clone() {
                config.grid = Some(registry::load_preset(self.ctx.ledger.as_ref(), &preset).await?);
            }
        }
        let normalized = normalize(&config)?;

        let now = now_ms();
        let session = ResearchSession::new(new_session_id(now), normalized, now);
        if let Err(e) = self.ctx.ledger.save_session(&session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist new session");
        }

        info!(
            session_id = %session.id,
            symbol = %session.symbol,
            timeframe = %session.timeframe,
            strategy = %session.strategy,
            level = %session.config.level,
            max_experiments = session.config.max_experiments,
            "Research session started"
        );

        self.spawn(session.clone());
        Ok(session)
    }

    fn spawn(&self, session: ResearchSession) {
        let id = session.id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = watch::channel(session.clone());
        let live = Arc::new(tx);

        let run = SessionRun::new(session, self.ctx.clone(), Arc::clone(&cancel), Arc::clone(&live));

        // Registered under the lock so the supervisor cannot deregister first
        let mut active = lock(&self.active);
        let run_handle = tokio::spawn(run.run());
        let supervisor = tokio::spawn(supervise(
            run_handle,
            id.clone(),
            Arc::clone(&live),
            Arc::clone(&self.ctx.ledger),
            Arc::clone(&self.active),
        ));
        active.insert(
            id,
            ActiveSession {
                cancel,
                live,
                supervisor,
            },
        );
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        lock(&self.active).contains_key(session_id)
    }

    /// Live updates for an active session
    pub fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<ResearchSession>> {
        lock(&self.active)
            .get(session_id)
            .map(|active| active.live.subscribe())
    }

    /// Current session record: live when active here, else from the ledger
    pub async fn status(&self, session_id: &str) -> Result<ResearchSession, AutopilotError> {
        let live = lock(&self.active)
            .get(session_id)
            .map(|active| active.live.borrow().clone());
        if let Some(session) = live {
            return Ok(session);
        }
        self.ctx
            .ledger
            .get_session(session_id)
            .await?
            .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<ResearchSession>, AutopilotError> {
        Ok(self.ctx.ledger.list_sessions(limit).await?)
    }

    pub async fn steps(&self, session_id: &str) -> Result<Vec<SessionStep>, AutopilotError> {
        self.status(session_id).await?;
        Ok(self.ctx.ledger.list_steps(session_id).await?)
    }

    pub async fn results(&self, session_id: &str) -> Result<SessionResults, AutopilotError> {
        let session = self.status(session_id).await?;
        let experiments = self.ctx.ledger.list_experiments(session_id).await?;
        Ok(SessionResults {
            session,
            experiments,
        })
    }

    pub async fn export(&self, session_id: &str) -> Result<SessionExport, AutopilotError> {
        let session = self.status(session_id).await?;
        let steps = self.ctx.ledger.list_steps(session_id).await?;
        let experiments = self.ctx.ledger.list_experiments(session_id).await?;
        let dashboard = dashboard_series(&experiments, session.config.stop.min_delta);
        Ok(SessionExport {
            session,
            steps,
            experiments,
            dashboard,
            exported_at: now_ms(),
        })
    }

    /// Request a stop. Active sessions stop at their next iteration boundary;
    /// sessions not running here are marked stopped directly.
    pub async fn stop(&self, session_id: &str) -> Result<ResearchSession, AutopilotError> {
        let live = lock(&self.active).get(session_id).map(|active| {
            active.cancel.store(true, Ordering::SeqCst);
            active.live.borrow().clone()
        });
        if let Some(session) = live {
            info!(session_id, "Stop requested");
            return Ok(session);
        }

        let mut session = self
            .ctx
            .ledger
            .get_session(session_id)
            .await?
            .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))?;
        if !session.status.is_terminal() {
            session.finish(SessionStatus::Stopped, "stopped while not active", now_ms());
            self.ctx.ledger.save_session(&session).await?;
            info!(session_id, "Inactive session marked stopped");
        }
        Ok(session)
    }

    /// Wait until the session reaches a terminal status
    pub async fn wait(&self, session_id: &str) -> Result<ResearchSession, AutopilotError> {
        if let Some(mut rx) = self.subscribe(session_id) {
            if let Ok(session) = rx
                .wait_for(|s| s.status.is_terminal())
                .await
                .map(|s| s.clone())
            {
                return Ok(session);
            }
        }
        self.status(session_id).await
    }
}

/// Await the run task; a panic marks the session failed. Always deregisters.
async fn supervise(
    run: JoinHandle<ResearchSession>,
    session_id: String,
    live: Arc<watch::Sender<ResearchSession>>,
    ledger: Arc<dyn Ledger>,
    active: ActiveRegistry,
) {
    match run.await {
        Ok(session) => {
            info!(
                session_id = %session_id,
                status = %session.status,
                experiments_run = session.stats.experiments_run,
                "Research session finished"
            );
        }
        Err(err) => {
            let reason = panic_message(err);
            error!(session_id = %session_id, error = %reason, "Research session task failed");

            let mut session = live.borrow().clone();
            session.last_error = Some(reason);
            session.finish(SessionStatus::Failed, "run task failed", now_ms());
            if let Err(e) = ledger.save_session(&session).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist failed session");
            }
            live.send_replace(session);
        }
    }
    lock(&active).remove(&session_id);
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

// ============================================================================
// Run loop
// ============================================================================

/// In-memory state owned by one session's run task
struct ActiveSessionState {
    cancel: Arc<AtomicBool>,
    step_seq: u64,
    no_improvement: u32,
    robustness_failures: u32,
    rate_limit_pauses: u32,
    seen_fingerprints: HashSet<String>,
}

struct ExperimentOutcome {
    record: ExperimentRecord,
    refined_grid: Option<ParamGrid>,
}

struct SessionRun {
    session: ResearchSession,
    ctx: RunContext,
    live: Arc<watch::Sender<ResearchSession>>,
    state: ActiveSessionState,
    /// Grid searched by the next iteration
    grid: ParamGrid,
}

impl SessionRun {
    fn new(
        session: ResearchSession,
        ctx: RunContext,
        cancel: Arc<AtomicBool>,
        live: Arc<watch::Sender<ResearchSession>>,
    ) -> Self {
        let grid = session.config.grid.clone();
        Self {
            session,
            ctx,
            live,
            state: ActiveSessionState {
                cancel,
                step_seq: 0,
                no_improvement: 0,
                robustness_failures: 0,
                rate_limit_pauses: 0,
                seen_fingerprints: HashSet::new(),
            },
            grid,
        }
    }

    async fn run(mut self) -> ResearchSession {
        let started = Instant::now();
        let max_runtime = self.session.config.timing.max_runtime();
        let planned = self.session.config.max_experiments;

        self.step(
            StepKind::Started,
            format!("Research started: {} experiments planned", planned),
            serde_json::json!({ "level": self.session.config.level, "planned": planned }),
        )
        .await;

        for _ in 0..planned {
            if self.state.cancel.load(Ordering::SeqCst) {
                self.step(StepKind::StopRequested, "Stop requested", serde_json::Value::Null)
                    .await;
                return self.finish(SessionStatus::Stopped, "stop requested").await;
            }
            if started.elapsed() >= max_runtime {
                return self
                    .finish(SessionStatus::Completed, "runtime budget exhausted")
                    .await;
            }

            let fingerprint = experiment_fingerprint(&self.session.config, &self.grid);
            if self.state.seen_fingerprints.contains(&fingerprint) {
                self.session.stats.duplicates_skipped += 1;
                self.step(
                    StepKind::DuplicateSkipped,
                    "Skipped duplicate experiment",
                    serde_json::json!({ "fingerprint": fingerprint }),
                )
                .await;
                self.persist().await;
                continue;
            }

            self.session.stats.experiments_run += 1;
            let sequence = self.session.stats.experiments_run;

            match self.run_experiment(sequence, &fingerprint).await {
                Ok(outcome) => {
                    self.state.rate_limit_pauses = 0;
                    self.state.seen_fingerprints.insert(fingerprint);
                    self.apply_outcome(outcome).await;

                    if let Some(reason) = self.session.config.stop.completion_reason(
                        self.state.no_improvement,
                        self.state.robustness_failures,
                    ) {
                        return self
                            .finish(SessionStatus::Completed, reason.to_string())
                            .await;
                    }
                }
                Err(e) if e.is_rate_limit() => {
                    self.state.rate_limit_pauses += 1;
                    self.session.stats.rate_limit_pauses += 1;
                    self.session.last_error = Some(e.to_string());
                    self.session.push_warning(format!("experiment {sequence}: {e}"));

                    if self
                        .session
                        .config
                        .stop
                        .rate_limit_exhausted(self.state.rate_limit_pauses)
                    {
                        warn!(
                            session_id = %self.session.id,
                            pauses = self.state.rate_limit_pauses,
                            "Rate-limit pauses exhausted"
                        );
                        return self
                            .finish(SessionStatus::Stopped, "rate-limit pauses exhausted")
                            .await;
                    }

                    let backoff = self.session.config.timing.rate_limit_backoff();
                    self.session.status = SessionStatus::Paused;
                    self.step(
                        StepKind::RateLimitPause,
                        format!("Rate limited, pausing {}s", backoff.as_secs()),
                        serde_json::json!({
                            "pauses": self.state.rate_limit_pauses,
                            "backoff_ms": backoff.as_millis() as u64,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                    self.persist().await;

                    tokio::time::sleep(backoff).await;

                    self.session.status = SessionStatus::Running;
                    self.step(StepKind::Resumed, "Resumed after backoff", serde_json::Value::Null)
                        .await;
                    self.persist().await;
                }
                Err(e) => {
                    warn!(session_id = %self.session.id, sequence, error = %e, "Experiment failed");
                    self.session.stats.failed_experiments += 1;
                    self.session.last_error = Some(e.to_string());
                    self.session.push_warning(format!("experiment {sequence}: {e}"));
                    self.step(
                        StepKind::ExperimentFailed,
                        format!("Experiment {sequence} failed"),
                        serde_json::json!({ "sequence": sequence, "error": e.to_string() }),
                    )
                    .await;
                    self.persist().await;
                }
            }
        }

        self.finish(SessionStatus::Completed, "experiment budget exhausted")
            .await
    }

    async fn fetch_history(&self) -> Result<CachedSeries, ExperimentError> {
        let config = &self.session.config;
        let to_ms = config.history.end_time.unwrap_or_else(now_ms);
        let from_ms = to_ms - i64::from(config.history.lookback_days) * DAY_MS;
        let series = self
            .ctx
            .history
            .fetch(HistoryRequest {
                symbol: config.symbol.clone(),
                timeframe: config.timeframe.clone(),
                from_ms,
                to_ms,
            })
            .await?;
        Ok(series)
    }

    async fn run_experiment(
        &mut self,
        sequence: u32,
        fingerprint: &str,
    ) -> Result<ExperimentOutcome, ExperimentError> {
        let config = self.session.config.clone();
        let id = experiment_id(&self.session.id, sequence);

        let series = self.fetch_history().await?;
        self.step(
            StepKind::HistoryFetched,
            format!("Fetched {} bars", series.bars.len()),
            serde_json::json!({
                "bars": series.bars.len(),
                "from_cache": series.from_cache,
                "chunks": series.chunks,
                "source": series.source,
            }),
        )
        .await;

        // Round 1 over the current grid
        let mut request = OptimizerRunRequest {
            symbol: config.symbol.clone(),
            timeframe: config.timeframe.clone(),
            strategy: config.strategy.clone(),
            grid: self.grid.clone(),
            objective: config.objective.clone(),
            execution: config.execution.clone(),
            validation: config.validation.clone(),
            time_filter: config.time_filter.clone(),
            bars: series.bars.to_vec(),
        };
        let round1 = run_round(self.ctx.optimizer.as_ref(), &request, 1, &config.timing).await?;
        self.step(
            StepKind::RoundCompleted,
            "Round 1 completed",
            serde_json::json!({ "round": 1, "evaluated": round1.evaluated, "total": round1.total_combos }),
        )
        .await;

        let refined_grid = match self
            .ctx
            .optimizer
            .refine(&RefinementRequest {
                strategy: config.strategy.clone(),
                grid: self.grid.clone(),
                results: round1,
            })
            .await
        {
            Ok(grid) => grid,
            Err(e) => {
                let e = ExperimentError::from(e);
                if e.is_rate_limit() {
                    return Err(e);
                }
                warn!(session_id = %self.session.id, error = %e, "Refinement failed, keeping grid");
                None
            }
        };

        // Round 2 over the refined grid
        if let Some(grid) = &refined_grid {
            request.grid = grid.clone();
        }
        let round2 = run_round(self.ctx.optimizer.as_ref(), &request, 2, &config.timing).await?;
        self.step(
            StepKind::RoundCompleted,
            "Round 2 completed",
            serde_json::json!({
                "round": 2,
                "evaluated": round2.evaluated,
                "total": round2.total_combos,
                "refined": refined_grid.is_some(),
            }),
        )
        .await;

        let candidate = round2
            .select_candidate()
            .cloned()
            .ok_or(ExperimentError::NoCandidate(2))?;
        let guardrails = config.objective.check(&candidate.metrics);

        let robustness = evaluate_robustness(
            self.ctx.optimizer.as_ref(),
            self.ctx.classifier.as_ref(),
            RobustnessInput {
                symbol: &config.symbol,
                timeframe: &config.timeframe,
                strategy: &config.strategy,
                params: &candidate.params,
                bars: &series.bars,
                validation: &config.validation,
                time_filter: config.time_filter.as_ref(),
                execution: &config.execution,
                stress: &config.stress,
                objective: &config.objective,
            },
        )
        .await?;

        let evaluations: Vec<RegimeEvaluation> = std::iter::once(RegimeEvaluation {
            regime: robustness.base_regime.clone(),
            passed: guardrails.passed,
        })
        .chain(robustness.variants.iter().map(|v| RegimeEvaluation {
            regime: v.regime.clone(),
            passed: v.passed,
        }))
        .collect();
        let regime_summary = self.ctx.classifier.summarize(&evaluations);
        let regime_gate = evaluate_gate(&regime_summary, &config.regime_gate);
        let target_regime = config
            .target_regime
            .as_ref()
            .map(|target| check_target_regime(&regime_summary, target));

        let mut decision = if guardrails.passed && robustness.all_passed() && regime_gate.passed {
            Decision::Adopt
        } else if guardrails.passed {
            Decision::Investigate
        } else {
            Decision::Reject
        };
        if regime_gate.downgraded {
            decision = decision.downgraded();
        }
        if target_regime.as_ref().is_some_and(|t| !t.satisfied) {
            decision = decision.downgraded();
        }

        let record = ExperimentRecord {
            id,
            session_id: self.session.id.clone(),
            sequence,
            fingerprint: fingerprint.to_string(),
            grid: self.grid.clone(),
            refined_grid: refined_grid.clone(),
            decision,
            params_hash: params_hash(&candidate.params),
            candidate,
            guardrails,
            robustness,
            regime_summary,
            regime_gate,
            target_regime,
            created_at: now_ms(),
        };

        if let Err(e) = self.ctx.ledger.save_experiment(&record).await {
            warn!(experiment_id = %record.id, error = %e, "Failed to persist experiment record");
        }
        registry::record_experiment(self.ctx.ledger.as_ref(), &record).await;

        Ok(ExperimentOutcome {
            record,
            refined_grid,
        })
    }

    async fn apply_outcome(&mut self, outcome: ExperimentOutcome) {
        let ExperimentOutcome {
            record,
            refined_grid,
        } = outcome;
        let stop = self.session.config.stop.clone();
        let stats = &mut self.session.stats;

        match record.decision {
            Decision::Adopt => stats.adopted += 1,
            Decision::Investigate => stats.investigated += 1,
            Decision::Reject => stats.rejected += 1,
        }
        for (regime, tally) in &record.regime_summary.per_regime {
            *stats.regime_histogram.entry(regime.clone()).or_default() += tally.samples as u32;
        }

        let mut improved = false;
        if record.decision != Decision::Reject {
            let champion = ChampionRecord {
                experiment_id: record.id.clone(),
                params_hash: record.params_hash.clone(),
                params: record.candidate.params.clone(),
                score: record.candidate.score,
                decision: record.decision,
                metrics: record.candidate.metrics.clone(),
                worst_case: record.robustness.worst_case.clone(),
                penalties: record.candidate.penalties.clone(),
                updated_at: record.created_at,
            };
            improved = stats.champions.offer_global(&champion, stop.min_delta);
            for regime in record.regime_summary.per_regime.keys() {
                stats.champions.offer_regime(regime, &champion, stop.min_delta);
            }
            stats.best_score = stats.champions.best_score();
        }

        if improved {
            self.state.no_improvement = 0;
        } else {
            self.state.no_improvement += 1;
        }
        if record.robustness.any_failed() {
            self.state.robustness_failures += 1;
        } else {
            self.state.robustness_failures = 0;
        }

        for warning in record.regime_gate.warnings.clone() {
            self.session.push_warning(format!("{}: {warning}", record.id));
        }
        if let Some(grid) = refined_grid {
            self.grid = grid;
        }

        info!(
            session_id = %self.session.id,
            experiment_id = %record.id,
            decision = %record.decision,
            score = %record.candidate.score,
            improved,
            no_improvement = self.state.no_improvement,
            robustness_failures = self.state.robustness_failures,
            "Experiment completed"
        );

        self.step(
            StepKind::ExperimentCompleted,
            format!("Experiment {} {}", record.sequence, record.decision),
            serde_json::json!({
                "experiment_id": record.id,
                "decision": record.decision,
                "score": record.candidate.score,
                "improved": improved,
            }),
        )
        .await;
        self.persist().await;
    }

    async fn step(&mut self, kind: StepKind, message: impl Into<String>, payload: serde_json::Value) {
        self.state.step_seq += 1;
        let step = SessionStep {
            session_id: self.session.id.clone(),
            seq: self.state.step_seq,
            kind,
            message: message.into(),
            payload,
            created_at: now_ms(),
        };
        if let Err(e) = self.ctx.ledger.append_step(&step).await {
            warn!(session_id = %self.session.id, seq = step.seq, error = %e, "Failed to append step");
        }
    }

    async fn persist(&mut self) {
        self.session.updated_at = now_ms();
        self.live.send_replace(self.session.clone());
        if let Err(e) = self.ctx.ledger.save_session(&self.session).await {
            warn!(session_id = %self.session.id, error = %e, "Failed to persist session");
        }
    }

    async fn finish(mut self, status: SessionStatus, reason: impl Into<String>) -> ResearchSession {
        let reason = reason.into();
        self.session.finish(status, reason.clone(), now_ms());
        self.step(
            StepKind::Finished,
            format!("Session {status}: {reason}"),
            serde_json::json!({ "status": status, "reason": reason }),
        )
        .await;
        self.persist().await;
        self.session
    }
}
