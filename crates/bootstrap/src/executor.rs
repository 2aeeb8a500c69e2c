//! The bootstrap executor: resumable, budget-bounded ticks over the packed
//! batch list, with cross-process locking and rate-limit pacing.

use chrono::{DateTime, Utc};
use omg_config::OmgConfig;
use omg_graph::{GraphStore, MetricEvent, MetricsSink};
use omg_llm::{Backoff, SharedModel};
use omg_observer::{
    run_observation, ObservationOutcome, ObservationPrompts, ObservationRequest, ObserverError,
    SessionStore,
};
use serde_json::json;
use tracing::{info, warn};

use crate::chunk::{pack_batches, Batch, ChunkSource, SourceChunk};
use crate::error::BootstrapError;
use crate::failures::{FailureErrorType, FailureLog, FailureLogEntry};
use crate::lock::claim;
use crate::state::{load_state, save_state, BootstrapState, BootstrapStatus};

/// Attempts per batch before it counts as rate-limit failed.
pub const MAX_RETRY_ATTEMPTS: usize = 3;
/// Consecutive rate-limit-failed batches that abort the whole tick.
pub const MAX_CONSECUTIVE_RATE_LIMITS: usize = 3;

/// Everything a bootstrap run needs, bundled so the three entry points
/// share one signature.
pub struct BootstrapRun<'a> {
    pub config: &'a OmgConfig,
    pub model: SharedModel,
    pub prompts: &'a dyn ObservationPrompts,
    pub store: &'a GraphStore,
    pub sessions: &'a SessionStore,
    pub metrics: &'a dyn MetricsSink,
    pub backoff: Backoff,
    pub scope: String,
    /// Re-run even when the state says completed.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub ran: bool,
    pub batches_processed: usize,
    pub chunks_succeeded: usize,
    pub nodes_written: usize,
    pub more_work_remains: bool,
    pub completed: bool,
}

/// One bounded tick: at most `bootstrap.batch_budget_per_run` batches.
pub async fn run_bootstrap_tick(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    now: DateTime<Utc>,
) -> Result<TickReport, BootstrapError> {
    tick_inner(run, sources, now, run.config.bootstrap.batch_budget_per_run).await
}

/// Run to completion (or failure) in one call.
pub async fn run_bootstrap(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    now: DateTime<Utc>,
) -> Result<TickReport, BootstrapError> {
    tick_inner(run, sources, now, usize::MAX).await
}

async fn tick_inner(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    now: DateTime<Utc>,
    batch_budget: usize,
) -> Result<TickReport, BootstrapError> {
    let root = run.store.root().to_path_buf();
    let Some(guard) = claim(&root, now)? else {
        info!("bootstrap lock held by a live process — not running");
        return Ok(TickReport::default());
    };

    // The lock marks active processing: released on every exit path,
    // including errors.
    let result = locked_tick(run, sources, now, batch_budget, &guard).await;
    guard.release();
    result
}

async fn locked_tick(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    now: DateTime<Utc>,
    batch_budget: usize,
    guard: &crate::lock::LockGuard,
) -> Result<TickReport, BootstrapError> {
    let root = run.store.root();
    let existing = load_state(root, now)?;

    if let Some(state) = &existing {
        if state.status == BootstrapStatus::Completed && !run.force {
            return Ok(TickReport {
                ran: false,
                completed: true,
                ..Default::default()
            });
        }
    }

    // Deterministic re-enumeration: the same sources yield the same batch
    // indices on every run, which is what makes `done` meaningful.
    let mut chunks: Vec<SourceChunk> = Vec::new();
    for source in sources {
        chunks.extend(source.chunks().await?);
    }
    let batches = pack_batches(chunks, run.config.bootstrap.batch_char_budget);
    let total = batches.len();

    let mut state = match existing {
        Some(mut state) if !run.force => {
            if state.total != total {
                warn!(
                    persisted = state.total,
                    enumerated = total,
                    "batch total changed since last run — adopting new total"
                );
                state.total = total;
            }
            state
        }
        _ => BootstrapState::fresh(total, now),
    };
    state.status = BootstrapStatus::Running;
    save_state(root, &state)?;

    let failure_log = FailureLog::new(root);
    let mut report = TickReport {
        ran: true,
        ..Default::default()
    };

    let pending: Vec<&Batch> = batches
        .iter()
        .filter(|batch| !state.done.contains(&batch.index))
        .take(batch_budget)
        .collect();

    let mut consecutive_rate_limits = 0usize;
    let mut aborted = false;

    for batch in pending {
        guard.heartbeat(now)?;
        report.batches_processed += 1;

        match run_batch(run, batch, now).await {
            BatchResult::Ok(outcome) => {
                consecutive_rate_limits = 0;
                state.record_done(batch.index, now);
                report.chunks_succeeded += batch.chunks.len();
                report.nodes_written += outcome.written_ids.len();

                // Zero operations is still success: the content may simply
                // hold nothing worth keeping.  Logged for diagnostics only.
                if outcome.operations_seen == 0 && !outcome.skipped {
                    let error_type = if outcome.diagnostics.is_empty() {
                        FailureErrorType::ZeroOperations
                    } else {
                        FailureErrorType::ParseEmpty
                    };
                    failure_log.append(&FailureLogEntry {
                        batch_index: batch.index,
                        labels: batch.labels(),
                        error_type,
                        error: "batch produced no operations".to_string(),
                        timestamp: now,
                        diagnostics: outcome.diagnostics.clone(),
                        chunk_count: batch.chunks.len(),
                    })?;
                }
            }
            BatchResult::RateLimited(message) => {
                consecutive_rate_limits += 1;
                state.record_fail(format!("Rate limit: {message}"), now);
                failure_log.append(&FailureLogEntry {
                    batch_index: batch.index,
                    labels: batch.labels(),
                    error_type: FailureErrorType::RateLimitAborted,
                    error: message.clone(),
                    timestamp: now,
                    diagnostics: vec![],
                    chunk_count: batch.chunks.len(),
                })?;

                if consecutive_rate_limits >= MAX_CONSECUTIVE_RATE_LIMITS {
                    warn!(
                        consecutive = consecutive_rate_limits,
                        "rate limits persist — aborting bootstrap tick"
                    );
                    state.status = BootstrapStatus::Failed;
                    state.last_error =
                        Some(format!("Rate limit exceeded after {consecutive_rate_limits} consecutive batches"));
                    aborted = true;
                }
            }
            BatchResult::Failed(message) => {
                consecutive_rate_limits = 0;
                state.record_fail(message.clone(), now);
                failure_log.append(&FailureLogEntry {
                    batch_index: batch.index,
                    labels: batch.labels(),
                    error_type: FailureErrorType::LlmError,
                    error: message,
                    timestamp: now,
                    diagnostics: vec![],
                    chunk_count: batch.chunks.len(),
                })?;
            }
        }

        // Persisted after every attempt so a crash resumes precisely.
        save_state(root, &state)?;
        if aborted {
            break;
        }
    }

    if !aborted {
        state.status = if state.done.len() >= total && state.ok > 0 {
            BootstrapStatus::Completed
        } else if state.all_accounted() && state.ok == 0 && total > 0 {
            BootstrapStatus::Failed
        } else {
            BootstrapStatus::Paused
        };
        save_state(root, &state)?;
    }

    report.more_work_remains =
        state.remaining() > 0 && state.status != BootstrapStatus::Completed;
    report.completed = state.status == BootstrapStatus::Completed;

    run.metrics.emit(MetricEvent::new(
        "bootstrap.tick",
        json!({
            "batches": report.batches_processed,
            "ok": state.ok,
            "fail": state.fail,
            "status": format!("{:?}", state.status),
            "nodes_written": report.nodes_written,
        }),
    ));
    info!(
        batches = report.batches_processed,
        status = ?state.status,
        remaining = state.remaining(),
        "bootstrap tick finished"
    );
    Ok(report)
}

enum BatchResult {
    Ok(ObservationOutcome),
    RateLimited(String),
    Failed(String),
}

/// One batch through the observation pipeline, with rate-limit retries.
/// Each batch gets its own session key so the observation boundary and
/// guardrail window stay scoped to that batch across resumes.
async fn run_batch(run: &BootstrapRun<'_>, batch: &Batch, now: DateTime<Utc>) -> BatchResult {
    let request = ObservationRequest {
        messages: batch.chunks.iter().map(|c| c.text.clone()).collect(),
        now_node_body: None,
        session_key: format!("bootstrap-{}", batch.index),
        scope: run.scope.clone(),
        source_kind: "bootstrap".to_string(),
        now,
    };

    let mut last_rate_limit = String::new();
    for attempt in 0..MAX_RETRY_ATTEMPTS {
        match run_observation(
            request.clone(),
            run.config,
            run.model.as_ref(),
            run.prompts,
            run.store,
            run.sessions,
            None,
            run.metrics,
        )
        .await
        {
            Ok(outcome) => return BatchResult::Ok(outcome),
            Err(ObserverError::Llm(err)) if err.is_rate_limit() => {
                last_rate_limit = err.to_string();
                if attempt + 1 < MAX_RETRY_ATTEMPTS {
                    run.backoff.sleep(attempt).await;
                }
            }
            Err(err) => return BatchResult::Failed(err.to_string()),
        }
    }
    BatchResult::RateLimited(last_rate_limit)
}

// ── Retry subset ──────────────────────────────────────────────────────────────

/// Options for [`run_bootstrap_retry`].
pub struct RetryOptions {
    /// Only retry entries with one of these error types.  `None` = all.
    pub error_type_filter: Option<Vec<FailureErrorType>>,
    /// Only retry these batch indices.  `None` = all matched by type.
    pub batch_indices: Option<Vec<usize>>,
    /// Per-request timeout for a dedicated retry client.  Only honoured
    /// together with `client_factory`.
    pub timeout_ms: Option<u64>,
    /// Builds a model client with the given timeout.
    #[allow(clippy::type_complexity)]
    pub client_factory: Option<Box<dyn Fn(u64) -> SharedModel + Send + Sync>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            error_type_filter: None,
            batch_indices: None,
            timeout_ms: None,
            client_factory: None,
        }
    }
}

/// Re-run exactly the failed batches selected by the options.  Entries not
/// selected survive the log rewrite untouched.
pub async fn run_bootstrap_retry(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    options: RetryOptions,
    now: DateTime<Utc>,
) -> Result<TickReport, BootstrapError> {
    let root = run.store.root().to_path_buf();
    let Some(guard) = claim(&root, now)? else {
        info!("bootstrap lock held by a live process — not retrying");
        return Ok(TickReport::default());
    };
    let result = locked_retry(run, sources, options, now).await;
    guard.release();
    result
}

async fn locked_retry(
    run: &BootstrapRun<'_>,
    sources: &[&dyn ChunkSource],
    options: RetryOptions,
    now: DateTime<Utc>,
) -> Result<TickReport, BootstrapError> {
    let root = run.store.root();
    let failure_log = FailureLog::new(root);
    let entries = failure_log.load()?;

    let matches = |entry: &FailureLogEntry| -> bool {
        options
            .error_type_filter
            .as_ref()
            .is_none_or(|types| types.contains(&entry.error_type))
            && options
                .batch_indices
                .as_ref()
                .is_none_or(|indices| indices.contains(&entry.batch_index))
    };
    let (selected, kept): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| matches(e));
    if selected.is_empty() {
        return Ok(TickReport {
            ran: true,
            ..Default::default()
        });
    }

    // A timeout without a factory (or vice versa) cannot build a client;
    // fall back to the run's default model.
    let model: SharedModel = match (&options.timeout_ms, &options.client_factory) {
        (Some(timeout), Some(factory)) => factory(*timeout),
        (None, None) => run.model.clone(),
        _ => {
            warn!("timeout_ms and client_factory must be supplied together — using default client");
            run.model.clone()
        }
    };
    let retry_run = BootstrapRun {
        config: run.config,
        model,
        prompts: run.prompts,
        store: run.store,
        sessions: run.sessions,
        metrics: run.metrics,
        backoff: run.backoff.clone(),
        scope: run.scope.clone(),
        force: run.force,
    };

    // Same deterministic batch list the original run used.
    let mut chunks: Vec<SourceChunk> = Vec::new();
    for source in sources {
        chunks.extend(source.chunks().await?);
    }
    let batches = pack_batches(chunks, run.config.bootstrap.batch_char_budget);

    let mut indices: Vec<usize> = selected.iter().map(|e| e.batch_index).collect();
    indices.sort_unstable();
    indices.dedup();

    let mut state = load_state(root, now)?.unwrap_or_else(|| BootstrapState::fresh(batches.len(), now));
    let mut report = TickReport {
        ran: true,
        ..Default::default()
    };
    let mut new_failures: Vec<FailureLogEntry> = Vec::new();

    for index in indices {
        let Some(batch) = batches.get(index) else {
            warn!(index, "failure-log batch index outside current batch list — dropped");
            continue;
        };
        report.batches_processed += 1;

        match run_batch(&retry_run, batch, now).await {
            BatchResult::Ok(outcome) => {
                if !state.done.contains(&batch.index) {
                    state.record_done(batch.index, now);
                }
                report.chunks_succeeded += batch.chunks.len();
                report.nodes_written += outcome.written_ids.len();
            }
            BatchResult::RateLimited(message) => {
                state.record_fail(format!("Rate limit: {message}"), now);
                new_failures.push(FailureLogEntry {
                    batch_index: batch.index,
                    labels: batch.labels(),
                    error_type: FailureErrorType::RateLimitAborted,
                    error: message,
                    timestamp: now,
                    diagnostics: vec![],
                    chunk_count: batch.chunks.len(),
                });
            }
            BatchResult::Failed(message) => {
                state.record_fail(message.clone(), now);
                new_failures.push(FailureLogEntry {
                    batch_index: batch.index,
                    labels: batch.labels(),
                    error_type: FailureErrorType::LlmError,
                    error: message,
                    timestamp: now,
                    diagnostics: vec![],
                    chunk_count: batch.chunks.len(),
                });
            }
        }
        save_state(root, &state)?;
    }

    // Preserve everything that was not retried, plus this run's failures.
    let mut rewritten = kept;
    rewritten.extend(new_failures);
    failure_log.rewrite(&rewritten)?;

    report.more_work_remains = state.remaining() > 0;
    report.completed = state.done.len() >= state.total && state.ok > 0;
    Ok(report)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use async_trait::async_trait;
    use omg_graph::{NullSink, Registry};
    use omg_llm::testkit::{ScriptedModel, Step};
    use omg_llm::LlmError;
    use omg_observer::JoinedPrompts;
    use uuid::Uuid;

    use super::*;
    use crate::state::{state_path, STATE_FILE};

    struct ListSource(Vec<SourceChunk>);

    #[async_trait]
    impl ChunkSource for ListSource {
        async fn chunks(&self) -> Result<Vec<SourceChunk>, BootstrapError> {
            Ok(self.0.clone())
        }
    }

    fn chunks(n: usize) -> Vec<SourceChunk> {
        (0..n)
            .map(|i| SourceChunk {
                label: format!("hist:{i}"),
                text: format!("historical note {i}: the user keeps mentioning topic {i}"),
            })
            .collect()
    }

    fn scratch() -> (GraphStore, SessionStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("omg-boot-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let registry = Arc::new(Registry::new(&root));
        (
            GraphStore::new(&root, registry),
            SessionStore::new(&root),
            root,
        )
    }

    fn config(budget_per_run: usize) -> OmgConfig {
        let mut config = OmgConfig::default();
        config.bootstrap.batch_char_budget = 0; // one chunk per batch
        config.bootstrap.batch_budget_per_run = budget_per_run;
        config
    }

    fn run_args<'a>(
        config: &'a OmgConfig,
        model: Arc<ScriptedModel>,
        store: &'a GraphStore,
        sessions: &'a SessionStore,
    ) -> BootstrapRun<'a> {
        BootstrapRun {
            config,
            model,
            prompts: &JoinedPrompts,
            store,
            sessions,
            metrics: &NullSink,
            backoff: Backoff::none(),
            scope: "test".to_string(),
            force: false,
        }
    }

    const EMPTY_RESPONSE: &str = "<observations></observations>";

    fn response_writing(key: &str) -> String {
        format!(
            r#"<observations><operation type="fact" action="upsert">
<title>{key}</title>
<canonical-key>history.{key}</canonical-key>
<description>historical fact {key}</description>
<body>details for {key}</body>
</operation></observations>"#
        )
    }

    #[tokio::test]
    async fn paused_resume_across_three_ticks() -> anyhow::Result<()> {
        let (store, sessions, root) = scratch();
        let config = config(10);
        let model = Arc::new(ScriptedModel::always(EMPTY_RESPONSE));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(30));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        // Tick 1: batches 0–9.
        let tick1 = run_bootstrap_tick(&run, &sources, Utc::now()).await?;
        assert!(tick1.ran);
        assert_eq!(tick1.batches_processed, 10);
        assert!(tick1.more_work_remains);
        assert!(!tick1.completed);

        let state = load_state(&root, Utc::now())?.expect("state persisted");
        assert_eq!(state.status, BootstrapStatus::Paused);
        assert_eq!(state.done.len(), 10);
        assert!(state.done.contains(&0) && state.done.contains(&9));
        assert_eq!(state.cursor, 10);

        // Tick 2: batches 10–19.
        let tick2 = run_bootstrap_tick(&run, &sources, Utc::now()).await?;
        assert_eq!(tick2.batches_processed, 10);
        assert!(tick2.more_work_remains);

        // Tick 3: batches 20–29, completing the run.
        let tick3 = run_bootstrap_tick(&run, &sources, Utc::now()).await?;
        assert_eq!(tick3.batches_processed, 10);
        assert!(!tick3.more_work_remains);
        assert!(tick3.completed);

        let state = load_state(&root, Utc::now())?.expect("state persisted");
        assert_eq!(state.status, BootstrapStatus::Completed);
        assert_eq!(state.ok, 30);
        assert_eq!(state.cursor, 30);

        // Tick 4: already completed.
        let tick4 = run_bootstrap_tick(&run, &sources, Utc::now()).await?;
        assert!(!tick4.ran);

        // Lock was released every time.
        assert!(!root.join(crate::lock::LOCK_FILE).exists());

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_abort_persists_failed_state_and_releases_lock() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        let model = Arc::new(ScriptedModel::new([Step::Fail(LlmError::RateLimited {
            retry_after: None,
        })]));
        let run = run_args(&config, model.clone(), &store, &sessions);
        let source = ListSource(chunks(10));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        let report = run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert!(report.ran);
        assert!(!report.completed);
        // 3 batches × 3 attempts each before the abort.
        assert_eq!(model.call_count(), MAX_CONSECUTIVE_RATE_LIMITS * MAX_RETRY_ATTEMPTS);

        let state = load_state(&root, Utc::now()).unwrap().unwrap();
        assert_eq!(state.status, BootstrapStatus::Failed);
        assert!(state.last_error.as_ref().unwrap().contains("Rate limit"));
        assert!(state.done.is_empty());

        assert!(!root.join(crate::lock::LOCK_FILE).exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn non_rate_limit_failures_continue_and_are_logged() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        // Batch 0 fails with a transport error, batches 1–2 succeed.
        let model = Arc::new(ScriptedModel::new([
            Step::Fail(LlmError::Transport("boom".to_string())),
            Step::Reply(EMPTY_RESPONSE.to_string()),
        ]));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(3));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        let report = run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert_eq!(report.batches_processed, 3);
        assert!(report.more_work_remains, "failed batch 0 is still pending");

        let state = load_state(&root, Utc::now()).unwrap().unwrap();
        assert_eq!(state.ok, 2);
        assert_eq!(state.fail, 1);
        assert!(!state.done.contains(&0));
        assert!(state.done.contains(&1));

        let failures = FailureLog::new(&root).load().unwrap();
        let llm_failures: Vec<_> = failures
            .iter()
            .filter(|e| e.error_type == FailureErrorType::LlmError)
            .collect();
        assert_eq!(llm_failures.len(), 1);
        assert_eq!(llm_failures[0].batch_index, 0);
        assert_eq!(llm_failures[0].labels, vec!["hist:0"]);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn zero_operation_batches_count_ok_with_diagnostic_entry() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        let model = Arc::new(ScriptedModel::always(EMPTY_RESPONSE));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(2));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        let report = run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert!(report.completed);

        let state = load_state(&root, Utc::now()).unwrap().unwrap();
        assert_eq!(state.ok, 2);
        assert_eq!(state.fail, 0);

        let failures = FailureLog::new(&root).load().unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|e| e.error_type == FailureErrorType::ZeroOperations));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn busy_lock_returns_ran_false() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        let model = Arc::new(ScriptedModel::always(EMPTY_RESPONSE));
        let run = run_args(&config, model.clone(), &store, &sessions);
        let source = ListSource(chunks(2));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        // Hold the lock with our own (alive) pid.
        let held = claim(&root, Utc::now()).unwrap().unwrap();
        let report = run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert!(!report.ran);
        assert_eq!(model.call_count(), 0);
        held.release();

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn full_run_writes_nodes_and_completes() {
        let (store, sessions, root) = scratch();
        let config = config(1); // tick budget irrelevant for run_bootstrap
        let model = Arc::new(ScriptedModel::new([
            Step::Reply(response_writing("alpha")),
            Step::Reply(response_writing("beta")),
        ]));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(2));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        let report = run_bootstrap(&run, &sources, Utc::now()).await.unwrap();
        assert!(report.completed);
        assert_eq!(report.batches_processed, 2);
        assert_eq!(report.nodes_written, 2);
        assert!(root.join("nodes/fact/history-alpha.md").is_file());
        assert!(root.join("nodes/fact/history-beta.md").is_file());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn retry_preserves_unmatched_failure_entries() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        // First pass: batch 0 fails (transport), batch 1 ok-but-empty.
        let model = Arc::new(ScriptedModel::new([
            Step::Fail(LlmError::Transport("boom".to_string())),
            Step::Reply(EMPTY_RESPONSE.to_string()),
        ]));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(2));
        let sources: Vec<&dyn ChunkSource> = vec![&source];
        run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();

        let before = FailureLog::new(&root).load().unwrap();
        assert_eq!(before.len(), 2); // llm-error + zero-operations

        // Retry only llm-error batches; this time the batch succeeds.
        let retry_model = Arc::new(ScriptedModel::always(response_writing("gamma")));
        let retry = run_args(&config, retry_model, &store, &sessions);
        let report = run_bootstrap_retry(
            &retry,
            &sources,
            RetryOptions {
                error_type_filter: Some(vec![FailureErrorType::LlmError]),
                ..Default::default()
            },
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(report.batches_processed, 1);
        assert!(report.completed);

        // The zero-operations diagnostic entry survived the rewrite; the
        // retried llm-error entry is gone.
        let after = FailureLog::new(&root).load().unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].error_type, FailureErrorType::ZeroOperations);
        assert_eq!(after[0].batch_index, 1);

        let state = load_state(&root, Utc::now()).unwrap().unwrap();
        assert!(state.done.contains(&0));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn retry_with_mismatched_timeout_options_uses_default_client() {
        let (store, sessions, root) = scratch();
        let config = config(10);
        let model = Arc::new(ScriptedModel::new([Step::Fail(LlmError::Transport(
            "boom".to_string(),
        ))]));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(1));
        let sources: Vec<&dyn ChunkSource> = vec![&source];
        run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();

        let retry_model = Arc::new(ScriptedModel::always(EMPTY_RESPONSE));
        let retry = run_args(&config, retry_model.clone(), &store, &sessions);
        let report = run_bootstrap_retry(
            &retry,
            &sources,
            RetryOptions {
                timeout_ms: Some(5000), // factory missing: warn + default
                ..Default::default()
            },
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(report.ran);
        assert!(retry_model.call_count() > 0, "default client used");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn crash_simulation_resumes_from_persisted_done_set() {
        let (store, sessions, root) = scratch();
        let config = config(2);
        let model = Arc::new(ScriptedModel::always(EMPTY_RESPONSE));
        let run = run_args(&config, model, &store, &sessions);
        let source = ListSource(chunks(5));
        let sources: Vec<&dyn ChunkSource> = vec![&source];

        // Tick processes 2 batches, then the "process dies" (state stays).
        run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert!(state_path(&root).is_file());
        assert!(root.join(STATE_FILE).is_file());

        // A new process resumes: batches 0–1 are skipped, 2–3 run next.
        let report = run_bootstrap_tick(&run, &sources, Utc::now()).await.unwrap();
        assert_eq!(report.batches_processed, 2);
        let state = load_state(&root, Utc::now()).unwrap().unwrap();
        assert_eq!(state.done.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(state.cursor, 4);

        let _ = std::fs::remove_dir_all(root);
    }
}
