//! The observation pipeline: guardrails → model → parse → suppress → merge
//! → write → state update.
//!
//! Failure policy: an unrecoverable model error leaves the observation
//! boundary and pending-token counter untouched so the next turn retries
//! the same messages; everything else the pipeline learned (fingerprints,
//! counters) is still persisted.  Per-operation write failures are
//! collected, never cascaded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use omg_config::OmgConfig;
use omg_graph::{
    GraphStore, MetricEvent, MetricsSink, MocAction, MocUpdate, NodeDraft, WriteContext,
};
use omg_llm::{TextModel, Usage};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ObserverError;
use crate::guardrails::{
    check_source_overlap, suppress_duplicate_candidates, truncate_overlapping, OverlapDecision,
};
use crate::merge::{body_adds_content, decide_merge, MergeDecision, SemanticSearch};
use crate::parser::{parse_observation_response, ObservationAction, ObservationOp};
use crate::session::{SessionStore, TriggerDecision};

/// Fixed completion budget for one observation call.
const OBSERVATION_MAX_TOKENS: u32 = 4096;

/// Builds the prompt pair for an observation call.  Prompt wording is the
/// host's concern; the core only routes text.
pub trait ObservationPrompts: Send + Sync {
    fn build(&self, messages: &[String], now_body: Option<&str>) -> (String, String);
}

/// Bare-bones default: system header plus the joined messages.
pub struct JoinedPrompts;

impl ObservationPrompts for JoinedPrompts {
    fn build(&self, messages: &[String], now_body: Option<&str>) -> (String, String) {
        let mut user = String::new();
        if let Some(now_body) = now_body {
            user.push_str("Current state:\n");
            user.push_str(now_body);
            user.push_str("\n\n");
        }
        user.push_str("Messages:\n");
        for message in messages {
            user.push_str(message);
            user.push('\n');
        }
        (
            "Extract durable observations as <observations> XML.".to_string(),
            user,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ObservationRequest {
    pub messages: Vec<String>,
    pub now_node_body: Option<String>,
    pub session_key: String,
    /// Uid scope, stable per workspace.
    pub scope: String,
    /// Provenance kind recorded on written nodes (`chat`, `bootstrap`, …).
    pub source_kind: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservationOutcome {
    pub skipped: bool,
    pub truncated: bool,
    pub written_ids: Vec<String>,
    pub appended_ids: Vec<String>,
    /// `(surviving node, aliased key)` pairs.
    pub aliases: Vec<(String, String)>,
    pub suppressed: usize,
    pub operations_seen: usize,
    pub usage: Usage,
    pub reflection_due: bool,
    pub diagnostics: Vec<String>,
    /// Per-operation failures that did not stop the rest of the batch.
    pub errors: Vec<String>,
}

impl ObservationOutcome {
    /// Every node this turn touched, writes first, then appends.
    pub fn touched_ids(&self) -> Vec<String> {
        let mut ids = self.written_ids.clone();
        for id in &self.appended_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// Turn-end driver for the session state machine: decides whether the
/// pipeline fires and persists the state on every path.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn_end(
    request: ObservationRequest,
    config: &OmgConfig,
    model: &dyn TextModel,
    prompts: &dyn ObservationPrompts,
    store: &GraphStore,
    sessions: &SessionStore,
    search: Option<&dyn SemanticSearch>,
    metrics: &dyn MetricsSink,
) -> Result<Option<ObservationOutcome>, ObserverError> {
    let state = sessions.load(&request.session_key)?;
    match state.decide_trigger(&request.messages, &config.observation) {
        TriggerDecision::Manual => Ok(None),
        TriggerDecision::Accumulate { pending_tokens } => {
            let mut state = state;
            state.apply_accumulate(pending_tokens);
            sessions.save(&request.session_key, &state)?;
            debug!(pending_tokens, "below observation threshold — accumulated");
            Ok(None)
        }
        TriggerDecision::Observe => run_observation(
            request, config, model, prompts, store, sessions, search, metrics,
        )
        .await
        .map(Some),
    }
}

/// Run one observation over the session's unobserved message tail.
#[allow(clippy::too_many_arguments)]
pub async fn run_observation(
    request: ObservationRequest,
    config: &OmgConfig,
    model: &dyn TextModel,
    prompts: &dyn ObservationPrompts,
    store: &GraphStore,
    sessions: &SessionStore,
    search: Option<&dyn SemanticSearch>,
    metrics: &dyn MetricsSink,
) -> Result<ObservationOutcome, ObserverError> {
    let mut state = sessions.load(&request.session_key)?;
    let mut outcome = ObservationOutcome::default();
    let guardrails = &config.extraction_guardrails;

    let tail: Vec<String> = request
        .messages
        .iter()
        .skip(state.observation_boundary_message_index)
        .cloned()
        .collect();
    if tail.is_empty() {
        debug!("no unobserved messages — nothing to do");
        return Ok(outcome);
    }

    // 1. Guardrail pre-check.
    let check = check_source_overlap(&tail, &state.recent_fingerprints, guardrails, request.now);
    let observed = match check.decision {
        OverlapDecision::Skip => {
            info!(
                overlap = check.max_overlap,
                "turn skipped: overlaps a recent observation window"
            );
            state.apply_skip(
                request.messages.len(),
                check.fingerprint,
                guardrails.recent_window_size,
                request.now,
            );
            sessions.save(&request.session_key, &state)?;
            outcome.skipped = true;
            return Ok(outcome);
        }
        OverlapDecision::Truncate => {
            let kept = truncate_overlapping(&tail, &state.recent_fingerprints, guardrails, request.now);
            outcome.truncated = true;
            if kept.is_empty() {
                state.apply_skip(
                    request.messages.len(),
                    check.fingerprint,
                    guardrails.recent_window_size,
                    request.now,
                );
                sessions.save(&request.session_key, &state)?;
                outcome.skipped = true;
                return Ok(outcome);
            }
            kept
        }
        OverlapDecision::Proceed => tail,
    };

    // 2. Model call.  On failure the boundary stays put and the turn retries.
    let (system, user) = prompts.build(&observed, request.now_node_body.as_deref());
    let response = match model.complete(&system, &user, OBSERVATION_MAX_TOKENS).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "observation model call failed — state preserved for retry");
            sessions.save(&request.session_key, &state)?;
            return Err(err.into());
        }
    };
    outcome.usage = response.usage;

    // 3. Recovery-tolerant parse.
    let parsed = parse_observation_response(&response.content);
    outcome.operations_seen = parsed.operations.len();
    outcome.diagnostics = parsed.diagnostics.clone();

    // 4. Candidate suppression against recently written nodes.
    let registry_snapshot = store
        .registry()
        .with_entries(|entries| entries.clone())
        .await?;
    let semantic_scores =
        collect_semantic_scores(&parsed.operations, search, config.merge.semantic_top_s).await;
    let suppression = suppress_duplicate_candidates(
        parsed.operations,
        &state.last_observation_node_ids,
        &registry_snapshot,
        &semantic_scores,
        guardrails,
    );
    outcome.suppressed = suppression.suppressed.len();

    // 5. Merge-decide and write each survivor.
    let ctx = WriteContext {
        scope: request.scope.clone(),
        session_key: request.session_key.clone(),
        source_kind: request.source_kind.clone(),
        now: request.now,
    };
    let mut moc_touches: Vec<MocUpdate> = parsed.moc_updates.clone();
    for op in suppression.survivors {
        match apply_operation(&op, &registry_snapshot, &semantic_scores, config, store, &ctx).await
        {
            Ok(applied) => {
                match applied {
                    AppliedOp::Written(id) => {
                        collect_moc_touches(&op, &id, &mut moc_touches);
                        outcome.written_ids.push(id);
                    }
                    AppliedOp::Appended(id) => outcome.appended_ids.push(id),
                    AppliedOp::Aliased { target, key } => outcome.aliases.push((target, key)),
                    AppliedOp::Noop => {}
                }
            }
            Err(err) => {
                warn!(id = %op.id, error = %err, "operation failed — continuing with the rest");
                outcome.errors.push(format!("{}: {err}", op.id));
            }
        }
    }

    // 6. Now snapshot.
    if let Some(now_body) = &parsed.now_update {
        let recent = outcome.touched_ids();
        if let Err(err) = store.write_now(now_body, &recent, &ctx).await {
            outcome.errors.push(format!("now update: {err}"));
        }
    }

    // 7. MOC touch list (hints and explicit updates; links are authoritative
    // and were folded in per written node).
    for update in dedupe_moc_updates(moc_touches) {
        if let Err(err) = store.apply_moc_update(&update, &ctx).await {
            outcome.errors.push(format!("moc {}: {err}", update.domain));
        }
    }

    // 8. Index regeneration.
    let stats = store.registry().stats().await?;
    let moc_ids = store.list_moc_ids()?;
    if let Err(err) = store.write_index(&moc_ids, stats.node_count, &ctx).await {
        outcome.errors.push(format!("index: {err}"));
    }

    // 9. Session state update and reflection trigger.
    state.apply_observation(
        request.messages.len(),
        response.usage.total(),
        check.fingerprint,
        guardrails.recent_window_size,
        outcome.touched_ids(),
        stats.node_count,
        request.now,
    )?;
    outcome.reflection_due = state.reflection_due(&config.reflection);
    sessions.save(&request.session_key, &state)?;

    metrics.emit(MetricEvent::new(
        "observation.complete",
        json!({
            "session": request.session_key,
            "written": outcome.written_ids.len(),
            "appended": outcome.appended_ids.len(),
            "aliased": outcome.aliases.len(),
            "suppressed": outcome.suppressed,
            "tokens": outcome.usage.total(),
        }),
    ));
    info!(
        written = outcome.written_ids.len(),
        appended = outcome.appended_ids.len(),
        aliased = outcome.aliases.len(),
        suppressed = outcome.suppressed,
        "observation complete"
    );
    Ok(outcome)
}

enum AppliedOp {
    Written(String),
    Appended(String),
    Aliased { target: String, key: String },
    Noop,
}

async fn apply_operation(
    op: &ObservationOp,
    registry_snapshot: &BTreeMap<String, omg_graph::RegistryEntry>,
    semantic_scores: &BTreeMap<String, f64>,
    config: &OmgConfig,
    store: &GraphStore,
    ctx: &WriteContext,
) -> Result<AppliedOp, ObserverError> {
    match op.action {
        ObservationAction::Create => {
            let node = store.write_legacy(&draft_from(op, None), ctx).await?;
            Ok(AppliedOp::Written(node.header.id))
        }
        ObservationAction::Update => {
            let target = op.target_id.clone().unwrap_or_default();
            let text = if op.body.is_empty() { &op.description } else { &op.body };
            let node = store.append_to_existing(&target, text, ctx).await?;
            Ok(AppliedOp::Appended(node.header.id))
        }
        ObservationAction::Supersede => {
            let superseded = op.target_id.clone().unwrap_or_default();
            let node = store
                .write_observation_upsert(&draft_from(op, Some(vec![superseded])), ctx)
                .await?;
            Ok(AppliedOp::Written(node.header.id))
        }
        ObservationAction::Upsert => {
            match decide_merge(op, registry_snapshot, semantic_scores, &config.merge) {
                MergeDecision::WriteNew => {
                    let node = store
                        .write_observation_upsert(&draft_from(op, None), ctx)
                        .await?;
                    Ok(AppliedOp::Written(node.header.id))
                }
                MergeDecision::MergeExact { target_id } => {
                    let existing = store.read_by_id(&target_id).await?;
                    let existing_body = existing.map(|n| n.body).unwrap_or_default();
                    if body_adds_content(&op.body, &existing_body) {
                        let node = store.append_to_existing(&target_id, &op.body, ctx).await?;
                        Ok(AppliedOp::Appended(node.header.id))
                    } else {
                        debug!(target = %target_id, "candidate already subsumed — no-op");
                        Ok(AppliedOp::Noop)
                    }
                }
                MergeDecision::Alias { target_id } => {
                    store
                        .add_alias(&target_id, &op.canonical_key, ctx)
                        .await?;
                    Ok(AppliedOp::Aliased {
                        target: target_id,
                        key: op.canonical_key.clone(),
                    })
                }
            }
        }
    }
}

fn draft_from(op: &ObservationOp, supersedes: Option<Vec<String>>) -> NodeDraft {
    NodeDraft {
        node_type: op.node_type,
        canonical_key: op.canonical_key.clone(),
        description: op.description.clone(),
        priority: op.priority,
        body: if op.body.is_empty() {
            op.description.clone()
        } else {
            op.body.clone()
        },
        links: (!op.links.is_empty()).then(|| op.links.clone()),
        tags: (!op.tags.is_empty()).then(|| op.tags.clone()),
        supersedes,
        applies_to: op.applies_to.clone(),
    }
}

/// MOC membership from model hints plus authoritative `omg/moc-<D>` links.
/// Tags never participate.
fn collect_moc_touches(op: &ObservationOp, written_id: &str, touches: &mut Vec<MocUpdate>) {
    for hint in &op.moc_hints {
        touches.push(MocUpdate {
            domain: hint.clone(),
            node_id: written_id.to_string(),
            action: MocAction::Add,
        });
    }
    for link in &op.links {
        if let Some(domain) = link.strip_prefix("omg/moc-") {
            if !domain.is_empty() {
                touches.push(MocUpdate {
                    domain: domain.to_string(),
                    node_id: written_id.to_string(),
                    action: MocAction::Add,
                });
            }
        }
    }
}

fn dedupe_moc_updates(touches: Vec<MocUpdate>) -> Vec<MocUpdate> {
    let mut seen = Vec::new();
    for touch in touches {
        if !seen.contains(&touch) {
            seen.push(touch);
        }
    }
    seen
}

async fn collect_semantic_scores(
    operations: &[ObservationOp],
    search: Option<&dyn SemanticSearch>,
    top: usize,
) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    let Some(search) = search else {
        return scores;
    };
    for op in operations {
        for (id, score) in search.similar_nodes(&op.description, top).await {
            let slot = scores.entry(id).or_insert(score);
            if score > *slot {
                *slot = score;
            }
        }
    }
    scores
}

// ── Tests ─────────────────────────────────────────────────────────────────────
