//! Inference Router
//!
//! Selects a model from the routing matrix, enforces per-call ceilings and
//! the hourly budget, invokes the inference provider with retry and
//! fallback, and records actual spend in the cost ledger.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::Database;
use crate::types::{
    ChatMessage, CostLedgerEntry, HundredthCents, InferenceError, InferenceOptions,
    InferenceProvider, InferenceToolCall, InferenceToolDefinition, ModelEntry, SurvivalTier,
    TaskKind, TokenUsage,
};

use super::matrix::{effective_ceiling, route_for, RouteSpec};

/// Maximum provider invocations per candidate before falling through.
const MAX_ATTEMPTS_PER_CANDIDATE: u32 = 3;

/// Exponential backoff base and cap, in seconds.
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Crude token estimate for budget math when no hint is given.
const CHARS_PER_TOKEN: usize = 4;

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterError {
    /// Every admissible candidate would blow the hourly budget.
    BudgetExhausted {
        hourly_spend: HundredthCents,
        hourly_budget: HundredthCents,
    },
    /// The matrix has no candidate this tier may use for this task.
    NoEligibleModel { task: TaskKind, tier: SurvivalTier },
    /// All candidates failed after retries.
    ProviderUnavailable(String),
    /// The last failure was a deadline expiry.
    Timeout { model_id: String, timeout_secs: u64 },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::BudgetExhausted {
                hourly_spend,
                hourly_budget,
            } => write!(
                f,
                "hourly budget exhausted: spent {hourly_spend} of {hourly_budget} hundredth-cents"
            ),
            RouterError::NoEligibleModel { task, tier } => write!(
                f,
                "no eligible model for task {} at tier {}",
                task.as_str(),
                tier.as_str()
            ),
            RouterError::ProviderUnavailable(msg) => {
                write!(f, "inference provider unavailable: {msg}")
            }
            RouterError::Timeout {
                model_id,
                timeout_secs,
            } => write!(f, "inference on {model_id} timed out after {timeout_secs}s"),
        }
    }
}

impl std::error::Error for RouterError {}

// ─── Request / Response ──────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub task: TaskKind,
    pub messages: Vec<ChatMessage>,
    /// Estimated input tokens; derived from message length when absent.
    pub size_hint_tokens: Option<u32>,
    pub tier_override: Option<SurvivalTier>,
    pub tools: Option<Vec<InferenceToolDefinition>>,
}

impl RouteRequest {
    pub fn new(task: TaskKind, messages: Vec<ChatMessage>) -> Self {
        Self {
            task,
            messages,
            size_hint_tokens: None,
            tier_override: None,
            tools: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouterResponse {
    pub message: ChatMessage,
    pub tool_calls: Option<Vec<InferenceToolCall>>,
    pub usage: TokenUsage,
    pub model_id: String,
    /// Total provider invocations across all candidates.
    pub attempts: u32,
    pub cost_hundredth_cents: HundredthCents,
}

// ─── Router ──────────────────────────────────────────────────────

pub struct InferenceRouter {
    db: Arc<Mutex<Database>>,
    inference: Arc<dyn InferenceProvider>,
    tier_rx: watch::Receiver<SurvivalTier>,
    per_call_ceiling: HundredthCents,
    hourly_budget: HundredthCents,
    enable_model_fallback: bool,
}

impl InferenceRouter {
    pub fn new(
        db: Arc<Mutex<Database>>,
        inference: Arc<dyn InferenceProvider>,
        tier_rx: watch::Receiver<SurvivalTier>,
        per_call_ceiling: HundredthCents,
        hourly_budget: HundredthCents,
        enable_model_fallback: bool,
    ) -> Self {
        Self {
            db,
            inference,
            tier_rx,
            per_call_ceiling,
            hourly_budget,
            enable_model_fallback,
        }
    }

    pub fn current_tier(&self) -> SurvivalTier {
        *self.tier_rx.borrow()
    }

    /// Route a request through the matrix for the current tier.
    pub async fn dispatch(&self, request: RouteRequest) -> Result<RouterResponse, RouterError> {
        let tier = request.tier_override.unwrap_or_else(|| self.current_tier());
        let spec = route_for(tier, request.task);
        self.dispatch_with(spec, tier, request).await
    }

    /// Route a request against an explicit spec. Exposed so runtime route
    /// overrides (and tests) can bypass the static matrix.
    pub async fn dispatch_with(
        &self,
        spec: RouteSpec,
        tier: SurvivalTier,
        request: RouteRequest,
    ) -> Result<RouterResponse, RouterError> {
        if spec.candidates.is_empty() {
            return Err(RouterError::NoEligibleModel {
                task: request.task,
                tier,
            });
        }

        let ceiling = effective_ceiling(spec.ceiling_hundredth_cents, self.per_call_ceiling, tier);
        let in_tokens = request
            .size_hint_tokens
            .unwrap_or_else(|| estimate_input_tokens(&request.messages));
        let timeout = Duration::from_secs(request.task.timeout_secs());

        let mut attempts: u32 = 0;
        let mut budget_blocked = false;
        let mut last_error: Option<RouterError> = None;

        for candidate in &spec.candidates {
            let model = match self.lookup_candidate(candidate, tier) {
                Some(m) => m,
                None => continue,
            };

            let estimate = estimate_cost(&model, in_tokens, spec.max_tokens);
            if estimate > ceiling {
                debug!(
                    "Skipping {}: estimate {}hc over ceiling {}hc",
                    model.model_id, estimate, ceiling
                );
                continue;
            }

            // Ledger reads happen-before every dispatch so the budget
            // invariant holds at the moment of the call.
            let hourly_spend = self.db.lock().unwrap().hourly_spend().unwrap_or(0);
            if hourly_spend + estimate > self.hourly_budget {
                warn!(
                    "Skipping {}: hourly spend {}hc + estimate {}hc exceeds budget {}hc",
                    model.model_id, hourly_spend, estimate, self.hourly_budget
                );
                budget_blocked = true;
                continue;
            }

            match self
                .invoke_candidate(&model, &request, spec.max_tokens, timeout, &mut attempts)
                .await
            {
                Ok(response) => {
                    let cost = actual_cost(&model, &response.usage);
                    self.record_spend(&model, request.task, tier, &response.usage, cost);
                    info!(
                        "Routed {} to {} ({} attempts, {}hc)",
                        request.task.as_str(),
                        model.model_id,
                        attempts,
                        cost
                    );
                    return Ok(RouterResponse {
                        message: response.message,
                        tool_calls: response.tool_calls,
                        usage: response.usage,
                        model_id: model.model_id,
                        attempts,
                        cost_hundredth_cents: cost,
                    });
                }
                Err(err) => {
                    warn!("Candidate {} failed: {}", model.model_id, err);
                    last_error = Some(err);
                    if !self.enable_model_fallback {
                        break;
                    }
                }
            }
        }

        if let Some(err) = last_error {
            return Err(err);
        }
        if budget_blocked {
            let hourly_spend = self.db.lock().unwrap().hourly_spend().unwrap_or(0);
            return Err(RouterError::BudgetExhausted {
                hourly_spend,
                hourly_budget: self.hourly_budget,
            });
        }
        Err(RouterError::NoEligibleModel {
            task: request.task,
            tier,
        })
    }

    fn lookup_candidate(&self, model_id: &str, tier: SurvivalTier) -> Option<ModelEntry> {
        let model = self.db.lock().unwrap().get_model(model_id).ok().flatten()?;
        if !model.enabled {
            debug!("Skipping {model_id}: disabled in registry");
            return None;
        }
        if model.tier_minimum.rank() > tier.rank() {
            debug!(
                "Skipping {model_id}: requires tier {}",
                model.tier_minimum.as_str()
            );
            return None;
        }
        Some(model)
    }

    /// Invoke a single candidate with timeout, retry, and backoff.
    /// Increments `attempts` once per provider invocation.
    async fn invoke_candidate(
        &self,
        model: &ModelEntry,
        request: &RouteRequest,
        max_tokens: u32,
        timeout: Duration,
        attempts: &mut u32,
    ) -> Result<crate::types::InferenceResponse, RouterError> {
        let options = InferenceOptions {
            model: Some(model.model_id.clone()),
            max_tokens: Some(max_tokens.min(model.max_tokens)),
            temperature: None,
            tools: if model.supports_tools {
                request.tools.clone()
            } else {
                None
            },
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            *attempts += 1;

            let call = self.inference.chat(request.messages.clone(), options.clone());
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => {
                    let retryable = err.is_retryable();
                    if retryable && attempt < MAX_ATTEMPTS_PER_CANDIDATE {
                        let delay = backoff_delay(attempt, retry_after_hint(&err));
                        debug!(
                            "Retrying {} after {:?} (attempt {}/{}): {}",
                            model.model_id, delay, attempt, MAX_ATTEMPTS_PER_CANDIDATE, err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RouterError::ProviderUnavailable(err.to_string()));
                }
                Err(_) => {
                    // Deadline expiry. The provider may have partially
                    // charged; the ledger reconciles at the next balance
                    // check, so retrying is preferred over giving up.
                    if attempt < MAX_ATTEMPTS_PER_CANDIDATE {
                        let delay = backoff_delay(attempt, None);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RouterError::Timeout {
                        model_id: model.model_id.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }

    fn record_spend(
        &self,
        model: &ModelEntry,
        task: TaskKind,
        tier: SurvivalTier,
        usage: &TokenUsage,
        cost: HundredthCents,
    ) {
        let db = self.db.lock().unwrap();
        let _ = db.append_ledger(&CostLedgerEntry {
            timestamp: Utc::now().to_rfc3339(),
            model_id: model.model_id.clone(),
            task_kind: task,
            tokens_in: usage.prompt_tokens as i64,
            tokens_out: usage.completion_tokens as i64,
            cost_hundredth_cents: cost,
            tier,
        });
        let _ = db.touch_model_last_seen(&model.model_id);
    }
}

// ─── Cost Math ───────────────────────────────────────────────────

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Pre-call estimate: price the full input plus the worst-case output.
pub fn estimate_cost(model: &ModelEntry, in_tokens: u32, max_tokens: u32) -> HundredthCents {
    ceil_div(in_tokens as i64 * model.cost_per_1k_input, 1_000)
        + ceil_div(max_tokens as i64 * model.cost_per_1k_output, 1_000)
}

/// Post-call cost from actual usage.
pub fn actual_cost(model: &ModelEntry, usage: &TokenUsage) -> HundredthCents {
    ceil_div(usage.prompt_tokens as i64 * model.cost_per_1k_input, 1_000)
        + ceil_div(
            usage.completion_tokens as i64 * model.cost_per_1k_output,
            1_000,
        )
}

fn estimate_input_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars / CHARS_PER_TOKEN).max(1) as u32
}

/// Full-jitter exponential backoff; a Retry-After hint takes precedence.
fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs.min(BACKOFF_CAP_SECS));
    }
    let cap_ms = BACKOFF_CAP_SECS * 1_000;
    let exp_ms = (BACKOFF_BASE_SECS * 1_000).saturating_mul(1u64 << (attempt - 1).min(16));
    let max_ms = exp_ms.min(cap_ms);
    let jittered = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(jittered)
}

fn retry_after_hint(err: &InferenceError) -> Option<u64> {
    match err {
        InferenceError::RateLimited { retry_after_secs } => *retry_after_secs,
        _ => None,
    }
}
