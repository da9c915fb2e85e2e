//! Automaton Daemon - Type Definitions
//!
//! All shared types for the agent runtime: turns, tiers, ledger rows,
//! provider capability traits, and the inference wire shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Integer currency unit used throughout the ledger.
/// 1 hundredth-cent = 0.01 US cent = $0.0001.
pub type HundredthCents = i64;

// ─── Identity ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatonIdentity {
    pub name: String,
    pub address: String,
    pub creator_address: String,
    pub sandbox_id: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletData {
    pub private_key: String,
    pub created_at: String,
}

// ─── Survival Tiers ──────────────────────────────────────────────

/// Discrete operating mode derived from available funds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SurvivalTier {
    High,
    Normal,
    LowCompute,
    Critical,
    Dead,
}

impl SurvivalTier {
    /// Ordering rank: higher is better funded.
    pub fn rank(self) -> u8 {
        match self {
            SurvivalTier::Dead => 0,
            SurvivalTier::Critical => 1,
            SurvivalTier::LowCompute => 2,
            SurvivalTier::Normal => 3,
            SurvivalTier::High => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SurvivalTier::High => "high",
            SurvivalTier::Normal => "normal",
            SurvivalTier::LowCompute => "low_compute",
            SurvivalTier::Critical => "critical",
            SurvivalTier::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<SurvivalTier> {
        match s {
            "high" => Some(SurvivalTier::High),
            "normal" => Some(SurvivalTier::Normal),
            "low_compute" => Some(SurvivalTier::LowCompute),
            "critical" => Some(SurvivalTier::Critical),
            "dead" => Some(SurvivalTier::Dead),
            _ => None,
        }
    }
}

/// Tier entry thresholds in hundredth-cents of liquid balance.
pub const TIER_THRESHOLD_HIGH: HundredthCents = 2_000;
pub const TIER_THRESHOLD_NORMAL: HundredthCents = 500;
pub const TIER_THRESHOLD_LOW_COMPUTE: HundredthCents = 100;
pub const TIER_THRESHOLD_CRITICAL: HundredthCents = 1;

/// Per-call ceiling forced while in the critical tier (3 cents).
pub const CRITICAL_TIER_CEILING: HundredthCents = 300;

// ─── Task Kinds ──────────────────────────────────────────────────

/// The kinds of inference work the router knows how to place.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    AgentTurn,
    HeartbeatTriage,
    SafetyCheck,
    Summarization,
    Planning,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::AgentTurn => "agent_turn",
            TaskKind::HeartbeatTriage => "heartbeat_triage",
            TaskKind::SafetyCheck => "safety_check",
            TaskKind::Summarization => "summarization",
            TaskKind::Planning => "planning",
        }
    }

    pub fn parse(s: &str) -> Option<TaskKind> {
        match s {
            "agent_turn" => Some(TaskKind::AgentTurn),
            "heartbeat_triage" => Some(TaskKind::HeartbeatTriage),
            "safety_check" => Some(TaskKind::SafetyCheck),
            "summarization" => Some(TaskKind::Summarization),
            "planning" => Some(TaskKind::Planning),
            _ => None,
        }
    }

    /// Per-task provider deadline in seconds.
    pub fn timeout_secs(self) -> u64 {
        match self {
            TaskKind::HeartbeatTriage => 15,
            TaskKind::SafetyCheck => 30,
            TaskKind::Summarization => 60,
            TaskKind::AgentTurn | TaskKind::Planning => 120,
        }
    }
}

// ─── Agent Turns ─────────────────────────────────────────────────

/// Lifecycle of a turn record. A crash leaves the record in one of the
/// first three states; startup recovery marks it `aborted`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Building,
    AwaitingInference,
    DispatchingTools,
    Finalized,
    Aborted,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Building => "building",
            TurnStatus::AwaitingInference => "awaiting_inference",
            TurnStatus::DispatchingTools => "dispatching_tools",
            TurnStatus::Finalized => "finalized",
            TurnStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<TurnStatus> {
        match s {
            "building" => Some(TurnStatus::Building),
            "awaiting_inference" => Some(TurnStatus::AwaitingInference),
            "dispatching_tools" => Some(TurnStatus::DispatchingTools),
            "finalized" => Some(TurnStatus::Finalized),
            "aborted" => Some(TurnStatus::Aborted),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Creator,
    Inbox,
    Wake,
    Interval,
    System,
}

impl InputSource {
    pub fn as_str(self) -> &'static str {
        match self {
            InputSource::Creator => "creator",
            InputSource::Inbox => "inbox",
            InputSource::Wake => "wake",
            InputSource::Interval => "interval",
            InputSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> InputSource {
        match s {
            "creator" => InputSource::Creator,
            "inbox" => InputSource::Inbox,
            "wake" => InputSource::Wake,
            "interval" => InputSource::Interval,
            _ => InputSource::System,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurn {
    pub id: String,
    pub timestamp: String,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_source: Option<InputSource>,
    pub thinking: String,
    pub tool_calls: Vec<ToolCallResult>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub cost_hundredth_cents: HundredthCents,
}

/// A tool call within a turn. Exactly one of `result` / `error` is set
/// once the call reaches a terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ─── Inbox ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    /// Externally assigned id; the global dedup key.
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub signed_at: String,
    pub received_at: String,
    #[serde(default)]
    pub processed: bool,
}

// ─── Cost Ledger ─────────────────────────────────────────────────

/// Append-only record of actual inference spend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostLedgerEntry {
    pub timestamp: String,
    pub model_id: String,
    pub task_kind: TaskKind,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_hundredth_cents: HundredthCents,
    pub tier: SurvivalTier,
}

// ─── Model Registry ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub model_id: String,
    pub provider: String,
    /// The lowest tier at which this model may be selected.
    pub tier_minimum: SurvivalTier,
    /// Hundredth-cents per 1k input tokens.
    pub cost_per_1k_input: HundredthCents,
    /// Hundredth-cents per 1k output tokens.
    pub cost_per_1k_output: HundredthCents,
    pub max_tokens: u32,
    pub context_window: u32,
    pub supports_tools: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

// ─── Children ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Running,
    Sleeping,
    Dead,
    Unknown,
}

impl ChildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildStatus::Running => "running",
            ChildStatus::Sleeping => "sleeping",
            ChildStatus::Dead => "dead",
            ChildStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ChildStatus {
        match s {
            "running" => ChildStatus::Running,
            "sleeping" => ChildStatus::Sleeping,
            "dead" => ChildStatus::Dead,
            _ => ChildStatus::Unknown,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildAutomaton {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    /// Parent/child links are address strings, never in-memory handles.
    pub address: String,
    pub status: ChildStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
}

// ─── Injection Defense ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The only form of external text permitted into a prompt.
/// Constructed exclusively by `agent::injection_defense::sanitize_input`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedInput {
    pub content: String,
    pub blocked: bool,
    pub threat_level: ThreatLevel,
    pub checks: Vec<InjectionCheck>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionCheck {
    pub name: String,
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ─── Heartbeat ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEntry {
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule: String,
    pub task: String,
    pub enabled: bool,
    /// Whether this task may still run while the tier is critical.
    #[serde(default)]
    pub critical_allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub entries: Vec<HeartbeatEntry>,
    pub default_interval_ms: u64,
    pub low_compute_multiplier: f64,
}

/// A scheduler-to-engine request for an immediate turn.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WakeSignal {
    pub reason: String,
    pub source: String,
    pub at: String,
}

// ─── Financial ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialState {
    /// Platform credits plus wallet stablecoin, in hundredth-cents.
    pub liquid_hundredth_cents: HundredthCents,
    /// Rolling 60-minute ledger sum at the time of the check.
    pub hourly_spend_hundredth_cents: HundredthCents,
    pub last_checked: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_hundredth_cents: Option<HundredthCents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_after_hundredth_cents: Option<HundredthCents>,
    pub description: String,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    CreditCheck,
    Inference,
    TransferIn,
    TransferOut,
    TierTransition,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::CreditCheck => "credit_check",
            TransactionType::Inference => "inference",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::TransferOut => "transfer_out",
            TransactionType::TierTransition => "tier_transition",
        }
    }

    pub fn parse(s: &str) -> TransactionType {
        match s {
            "inference" => TransactionType::Inference,
            "transfer_in" => TransactionType::TransferIn,
            "transfer_out" => TransactionType::TransferOut,
            "tier_transition" => TransactionType::TierTransition,
            _ => TransactionType::CreditCheck,
        }
    }
}

// ─── Skills ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub auto_activate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<SkillRequirements>,
    pub instructions: String,
    pub source: SkillSource,
    pub path: String,
    pub enabled: bool,
    pub installed_at: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkillRequirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Builtin,
    Disk,
    #[serde(rename = "self")]
    SelfAuthored,
}

impl SkillSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SkillSource::Builtin => "builtin",
            SkillSource::Disk => "disk",
            SkillSource::SelfAuthored => "self",
        }
    }

    pub fn parse(s: &str) -> SkillSource {
        match s {
            "self" | "inline" => SkillSource::SelfAuthored,
            "builtin" => SkillSource::Builtin,
            _ => SkillSource::Disk,
        }
    }
}

// ─── Inference Wire Shapes ───────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<InferenceToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: InferenceToolCallFunction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub id: String,
    pub model: String,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<InferenceToolCall>>,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<InferenceToolDefinition>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceToolDefinition {
    #[serde(rename = "type")]
    pub def_type: String,
    pub function: InferenceToolDefinitionFunction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceToolDefinitionFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ─── Provider Errors ─────────────────────────────────────────────

/// Failure modes of the inference provider, classified for retry logic.
#[derive(Clone, Debug)]
pub enum InferenceError {
    /// Connection refused, DNS failure, broken pipe.
    Network(String),
    /// Non-2xx HTTP status.
    Http { status: u16, message: String },
    /// 429 with an optional Retry-After hint.
    RateLimited { retry_after_secs: Option<u64> },
    /// 2xx but the body could not be interpreted.
    Malformed(String),
}

impl InferenceError {
    /// Whether the router should retry this candidate before falling through.
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Network(_) => true,
            InferenceError::Http { status, .. } => *status >= 500,
            InferenceError::RateLimited { .. } => true,
            InferenceError::Malformed(_) => false,
        }
    }
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceError::Network(msg) => write!(f, "network error: {msg}"),
            InferenceError::Http { status, message } => {
                write!(f, "inference error {status}: {message}")
            }
            InferenceError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(s) => write!(f, "rate limited, retry after {s}s"),
                None => write!(f, "rate limited"),
            },
            InferenceError::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for InferenceError {}

// ─── Provider Capability Traits ──────────────────────────────────

/// LLM chat completion capability.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: InferenceOptions,
    ) -> Result<InferenceResponse, InferenceError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: u16,
    pub public_url: String,
}

/// Control-plane capability for the sandbox this daemon runs in:
/// command execution, file I/O, port exposure, and the platform
/// credit balance that funds it.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn exec(&self, command: &str, timeout_ms: Option<u64>) -> anyhow::Result<ExecResult>;
    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;
    async fn read_file(&self, path: &str) -> anyhow::Result<String>;
    async fn expose_port(&self, port: u16) -> anyhow::Result<PortInfo>;
    /// Platform credit balance in hundredth-cents.
    async fn credits_balance(&self) -> anyhow::Result<HundredthCents>;
    /// Transfer platform credits to another agent's address.
    async fn transfer_credits(
        &self,
        to_address: &str,
        amount_hundredth_cents: HundredthCents,
    ) -> anyhow::Result<()>;
    /// Provision a fresh sandbox for a child automaton; returns its id.
    async fn create_sandbox(&self, name: &str) -> anyhow::Result<String>;
    /// Liveness of a sandbox by id ("running", "sleeping", "dead").
    async fn sandbox_status(&self, sandbox_id: &str) -> anyhow::Result<String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub messages: Vec<InboxMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub id: String,
}

/// Agent-to-agent messaging through a relay.
#[async_trait]
pub trait SocialProvider: Send + Sync {
    async fn poll(&self, cursor: Option<&str>) -> anyhow::Result<PollResponse>;
    async fn send(&self, to: &str, content: &str) -> anyhow::Result<SendReceipt>;
}

/// Signing capability backed by the automaton's private key.
/// The key itself never crosses this boundary.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// EIP-712 typed-data signature, hex encoded.
    async fn sign_typed_data(
        &self,
        domain: serde_json::Value,
        types: serde_json::Value,
        message: serde_json::Value,
    ) -> anyhow::Result<String>;
    fn address(&self) -> String;
}

/// Read-only chain access. Returns the raw return data of an
/// `eth_call` against the given contract.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn read_contract(&self, address: &str, calldata: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_rank_ordering() {
        assert!(SurvivalTier::High.rank() > SurvivalTier::Normal.rank());
        assert!(SurvivalTier::Normal.rank() > SurvivalTier::LowCompute.rank());
        assert!(SurvivalTier::LowCompute.rank() > SurvivalTier::Critical.rank());
        assert!(SurvivalTier::Critical.rank() > SurvivalTier::Dead.rank());
    }

    #[test]
    fn tier_round_trips_through_str() {
        for tier in [
            SurvivalTier::High,
            SurvivalTier::Normal,
            SurvivalTier::LowCompute,
            SurvivalTier::Critical,
            SurvivalTier::Dead,
        ] {
            assert_eq!(SurvivalTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn task_timeouts_match_contract() {
        assert_eq!(TaskKind::HeartbeatTriage.timeout_secs(), 15);
        assert_eq!(TaskKind::SafetyCheck.timeout_secs(), 30);
        assert_eq!(TaskKind::Summarization.timeout_secs(), 60);
        assert_eq!(TaskKind::AgentTurn.timeout_secs(), 120);
        assert_eq!(TaskKind::Planning.timeout_secs(), 120);
    }

    #[test]
    fn retryable_classification() {
        assert!(InferenceError::Network("refused".into()).is_retryable());
        assert!(InferenceError::Http {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(InferenceError::RateLimited {
            retry_after_secs: Some(2)
        }
        .is_retryable());
        assert!(!InferenceError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!InferenceError::Malformed("no choices".into()).is_retryable());
    }
}
