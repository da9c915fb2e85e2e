//! Automaton Tool System
//!
//! Defines the tools the automaton can call, with self-preservation
//! guards. Tool-call arguments arrive as free-form JSON from the model;
//! each registered tool has a typed variant, and an unrecognized name
//! is an error recorded on the call rather than a crash.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::AutomatonConfig;
use crate::skills::{is_valid_skill_name, save_skill};
use crate::state::Database;
use crate::types::{
    ChainProvider, ChildAutomaton, ChildStatus, HundredthCents, InferenceToolDefinition,
    InferenceToolDefinitionFunction, SandboxProvider, Skill, SkillSource, SocialProvider,
    WalletSigner,
};

/// Maximum tool calls the engine will execute within one turn.
pub const MAX_TOOL_CALLS_PER_TURN: usize = 10;

// --- Self-Preservation Guard ---

/// Patterns for commands the automaton must never execute.
fn forbidden_command_patterns() -> Vec<Regex> {
    let patterns = [
        // Self-destruction
        r"rm\s+(-rf?\s+)?.*\.automaton",
        r"rm\s+(-rf?\s+)?.*state\.db",
        r"rm\s+(-rf?\s+)?.*wallet\.json",
        r"rm\s+(-rf?\s+)?.*automaton\.json",
        r"rm\s+(-rf?\s+)?.*heartbeat\.yml",
        r"rm\s+(-rf?\s+)?.*SOUL\.md",
        // Process killing
        r"kill\s+.*automatond",
        r"pkill\s+.*automatond",
        r"systemctl\s+(stop|disable)\s+automatond",
        // Database destruction
        r"(?i)DROP\s+TABLE",
        r"(?i)DELETE\s+FROM\s+(turns|kv|schema_version|skills|children|cost_ledger|model_registry)",
        r"(?i)TRUNCATE",
        // Credential harvesting
        r"cat\s+.*\.ssh",
        r"cat\s+.*\.gnupg",
        r"cat\s+.*\.env",
        r"cat\s+.*wallet\.json",
    ];

    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

/// Check if a command is forbidden by self-preservation rules.
/// Returns `Some(reason)` if blocked, `None` if allowed.
pub fn is_forbidden_command(command: &str) -> Option<String> {
    for pattern in &forbidden_command_patterns() {
        if pattern.is_match(command) {
            return Some(format!(
                "Blocked: command matches self-harm pattern: {}",
                pattern.as_str()
            ));
        }
    }
    None
}

// --- Typed Invocations ---

/// Every registered tool, with its arguments decoded.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolInvocation {
    Exec {
        command: String,
        timeout_ms: Option<u64>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ReadFile {
        path: String,
    },
    ExposePort {
        port: u16,
    },
    CheckCredits,
    SendMessage {
        to: String,
        content: String,
    },
    TransferCredits {
        to: String,
        amount_hundredth_cents: HundredthCents,
    },
    SpawnChild {
        name: String,
        genesis_prompt: String,
    },
    PublishAgentCard {
        description: String,
    },
    UpdateSoul {
        content: String,
    },
    CreateSkill {
        name: String,
        description: String,
        instructions: String,
        auto_activate: bool,
    },
    Sleep {
        seconds: u64,
    },
}

#[derive(Clone, Debug)]
pub enum ToolParseError {
    /// The model asked for a tool that does not exist.
    Unknown(String),
    /// The tool exists but the arguments do not decode.
    BadArguments { tool: String, message: String },
}

impl std::fmt::Display for ToolParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolParseError::Unknown(name) => write!(f, "unknown tool: {name}"),
            ToolParseError::BadArguments { tool, message } => {
                write!(f, "bad arguments for {tool}: {message}")
            }
        }
    }
}

fn str_arg(args: &Value, key: &str, tool: &str) -> Result<String, ToolParseError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolParseError::BadArguments {
            tool: tool.to_string(),
            message: format!("missing string field '{key}'"),
        })
}

impl ToolInvocation {
    /// Decode a (name, arguments) pair from the model into a typed
    /// invocation.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolParseError> {
        match name {
            "exec" => Ok(ToolInvocation::Exec {
                command: str_arg(args, "command", name)?,
                timeout_ms: args.get("timeout").and_then(|v| v.as_u64()),
            }),
            "write_file" => Ok(ToolInvocation::WriteFile {
                path: str_arg(args, "path", name)?,
                content: str_arg(args, "content", name)?,
            }),
            "read_file" => Ok(ToolInvocation::ReadFile {
                path: str_arg(args, "path", name)?,
            }),
            "expose_port" => {
                let port = args.get("port").and_then(|v| v.as_u64()).ok_or_else(|| {
                    ToolParseError::BadArguments {
                        tool: name.to_string(),
                        message: "missing numeric field 'port'".to_string(),
                    }
                })?;
                Ok(ToolInvocation::ExposePort { port: port as u16 })
            }
            "check_credits" => Ok(ToolInvocation::CheckCredits),
            "send_message" => Ok(ToolInvocation::SendMessage {
                to: str_arg(args, "to", name)?,
                content: str_arg(args, "content", name)?,
            }),
            "transfer_credits" => {
                let amount = args
                    .get("amount_hundredth_cents")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| ToolParseError::BadArguments {
                        tool: name.to_string(),
                        message: "missing numeric field 'amount_hundredth_cents'".to_string(),
                    })?;
                Ok(ToolInvocation::TransferCredits {
                    to: str_arg(args, "to", name)?,
                    amount_hundredth_cents: amount,
                })
            }
            "spawn_child" => Ok(ToolInvocation::SpawnChild {
                name: str_arg(args, "name", name)?,
                genesis_prompt: str_arg(args, "genesis_prompt", name)?,
            }),
            "publish_agent_card" => Ok(ToolInvocation::PublishAgentCard {
                description: str_arg(args, "description", name)?,
            }),
            "update_soul" => Ok(ToolInvocation::UpdateSoul {
                content: str_arg(args, "content", name)?,
            }),
            "create_skill" => Ok(ToolInvocation::CreateSkill {
                name: str_arg(args, "name", name)?,
                description: args
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                instructions: str_arg(args, "instructions", name)?,
                auto_activate: args
                    .get("auto_activate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
            }),
            "sleep" => Ok(ToolInvocation::Sleep {
                seconds: args.get("seconds").and_then(|v| v.as_u64()).unwrap_or(60),
            }),
            other => Err(ToolParseError::Unknown(other.to_string())),
        }
    }

    /// Whether this tool crosses a trust boundary. The engine permits at
    /// most one outbound action per turn.
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            ToolInvocation::TransferCredits { .. }
                | ToolInvocation::SpawnChild { .. }
                | ToolInvocation::PublishAgentCard { .. }
        )
    }
}

// --- Execution ---

/// A tool failure. Fatal failures abort the remainder of the turn's
/// tool calls; non-fatal ones are recorded and the turn continues.
#[derive(Clone, Debug)]
pub struct ToolError {
    pub message: String,
    pub fatal: bool,
}

impl ToolError {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }
}

/// Provider handles tool execution runs against.
pub struct ToolDispatchContext {
    pub config: AutomatonConfig,
    pub agent_address: String,
    pub db: Arc<Mutex<Database>>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub social: Option<Arc<dyn SocialProvider>>,
    pub wallet: Arc<dyn WalletSigner>,
    pub chain: Option<Arc<dyn ChainProvider>>,
}

/// Execute a typed invocation. Returns the tool's result string on
/// success.
pub async fn execute_tool(
    invocation: &ToolInvocation,
    ctx: &ToolDispatchContext,
) -> Result<String, ToolError> {
    match invocation {
        ToolInvocation::Exec {
            command,
            timeout_ms,
        } => {
            if let Some(reason) = is_forbidden_command(command) {
                return Err(ToolError::recoverable(reason));
            }
            let result = ctx
                .sandbox
                .exec(command, *timeout_ms)
                .await
                .map_err(|e| ToolError::fatal(format!("sandbox lost: {e}")))?;
            Ok(json!({
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exitCode": result.exit_code,
            })
            .to_string())
        }

        ToolInvocation::WriteFile { path, content } => {
            ctx.sandbox
                .write_file(path, content)
                .await
                .map_err(|e| ToolError::fatal(format!("sandbox lost: {e}")))?;
            Ok(format!("Wrote {} bytes to {}", content.len(), path))
        }

        ToolInvocation::ReadFile { path } => ctx
            .sandbox
            .read_file(path)
            .await
            .map_err(|e| ToolError::fatal(format!("sandbox lost: {e}"))),

        ToolInvocation::ExposePort { port } => {
            let info = ctx
                .sandbox
                .expose_port(*port)
                .await
                .map_err(|e| ToolError::recoverable(format!("expose_port failed: {e}")))?;
            Ok(format!("Port {} exposed at {}", info.port, info.public_url))
        }

        ToolInvocation::CheckCredits => {
            let balance = ctx
                .sandbox
                .credits_balance()
                .await
                .map_err(|e| ToolError::recoverable(format!("credit check failed: {e}")))?;
            Ok(format!("Credit balance: {balance} hundredth-cents"))
        }

        ToolInvocation::SendMessage { to, content } => {
            let social = ctx
                .social
                .as_ref()
                .ok_or_else(|| ToolError::recoverable("no social relay configured"))?;
            let receipt = social
                .send(to, content)
                .await
                .map_err(|e| ToolError::recoverable(format!("send failed: {e}")))?;
            Ok(format!("Message sent (id: {})", receipt.id))
        }

        ToolInvocation::TransferCredits {
            to,
            amount_hundredth_cents,
        } => {
            if *amount_hundredth_cents <= 0 {
                return Err(ToolError::recoverable("transfer amount must be positive"));
            }
            ctx.sandbox
                .transfer_credits(to, *amount_hundredth_cents)
                .await
                .map_err(|e| ToolError::recoverable(format!("transfer failed: {e}")))?;
            Ok(format!(
                "Transferred {amount_hundredth_cents} hundredth-cents to {to}"
            ))
        }

        ToolInvocation::SpawnChild {
            name,
            genesis_prompt,
        } => {
            let children = ctx.db.lock().unwrap().get_children().map_err(|e| {
                ToolError::recoverable(format!("failed to count children: {e}"))
            })?;
            if children.len() as u32 >= ctx.config.max_children {
                return Err(ToolError::recoverable(format!(
                    "child limit reached ({})",
                    ctx.config.max_children
                )));
            }

            let sandbox_id = ctx
                .sandbox
                .create_sandbox(name)
                .await
                .map_err(|e| ToolError::recoverable(format!("sandbox create failed: {e}")))?;

            let child = ChildAutomaton {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                sandbox_id: sandbox_id.clone(),
                // The child derives its own wallet on first boot; until it
                // reports in, it is referenced by sandbox only.
                address: String::new(),
                status: ChildStatus::Unknown,
                created_at: Utc::now().to_rfc3339(),
                last_checked: None,
            };
            {
                let db = ctx.db.lock().unwrap();
                db.insert_child(&child)
                    .map_err(|e| ToolError::recoverable(format!("failed to record child: {e}")))?;
                // The installer inside the child's sandbox picks this up
                // as its genesis prompt.
                let _ = db.set_kv(&format!("child_genesis:{}", child.id), genesis_prompt);
            }

            info!("Spawned child '{name}' in sandbox {sandbox_id}");
            Ok(format!("Child '{name}' spawning in sandbox {sandbox_id}"))
        }

        ToolInvocation::PublishAgentCard { description } => {
            let card = json!({
                "type": "AgentCard",
                "name": ctx.config.name,
                "description": description,
                "address": ctx.agent_address,
                "active": true,
            });

            // The card is signed so peers can verify provenance. A signer
            // refusal is fatal for the rest of the turn.
            let signature = ctx
                .wallet
                .sign_typed_data(
                    json!({ "name": "automaton-card", "version": "1", "chainId": 8453 }),
                    json!({
                        "EIP712Domain": [
                            { "name": "name", "type": "string" },
                            { "name": "version", "type": "string" },
                            { "name": "chainId", "type": "uint256" }
                        ],
                        "AgentCard": [
                            { "name": "name", "type": "string" },
                            { "name": "description", "type": "string" },
                            { "name": "address", "type": "address" }
                        ]
                    }),
                    json!({
                        "name": ctx.config.name,
                        "description": description,
                        "address": ctx.agent_address,
                    }),
                )
                .await
                .map_err(|e| ToolError::fatal(format!("wallet signer refused: {e}")))?;

            let mut signed_card = card;
            signed_card["signature"] = json!(signature);

            ctx.sandbox
                .write_file(
                    "/srv/agent-card.json",
                    &serde_json::to_string_pretty(&signed_card).unwrap_or_default(),
                )
                .await
                .map_err(|e| ToolError::fatal(format!("sandbox lost: {e}")))?;

            Ok("Agent card signed and published".to_string())
        }

        ToolInvocation::UpdateSoul { content } => {
            let soul_path = crate::config::get_automaton_dir().join("SOUL.md");
            std::fs::write(&soul_path, content)
                .map_err(|e| ToolError::recoverable(format!("failed to write SOUL.md: {e}")))?;
            Ok("SOUL.md updated".to_string())
        }

        ToolInvocation::CreateSkill {
            name,
            description,
            instructions,
            auto_activate,
        } => {
            if !is_valid_skill_name(name) {
                return Err(ToolError::recoverable(format!(
                    "invalid skill name '{name}': use lowercase letters, digits, '-', '_'"
                )));
            }
            let skill = Skill {
                name: name.clone(),
                description: description.clone(),
                auto_activate: *auto_activate,
                requires: None,
                instructions: instructions.clone(),
                source: SkillSource::SelfAuthored,
                path: String::new(),
                enabled: true,
                installed_at: Utc::now().to_rfc3339(),
            };
            let skills_dir = crate::config::resolve_path(&ctx.config.skills_dir);
            let db = ctx.db.lock().unwrap();
            save_skill(&skill, &skills_dir, &db)
                .map_err(|e| ToolError::recoverable(format!("failed to save skill: {e}")))?;
            Ok(format!("Skill '{name}' created"))
        }

        ToolInvocation::Sleep { seconds } => {
            let until = Utc::now() + chrono::Duration::seconds(*seconds as i64);
            ctx.db
                .lock()
                .unwrap()
                .set_kv("sleep_until", &until.to_rfc3339())
                .map_err(|e| ToolError::recoverable(format!("failed to record sleep: {e}")))?;
            Ok(format!("Sleeping until {}", until.to_rfc3339()))
        }
    }
}

// --- Definitions for the model ---

fn def(name: &str, description: &str, parameters: Value) -> InferenceToolDefinition {
    InferenceToolDefinition {
        def_type: "function".to_string(),
        function: InferenceToolDefinitionFunction {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// The tool definitions advertised to the model each turn.
pub fn tool_definitions() -> Vec<InferenceToolDefinition> {
    vec![
        def(
            "exec",
            "Execute a shell command in your sandbox. Returns stdout, stderr, and exit code.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The shell command to execute" },
                    "timeout": { "type": "number", "description": "Timeout in milliseconds (default: 30000)" }
                },
                "required": ["command"]
            }),
        ),
        def(
            "write_file",
            "Write content to a file in your sandbox.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        ),
        def(
            "read_file",
            "Read content from a file in your sandbox.",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        ),
        def(
            "expose_port",
            "Expose a port from your sandbox to the internet. Returns a public URL.",
            json!({
                "type": "object",
                "properties": { "port": { "type": "number" } },
                "required": ["port"]
            }),
        ),
        def(
            "check_credits",
            "Check your current compute credit balance.",
            json!({ "type": "object", "properties": {} }),
        ),
        def(
            "send_message",
            "Send a message to another agent through the social relay.",
            json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string", "description": "Recipient address" },
                    "content": { "type": "string" }
                },
                "required": ["to", "content"]
            }),
        ),
        def(
            "transfer_credits",
            "Transfer compute credits to another agent. Outbound: at most one such action per turn.",
            json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string", "description": "Recipient address" },
                    "amount_hundredth_cents": { "type": "number" }
                },
                "required": ["to", "amount_hundredth_cents"]
            }),
        ),
        def(
            "spawn_child",
            "Spawn a child automaton in a fresh sandbox. Outbound: at most one such action per turn.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "genesis_prompt": { "type": "string" }
                },
                "required": ["name", "genesis_prompt"]
            }),
        ),
        def(
            "publish_agent_card",
            "Sign and publish your agent card so other agents can discover you. Outbound: at most one such action per turn.",
            json!({
                "type": "object",
                "properties": { "description": { "type": "string" } },
                "required": ["description"]
            }),
        ),
        def(
            "update_soul",
            "Rewrite SOUL.md, your self-authored identity appended to every prompt.",
            json!({
                "type": "object",
                "properties": { "content": { "type": "string" } },
                "required": ["content"]
            }),
        ),
        def(
            "create_skill",
            "Author a new skill file (YAML frontmatter + instructions).",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Lowercase name: [a-z0-9_-]+" },
                    "description": { "type": "string" },
                    "instructions": { "type": "string" },
                    "auto_activate": { "type": "boolean" }
                },
                "required": ["name", "instructions"]
            }),
        ),
        def(
            "sleep",
            "Pause the turn loop for a number of seconds. The heartbeat can still wake you.",
            json!({
                "type": "object",
                "properties": { "seconds": { "type": "number" } },
                "required": ["seconds"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_tool() {
        let inv = ToolInvocation::parse("exec", &json!({ "command": "ls -la" })).unwrap();
        assert_eq!(
            inv,
            ToolInvocation::Exec {
                command: "ls -la".to_string(),
                timeout_ms: None
            }
        );
    }

    #[test]
    fn parse_unknown_tool_is_error() {
        let err = ToolInvocation::parse("launch_missiles", &json!({})).unwrap_err();
        assert!(matches!(err, ToolParseError::Unknown(_)));
    }

    #[test]
    fn parse_missing_argument_is_error() {
        let err = ToolInvocation::parse("write_file", &json!({ "path": "/tmp/x" })).unwrap_err();
        assert!(matches!(err, ToolParseError::BadArguments { .. }));
    }

    #[test]
    fn outbound_classification() {
        assert!(ToolInvocation::TransferCredits {
            to: "0x1".into(),
            amount_hundredth_cents: 100
        }
        .is_outbound());
        assert!(ToolInvocation::SpawnChild {
            name: "kid".into(),
            genesis_prompt: "live".into()
        }
        .is_outbound());
        assert!(ToolInvocation::PublishAgentCard {
            description: "d".into()
        }
        .is_outbound());
        assert!(!ToolInvocation::Exec {
            command: "ls".into(),
            timeout_ms: None
        }
        .is_outbound());
        assert!(!ToolInvocation::SendMessage {
            to: "0x1".into(),
            content: "hi".into()
        }
        .is_outbound());
    }

    #[test]
    fn forbidden_commands_are_caught() {
        assert!(is_forbidden_command("rm -rf ~/.automaton").is_some());
        assert!(is_forbidden_command("rm state.db").is_some());
        assert!(is_forbidden_command("cat ~/.automaton/wallet.json").is_some());
        assert!(is_forbidden_command("sqlite3 state.db 'DROP TABLE turns'").is_some());
        assert!(is_forbidden_command("ls -la /tmp").is_none());
        assert!(is_forbidden_command("cargo build").is_none());
    }

    #[test]
    fn every_definition_parses_back() {
        for definition in tool_definitions() {
            let name = definition.function.name;
            // Unknown-name detection must not reject registered tools.
            let err = ToolInvocation::parse(&name, &json!({}));
            if let Err(ToolParseError::Unknown(n)) = err {
                panic!("registered tool '{n}' reported as unknown");
            }
        }
    }
}
