//! Agent Module
//!
//! The core turn engine, system prompt builder, context management,
//! injection defense, and tool system. When this runs, the automaton is
//! alive.

pub mod context;
pub mod injection_defense;
pub mod system_prompt;
pub mod tools;
pub mod turn_engine;

pub use context::PromptInput;
pub use injection_defense::sanitize_input;
pub use turn_engine::{TurnEngine, TurnEngineOptions};
