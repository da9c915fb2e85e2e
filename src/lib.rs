//! Automaton Daemon -- Autonomous Agent Runtime
//!
//! A self-funding agent that runs continuously in a cloud sandbox,
//! owns a wallet, pays for its own compute, and executes a
//! Think -> Act -> Observe loop against an external inference service.

pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod identity;
pub mod providers;
pub mod router;
pub mod skills;
pub mod state;
pub mod survival;
pub mod types;
