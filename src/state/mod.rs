//! Automaton State Module
//!
//! SQLite-backed persistent state for the automaton.
//! The database IS the automaton's memory.

mod database;
mod schema;

pub use database::{Database, KV_LIQUID_BALANCE, KV_SOCIAL_CURSOR, KV_TIER};
pub use schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};
