//! Identity Module
//!
//! What makes the automaton an economic actor: the wallet key on disk
//! and the SIWE exchange that turns a signature into an API key.

pub mod provision;
pub mod wallet;
