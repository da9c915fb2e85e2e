//! Inference Router Module
//!
//! Model selection from the (tier x task-kind) matrix, budget
//! enforcement, retry with fallback, and spend accounting.

pub mod matrix;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod router;

pub use matrix::{effective_ceiling, route_for, RouteSpec, CEILING_UNBOUNDED};
pub use registry::{baseline_models, seed_registry};
pub use router::{
    actual_cost, estimate_cost, InferenceRouter, RouteRequest, RouterError, RouterResponse,
};
