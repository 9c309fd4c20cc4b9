//! Session orchestration.
//!
//! Covers the session registry, single-flight submission control with its
//! cancellation ladder, the streaming relay, heartbeat supervision, and
//! the incremental message builder that checkpoints task records under a
//! per-task write claim.

pub mod builder;
pub mod claims;
pub mod controller;
pub mod heartbeat;
pub mod registry;
pub mod relay;
pub mod service;
pub mod sink;

pub use service::{Orchestrator, OrchestratorSettings, SubmitStream};
