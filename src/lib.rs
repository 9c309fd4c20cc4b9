#![forbid(unsafe_code)]

//! Session orchestrator for concurrent, streaming coding-agent conversations.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod state;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
