//! Shared application state handed to every transport.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::orchestrator::Orchestrator;

/// State shared by the HTTP and IPC transports.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Session orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// Shared secret required on IPC requests, if any.
    pub ipc_auth_token: Option<String>,
}
