//! Healthcare chat assistant backed by a hosted agent.
//!
//! A user's message is posted to their thread on a hosted agent service. The
//! agent reasons remotely and calls back into four local tool functions
//! (guideline search, web search, patient lookup, discharge summary) which
//! this crate executes and answers.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP front end with a single-page chat UI
//! - **Invocation loop**: drives hosted runs, answering tool calls
//! - **Tools**: one external dependency each, failures rendered as text
//! - **Secrets**: resolved once at startup from Key Vault or the environment
//!
//! # Modules
//!
//! - [`agent`]: hosted agent client, invocation loop, provisioning
//! - [`azure`]: bearer-token credentials
//! - [`config`]: CLI and layered configuration
//! - [`http`]: outbound HTTP clients with request timeouts
//! - [`secrets`]: secret stores and startup resolution
//! - [`server`], [`ui`]: HTTP routes and the chat page
//! - [`services`]: explicit construction of all clients
//! - [`session`]: user to thread mapping
//! - [`telemetry`]: tracing subscriber setup
//! - [`tools`]: the functions offered to the agent

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod agent;
pub mod azure;
pub mod config;
pub mod http;
pub mod secrets;
pub mod server;
pub mod services;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod ui;

use std::sync::Arc;

use agent::InvocationLoop;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Runs chat turns and owns the per-user thread registry.
    pub invocation: Arc<InvocationLoop>,
}

impl AppState {
    pub fn new(invocation: InvocationLoop) -> Self {
        Self {
            invocation: Arc::new(invocation),
        }
    }
}
