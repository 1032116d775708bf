//! Structured error types for the agent runtime.
//!
//! Mirrors the taxonomy callers need to distinguish: state violations,
//! missing modules, unresolved dependencies, and the two aggregate error
//! kinds raised at the end of `initialize`/`remove` batches.

use thiserror::Error;

use crate::state::AgentState;

pub type Result<T> = std::result::Result<T, AgentError>;

/// One module's failure inside an aggregate (`ModuleInitFailed`,
/// `ModuleDisposeFailed`).
#[derive(Debug, Clone)]
pub struct ModuleFailure {
    pub module_type: &'static str,
    pub message: String,
}

impl std::fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.module_type, self.message)
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    // =========================================================================
    // Lifecycle errors
    // =========================================================================
    /// Operation not permitted in the agent's current lifecycle state.
    #[error("invalid state: {operation} is not permitted while the agent is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },

    // =========================================================================
    // Module graph errors
    // =========================================================================
    /// A requested module is not present on the agent.
    #[error("module not found: {type_name}")]
    NotFound { type_name: &'static str },

    /// Raised by a module's `dispose()` to veto its own removal (spec §4.3
    /// step 5, §7). Caught by `Agent::remove` and never surfaced to the
    /// caller directly — it only ever shows up as the batch returning
    /// `Ok(false)` plus a `tracing::warn!`.
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// A constructor parameter of a module under construction could not be
    /// resolved against the service provider, the agent, or any existing or
    /// insertable module.
    #[error("dependency unresolved: {declaring_type} requires {required_type}")]
    DependencyUnresolved {
        declaring_type: &'static str,
        required_type: &'static str,
    },

    /// `add` failed after step 3 of insertion and the module sequence has
    /// been rolled back to its pre-call snapshot.
    #[error("failed to insert module {module_type}: rolled back ({source})")]
    ModuleInsertFailed {
        module_type: &'static str,
        #[source]
        source: Box<AgentError>,
    },

    /// One wrapped error per module that failed `initialize`. The agent
    /// still transitions to `Initialized`; this is raised after the fact.
    #[error("{} module(s) failed to initialize: {}", failures.len(), summarize(failures))]
    ModuleInitFailed { failures: Vec<ModuleFailure> },

    /// One wrapped error per module that failed `dispose` during a removal
    /// batch, excluding vetoes (an `InvalidOperation`-equivalent veto is not
    /// an error — see `Agent::remove`'s `Ok(false)` return).
    #[error("{} module(s) failed to dispose: {}", failures.len(), summarize(failures))]
    ModuleDisposeFailed { failures: Vec<ModuleFailure> },

    // =========================================================================
    // Run supervisor errors
    // =========================================================================
    /// Propagated from a user-supplied cancellation token through `run`.
    #[error("run cancelled")]
    Cancelled,

    /// Propagated by the `RethrowAndStopAll` exception policy.
    #[error("run policy propagated a module error: {0}")]
    RunPolicyError(String),
}

fn summarize(failures: &[ModuleFailure]) -> String {
    failures
        .iter()
        .map(ModuleFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AgentError {
    pub(crate) fn invalid_state(operation: &'static str, state: AgentState) -> Self {
        AgentError::InvalidState { operation, state }
    }
}
