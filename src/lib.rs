//! agentkit — an in-process modular agent runtime.
//!
//! A container (the [`Agent`]) composes independently developed [`Module`]s
//! that collaborate solely through a typed, ordered, interceptable signal
//! pipeline. Four parts interlock: lifecycle gates what signaling may do,
//! the dependency graph controls insertion and safe removal, the signaler
//! is the dispatch heart, and the run supervisor keeps long-lived module
//! loops alive under a declared failure policy.

#![deny(unsafe_code)]

mod ids;

pub mod error;
pub mod state;

pub mod registry;
pub mod service;

pub mod signal;

pub mod module;
pub mod agent;
pub mod supervisor;

pub use agent::Agent;
pub use error::{AgentError, ModuleFailure, Result};
pub use ids::ModuleId;
pub use module::{Module, ModuleHandle};
pub use registry::{DependencyKind, ModuleDescriptor, RequiredMemberDescriptor};
pub use service::{ResolvedDependency, ServiceProvider};
pub use signal::{BoxStream, SignalContext, Signaler, SubscriptionHandle};
pub use state::AgentState;
pub use supervisor::RunningModuleExceptionPolicy;
