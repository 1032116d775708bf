//! The external service-provider capability and the resolved-dependency
//! values fed to [`crate::registry::ModuleDescriptor::construct`].
//!
//! Per spec §6, the provider is "an opaque capability with a single method
//! `resolve(type) -> value?`"; this crate does not implement a DI container
//! (out of scope, §1) — only the trait the core depends on. A host
//! application wires its own container behind this trait, or the agent runs
//! with `None` and every `Service` dependency fails to resolve.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::module::Module;

/// External service lookup, keyed by `TypeId`. A missing provider behaves
/// as one that always returns `None` (spec §6).
pub trait ServiceProvider: Send + Sync {
    fn resolve(&self, type_id: TypeId) -> Option<Box<dyn Any + Send>>;
}

/// One resolved constructor parameter, handed to
/// [`crate::registry::ModuleDescriptor::construct`] in declaration order.
pub enum ResolvedDependency {
    Service(Box<dyn Any + Send>),
    Agent(Arc<crate::agent::Agent>),
    Module(Arc<dyn Module>),
}

impl ResolvedDependency {
    /// Downcasts a `Service` dependency, panicking if the declared
    /// `DependencyKind::service::<S>()` type doesn't match what the
    /// provider actually returned — a provider/declaration mismatch is a
    /// programming error in the host application, not a runtime condition
    /// this crate can recover from.
    pub fn into_service<S: Any + Send + 'static>(self) -> S {
        match self {
            ResolvedDependency::Service(boxed) => *boxed
                .downcast::<S>()
                .unwrap_or_else(|_| panic!("service provider returned a value of the wrong type for {}", std::any::type_name::<S>())),
            _ => panic!("expected a Service dependency"),
        }
    }

    pub fn into_agent(self) -> Arc<crate::agent::Agent> {
        match self {
            ResolvedDependency::Agent(agent) => agent,
            _ => panic!("expected an AgentHandle dependency"),
        }
    }

    /// Downcasts a `Module`/`ModuleAssignableTo` dependency to its concrete
    /// type `M`.
    pub fn into_module<M: Module + 'static>(self) -> Arc<M> {
        match self {
            ResolvedDependency::Module(module) => module
                .as_any_arc()
                .downcast::<M>()
                .unwrap_or_else(|_| panic!("module dependency resolved to the wrong concrete type")),
            _ => panic!("expected a Module dependency"),
        }
    }

    /// The dependency as a type-erased module, for `ModuleAssignableTo`
    /// parameters a module author wants to keep as a trait object.
    pub fn into_dyn_module(self) -> Arc<dyn Module> {
        match self {
            ResolvedDependency::Module(module) => module,
            _ => panic!("expected a Module dependency"),
        }
    }
}
