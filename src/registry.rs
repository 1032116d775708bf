//! Type metadata cache and the reverse "required-by" dependency graph.
//!
//! Replaces the reflection-driven instantiation of a managed-runtime source
//! with a static registry: each module type that wants to be constructible
//! via `Agent::add::<T>()` implements [`ModuleDescriptor`], which supplies an
//! instantiation descriptor `(dependency kinds, required members,
//! constructor fn)` read once per `TypeId` and cached for the life of the
//! process.
//!
//! A `DependencyKind::Module`/`ModuleAssignableTo` entry carries its own
//! monomorphized `ensure` function pointer (built by the `DependencyKind::*`
//! constructors below, at the call site where the dependency's concrete
//! type is still known) rather than a bare `TypeId` — a `TypeId` alone
//! cannot regain the static type needed to call `Agent::add::<T>()`
//! generically, so the pointer is captured at declaration time instead.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::agent::Agent;
use crate::error::Result;
use crate::module::Module;
use crate::service::ResolvedDependency;

/// One constructor parameter a [`ModuleDescriptor`] needs resolved before it
/// can be instantiated (spec §4.2 step 4's priority order, §9's
/// registry design note).
#[derive(Clone, Copy)]
pub enum DependencyKind {
    /// Resolved against the external service provider.
    Service(TypeId, &'static str),
    /// The agent itself.
    AgentHandle,
    /// An existing module of this exact concrete type, inserting one via
    /// `Agent::get_or_add::<M>()` if absent.
    Module {
        type_id: TypeId,
        type_name: &'static str,
        ensure: fn(&Arc<Agent>) -> Result<Arc<dyn Module>>,
    },
    /// An existing module assignable to this abstract/interface type; never
    /// inserted automatically if absent (spec §4.2 step 4(d)).
    ModuleAssignableTo {
        type_name: &'static str,
        matches: fn(&dyn Any) -> bool,
    },
}

impl DependencyKind {
    pub fn service<S: Any + Send + 'static>() -> Self {
        DependencyKind::Service(TypeId::of::<S>(), std::any::type_name::<S>())
    }

    pub const fn agent() -> Self {
        DependencyKind::AgentHandle
    }

    pub fn module<M: ModuleDescriptor + 'static>() -> Self {
        DependencyKind::Module {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            ensure: ensure_module::<M>,
        }
    }

    pub fn module_assignable_to<M: Module + 'static>(matches: fn(&dyn Any) -> bool) -> Self {
        DependencyKind::ModuleAssignableTo {
            type_name: std::any::type_name::<M>(),
            matches,
        }
    }
}

fn ensure_module<M: ModuleDescriptor + 'static>(agent: &Arc<Agent>) -> Result<Arc<dyn Module>> {
    agent.get_or_add::<M>().map(|m| m as Arc<dyn Module>)
}

/// A `RequiredModule`-marked settable member: the agent resolves or inserts
/// a module of `member_type` and invokes `setter` with it (spec §4.2 step
/// 6).
pub struct RequiredMemberDescriptor {
    pub member_type_id: TypeId,
    pub member_type_name: &'static str,
    pub ensure: fn(&Arc<Agent>) -> Result<Arc<dyn Module>>,
    pub setter: fn(&mut dyn Any, Arc<dyn Module>),
}

impl RequiredMemberDescriptor {
    pub fn new<M: ModuleDescriptor + 'static>(setter: fn(&mut dyn Any, Arc<dyn Module>)) -> Self {
        Self {
            member_type_id: TypeId::of::<M>(),
            member_type_name: std::any::type_name::<M>(),
            ensure: ensure_module::<M>,
            setter,
        }
    }
}

/// Implemented by module types that can be instantiated by `Agent::add::<T>()`
/// without an explicit factory closure.
///
/// Corresponds to the spec's "Singleton" and "RequiredModule" declarations
/// plus the constructor-resolution priority order in §4.2 step 4.
pub trait ModuleDescriptor: Module + Sized {
    /// A `Singleton`-marked type: at most one instance of exactly this type
    /// may exist per agent.
    fn is_singleton() -> bool {
        false
    }

    fn dependencies() -> &'static [DependencyKind] {
        &[]
    }

    fn required_members() -> &'static [RequiredMemberDescriptor] {
        &[]
    }

    /// Builds a new instance from its resolved constructor parameters, in
    /// the same order `dependencies()` declared them.
    fn construct(deps: Vec<ResolvedDependency>) -> Self;
}

/// Type-erased, cached metadata for one module type.
#[derive(Clone)]
pub struct TypeMetadata {
    pub type_name: &'static str,
    pub is_singleton: bool,
    pub dependencies: &'static [DependencyKind],
    pub required_members: &'static [RequiredMemberDescriptor],
}

lazy_static! {
    static ref METADATA_CACHE: Mutex<HashMap<TypeId, TypeMetadata>> = Mutex::new(HashMap::new());
}

/// Populates (if absent) and returns the cached metadata for `T`.
///
/// Single-writer under the cache mutex; once published, readers only ever
/// clone the cached entry (cheap: two `&'static` slices and a bool).
pub fn metadata_for<T: ModuleDescriptor + 'static>() -> TypeMetadata {
    let type_id = TypeId::of::<T>();
    let mut cache = METADATA_CACHE.lock();
    cache
        .entry(type_id)
        .or_insert_with(|| TypeMetadata {
            type_name: std::any::type_name::<T>(),
            is_singleton: T::is_singleton(),
            dependencies: T::dependencies(),
            required_members: T::required_members(),
        })
        .clone()
}

/// The reverse "required-by" graph: for each module type, the set of module
/// types that declared it as a dependency or required member. Used to
/// refuse a removal batch whose direct dependents are not themselves in the
/// batch (spec §4.3 step 3) and to drive the topological sort of step 4.
#[derive(Default)]
pub(crate) struct RequiredByGraph {
    edges: HashMap<TypeId, Vec<TypeId>>,
}

impl RequiredByGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` requires `dependency`.
    pub(crate) fn add_edge(&mut self, dependency: TypeId, dependent: TypeId) {
        let dependents = self.edges.entry(dependency).or_default();
        if !dependents.contains(&dependent) {
            dependents.push(dependent);
        }
    }

    pub(crate) fn dependents_of(&self, dependency: TypeId) -> &[TypeId] {
        self.edges.get(&dependency).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes every edge that mentions `type_id`, on either side, once a
    /// module of that type has left the agent.
    pub(crate) fn remove_type(&mut self, type_id: TypeId) {
        self.edges.remove(&type_id);
        for dependents in self.edges.values_mut() {
            dependents.retain(|d| *d != type_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_by_graph_tracks_dependents() {
        let mut graph = RequiredByGraph::new();
        let a = TypeId::of::<u8>();
        let b = TypeId::of::<u16>();
        let c = TypeId::of::<u32>();
        graph.add_edge(a, b); // b requires a
        graph.add_edge(a, c); // c requires a
        let mut dependents = graph.dependents_of(a).to_vec();
        dependents.sort_by_key(|t| format!("{t:?}"));
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains(&b));
        assert!(dependents.contains(&c));
    }

    #[test]
    fn remove_type_clears_both_sides() {
        let mut graph = RequiredByGraph::new();
        let a = TypeId::of::<u8>();
        let b = TypeId::of::<u16>();
        graph.add_edge(a, b);
        graph.remove_type(a);
        assert!(graph.dependents_of(a).is_empty());
    }
}
