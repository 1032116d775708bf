//! [`Agent`]: the container that owns modules, lifecycle state, and the
//! per-signal-type map of [`Signaler`]s (spec §3, §4.1–§4.3).

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ModuleFailure, Result};
use crate::ids::ModuleId;
use crate::module::Module;
use crate::registry::{metadata_for, ModuleDescriptor, RequiredByGraph};
use crate::service::{ResolvedDependency, ServiceProvider};
use crate::signal::{BoxStream, ErasedSignaler, ProcessorBody, Signaler, SubscriptionHandle};
use crate::state::AgentState;
use crate::supervisor::{self, RunningModuleExceptionPolicy};

struct AgentInner {
    modules: Vec<Arc<dyn Module>>,
    signalers: HashMap<TypeId, Arc<dyn ErasedSignaler>>,
    required_by: RequiredByGraph,
}

/// Container owning a set of modules, their signaler map, and lifecycle
/// state (spec §3). Always used behind an `Arc` — modules hold only a weak
/// back-reference, and the run supervisor, signal dispatch, and the public
/// API all assume shared ownership.
pub struct Agent {
    name: String,
    description: String,
    service_provider: Option<Arc<dyn ServiceProvider>>,
    state: crate::state::StateCell,
    inner: Mutex<AgentInner>,
    // Reentrant because resolving a `DependencyKind::Module` dependency can
    // recursively call back into `add`/`get_or_add` on the same thread
    // (spec §4.2 step 4(c), "else recursively insert one") while the
    // outermost `add` is still holding this gate.
    add_remove_lock: ReentrantMutex<()>,
    membership_notify: Notify,
    run_state: Mutex<Option<CancellationToken>>,
}

impl Agent {
    /// Builds a fresh, unnamed agent with no service provider. A missing
    /// provider behaves as one that always returns absent (spec §6).
    pub fn new() -> Arc<Self> {
        Self::with_service_provider(None)
    }

    pub fn with_service_provider(service_provider: Option<Arc<dyn ServiceProvider>>) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            description: String::new(),
            service_provider,
            state: crate::state::StateCell::new(AgentState::Uninitialized),
            inner: Mutex::new(AgentInner {
                modules: Vec::new(),
                signalers: HashMap::new(),
                required_by: RequiredByGraph::new(),
            }),
            add_remove_lock: ReentrantMutex::new(()),
            membership_notify: Notify::new(),
            run_state: Mutex::new(None),
        })
    }

    pub fn named(
        name: impl Into<String>,
        description: impl Into<String>,
        service_provider: Option<Arc<dyn ServiceProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            service_provider,
            state: crate::state::StateCell::new(AgentState::Uninitialized),
            inner: Mutex::new(AgentInner {
                modules: Vec::new(),
                signalers: HashMap::new(),
                required_by: RequiredByGraph::new(),
            }),
            add_remove_lock: ReentrantMutex::new(()),
            membership_notify: Notify::new(),
            run_state: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    // ----------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    /// `state_observable`: a new subscriber immediately observes the
    /// current state (spec §9 "Observable state stream").
    pub fn state_observable(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Resolves once the agent reaches `Initialized` (or immediately if it
    /// already has). Mirrors `initialization_completion` in spec §6.
    pub async fn initialization_completion(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow() == AgentState::Initialized {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs every module's `initialize()` concurrently, aggregating
    /// failures (spec §4.8: "initialization failure of one module ->
    /// aggregate continues, agent still becomes Initialized"). Idempotent
    /// once `Initializing` or `Initialized`; an error in `Disposing` or
    /// `Disposed` (spec §4.1 permission matrix).
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            AgentState::Uninitialized => {}
            AgentState::Initializing | AgentState::Initialized => return Ok(()),
            other => return Err(AgentError::invalid_state("initialize", other)),
        }
        self.state.set(AgentState::Initializing);
        tracing::info!(agent = %self.name, "agent initializing");

        let modules = { self.inner.lock().modules.clone() };
        let results = futures::future::join_all(modules.iter().map(|m| {
            let m = m.clone();
            async move { (m.handle().type_name(), m.initialize().await) }
        }))
        .await;

        let mut failures = Vec::new();
        for (type_name, result) in results {
            if let Err(e) = result {
                tracing::error!(module = type_name, error = %e, "module failed to initialize");
                failures.push(ModuleFailure {
                    module_type: type_name,
                    message: e.to_string(),
                });
            }
        }

        self.state.set(AgentState::Initialized);
        tracing::info!(agent = %self.name, "agent initialized");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::ModuleInitFailed { failures })
        }
    }

    /// Blocking counterpart of [`Agent::initialize`]; requires an active
    /// Tokio runtime context (spec §5: blocking variants drain work on the
    /// caller's thread).
    pub fn initialize_sync(self: &Arc<Self>) -> Result<()> {
        tokio::runtime::Handle::current().block_on(self.initialize())
    }

    /// Tears the agent down: stops any active run supervisor, disposes
    /// every module in reverse insertion order (best-effort — a veto is
    /// logged and ignored since a whole-agent teardown cannot be refused),
    /// and transitions to `Disposed`. Idempotent once `Disposed`/`Disposing`;
    /// an error while `Initializing` (spec §4.1).
    pub async fn dispose(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            AgentState::Disposed | AgentState::Disposing => return Ok(()),
            AgentState::Initializing => return Err(AgentError::invalid_state("dispose", AgentState::Initializing)),
            _ => {}
        }
        self.state.set(AgentState::Disposing);
        tracing::info!(agent = %self.name, "agent disposing");

        self.stop();

        let modules = { self.inner.lock().modules.clone() };
        let mut failures = Vec::new();
        for module in modules.iter().rev() {
            match module.dispose() {
                Ok(()) => {}
                Err(AgentError::InvalidOperation { reason }) => {
                    tracing::warn!(
                        module = module.handle().type_name(),
                        reason,
                        "module vetoed disposal during agent teardown; veto ignored"
                    );
                }
                Err(other) => failures.push(ModuleFailure {
                    module_type: module.handle().type_name(),
                    message: other.to_string(),
                }),
            }
            module.handle().clear_agent();
        }

        {
            let mut inner = self.inner.lock();
            inner.modules.clear();
            inner.signalers.clear();
            inner.required_by = RequiredByGraph::new();
        }

        self.state.set(AgentState::Disposed);
        tracing::info!(agent = %self.name, "agent disposed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::ModuleDisposeFailed { failures })
        }
    }

    // ----------------------------------------------------------------
    // Module insertion (spec §4.2)
    // ----------------------------------------------------------------

    /// Adds a module of type `T`, resolving its dependencies through the
    /// static registry (spec §9). Equivalent to `add_configured` with a
    /// no-op configure callback.
    pub fn add<T: ModuleDescriptor + 'static>(self: &Arc<Self>) -> Result<Arc<T>> {
        self.add_configured::<T>(|_| {})
    }

    pub fn add_configured<T: ModuleDescriptor + 'static>(
        self: &Arc<Self>,
        configure: impl FnOnce(&T),
    ) -> Result<Arc<T>> {
        let _guard = self.add_remove_lock.lock();
        self.insert::<T>(configure)
    }

    /// Bypasses the registry entirely: the caller builds the module by
    /// hand. Used for types that don't implement `ModuleDescriptor`, or
    /// whose construction needs values the registry can't express.
    pub fn add_with_factory<T: Module + 'static>(
        self: &Arc<Self>,
        factory: impl FnOnce(&Arc<Agent>) -> T,
    ) -> Result<Arc<T>> {
        let _guard = self.add_remove_lock.lock();

        let state = self.state.get();
        if state.is_terminal() || state == AgentState::Disposing {
            return Err(AgentError::invalid_state("add", state));
        }

        let module = Arc::new(factory(self));
        {
            let mut inner = self.inner.lock();
            inner.modules.push(module.clone() as Arc<dyn Module>);
        }
        module.handle().assign_agent(self);
        self.after_insert(&(module.clone() as Arc<dyn Module>));
        Ok(module)
    }

    /// Returns the existing module of type `T` if present, otherwise
    /// inserts one (spec §6 `get_or_add`).
    pub fn get_or_add<T: ModuleDescriptor + 'static>(self: &Arc<Self>) -> Result<Arc<T>> {
        if let Some(existing) = self.get::<T>() {
            return Ok(existing);
        }
        self.add::<T>()
    }

    pub fn get_or_add_configured<T: ModuleDescriptor + 'static>(
        self: &Arc<Self>,
        configure: impl FnOnce(&T),
    ) -> Result<Arc<T>> {
        if let Some(existing) = self.get::<T>() {
            configure(&existing);
            return Ok(existing);
        }
        self.add_configured::<T>(configure)
    }

    fn insert<T: ModuleDescriptor + 'static>(self: &Arc<Self>, configure: impl FnOnce(&T)) -> Result<Arc<T>> {
        // step 1
        let state = self.state.get();
        if state.is_terminal() || state == AgentState::Disposing {
            return Err(AgentError::invalid_state("add", state));
        }

        let metadata = metadata_for::<T>();

        // step 2: singleton short-circuit
        if metadata.is_singleton {
            if let Some(existing) = self.get::<T>() {
                configure(&existing);
                return Ok(existing);
            }
        }

        // step 3: snapshot
        let snapshot_len = { self.inner.lock().modules.len() };

        // step 4: resolve dependencies and construct
        let declaring_type_id = TypeId::of::<T>();
        let built = (|| -> Result<T> {
            let mut deps = Vec::with_capacity(metadata.dependencies.len());
            for kind in metadata.dependencies {
                deps.push(self.resolve_dependency(kind, metadata.type_name, declaring_type_id)?);
            }
            let mut module = T::construct(deps);
            for rm in metadata.required_members {
                let dep_module = self.resolve_required_member(rm, metadata.type_name)?;
                {
                    let mut inner = self.inner.lock();
                    inner.required_by.add_edge(dep_module.handle().type_id(), declaring_type_id);
                }
                (rm.setter)(&mut module as &mut dyn Any, dep_module);
            }
            Ok(module)
        })();

        let module = match built {
            Ok(m) => m,
            Err(e) => {
                self.rollback_to(snapshot_len);
                return Err(AgentError::ModuleInsertFailed {
                    module_type: metadata.type_name,
                    source: Box::new(e),
                });
            }
        };

        let module = Arc::new(module);

        // step 5: append + assign back-reference
        {
            let mut inner = self.inner.lock();
            inner.modules.push(module.clone() as Arc<dyn Module>);
        }
        module.handle().assign_agent(self);

        // step 7: configure
        configure(&module);

        // step 8: schedule initialize + notify supervisor if agent is live
        self.after_insert(&(module.clone() as Arc<dyn Module>));

        Ok(module)
    }

    fn after_insert(self: &Arc<Self>, module: &Arc<dyn Module>) {
        let state = self.state.get();
        if matches!(state, AgentState::Initializing | AgentState::Initialized) {
            let module = module.clone();
            tokio::spawn(async move {
                if let Err(e) = module.initialize().await {
                    tracing::error!(
                        module = module.handle().type_name(),
                        error = %e,
                        "module added after initialize failed to initialize"
                    );
                }
            });
        }
        self.membership_notify.notify_waiters();
    }

    fn rollback_to(&self, snapshot_len: usize) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.modules.split_off(snapshot_len)
        };
        for module in &removed {
            module.handle().clear_agent();
            let mut inner = self.inner.lock();
            inner.required_by.remove_type(module.handle().type_id());
            for signaler in inner.signalers.values() {
                signaler.remove_module(module.handle().id());
            }
        }
    }

    fn resolve_dependency(
        self: &Arc<Self>,
        kind: &crate::registry::DependencyKind,
        declaring_type: &'static str,
        declaring_type_id: TypeId,
    ) -> Result<ResolvedDependency> {
        use crate::registry::DependencyKind;
        match *kind {
            DependencyKind::Service(type_id, type_name) => {
                let resolved = self
                    .service_provider
                    .as_ref()
                    .and_then(|p| p.resolve(type_id));
                resolved.map(ResolvedDependency::Service).ok_or(AgentError::DependencyUnresolved {
                    declaring_type,
                    required_type: type_name,
                })
            }
            DependencyKind::AgentHandle => Ok(ResolvedDependency::Agent(self.clone())),
            DependencyKind::Module { type_id, ensure, .. } => {
                let existing = {
                    let inner = self.inner.lock();
                    inner
                        .modules
                        .iter()
                        .find(|m| m.handle().type_id() == type_id)
                        .cloned()
                };
                let module = match existing {
                    Some(m) => m,
                    None => ensure(self)?,
                };
                {
                    let mut inner = self.inner.lock();
                    inner.required_by.add_edge(module.handle().type_id(), declaring_type_id);
                }
                Ok(ResolvedDependency::Module(module))
            }
            DependencyKind::ModuleAssignableTo { type_name, matches } => {
                let found = self.find_module_assignable(matches);
                match found {
                    Some(module) => {
                        let mut inner = self.inner.lock();
                        inner.required_by.add_edge(module.handle().type_id(), declaring_type_id);
                        drop(inner);
                        Ok(ResolvedDependency::Module(module))
                    }
                    None => Err(AgentError::DependencyUnresolved {
                        declaring_type,
                        required_type: type_name,
                    }),
                }
            }
        }
    }

    fn resolve_required_member(
        self: &Arc<Self>,
        rm: &crate::registry::RequiredMemberDescriptor,
        declaring_type: &'static str,
    ) -> Result<Arc<dyn Module>> {
        let existing = {
            let inner = self.inner.lock();
            inner
                .modules
                .iter()
                .find(|m| m.handle().type_id() == rm.member_type_id)
                .cloned()
        };
        match existing {
            Some(m) => Ok(m),
            None => (rm.ensure)(self).map_err(|_| AgentError::DependencyUnresolved {
                declaring_type,
                required_type: rm.member_type_name,
            }),
        }
    }

    fn find_module_assignable(&self, matches: fn(&dyn Any) -> bool) -> Option<Arc<dyn Module>> {
        let inner = self.inner.lock();
        inner
            .modules
            .iter()
            .find(|m| matches(m.as_any()))
            .cloned()
    }

    // ----------------------------------------------------------------
    // Module removal (spec §4.3)
    // ----------------------------------------------------------------

    /// Removes every module whose concrete type is `T`. Returns `true` iff
    /// at least one module was actually removed (spec §9's resolved Open
    /// Question).
    pub fn remove<T: Module + 'static>(self: &Arc<Self>) -> Result<bool> {
        let targets: Vec<Arc<dyn Module>> = self
            .get_modules::<T>()
            .into_iter()
            .map(|m| m as Arc<dyn Module>)
            .collect();
        if targets.is_empty() {
            return Ok(false);
        }
        self.remove_modules(targets)
    }

    /// Removes a specific batch of module instances. Refuses the whole
    /// batch (returning `Ok(false)` with a logged warning) if any direct
    /// dependent of a batch member is not itself in the batch; vetoes
    /// cascade to every transitive requirer within the batch (spec §4.3,
    /// §8 S5).
    pub fn remove_modules(self: &Arc<Self>, set: Vec<Arc<dyn Module>>) -> Result<bool> {
        let _guard = self.add_remove_lock.lock();

        let state = self.state.get();
        if matches!(state, AgentState::Initializing | AgentState::Disposing) {
            return Err(AgentError::invalid_state("remove", state));
        }
        if state.is_terminal() {
            return Ok(false);
        }
        if set.is_empty() {
            return Ok(false);
        }

        let batch_ids: HashSet<ModuleId> = set.iter().map(|m| m.handle().id()).collect();
        let batch_types: HashSet<TypeId> = set.iter().map(|m| m.handle().type_id()).collect();

        // step 3: refuse if a direct dependent is outside the batch
        {
            let inner = self.inner.lock();
            for module in &set {
                let type_id = module.handle().type_id();
                for dependent_type in inner.required_by.dependents_of(type_id) {
                    let outside_batch = inner.modules.iter().any(|m| {
                        m.handle().type_id() == *dependent_type && !batch_ids.contains(&m.handle().id())
                    });
                    if outside_batch {
                        tracing::warn!(
                            module = module.handle().type_name(),
                            "removal refused: a direct dependent is outside the batch"
                        );
                        return Ok(false);
                    }
                }
            }
        }

        // step 4: topological order, dependents before dependencies
        let ordered = {
            let inner = self.inner.lock();
            topo_order_for_removal(&inner.required_by, &set)
        };

        // step 5: dispose each; record vetoes and other failures
        let mut vetoed_types: HashSet<TypeId> = HashSet::new();
        let mut failures = Vec::new();
        for module in &ordered {
            match module.dispose() {
                Ok(()) => {}
                Err(AgentError::InvalidOperation { reason }) => {
                    tracing::warn!(
                        module = module.handle().type_name(),
                        reason,
                        "module vetoed its own removal"
                    );
                    vetoed_types.insert(module.handle().type_id());
                }
                Err(other) => failures.push(ModuleFailure {
                    module_type: module.handle().type_name(),
                    message: other.to_string(),
                }),
            }
        }

        // veto cascade: every transitive requirer (within the batch) of a
        // vetoed type also stays (spec §8 S5, testable property #7).
        let excluded_types = {
            let inner = self.inner.lock();
            cascade_excluded(&inner.required_by, &batch_types, vetoed_types)
        };

        let removed: Vec<Arc<dyn Module>> = ordered
            .into_iter()
            .filter(|m| !excluded_types.contains(&m.handle().type_id()))
            .collect();

        // step 6: commit removal for everything that survived the veto cascade
        {
            let mut inner = self.inner.lock();
            for module in &removed {
                let id = module.handle().id();
                module.handle().clear_agent();
                inner.modules.retain(|m| m.handle().id() != id);
                inner.required_by.remove_type(module.handle().type_id());
                for signaler in inner.signalers.values() {
                    signaler.remove_module(id);
                }
            }
        }

        // step 7
        self.membership_notify.notify_waiters();

        if !failures.is_empty() {
            return Err(AgentError::ModuleDisposeFailed { failures });
        }

        // step 8
        Ok(!removed.is_empty())
    }

    // ----------------------------------------------------------------
    // Lookup
    // ----------------------------------------------------------------

    pub fn get<T: Module + 'static>(&self) -> Option<Arc<T>> {
        self.get_modules::<T>().into_iter().next()
    }

    pub fn get_or_default<T: Module + 'static>(&self) -> Option<Arc<T>> {
        self.get::<T>()
    }

    pub fn get_modules<T: Module + 'static>(&self) -> Vec<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let inner = self.inner.lock();
        inner
            .modules
            .iter()
            .filter(|m| m.handle().type_id() == type_id)
            .filter_map(|m| m.clone().as_any_arc().downcast::<T>().ok())
            .collect()
    }

    /// A read-only snapshot of the module sequence, in insertion order.
    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.inner.lock().modules.clone()
    }

    // ----------------------------------------------------------------
    // Signaling (spec §4.4–§4.6)
    // ----------------------------------------------------------------

    pub(crate) fn signaler_for<T: Send + Sync + 'static>(self: &Arc<Self>) -> Arc<Signaler<T>> {
        let type_id = TypeId::of::<T>();
        let mut inner = self.inner.lock();
        let erased = inner
            .signalers
            .entry(type_id)
            .or_insert_with(|| Arc::new(Signaler::<T>::new()) as Arc<dyn ErasedSignaler>)
            .clone();
        erased
            .as_any_arc()
            .downcast::<Signaler<T>>()
            .expect("signaler map key matches its value's concrete type")
    }

    /// Dispatches `value` through the `Signaler<T>` chain, producing the
    /// lazy asynchronous sequence of `R` described in spec §4.4.
    pub fn send<T, R>(self: &Arc<Self>, value: T) -> BoxStream<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        self.signaler_for::<T>().dispatch::<R>(value)
    }

    /// Blocking variant: drains the dispatched sequence on the caller's
    /// thread (spec §5 "blocking send variants").
    pub fn send_blocking<T, R>(self: &Arc<Self>, value: T) -> Vec<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        use futures::StreamExt;
        tokio::runtime::Handle::current().block_on(self.send::<T, R>(value).collect())
    }

    /// Subscribes an observer that does not itself belong to any module
    /// (spec §6 `observe<T>()`). The processor has no owning module, so it
    /// is never reordered by a preferred-order update and is removed only
    /// by disposing the returned handle.
    pub fn observe<T, F, Fut>(self: &Arc<Self>, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let signaler = self.signaler_for::<T>();
        let body = ProcessorBody::Observer(Arc::new(move |v: T| {
            Box::pin(f(v)) as BoxFuture<'static, ()>
        }));
        let id = signaler.subscribe_erased(None, body);
        SubscriptionHandle::immediate(signaler, id)
    }

    /// `set_signal_processing_order<T>`: the caller selects an ordered list
    /// of modules from the live agent; the chain reorders so their
    /// processors appear first, in that order (spec §4.4, §6).
    pub fn set_signal_processing_order<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        select: impl FnOnce(&Agent) -> Vec<ModuleId>,
    ) -> Result<()> {
        let state = self.state.get();
        if state.is_terminal() || state == AgentState::Disposing {
            return Err(AgentError::invalid_state("set_signal_processing_order", state));
        }
        let order = select(self);
        self.signaler_for::<T>().set_preferred_order(order);
        Ok(())
    }

    // ----------------------------------------------------------------
    // Run supervisor (spec §4.7)
    // ----------------------------------------------------------------

    pub async fn run(
        self: &Arc<Self>,
        policy: RunningModuleExceptionPolicy,
        cancel: CancellationToken,
    ) -> Result<()> {
        supervisor::run(self.clone(), policy, cancel).await
    }

    /// Cancels the active run supervisor, if any. A no-op if `run` is not
    /// currently active.
    pub fn stop(&self) {
        if let Some(token) = self.run_state.lock().take() {
            token.cancel();
        }
    }

    pub(crate) fn try_begin_run(&self) -> Result<CancellationToken> {
        let state = self.state.get();
        if state != AgentState::Initialized {
            return Err(AgentError::invalid_state("run", state));
        }
        let mut guard = self.run_state.lock();
        if guard.is_some() {
            return Err(AgentError::invalid_state("run", state));
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        Ok(token)
    }

    pub(crate) fn end_run(&self) {
        *self.run_state.lock() = None;
    }

    pub(crate) fn modules_snapshot(&self) -> Vec<Arc<dyn Module>> {
        self.inner.lock().modules.clone()
    }

    pub(crate) async fn wait_membership_change(&self) {
        self.membership_notify.notified().await;
    }
}

/// Orders `set` so that dependents are disposed before their dependencies
/// (spec §4.3 step 4), via Kahn's algorithm over the edges "c must precede
/// d" for every `c` in `required_by.dependents_of(d)` restricted to the
/// batch. Falls back to input order for any type left over by a cycle
/// (which a well-formed dependency graph never produces).
fn topo_order_for_removal(
    required_by: &RequiredByGraph,
    set: &[Arc<dyn Module>],
) -> Vec<Arc<dyn Module>> {
    let types: Vec<TypeId> = set.iter().map(|m| m.handle().type_id()).collect();
    let type_set: HashSet<TypeId> = types.iter().copied().collect();

    let mut in_degree: HashMap<TypeId, usize> = types.iter().map(|t| (*t, 0)).collect();
    let mut successors: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
    for &d in &types {
        for &c in required_by.dependents_of(d) {
            if type_set.contains(&c) {
                successors.entry(c).or_default().push(d);
                *in_degree.get_mut(&d).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<TypeId> = types.iter().copied().filter(|t| in_degree[t] == 0).collect();
    let mut type_order = Vec::with_capacity(types.len());
    while let Some(t) = queue.pop_front() {
        type_order.push(t);
        if let Some(succs) = successors.get(&t) {
            for &s in succs {
                let degree = in_degree.get_mut(&s).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(s);
                }
            }
        }
    }
    for t in &types {
        if !type_order.contains(t) {
            type_order.push(*t);
        }
    }

    let mut remaining = set.to_vec();
    let mut ordered = Vec::with_capacity(set.len());
    for t in type_order {
        let mut i = 0;
        while i < remaining.len() {
            if remaining[i].handle().type_id() == t {
                ordered.push(remaining.remove(i));
            } else {
                i += 1;
            }
        }
    }
    ordered
}

/// Expands `vetoed` to every type within `batch` that transitively requires
/// a vetoed type, via the reverse "required-by" graph (spec §8 S5, testable
/// property #7 "veto isolation").
fn cascade_excluded(
    required_by: &RequiredByGraph,
    batch: &HashSet<TypeId>,
    vetoed: HashSet<TypeId>,
) -> HashSet<TypeId> {
    let mut excluded = vetoed;
    loop {
        let mut added = false;
        let frontier: Vec<TypeId> = excluded.iter().copied().collect();
        for t in frontier {
            for dependent in required_by.dependents_of(t) {
                if batch.contains(dependent) && excluded.insert(*dependent) {
                    added = true;
                }
            }
        }
        if !added {
            break;
        }
    }
    excluded
}
