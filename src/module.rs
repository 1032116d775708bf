//! [`Module`]: the unit of behavior plugged into an [`crate::agent::Agent`].
//!
//! A module's lifecycle hooks and signal façade are split from its identity
//! bookkeeping: every module embeds a [`ModuleHandle`], which carries the
//! weak back-reference to its owning agent, the deferred-subscription
//! buffer used for constructor-time subscriptions (spec §4.5, §9), and the
//! module's process-wide identity (`ModuleId`) used for processor ownership
//! and preferred-order matching (spec §3, §4.4).

use std::any::{Any, TypeId};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::Result;
pub use crate::ids::ModuleId;
use crate::signal::{
    make_context, BoxStream, ErasedContinuation, ErasedItem, ProcessorBody, SignalContext,
    SubscriptionHandle,
};

type DeferredAction = Box<dyn FnOnce(&Arc<Agent>) + Send>;

/// Identity and agent-wiring state embedded in every [`Module`] impl.
///
/// Constructed once per module instance (typically in the module's own
/// constructor, before the agent reference is known) and never moved
/// afterwards; [`Module::handle`] hands back a stable reference to it.
pub struct ModuleHandle {
    id: ModuleId,
    type_id: TypeId,
    type_name: &'static str,
    agent: Mutex<Option<Weak<Agent>>>,
    deferred: Mutex<Vec<DeferredAction>>,
}

impl ModuleHandle {
    /// Builds a fresh handle for a module of concrete type `T`. Call this
    /// from `T::new(..)` before the module has an agent.
    pub fn new<T: 'static>() -> Self {
        Self {
            id: ModuleId::next(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            agent: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The owning agent, if this module is currently inserted anywhere.
    /// Upgrading a cleared or dropped weak reference yields `None`: callers
    /// must check presence before use rather than assume liveness (spec §3
    /// ownership note).
    pub fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Called by `Agent::add` once the module has been appended to the
    /// module sequence. Drains every buffered deferred subscription in
    /// order (spec §4.5 "deferred registration").
    pub(crate) fn assign_agent(&self, agent: &Arc<Agent>) {
        *self.agent.lock() = Some(Arc::downgrade(agent));
        let deferred: Vec<DeferredAction> = std::mem::take(&mut *self.deferred.lock());
        for action in deferred {
            action(agent);
        }
    }

    /// Called by `Agent::remove` once the module leaves the sequence.
    pub(crate) fn clear_agent(&self) {
        *self.agent.lock() = None;
    }

    /// Subscribes `body` on the `Signaler<T>` for this module's owning
    /// agent, buffering the subscription if no agent is assigned yet. The
    /// returned handle is real immediately in the first case and a proxy
    /// that becomes real on drain in the second (spec §4.5, §9).
    fn subscribe_body<T: Send + Sync + 'static>(&self, body: ProcessorBody<T>) -> SubscriptionHandle {
        let owner = self.id;
        if let Some(agent) = self.agent() {
            let signaler = agent.signaler_for::<T>();
            let id = signaler.subscribe_erased(Some(owner), body);
            SubscriptionHandle::immediate(signaler, id)
        } else {
            let handle = SubscriptionHandle::deferred();
            let proxy = handle.clone();
            self.deferred.lock().push(Box::new(move |agent: &Arc<Agent>| {
                let signaler = agent.signaler_for::<T>();
                let id = signaler.subscribe_erased(Some(owner), body);
                proxy.fulfill(move || signaler.remove(id));
            }));
            handle
        }
    }

    /// Subscribes a fire-and-forget synchronous receiver.
    pub fn receive<T, F>(&self, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_body::<T>(ProcessorBody::ReceiverVoid(Arc::new(move |v: T| {
            f(v);
            Box::pin(async {}) as BoxFuture<'static, ()>
        })))
    }

    /// Subscribes a fire-and-forget asynchronous receiver.
    pub fn receive_async<T, F, Fut>(&self, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_body::<T>(ProcessorBody::ReceiverVoid(Arc::new(move |v: T| {
            Box::pin(f(v)) as BoxFuture<'static, ()>
        })))
    }

    /// Subscribes a synchronous receiver that yields a response of type `R`.
    pub fn receive_returning<T, R, F>(&self, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        self.subscribe_body::<T>(ProcessorBody::ReceiverReturning {
            response_type_name: std::any::type_name::<R>(),
            call: Arc::new(move |v: T| {
                let r = f(v);
                Box::pin(async move { Box::new(r) as ErasedItem })
            }),
        })
    }

    /// Subscribes an asynchronous receiver that yields a response of type `R`.
    pub fn receive_returning_async<T, R, F, Fut>(&self, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.subscribe_body::<T>(ProcessorBody::ReceiverReturning {
            response_type_name: std::any::type_name::<R>(),
            call: Arc::new(move |v: T| {
                let fut = f(v);
                Box::pin(async move { Box::new(fut.await) as ErasedItem })
            }),
        })
    }

    /// Subscribes an interceptor: receives a [`SignalContext`] and controls
    /// whether and with what value the chain continues (spec §4.4, §4.6).
    pub fn intercept_async<T, R, F>(&self, f: F) -> SubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(SignalContext<T, R>) -> BoxStream<R> + Send + Sync + 'static,
    {
        self.subscribe_body::<T>(ProcessorBody::Interceptor {
            response_type_name: std::any::type_name::<R>(),
            call: Arc::new(move |v: T, continuation: ErasedContinuation<T>| {
                let ctx: SignalContext<T, R> = make_context(v, continuation);
                let stream = f(ctx);
                Box::pin(stream.map(|r| Box::new(r) as ErasedItem)) as Pin<Box<dyn futures::Stream<Item = ErasedItem> + Send>>
            }),
        })
    }

    /// Dispatches `value` on this module's owning agent, if any. Used by the
    /// module façade's `send` forwarder; panics are not involved — an absent
    /// agent simply yields an empty stream.
    pub fn send<T, R>(&self, value: T) -> BoxStream<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        match self.agent() {
            Some(agent) => agent.send(value),
            None => Box::pin(futures::stream::empty()),
        }
    }
}

/// Implemented by every module plugged into an [`Agent`].
///
/// Object-safe: the agent stores modules as `Arc<dyn Module>`. `as_any`
/// supports the downcasting `Agent::get::<T>()` needs; concrete modules
/// implement it with a one-line `self` cast (no blanket impl is possible
/// for a trait object's default method without losing object safety).
#[async_trait]
pub trait Module: Any + Send + Sync {
    /// The module's identity/agent-wiring state. See [`ModuleHandle`].
    fn handle(&self) -> &ModuleHandle;

    /// Called once after insertion while the agent is `Initializing` or
    /// `Initialized` (spec §4.2 step 8). The default does nothing.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// The module's long-lived work, run by the supervisor (spec §4.7). The
    /// default returns immediately, so a module with no background work
    /// completes its supervised task instantly rather than hanging it open.
    async fn run_loop(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Called during a removal batch (spec §4.3 step 5). Returning
    /// `Err(AgentError::InvalidOperation { .. })` is the veto mechanism; any
    /// other error is aggregated. The default allows removal unconditionally.
    fn dispose(&self) -> Result<()> {
        Ok(())
    }

    /// Enables `Agent::get::<T>()`'s downcast. Concrete modules implement
    /// this as `fn as_any(&self) -> &dyn Any { self }`.
    fn as_any(&self) -> &dyn Any;

    /// Owned-handle counterpart of `as_any`, used where `Agent::get::<T>()`
    /// needs to hand back an `Arc<T>` rather than a borrow. Concrete modules
    /// implement this as `fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> { self }`.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
