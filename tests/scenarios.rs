//! End-to-end behavioral scenarios: dispatch ordering, suppression, the
//! removal veto cascade, and the rerun exception policy.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lazy_static::lazy_static;
use tokio_util::sync::CancellationToken;

use agentkit::registry::{DependencyKind, ModuleDescriptor};
use agentkit::service::ResolvedDependency;
use agentkit::signal::{BoxStream, SignalContext};
use agentkit::{Agent, AgentError, Module, ModuleHandle, Result, RunningModuleExceptionPolicy};

#[derive(Clone, Debug, PartialEq)]
struct Ping(u32);

// ---------------------------------------------------------------------
// S1: string reversal — interceptor ahead of a receiver, preferred order
// ---------------------------------------------------------------------

struct Foo {
    handle: ModuleHandle,
}

impl Foo {
    fn new() -> Self {
        let handle = ModuleHandle::new::<Self>();
        handle.intercept_async::<String, i64, _>(|ctx: SignalContext<String, i64>| {
            let reversed: String = ctx.value().chars().rev().collect();
            let mut downstream = ctx.next_with(reversed);
            Box::pin(async_stream::stream! {
                while let Some(x) = downstream.next().await {
                    yield 2 * x;
                }
                yield -1;
            }) as BoxStream<i64>
        });
        Self { handle }
    }
}

#[async_trait]
impl Module for Foo {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct Bar {
    handle: ModuleHandle,
}

impl Bar {
    fn new(seen: Arc<StdMutex<Vec<String>>>) -> Self {
        let handle = ModuleHandle::new::<Self>();
        handle.receive_returning::<String, i64, _>(move |v: String| {
            seen.lock().unwrap().push(v);
            44
        });
        Self { handle }
    }
}

#[async_trait]
impl Module for Bar {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn s1_string_reversal_interceptor_then_receiver() {
    let agent = Agent::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let foo = agent.add_with_factory(|_agent| Foo::new()).unwrap();
    let bar = agent.add_with_factory({
        let seen = seen.clone();
        move |_agent| Bar::new(seen)
    }).unwrap();

    agent
        .set_signal_processing_order::<String>(|_| vec![foo.handle().id(), bar.handle().id()])
        .unwrap();

    agent.initialize().await.unwrap();

    let out: Vec<i64> = agent.send::<String, i64>("!olleH".to_string()).collect().await;
    assert_eq!(out, vec![88, -1]);
    assert_eq!(*seen.lock().unwrap(), vec!["Hello!".to_string()]);
}

// ---------------------------------------------------------------------
// S2: no-op pipeline — identity passthrough only when response type matches
// ---------------------------------------------------------------------

#[tokio::test]
async fn s2_no_op_pipeline_passes_identity_through_on_type_match_only() {
    let agent = Agent::new();
    let value = Ping(7);

    let same: Vec<Ping> = agent.send::<Ping, Ping>(value.clone()).collect().await;
    assert_eq!(same, vec![value.clone()]);

    let other: Vec<i64> = agent.send::<Ping, i64>(value).collect().await;
    assert!(other.is_empty());
}

// ---------------------------------------------------------------------
// S3: ordering follows subscription order when no preferred order is set
// ---------------------------------------------------------------------

#[tokio::test]
async fn s3_observers_fire_in_subscription_order_without_preferred_order() {
    let agent = Agent::new();
    let order = Arc::new(StdMutex::new(Vec::new()));

    for label in ["a", "b", "c"] {
        let order = order.clone();
        agent.observe::<Ping, _, _>(move |_: Ping| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(label);
            }
        });
    }

    let _: Vec<()> = agent.send::<Ping, ()>(Ping(1)).collect().await;
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

// ---------------------------------------------------------------------
// S4: suppression — an interceptor that never calls `next` stops the chain
// ---------------------------------------------------------------------

struct StopModule {
    handle: ModuleHandle,
}

impl StopModule {
    fn new() -> Self {
        let handle = ModuleHandle::new::<Self>();
        handle.intercept_async::<Ping, i64, _>(|_ctx: SignalContext<Ping, i64>| {
            Box::pin(futures::stream::empty()) as BoxStream<i64>
        });
        Self { handle }
    }
}

#[async_trait]
impl Module for StopModule {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct TrailingModule {
    handle: ModuleHandle,
}

impl TrailingModule {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        let handle = ModuleHandle::new::<Self>();
        handle.receive_returning::<Ping, i64, _>(move |_: Ping| {
            calls.fetch_add(1, Ordering::SeqCst);
            0
        });
        Self { handle }
    }
}

#[async_trait]
impl Module for TrailingModule {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn s4_suppressing_interceptor_stops_the_chain() {
    let agent = Agent::new();
    let trailing_calls = Arc::new(AtomicUsize::new(0));

    let stop = agent.add_with_factory(|_agent| StopModule::new()).unwrap();
    let trailing = agent
        .add_with_factory({
            let trailing_calls = trailing_calls.clone();
            move |_agent| TrailingModule::new(trailing_calls)
        })
        .unwrap();

    agent
        .set_signal_processing_order::<Ping>(|_| vec![stop.handle().id(), trailing.handle().id()])
        .unwrap();

    let out: Vec<i64> = agent.send::<Ping, i64>(Ping(9)).collect().await;
    assert!(out.is_empty());
    assert_eq!(trailing_calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------
// S5: veto cascade — A vetoes its own removal, B (which requires A) stays too
// ---------------------------------------------------------------------

struct ModuleA {
    handle: ModuleHandle,
}

impl ModuleA {
    fn new() -> Self {
        Self {
            handle: ModuleHandle::new::<Self>(),
        }
    }
}

#[async_trait]
impl Module for ModuleA {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn dispose(&self) -> Result<()> {
        Err(AgentError::InvalidOperation {
            reason: "module A refuses removal".to_string(),
        })
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl ModuleDescriptor for ModuleA {
    fn construct(_deps: Vec<ResolvedDependency>) -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref MODULE_B_DEPS: [DependencyKind; 1] = [DependencyKind::module::<ModuleA>()];
}

struct ModuleB {
    handle: ModuleHandle,
    _a: Arc<ModuleA>,
}

#[async_trait]
impl Module for ModuleB {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl ModuleDescriptor for ModuleB {
    fn dependencies() -> &'static [DependencyKind] {
        &MODULE_B_DEPS[..]
    }

    fn construct(mut deps: Vec<ResolvedDependency>) -> Self {
        let a = deps.remove(0).into_module::<ModuleA>();
        Self {
            handle: ModuleHandle::new::<Self>(),
            _a: a,
        }
    }
}

#[tokio::test]
async fn s5_veto_cascades_to_dependents_within_the_batch() {
    let agent = Agent::new();

    let b = agent.add::<ModuleB>().unwrap();
    let a = agent
        .get::<ModuleA>()
        .expect("resolving ModuleB's dependency must have inserted ModuleA");

    let removed = agent
        .remove_modules(vec![a.clone() as Arc<dyn Module>, b.clone() as Arc<dyn Module>])
        .unwrap();

    assert!(!removed);
    assert!(agent.get::<ModuleA>().is_some());
    assert!(agent.get::<ModuleB>().is_some());
}

// ---------------------------------------------------------------------
// S6: rerun policy — a module that always fails gets relaunched on a
// backoff; an unrelated long-running module is left alone
// ---------------------------------------------------------------------

struct FailingModule {
    handle: ModuleHandle,
    attempts: Arc<AtomicUsize>,
}

impl FailingModule {
    fn new(attempts: Arc<AtomicUsize>) -> Self {
        Self {
            handle: ModuleHandle::new::<Self>(),
            attempts,
        }
    }
}

#[async_trait]
impl Module for FailingModule {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    async fn run_loop(&self, _cancel: CancellationToken) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::RunPolicyError("boom".to_string()))
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct StableModule {
    handle: ModuleHandle,
    runs: Arc<AtomicUsize>,
}

impl StableModule {
    fn new(runs: Arc<AtomicUsize>) -> Self {
        Self {
            handle: ModuleHandle::new::<Self>(),
            runs,
        }
    }
}

#[async_trait]
impl Module for StableModule {
    fn handle(&self) -> &ModuleHandle {
        &self.handle
    }
    async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test(start_paused = true)]
async fn s6_rerun_policy_restarts_only_the_failing_module() {
    let agent = Agent::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let stable_runs = Arc::new(AtomicUsize::new(0));

    agent
        .add_with_factory({
            let attempts = attempts.clone();
            move |_agent| FailingModule::new(attempts)
        })
        .unwrap();
    agent
        .add_with_factory({
            let stable_runs = stable_runs.clone();
            move |_agent| StableModule::new(stable_runs)
        })
        .unwrap();

    agent.initialize().await.unwrap();

    let run_agent = agent.clone();
    let run_task = tokio::spawn(async move {
        run_agent
            .run(RunningModuleExceptionPolicy::LogAndRerunModule, CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    agent.stop();
    run_task.await.unwrap().expect("run should stop cleanly after cancellation");

    let restarts = attempts.load(Ordering::SeqCst);
    let expected_min = 1_000 / 10 - 1;
    assert!(
        restarts >= expected_min,
        "expected at least {expected_min} restarts in 1s of 10ms-backoff reruns, got {restarts}"
    );
    assert_eq!(stable_runs.load(Ordering::SeqCst), 1, "unrelated long-running module must not be rerun");
}
