//! [`Signaler`]: the per-signal-type ordered processor chain and its
//! dispatch algorithm.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::ids::ModuleId;

use super::context::SignalContext;
use super::processor::{Processor, ProcessorBody};
use super::{BoxStream, ErasedContinuation, ErasedItem, ErasedStream};

/// Type-erased operations every `Signaler<T>` exposes to the [`crate::agent::Agent`],
/// which otherwise only ever stores `Arc<dyn ErasedSignaler>` in its
/// per-type map (it cannot name `T` itself).
pub(crate) trait ErasedSignaler: Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn remove_module(&self, module: ModuleId);
}

/// Per-signal-type dispatcher holding the ordered processor chain.
///
/// The processor array and the preferred-order array are copy-on-write,
/// guarded by independent mutexes held only across the swap — dispatch reads
/// a cloned `Arc` snapshot and never holds a lock across user code (spec
/// §4.4, §5 "Locking discipline").
pub struct Signaler<T: 'static> {
    processors: Mutex<Arc<Vec<Processor<T>>>>,
    preferred_order: Mutex<Arc<Vec<ModuleId>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl<T: 'static> Default for Signaler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signaler<T> {
    pub(crate) fn new() -> Self {
        Self {
            processors: Mutex::new(Arc::new(Vec::new())),
            preferred_order: Mutex::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe_erased(
        self: &Arc<Self>,
        owning_module: Option<ModuleId>,
        body: ProcessorBody<T>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let processor = Processor {
            id,
            owning_module,
            insertion_seq: seq,
            body,
        };

        let mut processors = self.processors.lock();
        let mut updated = (**processors).clone();
        updated.push(processor);
        let preferred = self.preferred_order.lock().clone();
        *processors = Arc::new(reorder(updated, &preferred));
        id
    }

    pub(crate) fn remove(&self, id: u64) {
        let mut processors = self.processors.lock();
        let mut updated = (**processors).clone();
        updated.retain(|p| p.id != id);
        *processors = Arc::new(updated);
    }

    /// `set_signal_processing_order<T>`: recomputes the array so that
    /// processors whose owning module is listed here appear first, in this
    /// order, ahead of everything else (spec §4.4 re-ordering triggers).
    pub(crate) fn set_preferred_order(&self, modules: Vec<ModuleId>) {
        let mut preferred = self.preferred_order.lock();
        *preferred = Arc::new(modules.clone());
        let mut processors = self.processors.lock();
        let updated = (**processors).clone();
        *processors = Arc::new(reorder(updated, &modules));
    }

    /// Dispatches `value`, producing the lazy asynchronous sequence of `R`
    /// described in spec §4.4, including the zero-processor boundary case:
    /// with no processors, the value passes through as its own response
    /// when `R = T`, otherwise the sequence is empty.
    pub fn dispatch<R>(self: &Arc<Self>, value: T) -> BoxStream<R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
    {
        let processors = self.processors.lock().clone();
        if processors.is_empty() {
            if TypeId::of::<R>() == TypeId::of::<T>() {
                let boxed: ErasedItem = Box::new(value);
                let downcast = boxed
                    .downcast::<R>()
                    .expect("TypeId equality checked immediately above");
                return Box::pin(futures::stream::once(futures::future::ready(*downcast)));
            }
            return Box::pin(futures::stream::empty());
        }

        let erased = build_chain(processors, 0, value);
        Box::pin(erased.filter_map(|item: ErasedItem| {
            futures::future::ready(item.downcast::<R>().ok().map(|boxed| *boxed))
        }))
    }
}

impl<T: Send + Sync + 'static> ErasedSignaler for Signaler<T> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn remove_module(&self, module: ModuleId) {
        {
            let mut processors = self.processors.lock();
            let mut updated = (**processors).clone();
            updated.retain(|p| p.owning_module != Some(module));
            let preferred = self.preferred_order.lock().clone();
            *processors = Arc::new(reorder(updated, &preferred));
        }
        let mut preferred = self.preferred_order.lock();
        if preferred.contains(&module) {
            let mut updated = (**preferred).clone();
            updated.retain(|m| *m != module);
            *preferred = Arc::new(updated);
        }
    }
}

/// Rebuilds the processor array so that processors owned by a module in
/// `preferred` come first (in the order `preferred` declares), each group
/// ordered by `insertion_seq`, followed by every other processor, also
/// ordered by `insertion_seq`.
///
/// A pure function of `(owning_module, insertion_seq)` per processor and
/// `preferred` — never of the vec's current order — so that re-setting or
/// clearing the preferred order always lands on the same array regardless
/// of how many times it has been reordered before (spec §8 #3, #4).
fn reorder<T>(mut processors: Vec<Processor<T>>, preferred: &[ModuleId]) -> Vec<Processor<T>> {
    processors.sort_by_key(|p| p.insertion_seq);
    if preferred.is_empty() {
        return processors;
    }
    let mut groups: Vec<Vec<Processor<T>>> = preferred.iter().map(|_| Vec::new()).collect();
    let mut rest = Vec::new();
    for processor in processors {
        let slot = processor
            .owning_module
            .and_then(|owner| preferred.iter().position(|m| *m == owner));
        match slot {
            Some(index) => groups[index].push(processor),
            None => rest.push(processor),
        }
    }
    let mut result = Vec::with_capacity(rest.len() + groups.iter().map(Vec::len).sum::<usize>());
    for group in groups {
        result.extend(group);
    }
    result.extend(rest);
    result
}

fn build_chain<T>(processors: Arc<Vec<Processor<T>>>, index: usize, value: T) -> ErasedStream
where
    T: Clone + Send + 'static,
{
    let Some(processor) = processors.get(index).cloned() else {
        return Box::pin(futures::stream::empty());
    };

    match processor.body {
        ProcessorBody::Observer(push) => {
            let rest_processors = processors.clone();
            Box::pin(async_stream::stream! {
                let fut = push(value.clone());
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    tracing::error!(processor.kind = "observer", "signal observer panicked; chain continues");
                }
                let mut rest = build_chain(rest_processors, index + 1, value);
                while let Some(item) = rest.next().await {
                    yield item;
                }
            })
        }
        ProcessorBody::ReceiverVoid(call) => {
            let rest_processors = processors.clone();
            Box::pin(async_stream::stream! {
                let fut = call(value.clone());
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    tracing::error!(processor.kind = "receiver_void", "signal receiver panicked; chain continues");
                }
                let mut rest = build_chain(rest_processors, index + 1, value);
                while let Some(item) = rest.next().await {
                    yield item;
                }
            })
        }
        ProcessorBody::ReceiverReturning {
            response_type_name,
            call,
            ..
        } => {
            let rest_processors = processors.clone();
            Box::pin(async_stream::stream! {
                let fut = call(value.clone());
                match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(item) => yield item,
                    Err(_) => tracing::error!(
                        processor.kind = "receiver_returning",
                        response_type = response_type_name,
                        "signal receiver panicked; chain continues",
                    ),
                }
                let mut rest = build_chain(rest_processors, index + 1, value);
                while let Some(item) = rest.next().await {
                    yield item;
                }
            })
        }
        ProcessorBody::Interceptor { call, .. } => {
            let rest_processors = processors.clone();
            let continuation: ErasedContinuation<T> = Arc::new(move |v: T| {
                build_chain(rest_processors.clone(), index + 1, v)
            });
            call(value, continuation)
        }
    }
}

/// Constructs the `SignalContext` handed to an interceptor's callback. Kept
/// here (rather than on `SignalContext` itself) since only the dispatch path
/// needs to build one from an erased continuation.
pub(crate) fn make_context<T, R>(value: T, continuation: ErasedContinuation<T>) -> SignalContext<T, R> {
    SignalContext::new(value, continuation)
}

/// A handle to a single subscription, returned by the module façade and by
/// `Agent::observe`. Disposing it removes the processor from the signaler's
/// array.
///
/// Subscriptions made before a module has an agent are buffered (spec §4.5
/// "deferred registration"); the handle returned in that case is a proxy
/// that becomes real once the agent assigns the module and drains its
/// deferred actions. Disposing the proxy before that drain still cancels the
/// subscription the moment it is fulfilled.
#[derive(Clone)]
pub struct SubscriptionHandle {
    real: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
    disposed: Arc<std::sync::atomic::AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn immediate<T: Send + Sync + 'static>(signaler: Arc<Signaler<T>>, id: u64) -> Self {
        let handle = Self {
            real: Arc::new(Mutex::new(None)),
            disposed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        handle.fulfill(move || signaler.remove(id));
        handle
    }

    pub(crate) fn deferred() -> Self {
        Self {
            real: Arc::new(Mutex::new(None)),
            disposed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub(crate) fn fulfill(&self, unsubscribe: impl FnOnce() + Send + 'static) {
        if self.disposed.load(Ordering::SeqCst) {
            unsubscribe();
        } else {
            *self.real.lock() = Some(Box::new(unsubscribe));
        }
    }

    /// Removes this subscription's processor from its signaler.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(unsubscribe) = self.real.lock().take() {
            unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn void_fn<T: Send + 'static>(
        f: impl Fn(T) + Send + Sync + 'static,
    ) -> super::super::processor::ReceiverVoidFn<T> {
        Arc::new(move |v| {
            f(v);
            Box::pin(async {})
        })
    }

    fn returning_fn<T: Send + 'static, R: Send + 'static>(
        f: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> super::super::processor::ReceiverReturningFn<T> {
        Arc::new(move |v| {
            let r = f(v);
            Box::pin(async move { Box::new(r) as ErasedItem })
        })
    }

    #[tokio::test]
    async fn zero_processors_passes_value_through_when_types_match() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let out: Vec<u32> = signaler.dispatch::<u32>(7).collect().await;
        assert_eq!(out, vec![7]);
    }

    #[tokio::test]
    async fn zero_processors_yields_nothing_when_types_differ() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let out: Vec<String> = signaler.dispatch::<String>(7).collect().await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn subscription_order_follows_insertion_without_preferred_order() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = order.clone();
            signaler.subscribe_erased(None, ProcessorBody::ReceiverVoid(void_fn(move |_: u32| {
                order.lock().push(label);
            })));
        }
        let _: Vec<()> = signaler.dispatch::<()>(1).collect().await;
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn preferred_order_takes_precedence_over_insertion() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let module_a = ModuleId::next();
        let module_b = ModuleId::next();

        let order_a = order.clone();
        signaler.subscribe_erased(
            Some(module_a),
            ProcessorBody::ReceiverVoid(void_fn(move |_: u32| order_a.lock().push("a"))),
        );
        let order_b = order.clone();
        signaler.subscribe_erased(
            Some(module_b),
            ProcessorBody::ReceiverVoid(void_fn(move |_: u32| order_b.lock().push("b"))),
        );

        signaler.set_preferred_order(vec![module_b, module_a]);
        let _: Vec<()> = signaler.dispatch::<()>(1).collect().await;
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn clearing_preferred_order_restores_subscription_order() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let module_a = ModuleId::next();
        let module_b = ModuleId::next();
        let module_c = ModuleId::next();

        for (label, owner) in [("a", module_a), ("b", module_b), ("c", module_c)] {
            let order = order.clone();
            signaler.subscribe_erased(
                Some(owner),
                ProcessorBody::ReceiverVoid(void_fn(move |_: u32| order.lock().push(label))),
            );
        }

        signaler.set_preferred_order(vec![module_c, module_a]);
        signaler.set_preferred_order(vec![]);

        let _: Vec<()> = signaler.dispatch::<()>(1).collect().await;
        assert_eq!(
            *order.lock(),
            vec!["a", "b", "c"],
            "clearing the preferred order must deterministically restore subscription order, \
             not whatever order a prior reorder happened to leave the array in"
        );
    }

    #[tokio::test]
    async fn returning_receiver_yields_matching_type_only() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        signaler.subscribe_erased(
            None,
            ProcessorBody::ReceiverReturning {
                response_type_name: "u32",
                call: returning_fn(|v: u32| v * 2),
            },
        );
        let matched: Vec<u32> = signaler.dispatch::<u32>(21).collect().await;
        assert_eq!(matched, vec![42]);

        let mismatched: Vec<String> = signaler.dispatch::<String>(21).collect().await;
        assert!(mismatched.is_empty());
    }

    #[tokio::test]
    async fn panicking_receiver_is_caught_and_chain_continues() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let reached = Arc::new(AtomicUsize::new(0));
        signaler.subscribe_erased(
            None,
            ProcessorBody::ReceiverVoid(void_fn(|_: u32| panic!("boom"))),
        );
        let reached2 = reached.clone();
        signaler.subscribe_erased(
            None,
            ProcessorBody::ReceiverVoid(void_fn(move |_: u32| {
                reached2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let _: Vec<()> = signaler.dispatch::<()>(1).collect().await;
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_processor() {
        let signaler: Arc<Signaler<u32>> = Arc::new(Signaler::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let id = signaler.subscribe_erased(
            None,
            ProcessorBody::ReceiverVoid(void_fn(move |_: u32| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        signaler.remove(id);
        let _: Vec<()> = signaler.dispatch::<()>(1).collect().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
