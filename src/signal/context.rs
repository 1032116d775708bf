//! [`SignalContext`] — the value and continuation handed to an interceptor.

use std::any::Any;
use std::marker::PhantomData;

use futures::StreamExt;

use super::{BoxStream, ErasedContinuation};

/// Passed to an interceptor. Carries the current signal value and a
/// continuation that invokes the remainder of the chain.
///
/// `context.next()` replays the current value; `context.next_with(v)` feeds
/// a replaced value downstream instead. Neither consumes `self`: spec §4.6
/// permits calling `next` more than once, with the results concatenated by
/// whichever code drives the returned streams together (typically
/// `futures::stream::select` or sequential awaiting inside the interceptor's
/// own generator).
///
/// Items produced by the continuation are cast to `R`; any item whose
/// concrete type does not match `R` is silently dropped, implementing the
/// per-interceptor type filtering described in spec §9's "Dynamic typing of
/// responses" design note.
pub struct SignalContext<T, R> {
    value: T,
    continuation: ErasedContinuation<T>,
    _response: PhantomData<fn() -> R>,
}

impl<T, R> SignalContext<T, R> {
    pub(crate) fn new(value: T, continuation: ErasedContinuation<T>) -> Self {
        Self {
            value,
            continuation,
            _response: PhantomData,
        }
    }

    /// The signal value as received by this interceptor.
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T, R> SignalContext<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Invokes the remainder of the chain with the original value.
    pub fn next(&self) -> BoxStream<R> {
        self.next_with(self.value.clone())
    }

    /// Invokes the remainder of the chain with a replaced value.
    pub fn next_with(&self, replaced: T) -> BoxStream<R> {
        let erased = (self.continuation)(replaced);
        Box::pin(erased.filter_map(|item: Box<dyn Any + Send>| {
            let downcast = item.downcast::<R>().ok().map(|boxed| *boxed);
            futures::future::ready(downcast)
        }))
    }
}
