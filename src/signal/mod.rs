//! The per-signal-type dispatch pipeline: ordered processors, the
//! [`SignalContext`] interceptors receive, and the [`Signaler`] that holds
//! and walks the processor chain.
//!
//! Signal payloads (`T`) and responses (`R`) are required to be `Clone` so
//! that a single dispatched value can be handed to every processor in the
//! chain, and so an interceptor's continuation can be invoked more than
//! once ("invoking next multiple times is permitted") without resorting to
//! unsafe aliasing.

mod context;
mod processor;
mod signaler;

pub use context::SignalContext;
pub use signaler::{Signaler, SubscriptionHandle};
pub(crate) use signaler::{make_context, ErasedSignaler};

use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

/// A boxed, owned asynchronous sequence — the "lazy asynchronous sequence
/// of `R`" from spec §4.4.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

pub(crate) type ErasedItem = Box<dyn Any + Send>;
pub(crate) type ErasedStream = BoxStream<ErasedItem>;
pub(crate) type ErasedContinuation<T> = Arc<dyn Fn(T) -> ErasedStream + Send + Sync>;

pub(crate) use processor::ProcessorBody;
