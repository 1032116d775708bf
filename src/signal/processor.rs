//! The processor variants a [`super::Signaler`] dispatches through.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::ids::ModuleId;

use super::{ErasedContinuation, ErasedItem, ErasedStream};

pub(crate) type ObserverFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ReceiverVoidFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ReceiverReturningFn<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, ErasedItem> + Send + Sync>;
pub(crate) type InterceptorFn<T> =
    Arc<dyn Fn(T, ErasedContinuation<T>) -> ErasedStream + Send + Sync>;

pub(crate) enum ProcessorBody<T> {
    Observer(ObserverFn<T>),
    ReceiverVoid(ReceiverVoidFn<T>),
    ReceiverReturning {
        response_type_name: &'static str,
        call: ReceiverReturningFn<T>,
    },
    Interceptor {
        response_type_name: &'static str,
        call: InterceptorFn<T>,
    },
}

impl<T> Clone for ProcessorBody<T> {
    fn clone(&self) -> Self {
        match self {
            ProcessorBody::Observer(f) => ProcessorBody::Observer(f.clone()),
            ProcessorBody::ReceiverVoid(f) => ProcessorBody::ReceiverVoid(f.clone()),
            ProcessorBody::ReceiverReturning {
                response_type_name,
                call,
            } => ProcessorBody::ReceiverReturning {
                response_type_name,
                call: call.clone(),
            },
            ProcessorBody::Interceptor {
                response_type_name,
                call,
            } => ProcessorBody::Interceptor {
                response_type_name,
                call: call.clone(),
            },
        }
    }
}

/// One element of a [`super::Signaler`]'s chain.
///
/// `owning_module` and `insertion_seq` are ordering metadata only (spec
/// §4.4's ordering invariants); they play no role in dispatch semantics.
pub(crate) struct Processor<T> {
    pub(crate) id: u64,
    pub(crate) owning_module: Option<ModuleId>,
    pub(crate) insertion_seq: u64,
    pub(crate) body: ProcessorBody<T>,
}

impl<T> Clone for Processor<T> {
    fn clone(&self) -> Self {
        Processor {
            id: self.id,
            owning_module: self.owning_module,
            insertion_seq: self.insertion_seq,
            body: self.body.clone(),
        }
    }
}
