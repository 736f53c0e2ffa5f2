//! Driving a reconciler from a [`TracingQueue`].
//!
//! [`TracingReconciler`] wraps a host's [`ObjectReconciler`] so each pass
//! fetches the object, starts its trace with [`TracingClient::start_trace`],
//! reconciles under that context and persists the context again with
//! [`TracingClient::end_trace`]. Failures are recorded on the span and the
//! unit is retried through the queue's rate limiter.
use crate::client::TracingClient;
use crate::error::{BoxError, ReconcileError};
use crate::object::TracedObject;
use crate::queue::TracingQueue;
use crate::unit::{ResourceKey, UnitOfWork};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, Context};
use std::future::Future;
use std::time::Duration;

/// What to do with a unit once its pass succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Action {
    /// Nothing further; the key's retry history is reset.
    #[default]
    Done,
    /// Run again after the rate limiter's delay.
    Requeue,
    /// Run again after the given delay, starting a fresh causal chain.
    RequeueAfter(Duration),
}

/// Reads and writes objects for a [`TracingReconciler`].
pub trait ObjectStore<O>: Send + Sync {
    /// Fetch the object at `key`. `Ok(None)` when it does not exist.
    fn fetch(&self, key: &ResourceKey) -> impl Future<Output = Result<Option<O>, BoxError>> + Send;

    /// Persist the trace annotations and conditions `obj` gained during the
    /// pass.
    fn write_back(&self, obj: &O) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Host reconcile logic for objects of type `O`.
pub trait ObjectReconciler<O>: Send + Sync {
    /// Reconcile `obj`. Spans started under `cx` join the pass's trace.
    fn reconcile(
        &self,
        cx: &Context,
        obj: &mut O,
    ) -> impl Future<Output = Result<Action, BoxError>> + Send;
}

/// An [`ObjectReconciler`] run under a trace that continues across passes.
#[derive(Debug)]
pub struct TracingReconciler<T, S, R, P> {
    client: TracingClient<T, P>,
    store: S,
    reconciler: R,
    end_trace: bool,
}

impl<T, S, R, P> TracingReconciler<T, S, R, P>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    P: TextMapPropagator,
{
    /// Reconciler fetching from `store` and tracing with `client`.
    pub fn new(client: TracingClient<T, P>, store: S, reconciler: R) -> Self {
        TracingReconciler {
            client,
            store,
            reconciler,
            end_trace: true,
        }
    }

    /// Leave [`TracingClient::end_trace`] to the reconciler itself.
    pub fn with_end_trace_disabled(mut self) -> Self {
        self.end_trace = false;
        self
    }

    /// The client passes are traced with.
    pub fn client(&self) -> &TracingClient<T, P> {
        &self.client
    }

    /// Run one pass over `unit`. The pass's span is ended before returning.
    ///
    /// An object that no longer exists is not an error.
    pub async fn reconcile<O>(&self, cx: &Context, unit: &UnitOfWork) -> Result<Action, ReconcileError>
    where
        O: TracedObject,
        S: ObjectStore<O>,
        R: ObjectReconciler<O>,
    {
        let mut obj = match self.store.fetch(&unit.key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                let cx = self.client.start_trace(cx, unit, None::<&mut O>);
                cx.span().end();
                return Ok(Action::Done);
            }
            Err(source) => {
                let cx = self.client.start_trace(cx, unit, None::<&mut O>);
                let span = cx.span();
                span.record_error(source.as_ref());
                span.set_status(Status::error(source.to_string()));
                span.end();
                return Err(ReconcileError::Fetch {
                    key: unit.key.clone(),
                    source,
                });
            }
        };

        let cx = self.client.start_trace(cx, unit, Some(&mut obj));
        let result = self.reconciler.reconcile(&cx, &mut obj).await;
        if let Err(err) = &result {
            cx.span().record_error(err.as_ref());
            cx.span().set_status(Status::error(err.to_string()));
        }

        if self.end_trace && self.client.end_trace(&cx, &mut obj) {
            // a failed write back only costs trace continuity
            if let Err(err) = self.store.write_back(&obj).await {
                cx.span().record_error(err.as_ref());
            }
        }
        cx.span().end();

        result.map_err(|source| ReconcileError::Reconcile {
            key: unit.key.clone(),
            source,
        })
    }

    /// Reconcile units from `queue` until it shuts down.
    pub async fn run<O>(&self, queue: &TracingQueue)
    where
        O: TracedObject,
        S: ObjectStore<O>,
        R: ObjectReconciler<O>,
    {
        while let Some(unit) = queue.get().await {
            let outcome = self.reconcile::<O>(&Context::new(), &unit).await;
            settle(queue, &unit, &outcome);
            queue.done(&unit);
        }
    }
}

// queue the follow-up of a finished pass, before the unit is marked done
fn settle(queue: &TracingQueue, unit: &UnitOfWork, outcome: &Result<Action, ReconcileError>) {
    match outcome {
        Ok(Action::Done) => queue.forget(unit),
        Ok(Action::Requeue) => queue.add_rate_limited(unit.clone()),
        Ok(Action::RequeueAfter(delay)) => {
            queue.forget(unit);
            queue.add_after(unit.clone(), *delay);
        }
        Err(err) => {
            otel_debug!(
                name: "TracingReconciler.Retry",
                key = format!("{}", unit.key),
                error = format!("{err}"),
            );
            queue.add_rate_limited(unit.clone());
        }
    }
}
