//! The reconcile-facing entry points.
//!
//! A reconcile pass calls [`TracingClient::start_trace`] with the unit it
//! dequeued and the object it fetched, does its work under the returned
//! context, and calls [`TracingClient::end_trace`] before writing the object
//! back so that the next pass can continue the trace.
//!
//! # Examples
//!
//! ```
//! use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
//! use opentelemetry::Context;
//! use opentelemetry_operator_trace::config::ConfigBuilder;
//! use opentelemetry_operator_trace::object::{Annotations, TracedObject};
//! use opentelemetry_operator_trace::{ResourceKey, TracingClient, UnitOfWork};
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! struct Deployment {
//!     key: ResourceKey,
//!     annotations: Annotations,
//! }
//!
//! impl TracedObject for Deployment {
//!     fn key(&self) -> ResourceKey {
//!         self.key.clone()
//!     }
//!     fn kind(&self) -> &str {
//!         "Deployment"
//!     }
//!     fn annotations(&self) -> &Annotations {
//!         &self.annotations
//!     }
//!     fn annotations_mut(&mut self) -> &mut Annotations {
//!         &mut self.annotations
//!     }
//! }
//!
//! let provider = SdkTracerProvider::builder().build();
//! let client = TracingClient::new(provider.tracer("reconciler"), ConfigBuilder::default().build());
//!
//! let key = ResourceKey::new("default", "web");
//! let mut obj = Deployment { key: key.clone(), annotations: Annotations::new() };
//! let unit = UnitOfWork::new(key);
//!
//! let cx = client.start_trace(&Context::new(), &unit, Some(&mut obj));
//! // ... reconcile ...
//! assert!(client.end_trace(&cx, &mut obj));
//! cx.span().end();
//! ```
use crate::anchor::SpanAnchorResolver;
use crate::carrier;
use crate::codec::TraceContextCodec;
use crate::config::Config;
use crate::object::{TracedObject, SPAN_ID_CONDITION, TRACE_ID_CONDITION};
use crate::unit::{EmbeddedTraceName, LinkedSpans, ResourceKey, UnitOfWork};
use chrono::{DateTime, Utc};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_info, Context};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::borrow::Cow;

/// Starts and ends traces that span disconnected reconcile passes.
///
/// The tracer and propagator are passed in explicitly; nothing is read from
/// the global providers.
#[derive(Debug)]
pub struct TracingClient<T, P = TraceContextPropagator> {
    tracer: T,
    codec: TraceContextCodec<P>,
    config: Config,
}

impl<T> TracingClient<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Client encoding contexts with the W3C trace context propagator.
    pub fn new(tracer: T, config: Config) -> Self {
        TracingClient {
            tracer,
            codec: TraceContextCodec::new(),
            config,
        }
    }
}

impl<T, P> TracingClient<T, P>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    P: TextMapPropagator,
{
    /// Client encoding contexts with `propagator`.
    pub fn with_propagator(tracer: T, config: Config, propagator: P) -> Self {
        TracingClient {
            tracer,
            codec: TraceContextCodec::with_propagator(propagator),
            config,
        }
    }

    /// The resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The codec carriers are read and written with.
    pub fn codec(&self) -> &TraceContextCodec<P> {
        &self.codec
    }

    /// The tracer spans are started with.
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    /// A resolver sharing this client's codec and configuration.
    pub fn resolver(&self) -> SpanAnchorResolver<'_, P> {
        SpanAnchorResolver::new(&self.codec, &self.config)
    }

    /// [`start_trace_at`](Self::start_trace_at) the current time.
    pub fn start_trace<O>(&self, cx: &Context, unit: &UnitOfWork, obj: Option<&mut O>) -> Context
    where
        O: TracedObject + ?Sized,
    {
        self.start_trace_at(cx, unit, obj, Utc::now())
    }

    /// Start the span of a reconcile pass over `obj`, triggered by `unit`.
    ///
    /// The unit's parent pointer is first persisted onto `obj`, after which
    /// the span is anchored the way [`SpanAnchorResolver`] describes, with
    /// the unit's linked spans attached. `None` stands for an object that
    /// could not be fetched; the span then carries an error status.
    pub fn start_trace_at<O>(
        &self,
        cx: &Context,
        unit: &UnitOfWork,
        obj: Option<&mut O>,
        now: DateTime<Utc>,
    ) -> Context
    where
        O: TracedObject + ?Sized,
    {
        let resolver = self.resolver();
        let Some(obj) = obj else {
            let anchor = resolver.resolve_at(cx, None::<&O>, &unit.linked_spans, now);
            let cx = anchor.start(
                &self.tracer,
                format!("StartTrace Unknown Object {}", unit.key.name),
            );
            cx.span()
                .set_status(Status::error(format!("object {} could not be fetched", unit.key)));
            return cx;
        };

        carrier::override_from_parent(obj.annotations_mut(), &self.config, &unit.parent);

        let parent = &unit.parent;
        let name = if !parent.sender_kind.is_empty() && !parent.sender_name.is_empty() {
            format!(
                "StartTrace {}/{} Triggered By Changed Object {}/{}",
                obj.kind(),
                obj.name(),
                parent.sender_kind,
                parent.sender_name
            )
        } else {
            format!("StartTrace {} {}", obj.kind(), obj.name())
        };

        resolver
            .resolve_at(cx, Some(&*obj), &unit.linked_spans, now)
            .start(&self.tracer, name)
    }

    /// Start a child span named `name`, anchored on `obj` when `cx` holds no
    /// live span.
    pub fn start_span<O>(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        obj: Option<&O>,
    ) -> Context
    where
        O: TracedObject + ?Sized,
    {
        self.resolver()
            .resolve(cx, obj, &LinkedSpans::default())
            .start(&self.tracer, name)
    }

    /// [`end_trace_at`](Self::end_trace_at) the current time.
    pub fn end_trace<O>(&self, cx: &Context, obj: &mut O) -> bool
    where
        O: TracedObject + ?Sized,
    {
        self.end_trace_at(cx, obj, Utc::now())
    }

    /// Persist the active span of `cx` onto `obj`, stamped with `now`, and
    /// remove the legacy annotations and the `TraceID` / `SpanID` conditions.
    ///
    /// Returns whether `obj` changed and so needs writing back.
    pub fn end_trace_at<O>(&self, cx: &Context, obj: &mut O, now: DateTime<Utc>) -> bool
    where
        O: TracedObject + ?Sized,
    {
        let span_context = cx.span().span_context().clone();
        let previous = carrier::extract_own(&self.codec, obj.annotations(), &self.config)
            .and_then(|context| context.span_context(&self.codec));

        let mut changed = match self.codec.inject(
            &span_context,
            self.config.tracestate_timestamp_key(),
            now,
        ) {
            Some((trace_parent, trace_state)) => carrier::persist(
                obj.annotations_mut(),
                &self.config,
                &trace_parent,
                &trace_state,
            ),
            None => carrier::prune_legacy(obj.annotations_mut(), &self.config),
        };
        changed |= obj.delete_condition(TRACE_ID_CONDITION);
        changed |= obj.delete_condition(SPAN_ID_CONDITION);

        if let Some(previous) = previous {
            if span_context.is_valid() && previous.trace_id() != span_context.trace_id() {
                otel_info!(
                    name: "TracingClient.TraceIdChanged",
                    object = format!("{}", obj.key()),
                    previous_trace_id = format!("{}", previous.trace_id()),
                    trace_id = format!("{}", span_context.trace_id()),
                );
            }
        }
        changed
    }

    /// Point `unit` at the context persisted on `obj`, with `obj` as the
    /// sender. Returns whether a context was found.
    pub fn embed_context_in_unit<O>(&self, unit: &mut UnitOfWork, obj: &O) -> bool
    where
        O: TracedObject + ?Sized,
    {
        let Some(span_context) = self.own_span_context(obj, Utc::now()) else {
            return false;
        };
        unit.parent.trace_id = span_context.trace_id().to_string();
        unit.parent.span_id = span_context.span_id().to_string();
        unit.parent.sender_name = obj.name();
        unit.parent.sender_kind = obj.kind().to_string();
        true
    }

    /// `key` with the context persisted on `obj` embedded in its name, for
    /// hosts whose queue only carries keys. Decoded by
    /// [`UnitOfWork::from_embedded_key`]. `key` is returned unchanged when
    /// `obj` holds no context.
    pub fn embed_in_key<O>(&self, key: ResourceKey, obj: &O) -> ResourceKey
    where
        O: TracedObject + ?Sized,
    {
        let Some(span_context) = self.own_span_context(obj, Utc::now()) else {
            return key;
        };
        let embedded = EmbeddedTraceName {
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
            object_kind: obj.kind().to_string(),
            object_name: obj.name(),
            key_name: key.name,
        };
        ResourceKey::new(key.namespace, embedded.to_string())
    }

    /// Write the active span of `cx` into the `TraceID` / `SpanID`
    /// conditions of `obj`. Returns whether anything changed.
    pub fn stamp_conditions<O>(&self, cx: &Context, obj: &mut O, now: DateTime<Utc>) -> bool
    where
        O: TracedObject + ?Sized,
    {
        let span = cx.span();
        let span_context = span.span_context();
        if !span_context.is_valid() {
            return false;
        }
        let trace_id = span_context.trace_id().to_string();
        let span_id = span_context.span_id().to_string();
        let mut changed = obj.set_condition_message(TRACE_ID_CONDITION, &trace_id, now);
        changed |= obj.set_condition_message(SPAN_ID_CONDITION, &span_id, now);
        changed
    }

    fn own_span_context<O>(&self, obj: &O, now: DateTime<Utc>) -> Option<SpanContext>
    where
        O: TracedObject + ?Sized,
    {
        let context = carrier::extract_own(&self.codec, obj.annotations(), &self.config)?;
        if context.is_expired(self.config.trace_expiration(), now) {
            return None;
        }
        context.span_context(&self.codec)
    }
}
