//! Choosing the context a new span starts from.
//!
//! A reconcile pass has no caller to inherit a context from, so the context
//! is recovered from the resource it works on. [`SpanAnchorResolver`] tries,
//! in order:
//!
//! 1. the live span of the passed [`Context`], verbatim;
//! 2. the context persisted in the resource's annotations, used as parent or
//!    link depending on which annotation it was read from;
//! 3. the `TraceID` / `SpanID` conditions of the resource, as parent;
//!
//! and then adds the linked spans recorded on the unit of work. Persisted
//! contexts older than [`Config::trace_expiration`] are skipped.
use crate::carrier;
use crate::codec::{is_expired, TraceContextCodec};
use crate::config::{Config, Relationship};
use crate::object::{TracedObject, SPAN_ID_CONDITION, TRACE_ID_CONDITION};
use crate::unit::{LinkedSpanRef, LinkedSpans};
use chrono::{DateTime, Utc};
use opentelemetry::otel_debug;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{Link, SpanBuilder, SpanContext, TraceContextExt, Tracer};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::borrow::Cow;

/// Where a [`SpanAnchor`]'s parent came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnchorSource {
    /// The caller's active span.
    Live,
    /// The resource's annotations, attached with the given relationship.
    Carrier(Relationship),
    /// The resource's `TraceID` / `SpanID` conditions.
    Conditions,
    /// Nothing was recovered.
    Unanchored,
}

/// The parent and links a new span starts with.
#[derive(Clone, Debug)]
pub struct SpanAnchor {
    parent: Context,
    links: Vec<Link>,
    source: AnchorSource,
}

impl SpanAnchor {
    /// Context to start the span in.
    pub fn parent(&self) -> &Context {
        &self.parent
    }

    /// Links to attach to the span.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Where the parent came from.
    pub fn source(&self) -> AnchorSource {
        self.source
    }

    /// Whether a span started from this anchor begins a new trace.
    pub fn is_root(&self) -> bool {
        !self.parent.span().span_context().is_valid()
    }

    /// Start a span named `name` under this anchor and return the context
    /// holding it.
    pub fn start<T>(self, tracer: &T, name: impl Into<Cow<'static, str>>) -> Context
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let builder = SpanBuilder::from_name(name).with_links(self.links);
        let span = tracer.build_with_context(builder, &self.parent);
        self.parent.with_span(span)
    }
}

/// Resolves a [`SpanAnchor`] from a live context and a resource snapshot.
///
/// Holds no state of its own; every call depends only on its arguments.
#[derive(Debug)]
pub struct SpanAnchorResolver<'a, P = TraceContextPropagator> {
    codec: &'a TraceContextCodec<P>,
    config: &'a Config,
}

impl<'a, P: TextMapPropagator> SpanAnchorResolver<'a, P> {
    /// Resolver decoding with `codec` and keyed by `config`.
    pub fn new(codec: &'a TraceContextCodec<P>, config: &'a Config) -> Self {
        SpanAnchorResolver { codec, config }
    }

    /// [`resolve_at`](Self::resolve_at) the current time.
    pub fn resolve<O>(&self, cx: &Context, obj: Option<&O>, linked: &LinkedSpans) -> SpanAnchor
    where
        O: TracedObject + ?Sized,
    {
        self.resolve_at(cx, obj, linked, Utc::now())
    }

    /// Resolve the anchor for a span about `obj`, triggered by a unit of work
    /// carrying `linked`. Expiry is judged against `now`.
    pub fn resolve_at<O>(
        &self,
        cx: &Context,
        obj: Option<&O>,
        linked: &LinkedSpans,
        now: DateTime<Utc>,
    ) -> SpanAnchor
    where
        O: TracedObject + ?Sized,
    {
        if cx.span().span_context().is_valid() {
            return SpanAnchor {
                parent: cx.clone(),
                links: Vec::new(),
                source: AnchorSource::Live,
            };
        }

        let mut anchor = SpanAnchor {
            parent: cx.clone(),
            links: Vec::new(),
            source: AnchorSource::Unanchored,
        };

        if let Some(obj) = obj {
            if !self.anchor_from_carrier(&mut anchor, obj, now) {
                self.anchor_from_conditions(&mut anchor, obj, now);
            }
        }

        for link in linked {
            if let Some(span_context) = self.linked_span_context(link) {
                push_link(&mut anchor.links, span_context);
            }
        }
        anchor
    }

    fn anchor_from_carrier<O>(&self, anchor: &mut SpanAnchor, obj: &O, now: DateTime<Utc>) -> bool
    where
        O: TracedObject + ?Sized,
    {
        let Some(context) = carrier::extract(self.codec, obj.annotations(), self.config) else {
            return false;
        };
        if context.is_expired(self.config.trace_expiration(), now) {
            otel_debug!(
                name: "SpanAnchorResolver.StaleContextSkipped",
                source = "annotations",
                trace_parent = context.trace_parent(),
            );
            return false;
        }
        let Some(span_context) = context.span_context(self.codec) else {
            return false;
        };

        match context.relationship() {
            Relationship::Parent => {
                anchor.parent = anchor.parent.with_remote_span_context(span_context);
            }
            Relationship::Link => push_link(&mut anchor.links, span_context),
        }
        anchor.source = AnchorSource::Carrier(context.relationship());
        true
    }

    fn anchor_from_conditions<O>(&self, anchor: &mut SpanAnchor, obj: &O, now: DateTime<Utc>)
    where
        O: TracedObject + ?Sized,
    {
        let Some(trace_condition) = obj.condition(TRACE_ID_CONDITION) else {
            return;
        };
        let Some(span_id) = obj.condition_message(SPAN_ID_CONDITION) else {
            return;
        };
        if is_expired(
            Some(trace_condition.last_transition_time),
            self.config.trace_expiration(),
            now,
        ) {
            otel_debug!(
                name: "SpanAnchorResolver.StaleContextSkipped",
                source = "conditions",
                trace_id = trace_condition.message.as_str(),
            );
            return;
        }
        let Some(span_context) = self.span_context_from_ids(&trace_condition.message, span_id)
        else {
            return;
        };
        anchor.parent = anchor.parent.with_remote_span_context(span_context);
        anchor.source = AnchorSource::Conditions;
    }

    fn linked_span_context(&self, link: &LinkedSpanRef) -> Option<SpanContext> {
        if link.trace_id.is_empty() || link.span_id.is_empty() {
            return None;
        }
        self.span_context_from_ids(&link.trace_id, &link.span_id)
    }

    // remote and sampled, like a decoded `00-<trace>-<span>-01`
    fn span_context_from_ids(&self, trace_id: &str, span_id: &str) -> Option<SpanContext> {
        let trace_parent = self.codec.build_trace_parent(trace_id, span_id).ok()?;
        self.codec.parse_span_context(&trace_parent, "")
    }
}

fn push_link(links: &mut Vec<Link>, span_context: SpanContext) {
    let duplicate = links.iter().any(|link| {
        link.span_context.trace_id() == span_context.trace_id()
            && link.span_context.span_id() == span_context.span_id()
    });
    if !duplicate {
        links.push(Link::with_context(span_context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::object::{Condition, ConditionStatus};
    use crate::testing::TestObject;
    use chrono::TimeDelta;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use std::time::Duration;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";
    const OTHER_TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";
    const OTHER_SPAN_ID: &str = "b7ad6b7169203331";

    fn config() -> Config {
        ConfigBuilder::defaults()
            .with_trace_expiration(Duration::from_secs(60))
            .build()
    }

    fn span_context(trace_id: &str, span_id: &str) -> SpanContext {
        SpanContext::new(
            TraceId::from_hex(trace_id).unwrap(),
            SpanId::from_hex(span_id).unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        )
    }

    fn stamped(config: &Config, mut obj: TestObject, now: DateTime<Utc>) -> TestObject {
        let codec = TraceContextCodec::new();
        let (parent, state) = codec
            .inject(&span_context(TRACE_ID, SPAN_ID), config.tracestate_timestamp_key(), now)
            .unwrap();
        carrier::persist(&mut obj.annotations, config, &parent, &state);
        obj
    }

    fn id_conditions(trace_id: &str, span_id: &str, at: DateTime<Utc>) -> Vec<Condition> {
        [(TRACE_ID_CONDITION, trace_id), (SPAN_ID_CONDITION, span_id)]
            .into_iter()
            .map(|(type_, message)| Condition {
                type_: type_.into(),
                status: ConditionStatus::Unknown,
                message: message.into(),
                last_transition_time: at,
            })
            .collect()
    }

    #[test]
    fn no_context_is_root() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let obj = TestObject::new("ns", "a");

        let anchor = resolver.resolve(&Context::new(), Some(&obj), &LinkedSpans::default());
        assert!(anchor.is_root());
        assert!(anchor.links().is_empty());
        assert_eq!(anchor.source(), AnchorSource::Unanchored);

        let anchor = resolver.resolve(&Context::new(), None::<&TestObject>, &LinkedSpans::default());
        assert!(anchor.is_root());
    }

    #[test]
    fn live_context_wins_over_everything() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let now = Utc::now();
        let obj = stamped(&config, TestObject::new("ns", "a"), now);
        let mut linked = LinkedSpans::default();
        linked.push(LinkedSpanRef::new(OTHER_TRACE_ID, OTHER_SPAN_ID));

        let live = Context::new()
            .with_remote_span_context(span_context(OTHER_TRACE_ID, OTHER_SPAN_ID));
        let anchor = resolver.resolve_at(&live, Some(&obj), &linked, now);

        assert_eq!(anchor.source(), AnchorSource::Live);
        assert!(anchor.links().is_empty());
        assert_eq!(
            anchor.parent().span().span_context().trace_id().to_string(),
            OTHER_TRACE_ID
        );
    }

    #[test]
    fn carrier_parent_within_expiration() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let written = Utc::now();
        let obj = stamped(&config, TestObject::new("ns", "a"), written);

        let anchor = resolver.resolve_at(
            &Context::new(),
            Some(&obj),
            &LinkedSpans::default(),
            written + TimeDelta::seconds(60),
        );
        assert_eq!(anchor.source(), AnchorSource::Carrier(Relationship::Parent));
        let parent = anchor.parent().span().span_context().clone();
        assert!(parent.is_remote());
        assert_eq!(parent.trace_id().to_string(), TRACE_ID);
        assert_eq!(parent.span_id().to_string(), SPAN_ID);
    }

    #[test]
    fn expired_carrier_falls_through_to_conditions() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let written = Utc::now();
        let now = written + TimeDelta::seconds(61);
        let obj = stamped(
            &config,
            TestObject::new("ns", "a")
                .with_conditions(id_conditions(OTHER_TRACE_ID, OTHER_SPAN_ID, now)),
            written,
        );

        let anchor = resolver.resolve_at(&Context::new(), Some(&obj), &LinkedSpans::default(), now);
        assert_eq!(anchor.source(), AnchorSource::Conditions);
        assert_eq!(
            anchor.parent().span().span_context().span_id().to_string(),
            OTHER_SPAN_ID
        );
    }

    #[test]
    fn incoming_link_annotation_becomes_link() {
        let config = ConfigBuilder::defaults()
            .with_incoming_traceparent_annotation("peer.io/traceparent")
            .build();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let obj = TestObject::new("ns", "a")
            .with_annotation("peer.io/traceparent", format!("00-{TRACE_ID}-{SPAN_ID}-01"));

        let anchor = resolver.resolve(&Context::new(), Some(&obj), &LinkedSpans::default());
        assert_eq!(anchor.source(), AnchorSource::Carrier(Relationship::Link));
        assert!(anchor.is_root());
        assert_eq!(anchor.links().len(), 1);
        assert_eq!(anchor.links()[0].span_context.trace_id().to_string(), TRACE_ID);
    }

    #[test]
    fn stale_conditions_are_skipped() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let set_at = Utc::now();
        let obj = TestObject::new("ns", "a").with_conditions(id_conditions(TRACE_ID, SPAN_ID, set_at));

        let fresh = resolver.resolve_at(
            &Context::new(),
            Some(&obj),
            &LinkedSpans::default(),
            set_at + TimeDelta::seconds(60),
        );
        assert_eq!(fresh.source(), AnchorSource::Conditions);

        let stale = resolver.resolve_at(
            &Context::new(),
            Some(&obj),
            &LinkedSpans::default(),
            set_at + TimeDelta::seconds(60) + TimeDelta::nanoseconds(1),
        );
        assert_eq!(stale.source(), AnchorSource::Unanchored);
        assert!(stale.is_root());
    }

    #[test]
    fn conditions_need_both_valid_ids() {
        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let now = Utc::now();

        for (trace_id, span_id) in [(TRACE_ID, ""), (TRACE_ID, "xyz"), ("abc", SPAN_ID)] {
            let obj = TestObject::new("ns", "a").with_conditions(id_conditions(trace_id, span_id, now));
            let anchor = resolver.resolve_at(&Context::new(), Some(&obj), &LinkedSpans::default(), now);
            assert!(anchor.is_root(), "{trace_id:?} {span_id:?}");
        }
    }

    #[test]
    fn linked_spans_are_validated_and_deduplicated() {
        let config = ConfigBuilder::defaults()
            .with_incoming_traceparent_annotation("peer.io/traceparent")
            .build();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let obj = TestObject::new("ns", "a")
            .with_annotation("peer.io/traceparent", format!("00-{TRACE_ID}-{SPAN_ID}-01"));

        let mut linked = LinkedSpans::default();
        // same span as the incoming link annotation
        linked.push(LinkedSpanRef::new(TRACE_ID, SPAN_ID));
        linked.push(LinkedSpanRef::new("not-hex", OTHER_SPAN_ID));
        linked.push(LinkedSpanRef::new(OTHER_TRACE_ID, ""));
        linked.push(LinkedSpanRef::new(OTHER_TRACE_ID, OTHER_SPAN_ID));

        let anchor = resolver.resolve(&Context::new(), Some(&obj), &linked);
        let ids: Vec<_> = anchor
            .links()
            .iter()
            .map(|link| link.span_context.span_id().to_string())
            .collect();
        assert_eq!(ids, [SPAN_ID, OTHER_SPAN_ID]);
    }

    #[test]
    fn started_span_has_remote_parent_and_links() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("anchor-test");

        let config = config();
        let codec = TraceContextCodec::new();
        let resolver = SpanAnchorResolver::new(&codec, &config);
        let now = Utc::now();
        let obj = stamped(&config, TestObject::new("ns", "a"), now);
        let mut linked = LinkedSpans::default();
        linked.push(LinkedSpanRef::new(OTHER_TRACE_ID, OTHER_SPAN_ID));

        let cx = resolver
            .resolve_at(&Context::new(), Some(&obj), &linked, now)
            .start(&tracer, "reconcile");
        cx.span().end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "reconcile");
        assert_eq!(span.span_context.trace_id().to_string(), TRACE_ID);
        assert_eq!(span.parent_span_id.to_string(), SPAN_ID);
        assert_eq!(span.links.links.len(), 1);
        assert_eq!(
            span.links.links[0].span_context.trace_id().to_string(),
            OTHER_TRACE_ID
        );
    }
}
