//! Encoding of a span context into annotation string pairs.
//!
//! The persisted layout is the W3C one: a `traceparent` of the form
//! `00-<32 hex>-<16 hex>-<2 hex>` and a `tracestate` that carries one reserved
//! entry, the time the context was written. Decoding goes through an explicitly
//! passed [`TextMapPropagator`], never the global one.
use crate::config::{CarrierCandidate, Relationship};
use crate::error::{CodecError, IdentifierKind};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use opentelemetry::otel_debug;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";
const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

/// A context recovered from, or about to be written to, a carrier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    trace_parent: String,
    trace_state: String,
    timestamp: Option<DateTime<Utc>>,
    relationship: Relationship,
}

impl TraceContext {
    /// Create a context from already validated parts.
    pub fn new(
        trace_parent: impl Into<String>,
        trace_state: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        relationship: Relationship,
    ) -> Self {
        TraceContext {
            trace_parent: trace_parent.into(),
            trace_state: trace_state.into(),
            timestamp,
            relationship,
        }
    }

    /// The `traceparent` value.
    pub fn trace_parent(&self) -> &str {
        &self.trace_parent
    }

    /// The `tracestate` value, possibly empty.
    pub fn trace_state(&self) -> &str {
        &self.trace_state
    }

    /// When the context was written, if recorded.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// How a span started from this context attaches to it.
    pub fn relationship(&self) -> Relationship {
        self.relationship
    }

    /// Returns this context with a different relationship.
    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationship = relationship;
        self
    }

    /// Re-parse the stored strings into a remote [`SpanContext`].
    pub fn span_context<P: TextMapPropagator>(
        &self,
        codec: &TraceContextCodec<P>,
    ) -> Option<SpanContext> {
        codec.parse_span_context(&self.trace_parent, &self.trace_state)
    }

    /// See [`is_expired`].
    pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        is_expired(self.timestamp, expiration, now)
    }
}

/// True iff `now - timestamp` is strictly greater than `expiration`.
///
/// A missing timestamp is never expired.
pub fn is_expired(timestamp: Option<DateTime<Utc>>, expiration: Duration, now: DateTime<Utc>) -> bool {
    let Some(timestamp) = timestamp else {
        return false;
    };
    match TimeDelta::from_std(expiration) {
        Ok(expiration) => now.signed_duration_since(timestamp) > expiration,
        // longer than chrono can represent
        Err(_) => false,
    }
}

/// Annotation keys of the flat, pre-`traceparent` layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyKeys {
    /// Key holding a bare 32-hex trace id.
    pub trace_id: String,
    /// Key holding a bare 16-hex span id.
    pub span_id: String,
    /// Key holding an RFC-3339 write time.
    pub timestamp: String,
}

/// Pure encode/decode of trace contexts to carrier strings.
#[derive(Clone, Debug, Default)]
pub struct TraceContextCodec<P = TraceContextPropagator> {
    propagator: P,
}

impl TraceContextCodec {
    /// Codec backed by the W3C [`TraceContextPropagator`].
    pub fn new() -> Self {
        TraceContextCodec {
            propagator: TraceContextPropagator::new(),
        }
    }
}

impl<P: TextMapPropagator> TraceContextCodec<P> {
    /// Codec backed by another propagator that reads and writes the
    /// `traceparent` and `tracestate` fields.
    pub fn with_propagator(propagator: P) -> Self {
        TraceContextCodec { propagator }
    }

    /// Build `00-<trace_id>-<span_id>-01`.
    ///
    /// Both ids must be lowercase hex of the exact width and not all zeros.
    pub fn build_trace_parent(&self, trace_id: &str, span_id: &str) -> Result<String, CodecError> {
        validate_id(trace_id, TRACE_ID_HEX_LEN, IdentifierKind::Trace)?;
        validate_id(span_id, SPAN_ID_HEX_LEN, IdentifierKind::Span)?;
        Ok(format!("00-{trace_id}-{span_id}-01"))
    }

    /// Decode a `traceparent` / `tracestate` pair into a remote span context.
    ///
    /// Absent when the pair does not decode to a valid context.
    pub fn parse_span_context(&self, trace_parent: &str, trace_state: &str) -> Option<SpanContext> {
        if !has_well_formed_ids(trace_parent) {
            return None;
        }
        let mut carrier = HashMap::with_capacity(2);
        carrier.insert(TRACEPARENT_HEADER.to_string(), trace_parent.to_string());
        if !trace_state.is_empty() {
            carrier.insert(TRACESTATE_HEADER.to_string(), trace_state.to_string());
        }
        let cx = self.propagator.extract(&carrier);
        let span_context = cx.span().span_context().clone();
        span_context.is_valid().then_some(span_context)
    }

    /// Decode a `traceparent` / `tracestate` pair, reading the write time from
    /// `timestamp_key` inside the state. The result attaches as a parent.
    pub fn parse_context(
        &self,
        trace_parent: &str,
        trace_state: &str,
        timestamp_key: &str,
    ) -> Option<TraceContext> {
        self.parse_span_context(trace_parent, trace_state)?;
        Some(TraceContext::new(
            trace_parent,
            trace_state,
            Self::extract_timestamp(trace_state, timestamp_key),
            Relationship::Parent,
        ))
    }

    /// Read the RFC-3339 time stored at `key` inside a `tracestate` string.
    pub fn extract_timestamp(trace_state: &str, key: &str) -> Option<DateTime<Utc>> {
        if trace_state.is_empty() || key.is_empty() {
            return None;
        }
        let state = TraceState::from_str(trace_state).ok()?;
        let value = state.get(key)?;
        parse_time(value)
    }

    /// Serialize the span context's trace state with `timestamp_key` set to
    /// `now`. Any previous value at that key is replaced, never duplicated.
    pub fn build_state_string(
        &self,
        span_context: &SpanContext,
        timestamp_key: &str,
        now: DateTime<Utc>,
    ) -> String {
        let state = span_context.trace_state();
        if timestamp_key.is_empty() {
            return state.header();
        }
        let stamp = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
        match state
            .delete(timestamp_key)
            .and_then(|state| state.insert(timestamp_key, stamp))
        {
            Ok(state) => state.header(),
            Err(err) => {
                otel_debug!(
                    name: "TraceContextCodec.TimestampNotRecorded",
                    message = "Trace state left without a write time, the persisted context will not expire",
                    timestamp_key = timestamp_key,
                    error = format!("{err}"),
                );
                state.header()
            }
        }
    }

    /// Encode a span context as `(traceparent, tracestate)`, stamping the
    /// state with `now`. Absent for invalid contexts.
    pub fn inject(
        &self,
        span_context: &SpanContext,
        timestamp_key: &str,
        now: DateTime<Utc>,
    ) -> Option<(String, String)> {
        if !span_context.is_valid() {
            return None;
        }
        let cx = Context::new().with_remote_span_context(span_context.clone());
        let mut carrier: HashMap<String, String> = HashMap::with_capacity(2);
        self.propagator.inject_context(&cx, &mut carrier);
        let trace_parent = carrier.remove(TRACEPARENT_HEADER)?;
        let trace_state = self.build_state_string(span_context, timestamp_key, now);
        Some((trace_parent, trace_state))
    }

    /// Try each candidate key pair in order and return the first that decodes,
    /// with the candidate's relationship. When none matches, fall back to the
    /// legacy flat fields, which always attach as a parent.
    pub fn extract_from_carrier_set(
        &self,
        carrier: &BTreeMap<String, String>,
        candidates: &[CarrierCandidate],
        legacy: &LegacyKeys,
        timestamp_key: &str,
    ) -> Option<TraceContext> {
        if carrier.is_empty() {
            return None;
        }

        for candidate in candidates {
            if candidate.parent_key.is_empty() {
                continue;
            }
            let Some(trace_parent) = non_empty_value(carrier, &candidate.parent_key) else {
                continue;
            };
            let trace_state = non_empty_value(carrier, &candidate.state_key).unwrap_or_default();
            match self.parse_context(trace_parent, trace_state, timestamp_key) {
                Some(context) => return Some(context.with_relationship(candidate.relationship)),
                None => {
                    otel_debug!(
                        name: "TraceContextCodec.MalformedCarrier",
                        message = "Skipping annotation that does not hold a valid traceparent",
                        annotation = candidate.parent_key.as_str(),
                    );
                }
            }
        }

        self.extract_legacy(carrier, legacy)
    }

    fn extract_legacy(
        &self,
        carrier: &BTreeMap<String, String>,
        legacy: &LegacyKeys,
    ) -> Option<TraceContext> {
        let trace_id = non_empty_value(carrier, &legacy.trace_id)?;
        let span_id = non_empty_value(carrier, &legacy.span_id)?;
        let trace_parent = match self.build_trace_parent(trace_id, span_id) {
            Ok(trace_parent) => trace_parent,
            Err(err) => {
                otel_debug!(
                    name: "TraceContextCodec.MalformedLegacyCarrier",
                    error = format!("{err}"),
                );
                return None;
            }
        };
        let timestamp = non_empty_value(carrier, &legacy.timestamp).and_then(parse_time);
        Some(TraceContext::new(
            trace_parent,
            "",
            timestamp,
            Relationship::Parent,
        ))
    }
}

fn non_empty_value<'a>(carrier: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    if key.is_empty() {
        return None;
    }
    carrier
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

// the propagator parses ids with `from_str_radix`, which accepts short ids
// and a leading `+`
fn has_well_formed_ids(trace_parent: &str) -> bool {
    let mut parts = trace_parent.split('-');
    let (Some(_version), Some(trace_id), Some(span_id)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    validate_id(trace_id, TRACE_ID_HEX_LEN, IdentifierKind::Trace).is_ok()
        && validate_id(span_id, SPAN_ID_HEX_LEN, IdentifierKind::Span).is_ok()
}

fn validate_id(value: &str, len: usize, kind: IdentifierKind) -> Result<(), CodecError> {
    let valid = value.len() == len
        && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && value.bytes().any(|b| b != b'0');
    if valid {
        Ok(())
    } else {
        Err(CodecError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}
