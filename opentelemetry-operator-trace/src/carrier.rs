//! Reading and writing a persisted context on a resource's annotations.
use crate::codec::{LegacyKeys, TraceContext, TraceContextCodec};
use crate::config::Config;
use crate::object::Annotations;
use crate::unit::UnitParent;
use opentelemetry::propagation::TextMapPropagator;

/// The legacy flat keys for `config`'s prefix.
pub fn legacy_keys(config: &Config) -> LegacyKeys {
    LegacyKeys {
        trace_id: config.legacy_trace_id_key(),
        span_id: config.legacy_span_id_key(),
        timestamp: config.legacy_trace_time_key(),
    }
}

/// Recover the context persisted on `annotations`, trying
/// [`Config::carrier_candidates`] in order and then the legacy fields.
///
/// Expiry is not checked here; see [`TraceContext::is_expired`].
pub fn extract<P: TextMapPropagator>(
    codec: &TraceContextCodec<P>,
    annotations: &Annotations,
    config: &Config,
) -> Option<TraceContext> {
    codec.extract_from_carrier_set(
        annotations,
        &config.carrier_candidates(),
        &legacy_keys(config),
        config.tracestate_timestamp_key(),
    )
}

/// Like [`extract`], but only reads the keys this crate writes itself,
/// skipping the incoming peer annotation.
pub fn extract_own<P: TextMapPropagator>(
    codec: &TraceContextCodec<P>,
    annotations: &Annotations,
    config: &Config,
) -> Option<TraceContext> {
    codec.extract_from_carrier_set(
        annotations,
        &config.own_carrier_candidates(),
        &legacy_keys(config),
        config.tracestate_timestamp_key(),
    )
}

/// Remove the legacy flat keys. Returns whether any existed.
pub fn prune_legacy(annotations: &mut Annotations, config: &Config) -> bool {
    let mut changed = false;
    for key in [
        config.legacy_trace_id_key(),
        config.legacy_span_id_key(),
        config.legacy_trace_time_key(),
    ] {
        changed |= annotations.remove(&key).is_some();
    }
    changed
}

/// Write a `traceparent` / `tracestate` pair under the emitted keys, pruning
/// the legacy keys. An empty value deletes its key.
/// Returns whether `annotations` changed.
pub fn persist(
    annotations: &mut Annotations,
    config: &Config,
    trace_parent: &str,
    trace_state: &str,
) -> bool {
    let mut changed = prune_legacy(annotations, config);
    changed |= put_or_remove(annotations, config.emitted_traceparent_key(), trace_parent);
    changed |= put_or_remove(annotations, config.emitted_tracestate_key(), trace_state);
    changed
}

/// Persist a unit's parent pointer as a carrier with an empty state.
/// No-op, returning `false`, when the pointer is not a valid id pair.
pub fn override_from_parent(
    annotations: &mut Annotations,
    config: &Config,
    parent: &UnitParent,
) -> bool {
    if !parent.has_ids() {
        return false;
    }
    match TraceContextCodec::new().build_trace_parent(&parent.trace_id, &parent.span_id) {
        Ok(trace_parent) => persist(annotations, config, &trace_parent, ""),
        Err(_) => false,
    }
}

fn put_or_remove(annotations: &mut Annotations, key: String, value: &str) -> bool {
    if value.is_empty() {
        annotations.remove(&key).is_some()
    } else {
        annotations.insert(key, value.to_string()).as_deref() != Some(value)
    }
}
