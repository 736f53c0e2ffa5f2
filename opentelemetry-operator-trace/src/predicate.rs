//! Filtering out updates that only touched trace context.
//!
//! Persisting a context at the end of a reconcile writes the object, and that
//! write produces an update event. Without a filter, every reconcile would
//! trigger the next one.
use crate::config::Config;
use crate::object::{Annotations, Condition, TracedObject, SPAN_ID_CONDITION, TRACE_ID_CONDITION};
use std::collections::HashSet;

/// Whether `new` differs from `old` in anything other than the trace
/// annotations and the `TraceID` / `SpanID` conditions.
pub fn has_significant_update<O>(old: &O, new: &O, config: &Config) -> bool
where
    O: TracedObject + ?Sized,
{
    IgnoreTraceAnnotationUpdate::new(config).update(old, new)
}

/// Event filter passing every event except updates confined to trace context.
#[derive(Clone, Debug, Default)]
pub struct IgnoreTraceAnnotationUpdate {
    ignored: HashSet<String>,
}

impl IgnoreTraceAnnotationUpdate {
    /// Filter ignoring every annotation key `config` reads or writes.
    pub fn new(config: &Config) -> Self {
        IgnoreTraceAnnotationUpdate {
            ignored: config.trace_annotation_keys().into_iter().collect(),
        }
    }

    /// Also ignore changes to the annotation `key`.
    pub fn with_ignored_annotation(mut self, key: impl Into<String>) -> Self {
        self.ignored.insert(key.into());
        self
    }

    /// Creates always pass.
    pub fn create<O: TracedObject + ?Sized>(&self, _obj: &O) -> bool {
        true
    }

    /// Deletes always pass.
    pub fn delete<O: TracedObject + ?Sized>(&self, _obj: &O) -> bool {
        true
    }

    /// Generic events always pass.
    pub fn generic<O: TracedObject + ?Sized>(&self, _obj: &O) -> bool {
        true
    }

    /// Updates pass when something besides trace context changed.
    pub fn update<O>(&self, old: &O, new: &O) -> bool
    where
        O: TracedObject + ?Sized,
    {
        old.labels() != new.labels()
            || old.owner_references() != new.owner_references()
            || !self.annotations_equal(old.annotations(), new.annotations())
            || old.content_fingerprint() != new.content_fingerprint()
            || significant_conditions(old.conditions()) != significant_conditions(new.conditions())
    }

    fn annotations_equal(&self, old: &Annotations, new: &Annotations) -> bool {
        let significant = |annotations: &Annotations| {
            annotations
                .iter()
                .filter(|(key, _)| !self.ignored.contains(key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Vec<_>>()
        };
        significant(old) == significant(new)
    }
}

// an empty or missing list compares equal
fn significant_conditions(conditions: Option<&[Condition]>) -> Vec<&Condition> {
    conditions
        .unwrap_or_default()
        .iter()
        .filter(|c| c.type_ != TRACE_ID_CONDITION && c.type_ != SPAN_ID_CONDITION)
        .collect()
}
