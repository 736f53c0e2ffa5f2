//! In-memory [`TracedObject`] and propagator doubles for tests.
use crate::object::{Annotations, Condition, OwnerReference, TracedObject};
use crate::unit::ResourceKey;
use opentelemetry::propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A plain resource record with every optional capability filled in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestObject {
    /// Namespace and name.
    pub key: ResourceKey,
    /// Kind.
    pub kind: String,
    /// Annotations.
    pub annotations: Annotations,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Owner references.
    pub owner_references: Vec<OwnerReference>,
    /// `None` models an object type without a condition list.
    pub conditions: Option<Vec<Condition>>,
    /// Stand-in for the object's spec and status.
    pub content: u64,
}

impl TestObject {
    /// A `TestObject` of kind `TestKind`.
    pub fn new(namespace: &str, name: &str) -> Self {
        TestObject {
            key: ResourceKey::new(namespace, name),
            kind: "TestKind".to_string(),
            ..Default::default()
        }
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Add an owner reference.
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }

    /// Give the object a condition list.
    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

impl TracedObject for TestObject {
    fn key(&self) -> ResourceKey {
        self.key.clone()
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        Some(&self.labels)
    }

    fn owner_references(&self) -> &[OwnerReference] {
        &self.owner_references
    }

    fn conditions(&self) -> Option<&[Condition]> {
        self.conditions.as_deref()
    }

    fn conditions_mut(&mut self) -> Option<&mut Vec<Condition>> {
        self.conditions.as_mut()
    }

    fn content_fingerprint(&self) -> Option<u64> {
        Some(self.content)
    }
}

/// W3C propagator that counts how often it was asked to extract.
#[derive(Clone, Debug, Default)]
pub struct CountingPropagator {
    inner: TraceContextPropagator,
    extracts: Arc<AtomicUsize>,
}

impl CountingPropagator {
    /// Number of extractions so far, shared by every clone.
    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::Relaxed)
    }
}

impl TextMapPropagator for CountingPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        self.inner.inject_context(cx, injector)
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.extracts.fetch_add(1, Ordering::Relaxed);
        self.inner.extract_with_context(cx, extractor)
    }

    fn fields(&self) -> FieldIter<'_> {
        self.inner.fields()
    }
}
