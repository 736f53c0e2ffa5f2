//! Units of work and the causal pointers they carry.
use opentelemetry::otel_debug;
use std::fmt;
use std::str::FromStr;

/// Most linked spans a single [`UnitOfWork`] records.
pub const MAX_LINKED_SPANS: usize = 10;

/// Identity of a resource; the deduplication key of the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace, empty for cluster scoped resources.
    pub namespace: String,
    /// Name within the namespace.
    pub name: String,
}

impl ResourceKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A lightweight "also triggered by" pointer into another trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LinkedSpanRef {
    /// Hex trace id.
    pub trace_id: String,
    /// Hex span id.
    pub span_id: String,
}

impl LinkedSpanRef {
    /// Create a pointer.
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        LinkedSpanRef {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// Both ids are empty.
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty() && self.span_id.is_empty()
    }
}

/// Outcome of [`LinkedSpans::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPush {
    /// Recorded.
    Added,
    /// Both ids were empty.
    Empty,
    /// Already recorded.
    Duplicate,
    /// [`MAX_LINKED_SPANS`] are already recorded.
    Full,
}

/// Bounded, insertion ordered set of [`LinkedSpanRef`]s.
///
/// The first [`MAX_LINKED_SPANS`] distinct references win; later ones are
/// dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkedSpans {
    refs: Vec<LinkedSpanRef>,
}

impl LinkedSpans {
    /// Append, skipping empty and duplicate references and dropping once full.
    pub fn push(&mut self, link: LinkedSpanRef) -> LinkPush {
        if link.is_empty() {
            return LinkPush::Empty;
        }
        if self.refs.contains(&link) {
            return LinkPush::Duplicate;
        }
        if self.refs.len() >= MAX_LINKED_SPANS {
            otel_debug!(
                name: "TracingQueue.LinkedSpanDropped",
                message = "Linked span limit reached, dropping link",
                trace_id = link.trace_id.as_str(),
                span_id = link.span_id.as_str(),
            );
            return LinkPush::Full;
        }
        self.refs.push(link);
        LinkPush::Added
    }

    /// Number of recorded references.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// No references recorded.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Recorded references, oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, LinkedSpanRef> {
        self.refs.iter()
    }

    /// Forget every reference.
    pub fn clear(&mut self) {
        self.refs.clear()
    }
}

impl<'a> IntoIterator for &'a LinkedSpans {
    type Item = &'a LinkedSpanRef;
    type IntoIter = std::slice::Iter<'a, LinkedSpanRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The context that produced a unit of work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitParent {
    /// Hex trace id, empty when the trigger was untraced.
    pub trace_id: String,
    /// Hex span id, empty when the trigger was untraced.
    pub span_id: String,
    /// Name of the object whose event produced the unit.
    pub sender_name: String,
    /// Kind of the object whose event produced the unit.
    pub sender_kind: String,
    /// Event that produced the unit, e.g. `create` or `old`.
    pub event_kind: String,
}

impl UnitParent {
    /// The trace and span ids as a link.
    pub fn as_link(&self) -> LinkedSpanRef {
        LinkedSpanRef::new(self.trace_id.clone(), self.span_id.clone())
    }

    /// Whether both ids are set.
    pub fn has_ids(&self) -> bool {
        !self.trace_id.is_empty() && !self.span_id.is_empty()
    }

    fn same_ids(&self, other: &UnitParent) -> bool {
        self.trace_id == other.trace_id && self.span_id == other.span_id
    }
}

/// One pending reconcile of one resource, with its causal metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    /// The target resource.
    pub key: ResourceKey,
    /// The context that produced this unit.
    pub parent: UnitParent,
    /// Other contexts collapsed onto this unit by the queue.
    pub linked_spans: LinkedSpans,
}

impl UnitOfWork {
    /// An untraced unit for `key`.
    pub fn new(key: ResourceKey) -> Self {
        UnitOfWork {
            key,
            ..Default::default()
        }
    }

    /// Returns this unit with `parent` set.
    pub fn with_parent(mut self, parent: UnitParent) -> Self {
        self.parent = parent;
        self
    }

    /// Decode a key whose name was built by [`EmbeddedTraceName`].
    ///
    /// A name that is not in the embedded form is taken literally.
    pub fn from_embedded_key(key: ResourceKey) -> Self {
        match key.name.parse::<EmbeddedTraceName>() {
            Ok(embedded) => UnitOfWork {
                key: ResourceKey::new(key.namespace, embedded.key_name),
                parent: UnitParent {
                    trace_id: embedded.trace_id,
                    span_id: embedded.span_id,
                    sender_name: embedded.object_name,
                    sender_kind: embedded.object_kind,
                    event_kind: String::new(),
                },
                linked_spans: LinkedSpans::default(),
            },
            Err(_) => UnitOfWork::new(key),
        }
    }

    /// Fold `other`'s parent into this unit as a link when the two parents
    /// differ. Returns whether a link was recorded.
    pub(crate) fn merge_parent(&mut self, other: &UnitParent) -> bool {
        if self.parent.same_ids(other) {
            return false;
        }
        self.linked_spans.push(other.as_link()) == LinkPush::Added
    }

    /// Drop the parent and every linked span.
    pub(crate) fn reset_causality(&mut self) {
        self.parent = UnitParent::default();
        self.linked_spans.clear();
    }
}

/// A resource name that carries the trace context of the object that
/// requested it: `trace;span;kind;name;key`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmbeddedTraceName {
    /// Hex trace id.
    pub trace_id: String,
    /// Hex span id.
    pub span_id: String,
    /// Kind of the requesting object.
    pub object_kind: String,
    /// Name of the requesting object.
    pub object_name: String,
    /// The real resource name.
    pub key_name: String,
}

impl fmt::Display for EmbeddedTraceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{}",
            self.trace_id, self.span_id, self.object_kind, self.object_name, self.key_name
        )
    }
}

/// The name does not have exactly five `;`-separated parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseEmbeddedNameError;

impl fmt::Display for ParseEmbeddedNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected trace;span;kind;name;key")
    }
}

impl std::error::Error for ParseEmbeddedNameError {}

impl FromStr for EmbeddedTraceName {
    type Err = ParseEmbeddedNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(';').collect();
        let [trace_id, span_id, object_kind, object_name, key_name] = parts.as_slice() else {
            return Err(ParseEmbeddedNameError);
        };
        Ok(EmbeddedTraceName {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            object_kind: object_kind.to_string(),
            object_name: object_name.to_string(),
            key_name: key_name.to_string(),
        })
    }
}
