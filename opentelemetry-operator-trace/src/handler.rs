//! Turning watch events into queued units of work.
//!
//! The object that changed becomes the sender of the unit, and the context
//! persisted on it becomes the unit's parent, so the reconcile the event
//! triggers continues the trace of the pass that last wrote the object.
use crate::carrier;
use crate::codec::TraceContextCodec;
use crate::config::Config;
use crate::object::TracedObject;
use crate::queue::TracingQueue;
use crate::unit::{ResourceKey, UnitOfWork, UnitParent};
use chrono::Utc;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::fmt;

/// Tag of a unit produced from the old object of an update.
pub const OLD_OBJECT: &str = "old";
/// Tag of a unit produced from the current object.
pub const NEW_OBJECT: &str = "new";

/// Kind of watch event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The object was created.
    Create,
    /// The object was updated.
    Update,
    /// The object was deleted.
    Delete,
    /// An event from outside the cluster.
    Generic,
}

impl EventKind {
    /// Lowercase name, as recorded in [`UnitParent::event_kind`].
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Generic => "generic",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ids of the context this crate persisted on `obj`, if still fresh
fn parent_ids<O, P>(
    codec: &TraceContextCodec<P>,
    obj: &O,
    config: &Config,
) -> Option<(String, String)>
where
    O: TracedObject + ?Sized,
    P: TextMapPropagator,
{
    let context = carrier::extract_own(codec, obj.annotations(), config)?;
    if context.is_expired(config.trace_expiration(), Utc::now()) {
        return None;
    }
    let span_context = context.span_context(codec)?;
    Some((
        span_context.trace_id().to_string(),
        span_context.span_id().to_string(),
    ))
}

fn parent_for<O, P>(
    codec: &TraceContextCodec<P>,
    obj: &O,
    event_kind: &str,
    config: &Config,
) -> UnitParent
where
    O: TracedObject + ?Sized,
    P: TextMapPropagator,
{
    let (trace_id, span_id) = parent_ids(codec, obj, config).unwrap_or_default();
    UnitParent {
        trace_id,
        span_id,
        sender_name: obj.name(),
        sender_kind: obj.kind().to_string(),
        event_kind: event_kind.to_string(),
    }
}

/// A unit for `obj`'s own key, sent by `obj` and parented on the context
/// persisted on it.
pub fn unit_for_object<O>(obj: &O, event_kind: &str, config: &Config) -> UnitOfWork
where
    O: TracedObject + ?Sized,
{
    unit_for_object_with_codec(&TraceContextCodec::new(), obj, event_kind, config)
}

/// [`unit_for_object`], decoding the carrier with `codec`.
pub fn unit_for_object_with_codec<O, P>(
    codec: &TraceContextCodec<P>,
    obj: &O,
    event_kind: &str,
    config: &Config,
) -> UnitOfWork
where
    O: TracedObject + ?Sized,
    P: TextMapPropagator,
{
    UnitOfWork::new(obj.key()).with_parent(parent_for(codec, obj, event_kind, config))
}

/// Enqueues the object an event is about.
#[derive(Clone, Debug, Default)]
pub struct EnqueueForObject<P = TraceContextPropagator> {
    codec: TraceContextCodec<P>,
    config: Config,
}

impl EnqueueForObject {
    /// Handler reading carriers with `config`.
    pub fn new(config: Config) -> Self {
        EnqueueForObject {
            codec: TraceContextCodec::new(),
            config,
        }
    }
}

impl<P: TextMapPropagator> EnqueueForObject<P> {
    /// The same handler decoding carriers with `propagator`, as a
    /// [`TracingClient`](crate::TracingClient) built with that propagator does.
    pub fn with_propagator<Q: TextMapPropagator>(self, propagator: Q) -> EnqueueForObject<Q> {
        EnqueueForObject {
            codec: TraceContextCodec::with_propagator(propagator),
            config: self.config,
        }
    }

    fn enqueue<O>(&self, obj: &O, kind: EventKind, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        queue.add(unit_for_object_with_codec(
            &self.codec,
            obj,
            kind.as_str(),
            &self.config,
        ));
    }

    /// Enqueue a created object.
    pub fn create<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(obj, EventKind::Create, queue);
    }

    /// Enqueue the new version of an updated object.
    pub fn update<O>(&self, _old: &O, new: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(new, EventKind::Update, queue);
    }

    /// Enqueue a deleted object.
    pub fn delete<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(obj, EventKind::Delete, queue);
    }

    /// Enqueue the object of a generic event.
    pub fn generic<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(obj, EventKind::Generic, queue);
    }
}

/// Enqueues the owners of the object an event is about.
///
/// Each owner reference of the configured group and kind yields one unit,
/// sent by the owned object.
#[derive(Clone, Debug)]
pub struct EnqueueForOwner<P = TraceContextPropagator> {
    owner_group: String,
    owner_kind: String,
    only_controller: bool,
    cluster_scoped: bool,
    codec: TraceContextCodec<P>,
    config: Config,
}

impl EnqueueForOwner {
    /// Handler for owners of `owner_kind` in `owner_group`, the empty string
    /// being the core group.
    pub fn new(owner_group: impl Into<String>, owner_kind: impl Into<String>, config: Config) -> Self {
        EnqueueForOwner {
            owner_group: owner_group.into(),
            owner_kind: owner_kind.into(),
            only_controller: false,
            cluster_scoped: false,
            codec: TraceContextCodec::new(),
            config,
        }
    }
}

impl<P: TextMapPropagator> EnqueueForOwner<P> {
    /// The same handler decoding carriers with `propagator`.
    pub fn with_propagator<Q: TextMapPropagator>(self, propagator: Q) -> EnqueueForOwner<Q> {
        EnqueueForOwner {
            owner_group: self.owner_group,
            owner_kind: self.owner_kind,
            only_controller: self.only_controller,
            cluster_scoped: self.cluster_scoped,
            codec: TraceContextCodec::with_propagator(propagator),
            config: self.config,
        }
    }

    /// Only follow the reference of the managing controller.
    pub fn only_controller(mut self) -> Self {
        self.only_controller = true;
        self
    }

    /// The owner kind is cluster scoped, so its key has no namespace.
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }

    /// The units for the owners of `obj`, each tagged with `event_kind`.
    pub fn owner_units<O>(&self, obj: &O, event_kind: &str) -> Vec<UnitOfWork>
    where
        O: TracedObject + ?Sized,
    {
        let refs = obj.owner_references();
        let refs: Vec<_> = if self.only_controller {
            refs.iter().find(|r| r.controller).into_iter().collect()
        } else {
            refs.iter().collect()
        };

        let namespace = if self.cluster_scoped {
            String::new()
        } else {
            obj.key().namespace
        };

        let mut units = Vec::new();
        for owner in refs {
            if owner.kind != self.owner_kind || owner.group() != self.owner_group {
                continue;
            }
            let unit = UnitOfWork::new(ResourceKey::new(namespace.clone(), owner.name.clone()))
                .with_parent(parent_for(&self.codec, obj, event_kind, &self.config));
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        units
    }

    fn enqueue(&self, units: Vec<UnitOfWork>, queue: &TracingQueue) {
        for unit in units {
            queue.add(unit);
        }
    }

    /// Enqueue the owners of a created object.
    pub fn create<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(self.owner_units(obj, NEW_OBJECT), queue);
    }

    /// Enqueue the owners of both versions of an updated object.
    ///
    /// The new version is enqueued first, so an owner shared by both
    /// versions is parented on the new version's context.
    pub fn update<O>(&self, old: &O, new: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        let mut units = self.owner_units(new, NEW_OBJECT);
        units.extend(self.owner_units(old, OLD_OBJECT));
        self.enqueue(units, queue);
    }

    /// Enqueue the owners of a deleted object.
    pub fn delete<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(self.owner_units(obj, NEW_OBJECT), queue);
    }

    /// Enqueue the owners of the object of a generic event.
    pub fn generic<O>(&self, obj: &O, queue: &TracingQueue)
    where
        O: TracedObject + ?Sized,
    {
        self.enqueue(self.owner_units(obj, NEW_OBJECT), queue);
    }
}
