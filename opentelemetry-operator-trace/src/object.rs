//! The narrow view of a resource record this crate needs.
//!
//! Hosts implement [`TracedObject`] over their own object model (a typed
//! Kubernetes resource, a dynamic object, a test double). Only annotation
//! access is required; labels, owner references, conditions and a content
//! fingerprint are optional and default to "not available".
use crate::unit::ResourceKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Resource metadata key/value map.
pub type Annotations = BTreeMap<String, String>;

/// Condition type carrying the trace id side channel.
pub const TRACE_ID_CONDITION: &str = "TraceID";
/// Condition type carrying the span id side channel.
pub const SPAN_ID_CONDITION: &str = "SpanID";

/// Status of a [`Condition`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Unknown, the status used for the trace side channel.
    #[default]
    Unknown,
}

/// A typed status record on a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    /// Condition type, unique within the resource.
    pub type_: String,
    /// Condition status.
    pub status: ConditionStatus,
    /// Free form message. The trace side channel stores its id here.
    pub message: String,
    /// Last time the status or message changed.
    pub last_transition_time: DateTime<Utc>,
}

/// A reference from a resource to the resource that owns it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    /// `group/version`, or just `version` for the core group.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// Whether the owner is the managing controller.
    pub controller: bool,
}

impl OwnerReference {
    /// API group of the owner, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }
}

/// A resource record as seen by the tracing layer.
pub trait TracedObject {
    /// Namespace and name.
    fn key(&self) -> ResourceKey;

    /// Kind, e.g. `Deployment`.
    fn kind(&self) -> &str;

    /// Metadata annotations.
    fn annotations(&self) -> &Annotations;

    /// Mutable metadata annotations.
    fn annotations_mut(&mut self) -> &mut Annotations;

    /// Metadata labels, when the object model has them.
    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        None
    }

    /// Owner references.
    fn owner_references(&self) -> &[OwnerReference] {
        &[]
    }

    /// Status conditions, when the object model has them.
    fn conditions(&self) -> Option<&[Condition]> {
        None
    }

    /// Mutable status conditions; `None` when the object has no condition list.
    fn conditions_mut(&mut self) -> Option<&mut Vec<Condition>> {
        None
    }

    /// Fingerprint of the object's spec and status, excluding metadata.
    /// Two objects with equal fingerprints are treated as unchanged.
    fn content_fingerprint(&self) -> Option<u64> {
        None
    }

    /// Name.
    fn name(&self) -> String {
        self.key().name
    }

    /// The condition of type `type_`.
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions()?.iter().find(|c| c.type_ == type_)
    }

    /// Message of the condition of type `type_`.
    fn condition_message(&self, type_: &str) -> Option<&str> {
        self.condition(type_).map(|c| c.message.as_str())
    }

    /// Upsert the condition of type `type_` with status [`ConditionStatus::Unknown`].
    /// The transition time only moves when the message changes.
    /// Returns whether anything changed.
    fn set_condition_message(&mut self, type_: &str, message: &str, now: DateTime<Utc>) -> bool {
        let Some(conditions) = self.conditions_mut() else {
            return false;
        };
        match conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) if existing.message == message => false,
            Some(existing) => {
                existing.message = message.to_string();
                existing.status = ConditionStatus::Unknown;
                existing.last_transition_time = now;
                true
            }
            None => {
                conditions.push(Condition {
                    type_: type_.to_string(),
                    status: ConditionStatus::Unknown,
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// Remove the condition of type `type_`. Returns whether it existed.
    fn delete_condition(&mut self, type_: &str) -> bool {
        let Some(conditions) = self.conditions_mut() else {
            return false;
        };
        let before = conditions.len();
        conditions.retain(|c| c.type_ != type_);
        conditions.len() != before
    }
}
