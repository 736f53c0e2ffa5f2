//! Error types.
//!
//! Almost every malformed input in this crate is reported as an absent value
//! rather than an error, since trace continuity is best effort. The variants
//! here cover the few constructors that callers may want to inspect.
use crate::unit::ResourceKey;
use thiserror::Error;

/// Boxed error of a host-provided store or reconciler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which half of a trace context an identifier belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifierKind {
    /// A 128-bit trace id, 32 lowercase hex characters.
    Trace,
    /// A 64-bit span id, 16 lowercase hex characters.
    Span,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierKind::Trace => f.write_str("trace id"),
            IdentifierKind::Span => f.write_str("span id"),
        }
    }
}

/// Errors returned by [`TraceContextCodec`](crate::codec::TraceContextCodec).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The identifier is empty, has the wrong length, is not lowercase hex,
    /// or is all zeros.
    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier {
        /// Which identifier was rejected.
        kind: IdentifierKind,
        /// The rejected input.
        value: String,
    },
}

/// Errors returned by [`TracingReconciler`](crate::reconcile::TracingReconciler).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The object could not be fetched. A missing object is not an error.
    #[error("fetching {key} failed: {source}")]
    Fetch {
        /// The unit's key.
        key: ResourceKey,
        /// The store's error.
        source: BoxError,
    },
    /// The reconciler failed.
    #[error("reconciling {key} failed: {source}")]
    Reconcile {
        /// The unit's key.
        key: ResourceKey,
        /// The reconciler's error.
        source: BoxError,
    },
}
