//! Trace context continuity for operator reconcile loops.
//!
//! A reconcile pass is triggered by an event and runs with no call
//! relationship to the pass that produced that event. This crate lets those
//! disconnected passes take part in one logical trace:
//!
//! * [`codec`] and [`carrier`] encode a span context into a resource's
//!   annotations (`traceparent` / `tracestate` with a freshness timestamp)
//!   and decode it again, including the legacy flat `trace-id` / `span-id`
//!   layout.
//! * [`anchor`] decides which context a new unit of work starts from, and
//!   whether that context becomes the parent or only a link.
//! * [`queue`] is a key-deduplicating work queue that merges the causal
//!   metadata of every trigger collapsed onto one key, with at most one
//!   in-flight unit per key.
//! * [`client`] ties these together behind `start_trace` / `end_trace`.
//! * [`reconcile`] runs a host reconciler over the queue with those calls
//!   made around every pass.
//!
//! # Getting started
//!
//! ```
//! use std::collections::BTreeMap;
//! use chrono::Utc;
//! use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
//! use opentelemetry_operator_trace::{carrier, codec::TraceContextCodec, config::ConfigBuilder};
//!
//! let config = ConfigBuilder::default().build();
//! let codec = TraceContextCodec::new();
//!
//! let span_context = SpanContext::new(
//!     TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
//!     SpanId::from_hex("00f067aa0ba902b7").unwrap(),
//!     TraceFlags::SAMPLED,
//!     true,
//!     TraceState::default(),
//! );
//!
//! // persist onto the resource when a reconcile pass completes
//! let mut annotations = BTreeMap::new();
//! let (parent, state) = codec
//!     .inject(&span_context, config.tracestate_timestamp_key(), Utc::now())
//!     .unwrap();
//! carrier::persist(&mut annotations, &config, &parent, &state);
//!
//! // a later, unrelated pass recovers it
//! let recovered = carrier::extract(&codec, &annotations, &config).unwrap();
//! assert_eq!(recovered.trace_parent(), parent);
//! ```
//!
//! All tracing failures are best effort: a context that cannot be recovered
//! yields a fresh root span, never an error on the decorated operation.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod anchor;
pub mod carrier;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod object;
pub mod predicate;
pub mod queue;
pub mod reconcile;
pub mod unit;

#[cfg(any(feature = "testing", test))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "testing", test))))]
pub mod testing;

pub use anchor::{AnchorSource, SpanAnchor, SpanAnchorResolver};
pub use client::TracingClient;
pub use codec::{TraceContext, TraceContextCodec};
pub use config::{Config, ConfigBuilder, Relationship};
pub use error::{CodecError, ReconcileError};
pub use handler::{EnqueueForObject, EnqueueForOwner, EventKind};
pub use object::TracedObject;
pub use predicate::IgnoreTraceAnnotationUpdate;
pub use queue::TracingQueue;
pub use reconcile::{Action, ObjectReconciler, ObjectStore, TracingReconciler};
pub use unit::{LinkedSpanRef, LinkedSpans, ResourceKey, UnitOfWork, UnitParent};
