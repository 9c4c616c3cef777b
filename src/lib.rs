#![cfg_attr(docsrs, feature(doc_cfg))]

//! Client dispatcher and server execution engine for a serverless,
//! HDFS-compatible metadata service.
//!
//! The service has no standing process: a client dispatcher (C4) routes each
//! filesystem operation to the deployment that owns it via a stable consistent
//! hash (C2), submits it over a persistent TCP channel or an HTTP fallback, and
//! retries with backoff on transient failure. Each deployment is a cold-started
//! instance running the server execution engine (C5), which deduplicates retried
//! requests, executes them serially, and serves repeat reads from a function-local
//! metadata cache (C6) kept warm across invocations. A deployment registry (C1)
//! tracks which instance IDs are live for each deployment number; write authority
//! itself comes from the routing hash (C2), not from the registry.
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//! - TCP framing: `tokio_util` length-delimited codec
//!
//! # Feature flags
//! - `init-tracing` — structured tracing subscriber (env-filter + JSON formatting)

/// Exponential backoff with jitter for the client dispatcher's retry loop.
pub mod backoff;

/// Function-local metadata cache (C6), plus dependent ACL/encryption-zone caches.
pub mod cache;

/// Persistent TCP duplex channel used by the client dispatcher (C4).
pub mod channel;

/// Typed, environment-overridable configuration.
pub mod config;

/// Server-side in-flight/completed request deduplication (part of C5).
pub mod dedup;

/// Client Dispatcher (C4): submits operations, chooses transport, retries.
pub mod dispatcher;

/// The error taxonomy of the dispatcher and execution engine.
pub mod errors;

/// Server Execution Engine (C5): turns a request envelope into a response envelope.
pub mod engine;

/// Outbound HTTP transport, the dispatcher's fallback path.
pub mod http_transport;

/// Client-side invocation cache (C3): cached routing decisions.
pub mod invocation_cache;

/// HTTP and TCP accept loops that hand decoded envelopes to an `Engine`.
pub mod listener;

/// Deployment Registry (C1): tracks live deployment membership via a pluggable backend.
pub mod registry;

/// Consistent-hash routing from a path or inode id onto a deployment number (C2).
pub mod routing;

/// Structured logging and the operation-performed telemetry log.
pub mod telemetry;

/// Wire envelope types shared by the HTTP and TCP transports.
pub mod wire;

pub use dispatcher::{Dispatcher, DeploymentEndpoint, EndpointResolver};
pub use engine::{Engine, OperationHandler, OperationTable};
pub use errors::{DispatchError, ExecutionError};
