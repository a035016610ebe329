//! Host-side controller for sandboxed extension execution.
//!
//! Extensions are untrusted third-party code running in an isolated context
//! reachable only through structured asynchronous messages. The
//! [`Processor`] owns one such context: it drives the lifecycle state
//! machine, correlates requests with responses, queues calls issued before
//! the sandbox is ready, and marshals values — including live callables —
//! across the boundary in both directions.

mod driver;
mod marshal;

pub mod error;
pub mod processor;
pub mod transport;
pub mod value;

pub use enclave_wire as wire;

/// Tracing target for processor lifecycle events.
pub const TRACE_TARGET: &str = "enclave::processor";

pub use error::{Error, ResetReason, Result};
pub use processor::{InitScope, Processor, ProcessorBuilder};
pub use transport::{CommandTransport, InboundItem, Transport};
pub use value::{BoxError, Callable, Fault, Value};
