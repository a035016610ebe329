use thiserror::Error as ThisError;

/// Result type used by `enclave` APIs.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Why a processor tore its sandbox down and returned to the initial state.
///
/// The same reason is delivered to every request that was pending or queued
/// at the moment of the reset, and to the configured on-reset hook.
#[derive(Debug, Clone, ThisError)]
pub enum ResetReason {
    /// The isolated context could not be spawned.
    #[error("sandbox failed to start: {0}")]
    SpawnFailed(String),

    /// The initialize hook failed, so the sandbox never became available.
    #[error("sandbox initialization failed: {0}")]
    InitializeFailed(String),

    /// The sandbox violated the message protocol (unknown response id,
    /// malformed or direction-invalid envelope).
    #[error("sandbox protocol violation: {0}")]
    Protocol(String),

    /// The sandbox reported a fatal error not tied to any single request.
    #[error("sandbox crashed: {0}")]
    Crashed(String),

    /// The message channel to the sandbox closed underneath the processor.
    #[error("sandbox channel closed")]
    ChannelClosed,

    /// The embedding application tore the sandbox down.
    #[error("sandbox terminated")]
    Terminated,
}

#[derive(Debug, ThisError)]
pub enum Error {
    /// The sandbox answered this request with an error payload. Local to the
    /// one call; the sandbox stays up.
    #[error("{name}: {message}")]
    Sandbox { name: String, message: String },

    /// The request was dropped by a reset before a response arrived.
    #[error(transparent)]
    Reset(ResetReason),

    /// A bootstrap request was issued outside the initialize phase. Bootstrap
    /// calls must originate from the initialize hook.
    #[error("bootstrap requests are only valid while the sandbox is initializing")]
    NotInitializing,

    /// A function pointer was used while no sandbox is even partially
    /// initialized; the handle is stale.
    #[error("no sandbox connection is established")]
    NotEstablished,

    /// The processor has been shut down and its driver is gone.
    #[error("processor closed")]
    Closed,
}
