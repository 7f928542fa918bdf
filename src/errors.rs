use thiserror::Error;

/// Typed error kinds at the seams where callers branch on error kind rather
/// than just logging a message (Host Connector, Policy Engine, Deploy
/// Engine). Everywhere else uses `anyhow::Result` with `.context(...)`.
#[derive(Debug, Error)]
pub enum DduiError {
    /// Docker/SSH reach errors. Never fatal — retried by the next scan cycle.
    #[error("transient connect error for host {host}: {source}")]
    TransientConnect {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    /// A host was intentionally excluded from scanning.
    #[error("skipping scan for host {host}: {reason}")]
    SkipScan { host: String, reason: String },

    /// Malformed compose/inventory document. The specific stack/host is
    /// skipped; the rest of the batch continues.
    #[error("failed to parse {what}: {source}")]
    ParseError {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    /// Auto-apply disallowed by the Policy Engine.
    #[error("auto-apply denied for stack {stack_id}")]
    PolicyDenied { stack_id: i64 },

    /// SOPS/IO failure while staging. Aborts the deploy before any Docker
    /// invocation runs.
    #[error("failed to stage deployment: {0}")]
    StagingError(String),

    /// `docker`/`docker compose` exited non-zero.
    #[error("command failed (exit {exit_code:?}): {message}")]
    CommandFailure { exit_code: Option<i32>, message: String },

    /// A data invariant was violated (e.g. a stamp with no backing stack).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
