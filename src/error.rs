use thiserror::Error;

/// Errors from the shared store adapter. A transport or script error that is
/// not the one-shot NOSCRIPT recovery always propagates to the caller as a
/// fatal 503 — no admission occurs and no dimension is mutated. Config-load
/// and other startup-fatal paths use `anyhow::Result` instead, matching the
/// teacher's split between startup-fatal and request-path error handling.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connect error: {0}")]
    Connect(String),
}
