//! Error taxonomy for the router core (spec §7).

use thiserror::Error;

/// Everything that can go wrong inside the data or control plane.
///
/// Data-plane failures are never propagated to a caller that could panic on
/// them — callers on the hot path match and drop. Control-plane failures are
/// turned into a `NEG_REPLY` carrying `to_string()` as the `errMsg`
/// attribute.
#[derive(Debug, Error)]
pub enum ForestError {
    #[error("packet store exhausted")]
    StoreExhausted,

    #[error("table conflict: {0}")]
    TableConflict(String),

    #[error("rate oversubscribed: {0}")]
    RateOversubscribed(String),

    #[error("unknown control type: {0}")]
    UnknownControlType(u8),

    #[error("startup invariant violated: {0}")]
    StartupInvariant(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),

    #[error("decoding error: {0}")]
    Decoding(#[from] rmp_serde::decode::Error),
}

pub type Result<T> = std::result::Result<T, ForestError>;
