//! Error types for the offer engine.

use thiserror::Error;

/// Errors surfaced by the offer cache.
#[derive(Debug, Error)]
pub enum MarketError {
    /// The bootstrap snapshot carried no offer list at all.
    #[error("could not read offer data from Vast.ai")]
    NoInitialData,

    /// A response payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
