//! Error types for the ingest pipeline.

use thiserror::Error;

/// Errors surfaced by the ingest core.
///
/// Transient conditions (ring timeouts, out-of-window packets) never appear
/// here; they are handled in place and reported through status counters.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The output block ring was closed while the ingest still needed it.
    /// Anything other than a timeout from the ring is fatal to the thread.
    #[error("block ring closed")]
    RingClosed,

    /// The packet source failed in a way that is not a timeout.
    #[error("packet source failed: {0}")]
    Source(String),

    /// Socket or thread setup failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The status buffer does not describe a usable observation.
    #[error("invalid observation parameters: {0}")]
    ObsInfo(String),

    /// A destination spec (`A.B.C.D` or `A.B.C.D+N`) failed to parse.
    #[error("invalid destination spec '{spec}': {reason}")]
    DestSpec { spec: String, reason: String },

    /// Cancellation was requested while waiting on a ring.
    #[error("cancelled")]
    Cancelled,
}
