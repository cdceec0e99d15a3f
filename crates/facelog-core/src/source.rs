//! Match Source contract.
//!
//! A match source turns the current frame into at most one best candidate.
//! How frames are captured and how faces are compared is up to the
//! implementation; the recognition loop only sees [`MatchOutcome`]s.

use crate::types::MatchOutcome;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    /// Camera, spool or model not ready. The loop pauses and backs off.
    #[error("match source unavailable: {0}")]
    Unavailable(String),
    /// Decode or inference failure on this frame. The loop moves on to the next tick.
    #[error("match attempt failed: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Produces one match attempt per call.
pub trait MatchSource: Send + Sync + 'static {
    fn next_match(&self) -> impl Future<Output = Result<MatchOutcome, SourceError>> + Send;
}
