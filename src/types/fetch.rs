//! Resilient fetch types

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// One source a resilient load may be served from.
///
/// `order` defines the failover sequence; lower goes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCandidate {
    pub source_ref: String,
    pub order: u32,
}

impl FetchCandidate {
    pub fn new(source_ref: impl Into<String>, order: u32) -> Self {
        Self {
            source_ref: source_ref.into(),
            order,
        }
    }

    /// Build an ordered candidate list from sources, in the order given.
    pub fn ordered<I, S>(sources: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        sources
            .into_iter()
            .zip(0u32..)
            .map(|(source, order)| Self::new(source, order))
            .collect()
    }
}

/// Lifecycle state of a fetch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    #[default]
    Idle,
    Attempting,
    Ready,
    Exhausted,
    /// Cancelled by the caller; the session is inert.
    Cancelled,
}

impl FetchState {
    /// Whether the session will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FetchState::Ready | FetchState::Exhausted | FetchState::Cancelled
        )
    }
}

/// Diagnostics for one candidate that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub candidate: FetchCandidate,
    /// Retries performed after the first attempt.
    pub retries: u32,
    pub last_error: SyncError,
}
