//! Core data model.
//!
//! A key identifies a unit of work. A submission is one request to process a
//! key, and every submission ends in exactly one outcome.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ProcessingFailed};

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Anything that can be dispatched: equality and hash define the exclusion
/// class, `Debug` is used for log records.
///
/// Implemented for every type meeting the bounds.
pub trait Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Submission identity
// ---------------------------------------------------------------------------

/// Newtype for submission IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What happened to a submitted key.
#[derive(Debug)]
pub enum Outcome<K: fmt::Debug> {
    /// The processor accepted the key.
    Processed {
        id: SubmissionId,
        key: K,
        submitted_at: DateTime<Utc>,
        duration_ms: u64,
    },
    /// The key was not processed.
    Failed {
        id: SubmissionId,
        failure: ProcessingFailed<K>,
        submitted_at: DateTime<Utc>,
        duration_ms: u64,
    },
}

impl<K: fmt::Debug> Outcome<K> {
    pub fn id(&self) -> SubmissionId {
        match self {
            Outcome::Processed { id, .. } | Outcome::Failed { id, .. } => *id,
        }
    }

    pub fn key(&self) -> &K {
        match self {
            Outcome::Processed { key, .. } => key,
            Outcome::Failed { failure, .. } => &failure.key,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, Outcome::Processed { .. })
    }

    /// The failure cause, if the key was not processed.
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Outcome::Processed { .. } => None,
            Outcome::Failed { failure, .. } => Some(&failure.cause),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Outcome::Processed { duration_ms, .. } | Outcome::Failed { duration_ms, .. } => {
                *duration_ms
            }
        }
    }

    /// Label for logs and metrics: "processed" or "failed".
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Processed { .. } => "processed",
            Outcome::Failed { .. } => "failed",
        }
    }
}
