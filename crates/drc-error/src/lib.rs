#![forbid(unsafe_code)]
//! Error types for the duplicate request cache.
//!
//! # Error Taxonomy
//!
//! The cache distinguishes three outcomes that are not "the request was
//! handled normally":
//!
//! | Outcome | Representation | Caller action |
//! |---------|----------------|---------------|
//! | Cache could not be engaged | `DrcError::CacheUnavailable` | Execute the request uncached |
//! | Bad configuration | `InvalidConfig` / `UnknownKey` / `InvalidValue` | Refuse to start |
//! | Identical request already executing | `StartOutcome::BeingProcessed` (`drc-core`) | Send nothing |
//! | Broken internal invariant | `panic!` after an `error!` event | None (fail-stop) |
//!
//! `BeingProcessed` is a control signal, not an error, and lives next to the
//! other start outcomes in `drc-core`.
//!
//! ## Degradation Policy
//!
//! Only [`DrcError::CacheUnavailable`] is degradable: the transport executes
//! the request without duplicate suppression, which is the same risk profile
//! as running with the cache disabled. Configuration errors surface at
//! startup and are never retried.
//!
//! ## Invariant Violations
//!
//! Reference-count underflow, a deleted entry still reachable from an index,
//! or a second cache attached to one connection are logic errors. They are
//! not represented here: continuing to operate on such a cache could replay
//! a response to the wrong request.

use thiserror::Error;

/// Unified error type for duplicate request cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrcError {
    /// The cache could not be engaged for this request.
    ///
    /// Raised when allocating a cache or its partitions fails, when the
    /// subsystem has been shut down, or when a parked cache could not be
    /// revived within the bounded spin.
    #[error("duplicate request cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    /// A configuration field failed validation.
    #[error("invalid DRC configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A `DRC_*` core parameter this build does not recognise.
    #[error("unknown DRC parameter: {0}")]
    UnknownKey(String),

    /// A core parameter whose value could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

impl DrcError {
    /// Build a [`DrcError::CacheUnavailable`] from any displayable reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            reason: reason.into(),
        }
    }

    /// Whether the caller may fall back to uncached execution.
    ///
    /// The match is exhaustive so a new variant must pick a side.
    #[must_use]
    pub fn is_degradable(&self) -> bool {
        match self {
            Self::CacheUnavailable { .. } => true,
            Self::InvalidConfig { .. } | Self::UnknownKey(_) | Self::InvalidValue { .. } => false,
        }
    }
}

/// Result alias using `DrcError`.
pub type Result<T> = std::result::Result<T, DrcError>;
