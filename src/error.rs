#![forbid(unsafe_code)]

//! Error taxonomy shared by the collaborators and the pipeline.
//!
//! Every error knows its [`ErrorClass`]: transient failures are retried,
//! item-level failures mark one video as failed, and systemic failures stop the
//! whole run because every following item would fail the same way.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Item,
    Systemic,
}

/// Implemented by every collaborator error so retry and the workers can decide
/// what to do without matching on concrete variants.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    fn is_systemic(&self) -> bool {
        self.class() == ErrorClass::Systemic
    }
}

/// Failures reported by a [`crate::source::VideoSource`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("video not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient download failure: {0}")]
    Transient(String),
    #[error("invalid download output: {0}")]
    Invalid(String),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::Invalid(_) => ErrorClass::Item,
            Self::RateLimited(_) | Self::Transient(_) => ErrorClass::Transient,
        }
    }
}

/// Failures reported by a [`crate::mediacms::UploadSink`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient upload failure: {0}")]
    Transient(String),
    #[error("upload rejected: {0}")]
    Rejected(String),
}

impl Classify for SinkError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) | Self::QuotaExceeded(_) => ErrorClass::Systemic,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Rejected(_) => ErrorClass::Item,
        }
    }
}

/// Failures reported by a [`crate::discovery::Discovery`] backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery API rejected the credentials: {0}")]
    Auth(String),
    #[error("discovery API quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("channel not found: {0}")]
    NotFound(String),
    #[error("transient discovery failure: {0}")]
    Transient(String),
    #[error("malformed discovery response: {0}")]
    Malformed(String),
}

impl Classify for DiscoveryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) | Self::QuotaExceeded(_) => ErrorClass::Systemic,
            Self::Transient(_) => ErrorClass::Transient,
            Self::NotFound(_) | Self::Malformed(_) => ErrorClass::Item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_retry_only_transient_kinds() {
        assert!(SourceError::RateLimited("429".into()).is_transient());
        assert!(SourceError::Transient("reset".into()).is_transient());
        assert_eq!(
            SourceError::NotFound("gone".into()).class(),
            ErrorClass::Item
        );
        assert_eq!(
            SourceError::Invalid("empty".into()).class(),
            ErrorClass::Item
        );
    }

    #[test]
    fn sink_auth_and_quota_are_systemic() {
        assert!(SinkError::Auth("401".into()).is_systemic());
        assert!(SinkError::QuotaExceeded("full".into()).is_systemic());
        assert!(!SinkError::Rejected("bad file".into()).is_systemic());
        assert!(SinkError::Transient("502".into()).is_transient());
    }

    #[test]
    fn discovery_quota_is_systemic() {
        assert!(DiscoveryError::QuotaExceeded("daily".into()).is_systemic());
        assert_eq!(
            DiscoveryError::NotFound("UCx".into()).class(),
            ErrorClass::Item
        );
    }
}
