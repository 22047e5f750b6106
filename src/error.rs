//! Error types for the Symphony operator

use thiserror::Error;

/// Main error type for Symphony operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for Migration specs or work-queue keys
    #[error("validation error: {0}")]
    Validation(String),

    /// Release backend rejected or failed an operation
    #[error("release error [{release}]: {message}")]
    Release {
        /// Name of the release the operation targeted
        release: String,
        /// Description of what failed
        message: String,
    },

    /// Release backend reports the release does not exist
    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Informer caches did not sync before the startup deadline
    #[error("cache sync error: {0}")]
    CacheSync(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a release backend error for the named release
    pub fn release(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Release {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the named release
    pub fn release_not_found(release: impl Into<String>) -> Self {
        Self::ReleaseNotFound(release.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cache sync error with the given message
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the error means "the thing does not exist"
    ///
    /// Covers both a missing release and a Kubernetes 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ReleaseNotFound(_) => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is worth retrying
    ///
    /// Validation and serialization errors need a spec change first.
    pub fn is_retryable(&self) -> bool {
        match self {
            // the object is gone; anything else the API rejects may pass later
            Error::Kube(source) => !matches!(source, kube::Error::Api(ae) if ae.code == 404),
            Error::Validation(_) => false,
            Error::Release { .. } => true,
            Error::ReleaseNotFound(_) => false,
            Error::Serialization(_) => false,
            Error::CacheSync(_) => false,
            Error::Internal(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: backend failures carry the release name so events are actionable
    #[test]
    fn story_release_errors_name_the_release() {
        let err = Error::release("demo-blue", "connection refused");
        assert!(err.to_string().contains("demo-blue"));
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }

    /// Story: a missing release is an expected outcome, not a failure
    #[test]
    fn story_release_not_found_is_distinguishable() {
        let err = Error::release_not_found("demo-green");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "release not found: demo-green");
    }

    #[test]
    fn test_kube_404_is_not_found() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
    }

    #[test]
    fn test_kube_retryability() {
        assert!(api_error(500).is_retryable());
        // resourceVersion conflicts on status writes resolve on the next pass
        assert!(api_error(409).is_retryable());
        assert!(!api_error(404).is_retryable());
    }

    /// Story: a status write rejected by admission is retried with backoff
    #[test]
    fn story_rejected_status_write_is_retried() {
        assert!(api_error(422).is_retryable());
        assert!(api_error(403).is_retryable());
    }

    #[test]
    fn test_validation_is_permanent() {
        let err = Error::validation("app name must be specified");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("validation error"));
    }

    #[test]
    fn test_cache_sync_message() {
        let err = Error::cache_sync("timed out after 60s");
        assert_eq!(err.to_string(), "cache sync error: timed out after 60s");
        assert!(!err.is_retryable());
    }
}
