// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

use tokio::sync::AcquireError;

/// Reason an annotation or image was rejected during preparation.
///
/// Validation failures are soft: the preparation loop logs them and moves on
/// to the next object, they never abort a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The annotation bytes are not UTF-8 encoded JSON.
    MalformedJson(String),
    /// The annotation parsed but does not satisfy the record schema.
    Schema(String),
    /// The image bytes could not be decoded or failed the integrity check.
    CorruptImage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MalformedJson(s) => write!(f, "malformed annotation JSON: {}", s),
            ValidationError::Schema(s) => write!(f, "annotation schema violation: {}", s),
            ValidationError::CorruptImage(s) => write!(f, "corrupt image: {}", s),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Error type for every datalake client operation.
///
/// The variants follow the failure taxonomy of the pipeline: connectivity
/// problems are fatal, validation problems are recovered locally, copy
/// failures after validation are escalated, and missing or gated resources
/// are reported distinctly so callers can react (e.g. prompt for a token).
#[derive(Debug)]
pub enum Error {
    /// Storage endpoint or registry is unreachable, or a call timed out.
    Connectivity(String),
    /// A storage operation failed for a reason other than connectivity.
    Storage {
        /// Storage operation that failed (e.g. `get_object`).
        operation: &'static str,
        /// Underlying failure reported by the service or transport.
        message: String,
    },
    /// An annotation or image was rejected.
    Validation(ValidationError),
    /// Copying a validated pair into the dataset failed.
    Copy {
        /// Source object (`bucket/object`).
        source_object: String,
        /// Destination object (`bucket/object`).
        destination: String,
        /// Half of the pair that already landed in the dataset, if any.
        orphan: Option<String>,
        /// Failure reported by the store.
        cause: Box<Error>,
    },
    /// Referenced dataset, bucket or object does not exist.
    NotFound(String),
    /// The registry requires credentials that were not supplied.
    GatedAccess(String),
    /// The registry knows the dataset but cannot serve it.
    NotAvailable(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// One or more bulk upload tasks failed.
    UploadFailed {
        /// Number of failed items.
        failed: usize,
        /// Number of scheduled items.
        total: usize,
    },
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// HTTP request error from the reqwest client.
    HttpError(reqwest::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// URL parsing error.
    UrlParseError(url::ParseError),
    /// Async task join error.
    JoinError(tokio::task::JoinError),
    /// Semaphore acquisition error for concurrent operations.
    SemaphoreError(AcquireError),
    /// Image encoding or decoding error.
    ImageError(image::ImageError),
    /// Directory traversal error.
    WalkDirError(walkdir::Error),
    /// Path prefix stripping error.
    StripPrefixError(std::path::StripPrefixError),
}

impl Error {
    /// Returns true for failures that indicate the storage or registry
    /// cannot be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Connectivity(_) => true,
            Error::HttpError(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// Returns true if the error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Connectivity(err.to_string())
        } else {
            Error::HttpError(err)
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::JoinError(err)
    }
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        Error::SemaphoreError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::WalkDirError(err)
    }
}

impl From<std::path::StripPrefixError> for Error {
    fn from(err: std::path::StripPrefixError) -> Self {
        Error::StripPrefixError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connectivity(s) => write!(f, "Connectivity error: {}", s),
            Error::Storage { operation, message } => {
                write!(f, "Storage error during {}: {}", operation, message)
            }
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Copy {
                source_object,
                destination,
                orphan,
                cause,
            } => {
                write!(
                    f,
                    "Copy error: {} -> {}: {}",
                    source_object, destination, cause
                )?;
                if let Some(orphan) = orphan {
                    write!(f, " (orphaned object: {})", orphan)?;
                }
                Ok(())
            }
            Error::NotFound(s) => write!(f, "Not found: {}", s),
            Error::GatedAccess(s) => write!(f, "Gated access: {}", s),
            Error::NotAvailable(s) => write!(f, "Not available: {}", s),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::UploadFailed { failed, total } => {
                write!(f, "Upload failed for {} of {} items", failed, total)
            }
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::HttpError(e) => write!(f, "HTTP error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::JoinError(e) => write!(f, "Task join error: {}", e),
            Error::SemaphoreError(e) => write!(f, "Semaphore error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::WalkDirError(e) => write!(f, "Directory walk error: {}", e),
            Error::StripPrefixError(e) => write!(f, "Path prefix error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Validation(e) => Some(e),
            Error::Copy { cause, .. } => Some(cause.as_ref()),
            Error::IoError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            Error::JoinError(e) => Some(e),
            Error::SemaphoreError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::WalkDirError(e) => Some(e),
            Error::StripPrefixError(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_error_display_names_orphan() {
        let err = Error::Copy {
            source_object: "sources/cats/images/a.png".to_owned(),
            destination: "datasets/01/train/images/a.png".to_owned(),
            orphan: Some("datasets/01/train/annotations/a.json".to_owned()),
            cause: Box::new(Error::Connectivity("connection reset".to_owned())),
        };
        let text = err.to_string();
        assert!(text.contains("sources/cats/images/a.png"));
        assert!(text.contains("orphaned object: datasets/01/train/annotations/a.json"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Connectivity("down".to_owned()).is_connectivity());
        assert!(!Error::NotFound("x".to_owned()).is_connectivity());
        assert!(Error::NotFound("x".to_owned()).is_not_found());
        assert!(!Error::GatedAccess("x".to_owned()).is_not_found());
    }
}
