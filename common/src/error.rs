//! Error handling for the terasort-common crate.

use thiserror::Error;

/// Error type for the storage and compression layers.
///
/// Every variant carries a human readable message and an optional source
/// so that object-store and codec failures keep their full chain.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Storage operation failed: {message}")]
    StorageError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Object not found: {message}")]
    NotFoundError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Segmented write rejected: {message}")]
    SegmentError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Compression failed: {message}")]
    CompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Decompression failed: {message}")]
    DecompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Error severity levels for categorizing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The operation failed but a retry may succeed.
    Low,
    /// The operation must be aborted; the job can report and stop cleanly.
    High,
    /// Data integrity is at risk.
    Critical,
}

/// Error category for grouping related error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Object store and transport errors.
    Infrastructure,
    /// Encoding, compression and integrity errors.
    DataProcessing,
    /// Configuration and setup errors.
    Configuration,
}

/// Error diagnostics consumed by retry policies.
pub trait Diagnose {
    /// Get the error severity level.
    fn severity(&self) -> ErrorSeverity;

    /// Get the error category.
    fn category(&self) -> ErrorCategory;

    /// Check if the error is retryable.
    fn is_retryable(&self) -> bool;
}

macro_rules! error_constructors {
    ($($variant:ident => $plain:ident, $with_source:ident;)*) => {
        impl CommonError {
            $(
                #[doc = concat!("Create a `", stringify!($variant), "` with a custom message.")]
                pub fn $plain<S: Into<String>>(message: S) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: None,
                    }
                }

                #[doc = concat!("Create a `", stringify!($variant), "` with a message and source error.")]
                pub fn $with_source<S: Into<String>, E: Into<anyhow::Error>>(
                    message: S,
                    source: E,
                ) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: Some(source.into()),
                    }
                }
            )*
        }
    };
}

error_constructors! {
    StorageError => storage_error, storage_error_with_source;
    NotFoundError => not_found_error, not_found_error_with_source;
    SegmentError => segment_error, segment_error_with_source;
    ConfigurationError => configuration_error, configuration_error_with_source;
    CompressionError => compression_error, compression_error_with_source;
    DecompressionError => decompression_error, decompression_error_with_source;
}

impl CommonError {
    /// The bare message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            CommonError::StorageError { message, .. }
            | CommonError::NotFoundError { message, .. }
            | CommonError::SegmentError { message, .. }
            | CommonError::ConfigurationError { message, .. }
            | CommonError::CompressionError { message, .. }
            | CommonError::DecompressionError { message, .. } => message,
        }
    }
}

impl Diagnose for CommonError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            CommonError::StorageError { .. } => ErrorSeverity::Low,
            CommonError::NotFoundError { .. } => ErrorSeverity::High,
            CommonError::SegmentError { .. } => ErrorSeverity::Critical,
            CommonError::ConfigurationError { .. } => ErrorSeverity::High,
            CommonError::CompressionError { .. } => ErrorSeverity::High,
            CommonError::DecompressionError { .. } => ErrorSeverity::Critical,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            CommonError::StorageError { .. }
            | CommonError::NotFoundError { .. }
            | CommonError::SegmentError { .. } => ErrorCategory::Infrastructure,
            CommonError::CompressionError { .. }
            | CommonError::DecompressionError { .. } => ErrorCategory::DataProcessing,
            CommonError::ConfigurationError { .. } => ErrorCategory::Configuration,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, CommonError::StorageError { .. })
    }
}
