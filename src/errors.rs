use thiserror::Error;

/// Error types for the recommendation pipeline
///
/// Fatal errors carry the name of the offending rule or filter, the number of
/// affected rows where known, and a remediation hint in the message. Stages
/// are the unit of recovery: a fatal error aborts the current stage and the
/// caller reruns it with corrected inputs or looser thresholds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoError {
    /// Input data failed a quality gate: missing required column, empty
    /// table, or an all-filtered result
    #[error("Data quality error: {message}")]
    DataQuality { message: String },

    /// An arithmetic invariant was violated (confidence > 1, pair_freq >
    /// product_freq, ...) — indicates a sessionization or join bug upstream
    #[error("Invariant violation: {message}")]
    Invariant { message: String },

    /// Misconfigured thresholds or weights with no safe default
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Model training, persistence or cold-start scoring errors
    #[error("Model error: {message}")]
    Model { message: String },

    /// Serialization/deserialization errors for tables and artifacts
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Filesystem errors from the artifact store
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl RecoError {
    /// Create a new data quality error
    pub fn data_quality<S: Into<String>>(message: S) -> Self {
        Self::DataQuality {
            message: message.into(),
        }
    }

    /// Create a new invariant violation error
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(message: S) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

/// Result type alias for pipeline operations
pub type RecoResult<T> = Result<T, RecoError>;

// Implement conversions from common error types
impl From<serde_json::Error> for RecoError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}

impl From<csv::Error> for RecoError {
    fn from(err: csv::Error) -> Self {
        Self::serialization(format!("CSV error: {}", err))
    }
}

impl From<std::io::Error> for RecoError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

impl From<config::ConfigError> for RecoError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(format!("{}", err))
    }
}
