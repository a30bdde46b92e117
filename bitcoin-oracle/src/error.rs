use thiserror::Error;

/// Main error type for the bitcoin-oracle library.
///
/// Conditions under which no price can be produced (too little history, empty
/// histogram, price outside the sanity bounds) are not errors; they are
/// reported through [`BaselineStatus`](crate::BaselineStatus) and
/// [`EstimateStatus`](crate::EstimateStatus) on the result.
#[derive(Error, Debug)]
pub enum OracleError {
    /// Truncated or size-inconsistent transaction data.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid input parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error during calculation.
    #[error("Calculation error: {0}")]
    Calculation(String),

    /// A price sweep was abandoned because the window it was reading moved on.
    #[error("Estimation cancelled: window changed during sweep")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Type alias for Results in this library.
pub type Result<T> = std::result::Result<T, OracleError>;

impl OracleError {
    /// Creates a MalformedInput error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    /// Creates an InvalidConfig error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an InvalidParameter error.
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Creates a Calculation error.
    pub fn calculation(msg: impl Into<String>) -> Self {
        Self::Calculation(msg.into())
    }

    /// Returns true for errors caused by the shape of the input data rather
    /// than by the caller or the engine.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::MalformedInput(_) | Self::Serialization(_))
    }
}
