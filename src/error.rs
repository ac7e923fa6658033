use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    /// Fatal at device-open time; the acquisition does not start.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Recoverable at tick granularity; the scheduler skips the tick's data.
    #[error("transport fault: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported configuration key: {0}")]
    ConfigKey(String),

    #[error("invalid value for {key}: {reason}")]
    ConfigValue { key: String, reason: String },

    #[error("acquisition already running")]
    Busy,
}
