use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("{field}: invalid duration '{value}' ({source})")]
    Duration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
