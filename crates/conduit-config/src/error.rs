//! Errors from loading and editing the config file.

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading, validating, or persisting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to write a config file.
    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Two descriptors share a name.
    #[error("duplicate server name '{name}'")]
    DuplicateName { name: String },

    /// No descriptor with this name.
    #[error("server '{name}' not found")]
    NotFound { name: String },

    /// A transport-required field is absent.
    #[error("missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    /// A field is present but unusable.
    #[error("invalid value for '{field}' in {context}: {reason}")]
    InvalidValue {
        field: String,
        context: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn missing(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid(
        field: impl Into<String>,
        context: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            context: context.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::duplicate("alpha");
        assert_eq!(err.to_string(), "duplicate server name 'alpha'");

        let err = ConfigError::missing("command", "server 'beta'");
        assert!(err.to_string().contains("command"));
        assert!(err.to_string().contains("server 'beta'"));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("not = [valid").unwrap_err();
        let err: ConfigError = toml_err.into();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
