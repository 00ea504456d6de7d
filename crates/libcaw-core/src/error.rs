use thiserror::Error;

/// Main error type for caw operations
#[derive(Debug, Error)]
pub enum CawError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("local service error: {0}")]
    Ipc(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CawError {
    /// Get the error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            CawError::InvalidArgs(_) => "invalid_args",
            CawError::NotFound(_) => "not_found",
            CawError::Io(_) => "io_error",
            CawError::Json(_) => "internal_error",
            CawError::TomlParse(_) => "invalid_args",
            CawError::TomlSerialize(_) => "internal_error",
            CawError::Ipc(_) => "ipc_error",
            CawError::Internal(_) => "internal_error",
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            CawError::InvalidArgs(_) => 2,
            CawError::NotFound(_) => 3,
            CawError::Io(_) => 5,
            CawError::TomlParse(_) => 2,
            CawError::Ipc(_) => 6,
            _ => 1,
        }
    }

    /// Get actionable suggestions for fixing the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            CawError::Ipc(msg) if msg.contains("timed out") => vec![
                "Check that the Code Awareness local service is running",
                "Or raise request_timeout_ms in the caw config",
            ],
            CawError::Ipc(_) => vec!["Check that the Code Awareness local service is running"],
            CawError::TomlParse(_) => vec!["Fix the syntax of the caw config.toml"],
            _ => vec![],
        }
    }
}
