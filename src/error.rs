use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifexError {
    #[error("A job is already running")]
    AlreadyRunning,

    #[error("No running job")]
    NotRunning,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to invoke {program}: {reason}")]
    Invocation { program: String, reason: String },

    #[error("Probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ArtifexError {
    pub fn invocation(program: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        ArtifexError::Invocation {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = ArtifexError> = std::result::Result<T, E>;
