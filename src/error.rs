/// Error taxonomy for the command engine and the state store.
///
/// User-facing failures are always rendered to text by the engine; nothing in
/// the command path is allowed to take the host process down.
use thiserror::Error;

/// Malformed command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unexpected EOF while looking for matching `{0}'")]
    UnterminatedQuote(char),

    #[error("`{0}' is not supported in this shell")]
    UnsupportedOperator(String),

    #[error("invalid option `{0}'")]
    InvalidFlag(String),
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("syntax error: {0}")]
    Parse(#[from] ParseError),

    #[error("{0}: command not found")]
    UnknownCommand(String),

    /// Target node/GPU/port absent. Carries tool-specific wording.
    #[error("{0}")]
    NotFound(String),

    /// Recognised command with arguments the tool would reject.
    #[error("{0}")]
    Usage(String),

    /// A view of the cluster contradicts the canonical health derivation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("import rejected: {0}")]
    Import(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

impl SimError {
    /// Exit status used when this error reaches the terminal.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Parse(_) => 2,
            SimError::UnknownCommand(_) => 127,
            SimError::NotFound(_) => 1,
            SimError::Usage(_) => 2,
            SimError::InvariantViolation(_) => 70,
            SimError::Import(_) | SimError::Serde(_) | SimError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_renders_like_bash() {
        let err = SimError::UnknownCommand("nvidia-smu".into());
        assert_eq!(err.to_string(), "nvidia-smu: command not found");
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn parse_errors_convert() {
        let err: SimError = ParseError::UnterminatedQuote('"').into();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("matching `\"'"));
    }
}
