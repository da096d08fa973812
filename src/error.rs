use thiserror::Error;

use crate::pipeline::state::RunState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing branch parameters, unknown branch, bad config file
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Branch already attached: {0}")]
    AlreadyAttached(String),

    #[error("State transition to {target} failed (reached {reached}, pending {pending:?})")]
    StateTransition {
        target: RunState,
        reached: RunState,
        pending: Option<RunState>,
    },

    #[error("Link error: {0}")]
    Link(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Control loop is gone")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Configuration(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn link<E: std::fmt::Display>(e: E) -> Self {
        Self::Link(e.to_string())
    }

    pub fn stage<E: std::fmt::Display>(e: E) -> Self {
        Self::Stage(e.to_string())
    }

    /// Errors that end the current pipeline run rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StateTransition { .. } | Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::StateTransition {
            target: RunState::Paused,
            reached: RunState::Running,
            pending: Some(RunState::Paused),
        };
        assert_eq!(
            err.to_string(),
            "State transition to Paused failed (reached Running, pending Some(Paused))"
        );
        assert!(err.is_fatal());
        assert!(!Error::AlreadyAttached("live".into()).is_fatal());
        assert_eq!(
            Error::config("missing placeholder").to_string(),
            "Configuration error: missing placeholder"
        );
    }
}
