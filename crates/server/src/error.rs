//! Engine error types.

use thiserror::Error;

/// Why a join was refused. Surfaced synchronously to the joining client; never mutates state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("A player named {0:?} already joined")]
    DuplicateName(String),

    #[error("Game is full ({0} players)")]
    GameFull(usize),

    #[error("Game has already started")]
    GameAlreadyStarted,

    #[error("Invalid player name")]
    InvalidName,
}

impl JoinError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            JoinError::DuplicateName(_) => "DUPLICATE_NAME",
            JoinError::GameFull(_) => "GAME_FULL",
            JoinError::GameAlreadyStarted => "GAME_ALREADY_STARTED",
            JoinError::InvalidName => "INVALID_NAME",
        }
    }
}

/// Errors handing work to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Session queue is full")]
    Backpressure,

    #[error("Session has shut down")]
    SessionClosed,
}

/// A join routed through a session: either the hand-off or the join itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Errors from the process-wide game registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Game {0} not found")]
    NotFound(String),

    #[error("Too many live games ({0})")]
    AtCapacity(usize),
}

/// Internal failures inside a session step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

/// Invalid game tuning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Grid must have at least one cell")]
    EmptyGrid,

    #[error("Invalid player bounds: min {min}, max {max}")]
    PlayerBounds { min: usize, max: usize },

    #[error("max_rounds must be at least 1")]
    NoRounds,

    #[error("{0} must be a finite, non-negative number of seconds")]
    InvalidDuration(&'static str),

    #[error("Timing progression is empty")]
    EmptyProgression,

    #[error("Invalid timing range {0}..={1}")]
    InvalidRange(u32, u32),

    #[error("Timing range starting at round {0} overlaps or is out of order")]
    OverlappingRanges(u32),

    #[error("Rush duration increases at round {0}")]
    IncreasingDuration(u32),

    #[error("Perfect bonus threshold must not exceed the speed bonus threshold")]
    BonusThresholds,

    #[error("Speed limit must be positive with a tolerance of at least 1.0")]
    SpeedLimit,

    #[error("Palette floor {0} must be between 2 and 16")]
    PaletteFloor(usize),
}
