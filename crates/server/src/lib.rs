//! Authoritative engine for colorfall: grid, players, movement checks, scoring and the
//! per-game session workers.

pub mod config;
pub mod error;
pub mod grid;
pub mod movement;
pub mod scoring;
pub mod server;

// Re-export commonly used types
pub use config::{Config, GameConfig, ServerConfig};
pub use error::{ConfigError, EngineError, JoinError, RegistryError, SessionError, SubmitError};
pub use server::{Game, GameRegistry, SessionHandle};
