//! Game sessions and the process-wide registry of live games.

use crate::config::{GameConfig, ServerConfig};
use crate::error::{ConfigError, RegistryError};
use protocol::GameView;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod game;
pub mod player;
pub mod session;

pub use game::{Game, Outgoing, Recipient};
pub use player::{Player, PlayerId, PlayerRegistry};
pub use session::{ClientSender, Command, Session, SessionHandle};

/// Live games by id. The lock only guards the handle map; gameplay never runs under it.
#[derive(Clone)]
pub struct GameRegistry {
    games: Arc<RwLock<HashMap<String, SessionHandle>>>,
    server: ServerConfig,
    game: GameConfig,
}

impl GameRegistry {
    /// Fails if `game` would break the engine; every session is created from it.
    pub fn new(server: ServerConfig, game: GameConfig) -> Result<Self, ConfigError> {
        game.validate()?;
        Ok(Self {
            games: Arc::new(RwLock::new(HashMap::new())),
            server,
            game,
        })
    }

    /// Start a new game session under a fresh six-digit id.
    pub async fn create(&self) -> Result<SessionHandle, RegistryError> {
        let mut games = self.games.write().await;
        if games.len() >= self.server.max_games {
            warn!("Refusing new game: {} games live", games.len());
            return Err(RegistryError::AtCapacity(self.server.max_games));
        }

        let mut rng = rand::rng();
        let id = loop {
            let candidate = rng.random_range(100_000..1_000_000u32).to_string();
            if !games.contains_key(&candidate) {
                break candidate;
            }
        };

        let game = Game::new(id.clone(), self.game.clone(), rng.random(), Instant::now());
        let (handle, task) = Session::spawn(game, &self.server);
        games.insert(id.clone(), handle.clone());
        info!("Created game {} ({} live)", id, games.len());

        // Forget the game once its worker exits.
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!("Session for game {} ended abnormally: {}", id, e);
            }
            registry.games.write().await.remove(&id);
            info!("Game {} removed from registry", id);
        });

        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<SessionHandle, RegistryError> {
        self.games
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Read-only copy of a game's state.
    pub async fn snapshot(&self, id: &str) -> Result<GameView, RegistryError> {
        Ok(self.get(id).await?.snapshot())
    }

    /// Stop a game and forget it.
    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        let handle = self.games.write().await.remove(id)?;
        if handle.shutdown().is_err() {
            warn!("Game {} did not take the shutdown request", id);
        }
        Some(handle)
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }
}
