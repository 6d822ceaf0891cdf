//! Player records and the per-game player registry.

use crate::error::JoinError;
use crate::movement::MoveSample;
use protocol::{PlayerStats, PlayerView, Position};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Player identity, unique within a game. Assigned in join order.
pub type PlayerId = u32;

/// Longest accepted display name, in characters.
pub const MAX_NAME_LENGTH: usize = 24;

/// A player in a game.
#[derive(Debug, Clone)]
pub struct Player {
    /// Unique player ID.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Authoritative position.
    pub position: Position,
    pub is_eliminated: bool,
    pub is_spectator: bool,
    /// Cleared when the transport reports a disconnect mid-game.
    pub is_connected: bool,
    /// Round the player joined in (1 for everyone who was there at the start).
    pub joined_round: u32,
    /// Last time any intent arrived from this player.
    pub last_update: Instant,
    /// Last accepted move; the rollback target.
    pub last_valid: Option<MoveSample>,
    /// Latest move refused live, kept for the lag-compensated re-check.
    pub disputed: Option<MoveSample>,
    /// Time from rush start to the last accepted move onto the target color, this round.
    pub round_response: Option<Duration>,
    pub stats: PlayerStats,
}

impl Player {
    /// Create a new player record.
    pub fn new(id: PlayerId, name: String, joined_round: u32, is_spectator: bool, now: Instant) -> Self {
        Self {
            id,
            name,
            position: Position::ZERO,
            is_eliminated: false,
            is_spectator,
            is_connected: true,
            joined_round,
            last_update: now,
            last_valid: None,
            disputed: None,
            round_response: None,
            stats: PlayerStats::default(),
        }
    }

    /// Still competing: not a spectator and not eliminated.
    pub fn is_alive(&self) -> bool {
        !self.is_spectator && !self.is_eliminated
    }

    /// Update activity timestamp.
    pub fn touch(&mut self, now: Instant) {
        self.last_update = now;
    }

    /// Place the player and make the spot the rollback target.
    pub fn place(&mut self, position: Position, now: Instant) {
        self.position = position;
        self.last_valid = Some(MoveSample::new(position, now));
        self.disputed = None;
    }

    /// Where a rejected move rolls back to.
    pub fn last_valid_position(&self) -> Position {
        self.last_valid.map(|sample| sample.position).unwrap_or(self.position)
    }

    /// Point-in-time copy for external readers.
    pub fn view(&self) -> PlayerView {
        PlayerView {
            id: self.id,
            name: self.name.clone(),
            position: self.position,
            is_spectator: self.is_spectator,
            is_eliminated: self.is_eliminated,
            is_connected: self.is_connected,
            joined_round: self.joined_round,
            stats: self.stats.clone(),
        }
    }
}

/// All players of one game, indexed by identity and iterated in join order.
#[derive(Debug, Clone)]
pub struct PlayerRegistry {
    players: BTreeMap<PlayerId, Player>,
    next_id: PlayerId,
    alive_count: usize,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            players: BTreeMap::new(),
            next_id: 1,
            alive_count: 0,
        }
    }

    /// Register a player. Names must be unique within the game.
    pub fn add(
        &mut self,
        name: &str,
        is_spectator: bool,
        joined_round: u32,
        now: Instant,
    ) -> Result<&Player, JoinError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
            return Err(JoinError::InvalidName);
        }
        if self.players.values().any(|p| p.name == name) {
            return Err(JoinError::DuplicateName(name.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let player = Player::new(id, name.to_string(), joined_round, is_spectator, now);
        if player.is_alive() {
            self.alive_count += 1;
        }
        Ok(self.players.entry(id).or_insert(player))
    }

    /// Drop a player entirely. Only a still-alive contender lowers the alive count.
    pub fn remove(&mut self, id: PlayerId) -> Option<Player> {
        let player = self.players.remove(&id)?;
        if player.is_alive() {
            self.alive_count -= 1;
        }
        Some(player)
    }

    /// Flag a player as eliminated. Returns `false` when there was nothing to do.
    pub fn mark_eliminated(&mut self, id: PlayerId) -> bool {
        match self.players.get_mut(&id) {
            Some(player) if player.is_alive() => {
                player.is_eliminated = true;
                self.alive_count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Mutable iteration. Must not be used to flip `is_eliminated`; use `mark_eliminated`.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.values_mut()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Non-spectators, eliminated or not.
    pub fn contender_count(&self) -> usize {
        self.players.values().filter(|p| !p.is_spectator).count()
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.is_connected).count()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// Alive count recomputed from the records.
    pub fn counted_alive(&self) -> usize {
        self.players.values().filter(|p| p.is_alive()).count()
    }

    pub fn views(&self) -> Vec<PlayerView> {
        self.players.values().map(Player::view).collect()
    }
}
