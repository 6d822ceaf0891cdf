//! Server -> Client event building.

use crate::{GamePhase, PlayerStats, Position, ProtocolError, RejectReason, RoundPhase, WoolColor};
use serde::{Deserialize, Serialize};

/// Point-in-time copy of a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: u32,
    pub name: String,
    pub position: Position,
    pub is_spectator: bool,
    pub is_eliminated: bool,
    pub is_connected: bool,
    pub joined_round: u32,
    pub stats: PlayerStats,
}

/// Point-in-time copy of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundView {
    pub round_number: u32,
    pub phase: RoundPhase,
    pub color_to_show: WoolColor,
    /// Seconds.
    pub rush_duration: f64,
    /// Unix milliseconds.
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub eliminated_count: u32,
}

/// Read-only snapshot of a whole game, safe to hand to any reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameView {
    pub game_id: String,
    pub phase: GamePhase,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub round_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_round: Option<RoundView>,
    pub rounds: Vec<RoundView>,
    /// Row-major color ids, `map[y][x]`.
    pub map: Vec<Vec<u8>>,
    pub active_colors: Vec<WoolColor>,
    pub players: Vec<PlayerView>,
    pub player_count: u32,
    pub alive_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<f64>,
}

/// A single player's position, as fanned out to every client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerPosition {
    pub id: u32,
    pub position: Position,
}

/// Per-survivor scoring line in a round summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundScore {
    pub id: u32,
    pub points: u32,
    pub score: u32,
    pub streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
}

/// Outbound event. One case per notification kind; serialization is the transport's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full state, sent to a client right after it registers.
    GameState(Box<GameView>),
    PlayerJoined {
        player: PlayerView,
        player_count: u32,
    },
    PlayerLeft {
        id: u32,
        name: String,
        player_count: u32,
    },
    LobbyCountdown {
        seconds_remaining: f64,
        player_count: u32,
    },
    GameStarted {
        game_id: String,
        players: Vec<PlayerView>,
        map: Vec<Vec<u8>>,
    },
    RoundStarted {
        round: RoundView,
        map: Vec<Vec<u8>>,
        active_colors: Vec<WoolColor>,
    },
    PhaseChanged {
        round_number: u32,
        phase: RoundPhase,
        color_to_show: WoolColor,
    },
    CountdownTick {
        round_number: u32,
        phase: RoundPhase,
        remaining_seconds: f64,
    },
    PositionsUpdate {
        players: Vec<PlayerPosition>,
    },
    MapCollapsed {
        round_number: u32,
        color_to_show: WoolColor,
        removed_cells: u32,
        map: Vec<Vec<u8>>,
    },
    PlayersEliminated {
        round_number: u32,
        eliminated_players: Vec<PlayerView>,
        remaining_count: u32,
    },
    RoundFinished {
        round_number: u32,
        eliminated_count: u32,
        remaining_count: u32,
        scores: Vec<RoundScore>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_round_in: Option<f64>,
    },
    SettlementStarted {
        game_id: String,
        /// Everyone sharing the top rank; empty when nobody survived.
        winners: Vec<u32>,
    },
    GameEnded {
        game_id: String,
        total_rounds: u32,
        duration: f64,
        /// Ordered by final position.
        players: Vec<PlayerView>,
    },
    MovementRejected {
        reason: RejectReason,
        speed: f64,
        max_speed: f64,
        reset_position: Position,
    },
    GameCleanup {
        game_id: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::GameState(_) => "game_state",
            ServerEvent::PlayerJoined { .. } => "player_joined",
            ServerEvent::PlayerLeft { .. } => "player_left",
            ServerEvent::LobbyCountdown { .. } => "lobby_countdown",
            ServerEvent::GameStarted { .. } => "game_started",
            ServerEvent::RoundStarted { .. } => "round_started",
            ServerEvent::PhaseChanged { .. } => "phase_changed",
            ServerEvent::CountdownTick { .. } => "countdown_tick",
            ServerEvent::PositionsUpdate { .. } => "positions_update",
            ServerEvent::MapCollapsed { .. } => "map_collapsed",
            ServerEvent::PlayersEliminated { .. } => "players_eliminated",
            ServerEvent::RoundFinished { .. } => "round_finished",
            ServerEvent::SettlementStarted { .. } => "settlement_started",
            ServerEvent::GameEnded { .. } => "game_ended",
            ServerEvent::MovementRejected { .. } => "movement_rejected",
            ServerEvent::GameCleanup { .. } => "game_cleanup",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope() {
        let json = ServerEvent::MovementRejected {
            reason: RejectReason::TooFast,
            speed: 50.0,
            max_speed: 5.0,
            reset_position: Position::new(2.5, 3.5),
        }
        .to_json()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "movement_rejected");
        assert_eq!(value["data"]["reason"], "too_fast");
        assert_eq!(value["data"]["max_speed"], 5.0);
    }

    #[test]
    fn test_unit_event_has_no_data() {
        let json = ServerEvent::Pong.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
