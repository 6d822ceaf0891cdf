//! Shared protocol crate for colorfall.
//!
//! This crate contains:
//! - The tile palette (`WoolColor`) and coordinate type (`Position`)
//! - Game/round phase enums shared by the engine and its views
//! - Inbound client intents and outbound server events
//! - Read-only snapshot views handed to transports and status endpoints

mod error;
pub mod packets;

pub use error::ProtocolError;
pub use packets::*;

use serde::{Deserialize, Serialize};

/// Continuous player position. Integer floor (minus the origin offset) maps to a grid cell.
pub type Position = glam::DVec2;

/// Tile colors. `Air` is the empty sentinel left behind when a tile is removed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WoolColor {
    White = 0,
    Orange = 1,
    Magenta = 2,
    LightBlue = 3,
    Yellow = 4,
    Lime = 5,
    Pink = 6,
    Gray = 7,
    LightGray = 8,
    Cyan = 9,
    Purple = 10,
    Blue = 11,
    Brown = 12,
    Green = 13,
    Red = 14,
    Black = 15,
    Air = 16,
}

impl WoolColor {
    /// Every real color, in id order. Excludes `Air`.
    pub const PALETTE: [WoolColor; 16] = [
        WoolColor::White,
        WoolColor::Orange,
        WoolColor::Magenta,
        WoolColor::LightBlue,
        WoolColor::Yellow,
        WoolColor::Lime,
        WoolColor::Pink,
        WoolColor::Gray,
        WoolColor::LightGray,
        WoolColor::Cyan,
        WoolColor::Purple,
        WoolColor::Blue,
        WoolColor::Brown,
        WoolColor::Green,
        WoolColor::Red,
        WoolColor::Black,
    ];

    /// Numeric id used in map payloads.
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn is_empty(self) -> bool {
        matches!(self, WoolColor::Air)
    }
}

impl From<u8> for WoolColor {
    fn from(val: u8) -> Self {
        WoolColor::PALETTE
            .get(val as usize)
            .copied()
            .unwrap_or(WoolColor::Air)
    }
}

/// Top-level lifecycle of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GamePhase {
    PreGame,
    InGame,
    Settlement,
}

/// Phase within a single round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundPhase {
    ColorCall,
    Rush,
    EliminationCheck,
    Transition,
}

impl RoundPhase {
    /// Whether position updates are applied during this phase.
    pub const fn accepts_movement(self) -> bool {
        !matches!(self, RoundPhase::EliminationCheck)
    }
}

/// Why a position update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutOfBounds,
    TooFast,
    Teleport,
}

/// Per-player performance record, settled at game end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub rounds_survived: u32,
    pub total_distance: f64,
    /// Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_at: Option<u64>,
    /// Round in which the player was eliminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_in_round: Option<u32>,
    /// 1 = winner. Provisional until settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_position: Option<u32>,

    pub score: u32,
    pub survival_points: u32,
    pub elimination_bonus: u32,
    pub speed_bonus: u32,
    pub streak_bonus: u32,
    pub winner_bonus: u32,
    pub endurance_bonus: u32,

    pub current_streak: u32,
    pub longest_streak: u32,
    pub perfect_rounds: u32,
    /// Rolling mean in seconds over survived rounds. Tie-break only.
    pub average_response_time: f64,
}

impl PlayerStats {
    /// Recompute `score` from its additive components.
    pub fn recompute_score(&mut self) {
        self.score = self.survival_points
            + self.elimination_bonus
            + self.speed_bonus
            + self.streak_bonus
            + self.winner_bonus
            + self.endurance_bonus;
    }
}
