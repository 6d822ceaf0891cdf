//! Server configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub game: GameConfig,
}

impl Config {
    /// Load configuration from `config.toml` or use defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Path::new("config.toml");
        let config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            info!("No config.toml found, creating default config");
            let default_config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&default_config)?)?;
            default_config
        };
        config.game.validate()?;
        Ok(config)
    }
}

/// Server networking and process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Session tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Inbound queue depth per session. A full queue rejects with backpressure.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,
    /// Outbound frames buffered per client before it is dropped as unresponsive.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    /// Maximum live games in this process.
    #[serde(default = "default_max_games")]
    pub max_games: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            tick_interval_ms: default_tick_interval(),
            command_queue_capacity: default_command_queue_capacity(),
            client_buffer: default_client_buffer(),
            max_games: default_max_games(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_tick_interval() -> u64 {
    50
}
fn default_command_queue_capacity() -> usize {
    256
}
fn default_client_buffer() -> usize {
    64
}
fn default_max_games() -> usize {
    100
}

/// Per-game tuning. Copied into each game at creation and never mutated afterward.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GameConfig {
    #[serde(default = "default_map_size")]
    pub map_width: usize,
    #[serde(default = "default_map_size")]
    pub map_height: usize,
    #[serde(default = "default_min_players")]
    pub min_players: usize,
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Seconds between reaching `min_players` and the start of the game.
    #[serde(default = "default_lobby_wait")]
    pub lobby_wait_secs: f64,
    /// A lobby nobody has joined is torn down after this many seconds.
    #[serde(default = "default_idle_lobby")]
    pub idle_lobby_secs: f64,
    /// Late joiners become spectators instead of being refused.
    #[serde(default = "default_allow_late_spectators")]
    pub allow_late_spectators: bool,
    /// Round cap. Reaching it with several survivors settles by tie-break.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub movement: MovementConfig,
    #[serde(default)]
    pub palette: PaletteConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            map_width: default_map_size(),
            map_height: default_map_size(),
            min_players: default_min_players(),
            max_players: default_max_players(),
            lobby_wait_secs: default_lobby_wait(),
            idle_lobby_secs: default_idle_lobby(),
            allow_late_spectators: default_allow_late_spectators(),
            max_rounds: default_max_rounds(),
            timing: TimingConfig::default(),
            scoring: ScoringConfig::default(),
            movement: MovementConfig::default(),
            palette: PaletteConfig::default(),
        }
    }
}

fn default_map_size() -> usize {
    20
}
fn default_min_players() -> usize {
    2
}
fn default_max_players() -> usize {
    16
}
fn default_lobby_wait() -> f64 {
    10.0
}
fn default_idle_lobby() -> f64 {
    300.0
}
fn default_allow_late_spectators() -> bool {
    true
}
fn default_max_rounds() -> u32 {
    25
}

impl GameConfig {
    /// Rush window for a round: table lookup, clamped to the last entry and to the floor.
    pub fn rush_duration(&self, round: u32) -> Duration {
        // Ranges are sorted, so the last one starting at or before `round` applies;
        // this also clamps rounds past the table to its final entry.
        let secs = self
            .timing
            .progression
            .iter()
            .rev()
            .find(|range| range.start_round <= round)
            .or_else(|| self.timing.progression.first())
            .map(|range| range.duration)
            .unwrap_or(self.timing.min_rush_secs);
        Duration::try_from_secs_f64(secs.max(self.timing.min_rush_secs)).unwrap_or_default()
    }

    pub fn lag_compensation(&self) -> Duration {
        Duration::from_millis(self.movement.lag_compensation_ms)
    }

    /// Reject tuning that would break the engine's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_width == 0 || self.map_height == 0 {
            return Err(ConfigError::EmptyGrid);
        }
        if self.min_players == 0 || self.min_players > self.max_players {
            return Err(ConfigError::PlayerBounds {
                min: self.min_players,
                max: self.max_players,
            });
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::NoRounds);
        }

        let timing = &self.timing;
        for (name, value) in [
            ("lobby_wait_secs", self.lobby_wait_secs),
            ("idle_lobby_secs", self.idle_lobby_secs),
            ("color_call_secs", timing.color_call_secs),
            ("elimination_check_secs", timing.elimination_check_secs),
            ("transition_secs", timing.transition_secs),
            ("settlement_grace_secs", timing.settlement_grace_secs),
            ("min_rush_secs", timing.min_rush_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidDuration(name));
            }
        }

        let table = &self.timing.progression;
        if table.is_empty() {
            return Err(ConfigError::EmptyProgression);
        }
        for range in table {
            if range.start_round == 0 || range.end_round < range.start_round || !(range.duration.is_finite() && range.duration > 0.0) {
                return Err(ConfigError::InvalidRange(range.start_round, range.end_round));
            }
        }
        for pair in table.windows(2) {
            if pair[1].start_round <= pair[0].end_round {
                return Err(ConfigError::OverlappingRanges(pair[1].start_round));
            }
            if pair[1].duration > pair[0].duration {
                return Err(ConfigError::IncreasingDuration(pair[1].start_round));
            }
        }

        let scoring = &self.scoring;
        if scoring.perfect_bonus_threshold > scoring.speed_bonus_threshold {
            return Err(ConfigError::BonusThresholds);
        }
        if self.movement.speed_tolerance < 1.0 || self.movement.max_speed <= 0.0 {
            return Err(ConfigError::SpeedLimit);
        }
        if self.palette.min_colors < 2 || self.palette.min_colors > protocol::WoolColor::PALETTE.len() {
            return Err(ConfigError::PaletteFloor(self.palette.min_colors));
        }
        Ok(())
    }
}

/// Phase durations and the rush-window progression table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_color_call")]
    pub color_call_secs: f64,
    #[serde(default = "default_elimination_check")]
    pub elimination_check_secs: f64,
    #[serde(default = "default_transition")]
    pub transition_secs: f64,
    /// Time results stay readable before the game is torn down.
    #[serde(default = "default_settlement_grace")]
    pub settlement_grace_secs: f64,
    /// Floor for the rush window.
    #[serde(default = "default_min_rush")]
    pub min_rush_secs: f64,
    #[serde(default = "default_progression")]
    pub progression: Vec<TimingRange>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            color_call_secs: default_color_call(),
            elimination_check_secs: default_elimination_check(),
            transition_secs: default_transition(),
            settlement_grace_secs: default_settlement_grace(),
            min_rush_secs: default_min_rush(),
            progression: default_progression(),
        }
    }
}

fn default_color_call() -> f64 {
    1.0
}
fn default_elimination_check() -> f64 {
    2.0
}
fn default_transition() -> f64 {
    3.0
}
fn default_settlement_grace() -> f64 {
    300.0
}
fn default_min_rush() -> f64 {
    1.0
}
fn default_progression() -> Vec<TimingRange> {
    [
        (1, 3, 5.0),
        (4, 6, 4.0),
        (7, 9, 3.0),
        (10, 12, 2.5),
        (13, 15, 2.0),
        (16, 20, 1.5),
        (21, 25, 1.0),
    ]
    .into_iter()
    .map(|(start_round, end_round, duration)| TimingRange {
        start_round,
        end_round,
        duration,
    })
    .collect()
}

/// Rush window for an inclusive range of round numbers.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TimingRange {
    pub start_round: u32,
    pub end_round: u32,
    /// Seconds.
    pub duration: f64,
}

/// Scoring constants.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    #[serde(default = "default_survival_points")]
    pub survival_points_per_round: u32,
    #[serde(default = "default_elimination_multiplier")]
    pub elimination_bonus_multiplier: u32,
    /// Seconds from rush start.
    #[serde(default = "default_speed_threshold")]
    pub speed_bonus_threshold: f64,
    /// Seconds from rush start. Must be tighter than the speed threshold.
    #[serde(default = "default_perfect_threshold")]
    pub perfect_bonus_threshold: f64,
    #[serde(default = "default_speed_points")]
    pub speed_bonus_points: u32,
    #[serde(default = "default_perfect_points")]
    pub perfect_bonus_points: u32,
    #[serde(default = "default_final_winner_bonus")]
    pub final_winner_bonus: u32,
    #[serde(default = "default_endurance_bonus")]
    pub endurance_bonus: u32,
    #[serde(default = "default_streak_bonuses")]
    pub streak_bonuses: Vec<StreakBonus>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            survival_points_per_round: default_survival_points(),
            elimination_bonus_multiplier: default_elimination_multiplier(),
            speed_bonus_threshold: default_speed_threshold(),
            perfect_bonus_threshold: default_perfect_threshold(),
            speed_bonus_points: default_speed_points(),
            perfect_bonus_points: default_perfect_points(),
            final_winner_bonus: default_final_winner_bonus(),
            endurance_bonus: default_endurance_bonus(),
            streak_bonuses: default_streak_bonuses(),
        }
    }
}

fn default_survival_points() -> u32 {
    10
}
fn default_elimination_multiplier() -> u32 {
    5
}
fn default_speed_threshold() -> f64 {
    2.0
}
fn default_perfect_threshold() -> f64 {
    1.0
}
fn default_speed_points() -> u32 {
    20
}
fn default_perfect_points() -> u32 {
    50
}
fn default_final_winner_bonus() -> u32 {
    100
}
fn default_endurance_bonus() -> u32 {
    200
}
fn default_streak_bonuses() -> Vec<StreakBonus> {
    vec![
        StreakBonus { streak: 3, points: 30 },
        StreakBonus { streak: 5, points: 75 },
        StreakBonus { streak: 10, points: 200 },
    ]
}

/// Points granted when a survival streak reaches `streak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreakBonus {
    pub streak: u32,
    pub points: u32,
}

/// Movement limits and update-rate hints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MovementConfig {
    /// Hard ceiling, blocks/second.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Multiplier on `max_speed` that absorbs network jitter.
    #[serde(default = "default_speed_tolerance")]
    pub speed_tolerance: f64,
    /// A single jump longer than this that no window can explain is a teleport.
    #[serde(default = "default_teleport_distance")]
    pub teleport_distance: f64,
    #[serde(default = "default_lag_compensation")]
    pub lag_compensation_ms: u64,
    #[serde(default = "default_position_update_hz")]
    pub position_update_hz: u32,
    #[serde(default = "default_timer_update_hz")]
    pub timer_update_hz: u32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            max_speed: default_max_speed(),
            speed_tolerance: default_speed_tolerance(),
            teleport_distance: default_teleport_distance(),
            lag_compensation_ms: default_lag_compensation(),
            position_update_hz: default_position_update_hz(),
            timer_update_hz: default_timer_update_hz(),
        }
    }
}

fn default_max_speed() -> f64 {
    5.0
}
fn default_speed_tolerance() -> f64 {
    1.1
}
fn default_teleport_distance() -> f64 {
    8.0
}
fn default_lag_compensation() -> u64 {
    100
}
fn default_position_update_hz() -> u32 {
    10
}
fn default_timer_update_hz() -> u32 {
    20
}

/// Palette shrinking schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaletteConfig {
    /// Rounds at whose start colors are removed from play.
    #[serde(default = "default_shrink_rounds")]
    pub shrink_rounds: Vec<u32>,
    #[serde(default = "default_colors_removed_each")]
    pub colors_removed_each: usize,
    #[serde(default = "default_min_colors")]
    pub min_colors: usize,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            shrink_rounds: default_shrink_rounds(),
            colors_removed_each: default_colors_removed_each(),
            min_colors: default_min_colors(),
        }
    }
}

fn default_shrink_rounds() -> Vec<u32> {
    vec![5, 10, 15, 20]
}
fn default_colors_removed_each() -> usize {
    2
}
fn default_min_colors() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        GameConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rush_duration_is_non_increasing() {
        let config = GameConfig::default();
        let mut previous = config.rush_duration(1);
        for round in 2..=40 {
            let current = config.rush_duration(round);
            assert!(current <= previous, "round {} got longer", round);
            previous = current;
        }
    }

    #[test]
    fn test_rush_duration_clamps_past_table() {
        let config = GameConfig::default();
        assert_eq!(config.rush_duration(1), Duration::from_secs(5));
        assert_eq!(config.rush_duration(11), Duration::from_millis(2500));
        assert_eq!(config.rush_duration(99), config.rush_duration(25));
    }

    #[test]
    fn test_rush_duration_respects_floor() {
        let mut config = GameConfig::default();
        config.timing.min_rush_secs = 3.0;
        assert_eq!(config.rush_duration(1), Duration::from_secs(5));
        assert_eq!(config.rush_duration(20), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_increasing_table() {
        let mut config = GameConfig::default();
        config.timing.progression[1].duration = 9.0;
        assert!(matches!(config.validate(), Err(ConfigError::IncreasingDuration(4))));
    }

    #[test]
    fn test_validate_rejects_non_finite_durations() {
        let parsed: Config = toml::from_str(
            "[[game.timing.progression]]\nstart_round = 1\nend_round = 25\nduration = inf\n",
        )
        .unwrap();
        assert!(matches!(parsed.game.validate(), Err(ConfigError::InvalidRange(1, 25))));

        let mut config = GameConfig::default();
        config.timing.progression[0].duration = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRange(1, 3))));

        let mut config = GameConfig::default();
        config.timing.min_rush_secs = f64::INFINITY;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDuration("min_rush_secs"))));

        let mut config = GameConfig::default();
        config.timing.transition_secs = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDuration("transition_secs"))));
    }

    #[test]
    fn test_rush_duration_never_panics_on_unchecked_table() {
        let mut config = GameConfig::default();
        config.timing.progression[0].duration = f64::INFINITY;
        assert_eq!(config.rush_duration(1), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_bad_player_bounds() {
        let mut config = GameConfig::default();
        config.min_players = 20;
        assert!(matches!(config.validate(), Err(ConfigError::PlayerBounds { .. })));
    }

    #[test]
    fn test_toml_round_trip_keeps_tables() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.game.timing.progression, default_progression());
        assert_eq!(parsed.game.scoring.streak_bonuses.len(), 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str("[game]\nmax_rounds = 10\n").unwrap();
        assert_eq!(parsed.game.max_rounds, 10);
        assert_eq!(parsed.game.map_width, 20);
        assert_eq!(parsed.server.tick_interval_ms, 50);
    }
}
