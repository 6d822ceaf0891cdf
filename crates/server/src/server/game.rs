//! Game state and the round/phase state machine.
//!
//! A `Game` is owned by exactly one session worker. Every mutation takes the current
//! `Instant` explicitly; phase deadlines are recomputed from the round start on every
//! step so a late tick never shifts later phases.

use super::player::{Player, PlayerId, PlayerRegistry};
use crate::config::{GameConfig, TimingConfig};
use crate::error::{EngineError, JoinError};
use crate::grid::{Grid, Palette};
use crate::movement::{self, MoveSample, Verdict};
use crate::scoring;
use protocol::{
    ClientMessage, GamePhase, GameView, PlayerPosition, PlayerStats, Position, RoundPhase, RoundScore, RoundView,
    ServerEvent, WoolColor,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Who an outbound event is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    All,
    Player(PlayerId),
}

/// An event waiting for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Recipient,
    pub event: ServerEvent,
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// Minimum spacing between throttled broadcasts.
fn period(hz: u32) -> Duration {
    if hz == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(1) / hz
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Round {
    number: u32,
    phase: RoundPhase,
    target: WoolColor,
    started_at: Instant,
    started_ms: u64,
    ended_ms: Option<u64>,
    rush_duration: Duration,
    eliminated_count: u32,
}

impl Round {
    fn rush_start(&self, timing: &TimingConfig) -> Instant {
        self.started_at + secs(timing.color_call_secs)
    }

    fn rush_end(&self, timing: &TimingConfig) -> Instant {
        self.rush_start(timing) + self.rush_duration
    }

    /// When the current phase expires.
    fn deadline(&self, timing: &TimingConfig) -> Instant {
        let check_end = self.rush_end(timing) + secs(timing.elimination_check_secs);
        match self.phase {
            RoundPhase::ColorCall => self.rush_start(timing),
            RoundPhase::Rush => self.rush_end(timing),
            RoundPhase::EliminationCheck => check_end,
            RoundPhase::Transition => check_end + secs(timing.transition_secs),
        }
    }

    fn view(&self) -> RoundView {
        RoundView {
            round_number: self.number,
            phase: self.phase,
            color_to_show: self.target,
            rush_duration: self.rush_duration.as_secs_f64(),
            started_at: self.started_ms,
            ended_at: self.ended_ms,
            eliminated_count: self.eliminated_count,
        }
    }
}

/// Accept `sample` as the player's new authoritative position.
fn accept_move(player: &mut Player, sample: MoveSample, distance: f64, grid: &Grid, target: WoolColor, rush_start: Instant) {
    player.place(sample.position, sample.at);
    player.stats.total_distance += distance;
    if grid.color_at(sample.position) == Some(target) {
        player.round_response = Some(sample.at.saturating_duration_since(rush_start));
    }
}

/// One game: map, players, and round progression.
#[derive(Debug, Clone)]
pub struct Game {
    id: String,
    config: GameConfig,
    phase: GamePhase,
    created_at: Instant,
    created_ms: u64,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,

    lobby_deadline: Option<Instant>,
    last_lobby_tick: Option<Instant>,
    last_countdown_tick: Option<Instant>,
    last_positions_update: Option<Instant>,
    positions_dirty: bool,

    current_round: Option<Round>,
    /// Completed rounds, oldest first.
    rounds: Vec<RoundView>,
    grid: Grid,
    palette: Palette,
    players: PlayerRegistry,
    rng: StdRng,

    teardown: bool,
    finished: bool,
    outbox: Vec<Outgoing>,
}

impl Game {
    /// Create an empty game in the lobby.
    pub fn new(id: String, config: GameConfig, seed: u64, now: Instant) -> Self {
        let grid = Grid::new(config.map_width, config.map_height);
        Self {
            id,
            config,
            phase: GamePhase::PreGame,
            created_at: now,
            created_ms: unix_millis(),
            started_at: None,
            ended_at: None,
            lobby_deadline: None,
            last_lobby_tick: None,
            last_countdown_tick: None,
            last_positions_update: None,
            positions_dirty: false,
            current_round: None,
            rounds: Vec::new(),
            grid,
            palette: Palette::default(),
            players: PlayerRegistry::new(),
            rng: StdRng::seed_from_u64(seed),
            teardown: false,
            finished: false,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn alive_count(&self) -> usize {
        self.players.alive_count()
    }

    pub fn round_phase(&self) -> Option<RoundPhase> {
        self.current_round.as_ref().map(|round| round.phase)
    }

    pub fn target(&self) -> Option<WoolColor> {
        self.current_round.as_ref().map(|round| round.target)
    }

    pub fn rounds(&self) -> &[RoundView] {
        &self.rounds
    }

    /// Set once the game has been torn down; the owning worker should stop.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take every event produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    fn broadcast(&mut self, event: ServerEvent) {
        self.outbox.push(Outgoing {
            to: Recipient::All,
            event,
        });
    }

    fn send(&mut self, id: PlayerId, event: ServerEvent) {
        self.outbox.push(Outgoing {
            to: Recipient::Player(id),
            event,
        });
    }

    fn wall_ms(&self, at: Instant) -> u64 {
        self.created_ms + at.saturating_duration_since(self.created_at).as_millis() as u64
    }

    /// Register a player. In the lobby they compete; once play started they can only watch.
    pub fn join(&mut self, name: &str, now: Instant) -> Result<PlayerId, JoinError> {
        let is_spectator = match self.phase {
            GamePhase::PreGame => {
                if self.players.contender_count() >= self.config.max_players {
                    return Err(JoinError::GameFull(self.config.max_players));
                }
                false
            }
            GamePhase::InGame if self.config.allow_late_spectators => true,
            _ => return Err(JoinError::GameAlreadyStarted),
        };

        let joined_round = self.current_round.as_ref().map_or(1, |round| round.number);
        let player = self.players.add(name, is_spectator, joined_round, now)?.view();
        let id = player.id;
        info!(
            "Game {}: {} joined as player {}{}",
            self.id,
            player.name,
            id,
            if is_spectator { " (spectator)" } else { "" }
        );

        let player_count = self.players.len() as u32;
        self.broadcast(ServerEvent::PlayerJoined { player, player_count });
        let view = self.view(now);
        self.send(id, ServerEvent::GameState(Box::new(view)));

        if self.phase == GamePhase::PreGame {
            self.update_lobby(now);
        }
        Ok(id)
    }

    /// Transport reported the player gone.
    ///
    /// Lobby players are dropped. Contenders in a running game stay registered but are
    /// flagged, and are eliminated at the next elimination check.
    pub fn leave(&mut self, id: PlayerId, now: Instant) {
        let Some(player) = self.players.get(id) else {
            return;
        };
        if !player.is_connected {
            return;
        }
        let name = player.name.clone();
        let is_spectator = player.is_spectator;

        if self.phase == GamePhase::PreGame || is_spectator {
            self.players.remove(id);
        } else if let Some(player) = self.players.get_mut(id) {
            player.is_connected = false;
        }
        info!("Game {}: {} (player {}) left", self.id, name, id);

        let player_count = self.players.connected_count() as u32;
        self.broadcast(ServerEvent::PlayerLeft { id, name, player_count });

        if self.phase == GamePhase::PreGame {
            self.update_lobby(now);
        }
        if self.players.connected_count() == 0 {
            self.teardown = true;
        }
    }

    /// Apply one inbound intent.
    pub fn handle_intent(&mut self, id: PlayerId, message: ClientMessage, now: Instant) {
        match message {
            ClientMessage::Ping => {
                if let Some(player) = self.players.get_mut(id) {
                    player.touch(now);
                    self.send(id, ServerEvent::Pong);
                }
            }
            ClientMessage::PlayerUpdate { pos_x, pos_y } => {
                self.handle_move(id, Position::new(pos_x, pos_y), now);
            }
        }
    }

    fn handle_move(&mut self, id: PlayerId, position: Position, now: Instant) {
        let Some(round) = &self.current_round else {
            return;
        };
        if !round.phase.accepts_movement() {
            return;
        }
        let timing = &self.config.timing;
        // Until the step into Transition runs, a late move may still see ColorCall or Rush.
        if round.phase != RoundPhase::Transition && now >= round.rush_end(timing) {
            return;
        }
        let target = round.target;
        let rush_start = round.rush_start(timing);

        let Some(player) = self.players.get_mut(id) else {
            return;
        };
        if !player.is_alive() {
            return;
        }
        player.touch(now);

        let proposed = MoveSample::new(position, now);
        let rejected = match movement::validate(&self.grid, &self.config.movement, player.last_valid, proposed, Duration::ZERO) {
            Verdict::Accepted { distance } => {
                accept_move(player, proposed, distance, &self.grid, target, rush_start);
                self.positions_dirty = true;
                None
            }
            Verdict::Rejected(rejection) => {
                player.disputed = Some(proposed);
                player.position = player.last_valid_position();
                debug!(
                    "Game {}: rejected move from player {} ({:?}, {:.1} b/s)",
                    self.id, id, rejection.reason, rejection.speed
                );
                Some(ServerEvent::MovementRejected {
                    reason: rejection.reason,
                    speed: rejection.speed,
                    max_speed: rejection.max_speed,
                    reset_position: player.position,
                })
            }
        };
        if let Some(event) = rejected {
            self.send(id, event);
        }
    }

    /// Advance the state machine to `now`.
    pub fn step(&mut self, now: Instant) {
        if self.finished {
            return;
        }
        if self.teardown {
            self.cleanup();
            return;
        }
        match self.phase {
            GamePhase::PreGame => self.step_lobby(now),
            GamePhase::InGame => self.step_round(now),
            GamePhase::Settlement => {
                let grace = secs(self.config.timing.settlement_grace_secs);
                if self.ended_at.is_some_and(|ended| now >= ended + grace) {
                    self.cleanup();
                }
            }
        }
    }

    fn update_lobby(&mut self, now: Instant) {
        let player_count = self.players.contender_count();
        if player_count >= self.config.min_players {
            if self.lobby_deadline.is_none() {
                let wait = secs(self.config.lobby_wait_secs);
                self.lobby_deadline = Some(now + wait);
                self.last_lobby_tick = Some(now);
                info!("Game {}: {} players ready, starting in {:?}", self.id, player_count, wait);
                self.broadcast(ServerEvent::LobbyCountdown {
                    seconds_remaining: wait.as_secs_f64(),
                    player_count: player_count as u32,
                });
            }
        } else if self.lobby_deadline.take().is_some() {
            info!("Game {}: start countdown cancelled", self.id);
        }
    }

    fn step_lobby(&mut self, now: Instant) {
        if self.players.is_empty() {
            let idle = secs(self.config.idle_lobby_secs);
            if now.saturating_duration_since(self.created_at) >= idle {
                info!("Game {}: nobody joined within {:?}", self.id, idle);
                self.cleanup();
            }
            return;
        }
        if self.players.contender_count() >= self.config.max_players {
            self.start(now);
            return;
        }
        let Some(deadline) = self.lobby_deadline else {
            return;
        };
        if now >= deadline {
            self.start(now);
            return;
        }
        if self
            .last_lobby_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= Duration::from_secs(1))
        {
            self.last_lobby_tick = Some(now);
            self.broadcast(ServerEvent::LobbyCountdown {
                seconds_remaining: deadline.saturating_duration_since(now).as_secs_f64(),
                player_count: self.players.contender_count() as u32,
            });
        }
    }

    /// Leave the lobby: lay out round 1 and spread players over it.
    fn start(&mut self, now: Instant) {
        self.phase = GamePhase::InGame;
        self.started_at = Some(now);
        self.lobby_deadline = None;

        self.open_round(now);
        let cells = self.grid.non_empty_cells();
        for player in self.players.iter_mut() {
            player.stats = PlayerStats::default();
            if player.is_spectator {
                continue;
            }
            if let Some(&(x, y)) = cells.choose(&mut self.rng) {
                player.place(Grid::cell_center(x, y), now);
            }
        }

        info!("Game {} started with {} players", self.id, self.players.alive_count());
        self.broadcast(ServerEvent::GameStarted {
            game_id: self.id.clone(),
            players: self.players.views(),
            map: self.grid.rows(),
        });
        self.announce_round();
    }

    fn begin_round(&mut self, at: Instant) {
        self.open_round(at);
        self.announce_round();
    }

    /// Shrink the palette if scheduled, lay out a fresh map and pick the target.
    fn open_round(&mut self, at: Instant) {
        let number = self.rounds.len() as u32 + 1;

        if self.config.palette.shrink_rounds.contains(&number) {
            let removed = self.palette.shrink(
                self.config.palette.colors_removed_each,
                self.config.palette.min_colors,
                &mut self.rng,
            );
            if !removed.is_empty() {
                info!("Game {}: round {} removes {:?} from play", self.id, number, removed);
            }
        }

        self.grid.randomize_balanced(self.palette.colors(), &mut self.rng);
        let present = self.grid.colors_present();
        let target = present
            .choose(&mut self.rng)
            .copied()
            .or_else(|| self.palette.choose(&mut self.rng))
            .unwrap_or(WoolColor::White);

        for player in self.players.iter_mut() {
            player.round_response = None;
            player.disputed = None;
        }

        let round = Round {
            number,
            phase: RoundPhase::ColorCall,
            target,
            started_at: at,
            started_ms: self.wall_ms(at),
            ended_ms: None,
            rush_duration: self.config.rush_duration(number),
            eliminated_count: 0,
        };
        info!(
            "Game {}: round {} target {:?}, rush {:?}",
            self.id, number, target, round.rush_duration
        );

        self.current_round = Some(round);
        self.last_countdown_tick = None;
    }

    fn announce_round(&mut self) {
        let Some(round) = &self.current_round else {
            return;
        };
        let view = round.view();
        self.broadcast(ServerEvent::RoundStarted {
            round: view,
            map: self.grid.rows(),
            active_colors: self.palette.colors().to_vec(),
        });
        self.announce_phase();
    }

    fn step_round(&mut self, now: Instant) {
        // A late step may cross several deadlines; each transition happens at its own deadline.
        loop {
            let Some(round) = &self.current_round else {
                return;
            };
            let at = round.deadline(&self.config.timing);
            if now < at {
                break;
            }
            match round.phase {
                RoundPhase::ColorCall => self.set_round_phase(RoundPhase::Rush),
                RoundPhase::Rush => {
                    self.collapse();
                    self.set_round_phase(RoundPhase::EliminationCheck);
                    self.check_eliminations(at);
                }
                RoundPhase::EliminationCheck => {
                    self.score_round();
                    self.set_round_phase(RoundPhase::Transition);
                }
                RoundPhase::Transition => {
                    if self.is_over() {
                        self.settle(at);
                        return;
                    }
                    self.finish_round(at);
                    self.begin_round(at);
                }
            }
        }
        self.tick_countdown(now);
        self.flush_positions(now);
    }

    fn set_round_phase(&mut self, phase: RoundPhase) {
        if let Some(round) = self.current_round.as_mut() {
            round.phase = phase;
        }
        self.announce_phase();
    }

    fn announce_phase(&mut self) {
        let Some(round) = &self.current_round else {
            return;
        };
        debug!("Game {}: round {} -> {:?}", self.id, round.number, round.phase);
        let event = ServerEvent::PhaseChanged {
            round_number: round.number,
            phase: round.phase,
            color_to_show: round.target,
        };
        self.broadcast(event);
    }

    fn is_over(&self) -> bool {
        let at_cap = self
            .current_round
            .as_ref()
            .is_some_and(|round| round.number >= self.config.max_rounds);
        self.players.alive_count() <= 1 || at_cap
    }

    fn collapse(&mut self) {
        let Some(round) = &self.current_round else {
            return;
        };
        let (round_number, target) = (round.number, round.target);
        let removed = self.grid.collapse_to(target);
        self.broadcast(ServerEvent::MapCollapsed {
            round_number,
            color_to_show: target,
            removed_cells: removed as u32,
            map: self.grid.rows(),
        });
    }

    fn check_eliminations(&mut self, at: Instant) {
        let Some(round) = &self.current_round else {
            return;
        };
        let (number, target) = (round.number, round.target);
        let rush_start = round.rush_start(&self.config.timing);

        // Moves refused live get one more look with the lag window added.
        let grace = self.config.lag_compensation();
        for player in self.players.iter_mut() {
            if !player.is_alive() {
                continue;
            }
            let Some(disputed) = player.disputed.take() else {
                continue;
            };
            if let Verdict::Accepted { distance } =
                movement::validate(&self.grid, &self.config.movement, player.last_valid, disputed, grace)
            {
                debug!("Game {}: lag compensation accepted player {}", self.id, player.id);
                accept_move(player, disputed, distance, &self.grid, target, rush_start);
            }
        }

        let off_target = scoring::find_off_target(&self.grid, target, &self.players);
        let total = self.players.contender_count();
        let eliminated_at = self.wall_ms(at);
        let eliminated = scoring::eliminate_batch(
            &mut self.players,
            &off_target,
            number,
            total,
            eliminated_at,
            &self.config.scoring,
        );
        if let Some(round) = self.current_round.as_mut() {
            round.eliminated_count = eliminated.len() as u32;
        }
        if eliminated.is_empty() {
            return;
        }

        info!(
            "Game {}: round {} eliminated {} players, {} remain",
            self.id,
            number,
            eliminated.len(),
            self.players.alive_count()
        );
        let eliminated_players = eliminated
            .iter()
            .filter_map(|&id| self.players.get(id).map(Player::view))
            .collect();
        self.broadcast(ServerEvent::PlayersEliminated {
            round_number: number,
            eliminated_players,
            remaining_count: self.players.alive_count() as u32,
        });
    }

    fn score_round(&mut self) {
        let Some(round) = &self.current_round else {
            return;
        };
        let (number, rush, eliminated_count) = (round.number, round.rush_duration, round.eliminated_count);

        let mut scores = Vec::new();
        for player in self.players.iter_mut().filter(|p| p.is_alive()) {
            let response = player.round_response;
            let points = scoring::award_survival(&mut player.stats, response, rush, &self.config.scoring);
            scores.push(RoundScore {
                id: player.id,
                points,
                score: player.stats.score,
                streak: player.stats.current_streak,
                response_time: response.map(|d| d.as_secs_f64()),
            });
        }

        let next_round_in = (!self.is_over()).then_some(self.config.timing.transition_secs);
        self.broadcast(ServerEvent::RoundFinished {
            round_number: number,
            eliminated_count,
            remaining_count: self.players.alive_count() as u32,
            scores,
            next_round_in,
        });
    }

    /// Move the current round into the log.
    fn finish_round(&mut self, at: Instant) {
        let ended_ms = self.wall_ms(at);
        if let Some(mut round) = self.current_round.take() {
            round.ended_ms = Some(ended_ms);
            self.rounds.push(round.view());
        }
    }

    fn settle(&mut self, at: Instant) {
        let round_cap_reached = self
            .current_round
            .as_ref()
            .is_some_and(|round| round.number >= self.config.max_rounds);
        self.finish_round(at);

        let settlement = scoring::settle(&mut self.players, &self.config.scoring, round_cap_reached);
        self.phase = GamePhase::Settlement;
        self.ended_at = Some(at);

        info!(
            "Game {} settled after {} rounds, winners {:?}",
            self.id,
            self.rounds.len(),
            settlement.winners
        );

        self.broadcast(ServerEvent::SettlementStarted {
            game_id: self.id.clone(),
            winners: settlement.winners.clone(),
        });
        let players = settlement
            .standings
            .iter()
            .filter_map(|&id| self.players.get(id).map(Player::view))
            .collect();
        let duration = self
            .started_at
            .map(|started| at.saturating_duration_since(started).as_secs_f64())
            .unwrap_or_default();
        self.broadcast(ServerEvent::GameEnded {
            game_id: self.id.clone(),
            total_rounds: self.rounds.len() as u32,
            duration,
            players,
        });
    }

    fn cleanup(&mut self) {
        info!("Game {} torn down", self.id);
        self.broadcast(ServerEvent::GameCleanup { game_id: self.id.clone() });
        self.teardown = false;
        self.finished = true;
    }

    fn tick_countdown(&mut self, now: Instant) {
        let Some(round) = &self.current_round else {
            return;
        };
        if round.phase != RoundPhase::Rush {
            return;
        }
        let interval = period(self.config.movement.timer_update_hz);
        if !self
            .last_countdown_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
        {
            return;
        }
        let event = ServerEvent::CountdownTick {
            round_number: round.number,
            phase: round.phase,
            remaining_seconds: round.rush_end(&self.config.timing).saturating_duration_since(now).as_secs_f64(),
        };
        self.last_countdown_tick = Some(now);
        self.broadcast(event);
    }

    fn flush_positions(&mut self, now: Instant) {
        if !self.positions_dirty {
            return;
        }
        let interval = period(self.config.movement.position_update_hz);
        if !self
            .last_positions_update
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
        {
            return;
        }
        let players = self
            .players
            .iter()
            .filter(|p| p.is_alive())
            .map(|p| PlayerPosition {
                id: p.id,
                position: p.position,
            })
            .collect();
        self.positions_dirty = false;
        self.last_positions_update = Some(now);
        self.broadcast(ServerEvent::PositionsUpdate { players });
    }

    /// Point-in-time copy of the public game state.
    pub fn view(&self, now: Instant) -> GameView {
        let countdown_seconds = match (&self.current_round, self.lobby_deadline) {
            (Some(round), _) => Some(round.deadline(&self.config.timing).saturating_duration_since(now).as_secs_f64()),
            (None, Some(deadline)) => Some(deadline.saturating_duration_since(now).as_secs_f64()),
            (None, None) => None,
        };
        GameView {
            game_id: self.id.clone(),
            phase: self.phase,
            created_at: self.created_ms,
            started_at: self.started_at.map(|at| self.wall_ms(at)),
            ended_at: self.ended_at.map(|at| self.wall_ms(at)),
            round_number: self
                .current_round
                .as_ref()
                .map_or(self.rounds.len() as u32, |round| round.number),
            current_round: self.current_round.as_ref().map(Round::view),
            rounds: self.rounds.clone(),
            map: self.grid.rows(),
            active_colors: self.palette.colors().to_vec(),
            players: self.players.views(),
            player_count: self.players.len() as u32,
            alive_count: self.players.alive_count() as u32,
            countdown_seconds,
        }
    }

    /// Internal consistency checks run after every step.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        let counted = self.players.counted_alive();
        if counted != self.players.alive_count() {
            return Err(EngineError::InvariantViolation(format!(
                "alive count {} but {} players alive",
                self.players.alive_count(),
                counted
            )));
        }
        if self.current_round.is_some() != (self.phase == GamePhase::InGame) {
            return Err(EngineError::InvariantViolation(format!(
                "phase {:?} with current round present: {}",
                self.phase,
                self.current_round.is_some()
            )));
        }
        for (i, round) in self.rounds.iter().enumerate() {
            if round.round_number != i as u32 + 1 {
                return Err(EngineError::InvariantViolation(format!(
                    "round log entry {} has number {}",
                    i, round.round_number
                )));
            }
        }
        if let Some(round) = &self.current_round {
            if round.number != self.rounds.len() as u32 + 1 {
                return Err(EngineError::InvariantViolation(format!(
                    "current round {} after {} completed rounds",
                    round.number,
                    self.rounds.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::RejectReason;
    use rand::Rng;
    use std::collections::HashSet;

    fn config(width: usize, height: usize, max_players: usize) -> GameConfig {
        GameConfig {
            map_width: width,
            map_height: height,
            min_players: 2,
            max_players,
            ..GameConfig::default()
        }
    }

    fn game_with(names: &[&str], config: GameConfig, now: Instant) -> Game {
        let mut game = Game::new("123456".to_string(), config, 42, now);
        for name in names {
            game.join(name, now).unwrap();
        }
        game
    }

    fn after(t0: Instant, secs: f64) -> Instant {
        t0 + Duration::from_secs_f64(secs)
    }

    /// Put a player on the center of some cell of the round's target color.
    fn park_on_target(game: &mut Game, id: PlayerId, now: Instant) {
        let target = game.target().unwrap();
        let (x, y) = game
            .grid
            .non_empty_cells()
            .into_iter()
            .find(|&(x, y)| game.grid.get(x, y) == Some(target))
            .unwrap();
        game.players.get_mut(id).unwrap().place(Grid::cell_center(x, y), now);
    }

    #[test]
    fn test_lobby_starts_when_full() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b", "c", "d"], config(6, 6, 4), t0);
        assert_eq!(game.phase(), GamePhase::PreGame);

        game.step(t0);
        assert_eq!(game.phase(), GamePhase::InGame);
        assert_eq!(game.round_phase(), Some(RoundPhase::ColorCall));
        assert_eq!(game.rounds().len(), 0);
        for player in game.players().iter() {
            assert!(game.grid().color_at(player.position).is_some_and(|c| !c.is_empty()));
        }

        let kinds: Vec<&str> = game.drain_events().iter().map(|out| out.event.kind()).collect();
        assert!(kinds.contains(&"game_started"));
        assert!(kinds.contains(&"round_started"));
        game.check_invariants().unwrap();
    }

    #[test]
    fn test_lobby_countdown_and_cancel() {
        let t0 = Instant::now();
        let mut game = game_with(&["a"], config(6, 6, 8), t0);
        assert!(game.lobby_deadline.is_none());

        game.join("b", t0).unwrap();
        assert_eq!(game.lobby_deadline, Some(after(t0, 10.0)));
        assert!(game.drain_events().iter().any(|out| out.event.kind() == "lobby_countdown"));

        game.leave(2, t0);
        assert!(game.lobby_deadline.is_none());

        let t1 = after(t0, 2.0);
        game.join("c", t1).unwrap();
        game.step(after(t1, 5.0));
        assert_eq!(game.phase(), GamePhase::PreGame);
        game.step(after(t1, 10.0));
        assert_eq!(game.phase(), GamePhase::InGame);
    }

    #[test]
    fn test_join_errors() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(6, 6, 2), t0);
        assert_eq!(game.join("a", t0), Err(JoinError::GameFull(2)));

        let mut open = game_with(&["a"], config(6, 6, 4), t0);
        assert_eq!(open.join("a", t0), Err(JoinError::DuplicateName("a".to_string())));

        let mut strict = config(6, 6, 2);
        strict.allow_late_spectators = false;
        let mut closed = game_with(&["a", "b"], strict, t0);
        closed.step(t0);
        assert_eq!(closed.join("late", t0), Err(JoinError::GameAlreadyStarted));
    }

    #[test]
    fn test_late_joiner_watches() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(6, 6, 2), t0);
        game.step(t0);
        game.step(after(t0, 1.5));

        let id = game.join("watcher", after(t0, 1.5)).unwrap();
        let watcher = game.players().get(id).unwrap();
        assert!(watcher.is_spectator);
        assert_eq!(watcher.joined_round, 1);
        assert_eq!(game.alive_count(), 2);

        // Spectator moves are ignored.
        game.drain_events();
        game.handle_intent(id, ClientMessage::PlayerUpdate { pos_x: 3.5, pos_y: 3.5 }, after(t0, 1.6));
        assert!(game.drain_events().is_empty());
        assert_eq!(game.players().get(id).unwrap().position, Position::ZERO);
    }

    #[test]
    fn test_red_scenario_single_survivor_wins() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b", "c", "d"], config(2, 2, 4), t0);
        game.step(t0);

        game.grid.set(0, 0, WoolColor::Red);
        game.grid.set(1, 0, WoolColor::Blue);
        game.grid.set(0, 1, WoolColor::Green);
        game.grid.set(1, 1, WoolColor::Yellow);
        game.current_round.as_mut().unwrap().target = WoolColor::Red;
        for (id, (x, y)) in (1..=4).zip([(0, 0), (1, 0), (0, 1), (1, 1)]) {
            game.players.get_mut(id).unwrap().place(Grid::cell_center(x, y), t0);
        }
        game.drain_events();

        game.step(after(t0, 1.0));
        assert_eq!(game.round_phase(), Some(RoundPhase::Rush));

        game.step(after(t0, 6.0));
        assert_eq!(game.round_phase(), Some(RoundPhase::EliminationCheck));
        assert_eq!(game.alive_count(), 1);
        assert!(game.players().get(1).unwrap().is_alive());
        for id in 2..=4 {
            let player = game.players().get(id).unwrap();
            assert!(player.is_eliminated);
            assert_eq!(player.stats.rounds_survived, 0);
            assert_eq!(player.stats.eliminated_in_round, Some(1));
        }

        game.step(after(t0, 8.0));
        assert_eq!(game.round_phase(), Some(RoundPhase::Transition));
        game.step(after(t0, 11.0));
        assert_eq!(game.phase(), GamePhase::Settlement);
        assert!(game.round_phase().is_none());
        assert_eq!(game.rounds().len(), 1);

        let winner = &game.players().get(1).unwrap().stats;
        assert_eq!(winner.final_position, Some(1));
        assert_eq!(winner.winner_bonus, 100);
        assert_eq!(winner.rounds_survived, 1);
        let others: HashSet<u32> = (2..=4)
            .filter_map(|id| game.players().get(id).unwrap().stats.final_position)
            .collect();
        assert_eq!(others, HashSet::from([2, 3, 4]));

        let events = game.drain_events();
        assert!(events.iter().any(|out| out.event
            == ServerEvent::SettlementStarted {
                game_id: "123456".to_string(),
                winners: vec![1]
            }));
        game.check_invariants().unwrap();

        game.step(after(t0, 11.0 + 300.0));
        assert!(game.is_finished());
        assert!(game.drain_events().iter().any(|out| out.event.kind() == "game_cleanup"));
    }

    #[test]
    fn test_overspeed_only_emits_rejection() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(20, 20, 2), t0);
        game.step(t0);
        let start = Position::new(5.5, 5.5);
        game.players.get_mut(1).unwrap().place(start, t0);
        game.drain_events();

        let at = t0 + Duration::from_millis(100);
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: 10.5, pos_y: 5.5 }, at);

        let events = game.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to, Recipient::Player(1));
        match &events[0].event {
            ServerEvent::MovementRejected {
                reason,
                speed,
                max_speed,
                reset_position,
            } => {
                assert_eq!(*reason, RejectReason::TooFast);
                assert!((speed - 50.0).abs() < 1e-6);
                assert_eq!(*max_speed, 5.0);
                assert_eq!(*reset_position, start);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let player = game.players().get(1).unwrap();
        assert_eq!(player.position, start);
        assert_eq!(player.stats.total_distance, 0.0);
    }

    #[test]
    fn test_positions_update_is_throttled() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(20, 20, 2), t0);
        game.step(t0);
        game.players.get_mut(1).unwrap().place(Position::new(5.5, 5.5), t0);
        game.drain_events();

        let count_updates = |game: &mut Game| {
            game.drain_events()
                .iter()
                .filter(|out| out.event.kind() == "positions_update")
                .count()
        };

        let t1 = t0 + Duration::from_millis(100);
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: 5.9, pos_y: 5.5 }, t1);
        game.step(t1);
        assert_eq!(count_updates(&mut game), 1);

        let t2 = t0 + Duration::from_millis(150);
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: 6.1, pos_y: 5.5 }, t2);
        game.step(t2);
        assert_eq!(count_updates(&mut game), 0);

        game.step(t0 + Duration::from_millis(200));
        assert_eq!(count_updates(&mut game), 1);
        assert!((game.players().get(1).unwrap().stats.total_distance - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_no_moves_during_elimination_check() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(20, 20, 2), t0);
        game.step(t0);
        park_on_target(&mut game, 1, t0);
        park_on_target(&mut game, 2, t0);
        game.step(after(t0, 6.0));
        assert_eq!(game.round_phase(), Some(RoundPhase::EliminationCheck));

        let before = game.players().get(1).unwrap().position;
        game.drain_events();
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: before.x + 0.1, pos_y: before.y }, after(t0, 7.0));
        assert!(game.drain_events().is_empty());
        assert_eq!(game.players().get(1).unwrap().position, before);
    }

    #[test]
    fn test_alive_count_matches_standing_on_target() {
        for seed in 0..8u64 {
            let t0 = Instant::now();
            let mut game = Game::new("654321".to_string(), config(4, 4, 6), seed, t0);
            for name in ["a", "b", "c", "d", "e", "f"] {
                game.join(name, t0).unwrap();
            }
            game.step(t0);

            let mut rng = StdRng::seed_from_u64(seed);
            for id in 1..=6 {
                let spot = Position::new(rng.random_range(0.0..6.0), rng.random_range(0.0..6.0));
                game.players.get_mut(id).unwrap().place(spot, t0);
            }

            game.step(after(t0, 6.0));
            assert_eq!(game.round_phase(), Some(RoundPhase::EliminationCheck));
            let target = game.target().unwrap();
            let expected = game
                .players()
                .iter()
                .filter(|p| game.grid().color_at(p.position) == Some(target))
                .count();
            assert_eq!(game.alive_count(), expected, "seed {}", seed);
            game.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_disconnect_eliminated_at_next_check() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b", "c"], config(6, 6, 3), t0);
        game.step(t0);
        for id in 1..=3 {
            park_on_target(&mut game, id, t0);
        }

        game.step(after(t0, 2.0));
        game.leave(2, after(t0, 2.0));
        let player = game.players().get(2).unwrap();
        assert!(!player.is_connected);
        assert!(!player.is_eliminated);

        game.step(after(t0, 6.0));
        assert!(game.players().get(2).unwrap().is_eliminated);
        assert_eq!(game.alive_count(), 2);
    }

    #[test]
    fn test_rounds_progress_to_cap() {
        let t0 = Instant::now();
        let mut cfg = config(6, 6, 3);
        cfg.max_rounds = 4;
        let mut game = game_with(&["a", "b", "c"], cfg, t0);

        let mut now = t0;
        let mut seen_round = 0;
        let mut started_rounds = Vec::new();
        game.step(now);
        while game.phase() != GamePhase::Settlement {
            let current = game.current_round.as_ref().map(|round| round.number);
            if let Some(number) = current {
                if number != seen_round {
                    seen_round = number;
                    park_on_target(&mut game, 1, now);
                    park_on_target(&mut game, 2, now);
                    if number == 1 {
                        park_on_target(&mut game, 3, now);
                    } else {
                        game.players.get_mut(3).unwrap().place(Position::new(0.0, 0.0), now);
                    }
                }
            }
            for out in game.drain_events() {
                if let ServerEvent::RoundStarted { round, .. } = out.event {
                    started_rounds.push(round.round_number);
                }
            }
            now += Duration::from_millis(250);
            game.step(now);
            game.check_invariants().unwrap();
        }

        assert_eq!(started_rounds, vec![1, 2, 3, 4]);
        let logged: Vec<u32> = game.rounds().iter().map(|round| round.round_number).collect();
        assert_eq!(logged, vec![1, 2, 3, 4]);

        let dropped = &game.players().get(3).unwrap().stats;
        assert_eq!(dropped.eliminated_in_round, Some(2));
        assert_eq!(dropped.rounds_survived, 1);
        assert_eq!(dropped.final_position, Some(3));

        for id in [1, 2] {
            let stats = &game.players().get(id).unwrap().stats;
            assert_eq!(stats.rounds_survived, 4);
            assert_eq!(stats.endurance_bonus, 200);
            assert_eq!(stats.winner_bonus, 100);
            assert_eq!(stats.streak_bonus, 30);
        }
        let top: HashSet<u32> = [1, 2]
            .iter()
            .filter_map(|&id| game.players().get(id).unwrap().stats.final_position)
            .collect();
        assert_eq!(top, HashSet::from([1, 2]));
    }

    #[test]
    fn test_palette_shrinks_on_schedule() {
        let t0 = Instant::now();
        let mut cfg = config(6, 6, 2);
        cfg.palette.shrink_rounds = vec![1];
        cfg.palette.colors_removed_each = 4;
        let mut game = game_with(&["a", "b"], cfg, t0);
        game.step(t0);

        let view = game.view(t0);
        assert_eq!(view.active_colors.len(), 12);
        let target = game.target().unwrap();
        assert!(view.active_colors.contains(&target));
        for row in &view.map {
            for &id in row {
                assert!(view.active_colors.contains(&WoolColor::from(id)));
            }
        }
    }

    #[test]
    fn test_empty_lobby_tears_down() {
        let t0 = Instant::now();
        let mut game = game_with(&["a"], config(6, 6, 4), t0);
        game.leave(1, t0);
        game.step(t0);
        assert!(game.is_finished());
        assert!(game.drain_events().iter().any(|out| out.event.kind() == "game_cleanup"));
    }

    #[test]
    fn test_invariant_check_catches_phase_mismatch() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(6, 6, 4), t0);
        game.check_invariants().unwrap();
        game.phase = GamePhase::InGame;
        assert!(matches!(game.check_invariants(), Err(EngineError::InvariantViolation(_))));
    }

    #[test]
    fn test_view_is_a_copy() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(6, 6, 2), t0);
        let before = game.view(t0);
        game.step(t0);
        assert_eq!(before.phase, GamePhase::PreGame);
        assert_eq!(game.view(t0).phase, GamePhase::InGame);
        assert_eq!(before.player_count, 2);
    }

    /// Paint the whole map one color, then mark `cells` with the round's target.
    fn paint(game: &mut Game, background: WoolColor, target: WoolColor, cells: &[(usize, usize)]) {
        for y in 0..game.config.map_height {
            for x in 0..game.config.map_width {
                game.grid.set(x, y, background);
            }
        }
        for &(x, y) in cells {
            game.grid.set(x, y, target);
        }
        game.current_round.as_mut().unwrap().target = target;
    }

    #[test]
    fn test_move_after_rush_deadline_is_ignored_before_step() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b"], config(20, 20, 2), t0);
        game.step(t0);
        paint(&mut game, WoolColor::Blue, WoolColor::Red, &[(2, 2), (17, 2)]);
        game.players.get_mut(1).unwrap().place(Grid::cell_center(10, 2), t0);
        game.players.get_mut(2).unwrap().place(Grid::cell_center(2, 2), t0);
        assert_eq!(game.round_phase(), Some(RoundPhase::ColorCall));

        // Rush closed at t0 + 6s; no step has moved the round past ColorCall yet.
        let late = after(t0, 10.0);
        let onto_target = Grid::cell_center(17, 2);
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: onto_target.x, pos_y: onto_target.y }, late);
        assert_eq!(game.players().get(1).unwrap().position, Grid::cell_center(10, 2));

        game.step(late);
        assert_eq!(game.round_phase(), Some(RoundPhase::Transition));
        assert!(game.players().get(1).unwrap().is_eliminated);
        assert!(game.players().get(2).unwrap().is_alive());
    }

    #[test]
    fn test_lag_recheck_rescues_too_fast_but_not_teleport() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b", "c"], config(20, 20, 3), t0);
        game.step(t0);
        paint(&mut game, WoolColor::Blue, WoolColor::Red, &[(10, 5), (15, 12), (3, 3)]);
        let rush_start = after(t0, 1.0);
        game.step(rush_start);
        assert_eq!(game.round_phase(), Some(RoundPhase::Rush));
        game.players.get_mut(1).unwrap().place(Grid::cell_center(4, 5), rush_start);
        game.players.get_mut(2).unwrap().place(Grid::cell_center(2, 12), rush_start);
        game.players.get_mut(3).unwrap().place(Grid::cell_center(3, 3), rush_start);
        game.drain_events();

        // 6 blocks in 1s is over the 5.5 b/s ceiling but fits once 100ms of lag is granted.
        let at = after(t0, 2.0);
        let near = Grid::cell_center(10, 5);
        game.handle_intent(1, ClientMessage::PlayerUpdate { pos_x: near.x, pos_y: near.y }, at);
        // 13 blocks in 1s cannot be walked with any lag window.
        let far = Grid::cell_center(15, 12);
        game.handle_intent(2, ClientMessage::PlayerUpdate { pos_x: far.x, pos_y: far.y }, at);

        let reasons: Vec<(Recipient, RejectReason)> = game
            .drain_events()
            .into_iter()
            .filter_map(|out| match out.event {
                ServerEvent::MovementRejected { reason, .. } => Some((out.to, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                (Recipient::Player(1), RejectReason::TooFast),
                (Recipient::Player(2), RejectReason::Teleport)
            ]
        );
        assert_eq!(game.players().get(1).unwrap().position, Grid::cell_center(4, 5));

        game.step(after(t0, 6.0));
        assert_eq!(game.round_phase(), Some(RoundPhase::EliminationCheck));

        let rescued = game.players().get(1).unwrap();
        assert!(rescued.is_alive());
        assert_eq!(rescued.position, near);
        assert!((rescued.stats.total_distance - 6.0).abs() < 1e-9);
        assert_eq!(rescued.round_response, Some(Duration::from_secs(1)));

        let refused = game.players().get(2).unwrap();
        assert!(refused.is_eliminated);
        assert_eq!(refused.position, Grid::cell_center(2, 12));
        assert_eq!(refused.stats.total_distance, 0.0);
        assert_eq!(game.alive_count(), 2);
    }

    #[test]
    fn test_idle_lobby_tears_down() {
        let t0 = Instant::now();
        let mut game = Game::new("111111".to_string(), config(6, 6, 4), 7, t0);
        game.step(after(t0, 299.0));
        assert!(!game.is_finished());
        game.step(after(t0, 300.0));
        assert!(game.is_finished());
        assert!(game.drain_events().iter().any(|out| out.event.kind() == "game_cleanup"));

        // A lobby with someone waiting stays open.
        let mut waiting = game_with(&["a"], config(6, 6, 4), t0);
        waiting.step(after(t0, 24.0 * 3600.0));
        assert!(!waiting.is_finished());
        assert_eq!(waiting.phase(), GamePhase::PreGame);
    }

    #[test]
    fn test_start_announces_round_one_map() {
        let t0 = Instant::now();
        let mut game = game_with(&["a", "b", "c"], config(5, 5, 3), t0);
        game.step(t0);

        let events = game.drain_events();
        let started = events
            .iter()
            .find_map(|out| match &out.event {
                ServerEvent::GameStarted { map, .. } => Some(map.clone()),
                _ => None,
            })
            .unwrap();
        let round_map = events
            .iter()
            .find_map(|out| match &out.event {
                ServerEvent::RoundStarted { map, .. } => Some(map.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(started, round_map);
        assert_eq!(started, game.grid().rows());

        let kinds: Vec<&str> = events.iter().map(|out| out.event.kind()).collect();
        let game_started = kinds.iter().position(|k| *k == "game_started").unwrap();
        let round_started = kinds.iter().position(|k| *k == "round_started").unwrap();
        assert!(game_started < round_started);
    }
}
