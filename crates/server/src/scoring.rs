//! Elimination and scoring.
//!
//! Placement is 1-based; 1 is the winner. Players eliminated in the same check share
//! the best placement still open to them, so iteration order never decides a score.

use crate::config::ScoringConfig;
use crate::grid::Grid;
use crate::server::player::{Player, PlayerId, PlayerRegistry};
use protocol::{PlayerStats, WoolColor};
use std::cmp::Ordering;
use std::time::Duration;

/// Alive players standing anywhere but a `target` tile, plus alive players who disconnected.
pub fn find_off_target(grid: &Grid, target: WoolColor, players: &PlayerRegistry) -> Vec<PlayerId> {
    players
        .iter()
        .filter(|p| p.is_alive())
        .filter(|p| !p.is_connected || grid.color_at(p.position) != Some(target))
        .map(|p| p.id)
        .collect()
}

/// Provisional placement shared by a batch eliminated together.
///
/// Position 1 is reserved for a survivor: when a batch wipes out the whole field it
/// ranks second and the game has no winner.
pub fn batch_placement(alive_after: usize) -> u32 {
    (alive_after as u32 + 1).max(2)
}

pub fn elimination_bonus(config: &ScoringConfig, total_players: usize, placement: u32) -> u32 {
    config.elimination_bonus_multiplier * (total_players as u32).saturating_sub(placement)
}

/// Eliminate `ids` as one batch in `round`. Already-eliminated ids are skipped.
/// Returns the ids that were actually eliminated.
pub fn eliminate_batch(
    players: &mut PlayerRegistry,
    ids: &[PlayerId],
    round: u32,
    total_players: usize,
    eliminated_at_ms: u64,
    config: &ScoringConfig,
) -> Vec<PlayerId> {
    let fresh: Vec<PlayerId> = ids
        .iter()
        .copied()
        .filter(|&id| players.get(id).is_some_and(Player::is_alive))
        .collect();
    if fresh.is_empty() {
        return fresh;
    }

    let placement = batch_placement(players.alive_count() - fresh.len());
    let bonus = elimination_bonus(config, total_players, placement);

    for &id in &fresh {
        players.mark_eliminated(id);
        if let Some(player) = players.get_mut(id) {
            let stats = &mut player.stats;
            stats.eliminated_at = Some(eliminated_at_ms);
            stats.eliminated_in_round = Some(round);
            stats.rounds_survived = round.saturating_sub(1);
            stats.final_position = Some(placement);
            stats.current_streak = 0;
            stats.elimination_bonus += bonus;
            stats.recompute_score();
        }
    }
    fresh
}

/// Credit a player who survived a round. Returns the points earned this round.
///
/// `response` is the time from rush start to the last accepted move onto the target;
/// `None` means the player never moved onto it and earns no speed bonus.
pub fn award_survival(stats: &mut PlayerStats, response: Option<Duration>, rush: Duration, config: &ScoringConfig) -> u32 {
    let mut points = config.survival_points_per_round;
    stats.rounds_survived += 1;
    stats.survival_points += config.survival_points_per_round;

    stats.current_streak += 1;
    stats.longest_streak = stats.longest_streak.max(stats.current_streak);
    let streak: u32 = config
        .streak_bonuses
        .iter()
        .filter(|bonus| bonus.streak == stats.current_streak)
        .map(|bonus| bonus.points)
        .sum();
    stats.streak_bonus += streak;
    points += streak;

    if let Some(response) = response {
        let secs = response.as_secs_f64();
        if secs < config.perfect_bonus_threshold {
            stats.speed_bonus += config.perfect_bonus_points;
            stats.perfect_rounds += 1;
            points += config.perfect_bonus_points;
        } else if secs < config.speed_bonus_threshold {
            stats.speed_bonus += config.speed_bonus_points;
            points += config.speed_bonus_points;
        }
    }

    let secs = response.unwrap_or(rush).as_secs_f64();
    let n = stats.rounds_survived as f64;
    stats.average_response_time += (secs - stats.average_response_time) / n;

    stats.recompute_score();
    points
}

/// Tie-break order among survivors: score, rounds survived, then faster average response.
fn compare_survivors(a: &Player, b: &Player) -> Ordering {
    b.stats
        .score
        .cmp(&a.stats.score)
        .then(b.stats.rounds_survived.cmp(&a.stats.rounds_survived))
        .then(
            a.stats
                .average_response_time
                .partial_cmp(&b.stats.average_response_time)
                .unwrap_or(Ordering::Equal),
        )
}

/// Order among eliminated players: later elimination first, then provisional placement,
/// then the survivor tie-breaks.
fn compare_eliminated(a: &Player, b: &Player) -> Ordering {
    b.stats
        .eliminated_in_round
        .cmp(&a.stats.eliminated_in_round)
        .then(a.stats.final_position.cmp(&b.stats.final_position))
        .then_with(|| compare_survivors(a, b))
}

/// Survivors partitioned into groups that no tie-break separates, best first.
pub fn rank_survivors(players: &PlayerRegistry) -> Vec<Vec<PlayerId>> {
    let mut survivors: Vec<&Player> = players.iter().filter(|p| p.is_alive()).collect();
    survivors.sort_by(|a, b| compare_survivors(a, b).then(a.id.cmp(&b.id)));

    let mut groups: Vec<Vec<PlayerId>> = Vec::new();
    let mut previous: Option<&Player> = None;
    for player in survivors {
        match (previous, groups.last_mut()) {
            (Some(prev), Some(group)) if compare_survivors(prev, player) == Ordering::Equal => {
                group.push(player.id)
            }
            _ => groups.push(vec![player.id]),
        }
        previous = Some(player);
    }
    groups
}

/// Outcome of settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// Players sharing first place, in final-position order. Empty when nobody survived.
    pub winners: Vec<PlayerId>,
    /// Every ranked player, ordered by final position.
    pub standings: Vec<PlayerId>,
}

/// Assign final positions and end-of-game bonuses.
///
/// Survivors take positions from 1; a group tied on every criterion shares the bonus tier
/// and is ordered by join order. Eliminated players follow. Spectators are not ranked.
pub fn settle(players: &mut PlayerRegistry, config: &ScoringConfig, round_cap_reached: bool) -> Settlement {
    let groups = rank_survivors(players);

    if round_cap_reached {
        for id in groups.iter().flatten() {
            if let Some(player) = players.get_mut(*id) {
                player.stats.endurance_bonus += config.endurance_bonus;
                player.stats.recompute_score();
            }
        }
    }

    let winners = groups.first().cloned().unwrap_or_default();
    for id in &winners {
        if let Some(player) = players.get_mut(*id) {
            player.stats.winner_bonus += config.final_winner_bonus;
            player.stats.recompute_score();
        }
    }

    let mut standings: Vec<PlayerId> = groups.into_iter().flatten().collect();
    let mut eliminated: Vec<&Player> = players
        .iter()
        .filter(|p| !p.is_spectator && p.is_eliminated)
        .collect();
    eliminated.sort_by(|a, b| compare_eliminated(a, b).then(a.id.cmp(&b.id)));
    let eliminated: Vec<PlayerId> = eliminated.into_iter().map(|p| p.id).collect();

    let first_eliminated_position = if standings.is_empty() { 2 } else { standings.len() as u32 + 1 };
    for (i, id) in standings.iter().enumerate() {
        if let Some(player) = players.get_mut(*id) {
            player.stats.final_position = Some(i as u32 + 1);
        }
    }
    for (i, id) in eliminated.iter().enumerate() {
        if let Some(player) = players.get_mut(*id) {
            player.stats.final_position = Some(first_eliminated_position + i as u32);
        }
    }

    standings.extend(eliminated);
    Settlement { winners, standings }
}
