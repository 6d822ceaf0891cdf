//! Movement validation (anti-cheat).
//!
//! Speeds are in blocks per second. The validator is a pure function of the last
//! accepted sample and the proposed one; callers decide what to roll back.

use crate::config::MovementConfig;
use crate::grid::Grid;
use protocol::{Position, RejectReason};
use std::time::{Duration, Instant};

/// A position observed at a server-side instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveSample {
    pub position: Position,
    pub at: Instant,
}

impl MoveSample {
    pub fn new(position: Position, at: Instant) -> Self {
        Self { position, at }
    }
}

/// A refused move and the measurements that condemned it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub speed: f64,
    pub max_speed: f64,
}

/// Validator outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Move is legal; `distance` should be added to the mover's travel stats.
    Accepted { distance: f64 },
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

/// Check a proposed move against the last accepted one.
///
/// `grace` widens the elapsed time, used by the lag-compensated re-check.
pub fn validate(
    bounds: &Grid,
    limits: &MovementConfig,
    last: Option<MoveSample>,
    proposed: MoveSample,
    grace: Duration,
) -> Verdict {
    if !bounds.contains(proposed.position) {
        return Verdict::Rejected(Rejection {
            reason: RejectReason::OutOfBounds,
            speed: 0.0,
            max_speed: limits.max_speed,
        });
    }

    // First update for this player.
    let Some(last) = last else {
        return Verdict::Accepted { distance: 0.0 };
    };

    let distance = last.position.distance(proposed.position);
    if distance == 0.0 {
        return Verdict::Accepted { distance };
    }

    let elapsed = proposed.at.saturating_duration_since(last.at) + grace;
    let elapsed_secs = elapsed.as_secs_f64();
    let speed = if elapsed_secs > 0.0 {
        distance / elapsed_secs
    } else {
        f64::INFINITY
    };

    let ceiling = limits.max_speed * limits.speed_tolerance;
    if speed <= ceiling {
        return Verdict::Accepted { distance };
    }

    // Even granting the whole lag window at full speed the jump cannot be walked.
    let reach = ceiling * (elapsed_secs + limits.lag_compensation_ms as f64 / 1000.0);
    let reason = if distance > reach.max(limits.teleport_distance) {
        RejectReason::Teleport
    } else {
        RejectReason::TooFast
    };

    Verdict::Rejected(Rejection {
        reason,
        speed,
        max_speed: limits.max_speed,
    })
}
