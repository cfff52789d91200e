//! Timer-driven pattern sequencer.
//!
//! Every launched square becomes an independent activation that walks
//! `Pending -> Warning -> Damage -> Cleared`. All activations share one
//! min-heap of absolute fire times, so the event loop only ever has to sleep
//! until [`Sequencer::next_deadline`] and then call [`Sequencer::fire_next`]
//! until nothing is due. Each call applies exactly one transition or hit
//! sweep to the session, which lets the caller broadcast after every step.
//!
//! Activations are never cancelled and never wait on each other. The
//! sequencer keeps its own copy of each launched square, so deleting the
//! saved pattern afterwards has no effect on a cascade already in flight.

use crate::session::Session;
use log::debug;
use shared::{
    ActiveSquare, ConnectionId, Pattern, Phase, DEFAULT_SQUARE_DURATION_SECS,
    DEFAULT_TIMING_SECS, HIT_SWEEP_INTERVAL_SECS, WARNING_DURATION_SECS,
};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::{Duration, Instant};

/// Longest delay or damage phase accepted from a pattern, in seconds.
const MAX_SCHEDULE_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Where an activation is in its lifecycle. `Cleared` activations are
/// dropped from the schedule rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Warning { id: u64 },
    Damage { id: u64, sweeps_done: u32 },
}

/// What a single [`Sequencer::fire_next`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Square appeared in its warning phase.
    Warning,
    /// Warning instance replaced by a damage instance, with the entry sweep.
    Damage,
    /// Follow-up hit sweep while in the damage phase.
    Sweep,
    /// Damage instance removed.
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerEvent {
    pub square_id: u64,
    pub row: u32,
    pub col: u32,
    pub transition: Transition,
    /// Players whose hit counter was bumped by this step.
    pub hits: Vec<ConnectionId>,
    /// Scheduled fire time of the step.
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct Activation {
    row: u32,
    col: u32,
    launched_at: Instant,
    delay: Duration,
    duration: Duration,
    /// Hit sweeps run during the damage phase, entry sweep included.
    sweeps: u32,
    stage: Stage,
}

impl Activation {
    fn damage_start(&self) -> Instant {
        self.launched_at + self.delay + Duration::from_secs(WARNING_DURATION_SECS)
    }

    fn next_fire(&self) -> Instant {
        match self.stage {
            Stage::Pending => self.launched_at + self.delay,
            Stage::Warning { .. } => self.damage_start(),
            Stage::Damage { sweeps_done, .. } if sweeps_done < self.sweeps => {
                self.damage_start()
                    + Duration::from_secs(HIT_SWEEP_INTERVAL_SECS * u64::from(sweeps_done))
            }
            Stage::Damage { .. } => self.damage_start() + self.duration,
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    at: Instant,
    /// Launch order, breaks ties between activations due at the same instant.
    order: u64,
    activation: Activation,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.order == other.order
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.order).cmp(&(other.at, other.order))
    }
}

#[derive(Debug, Default)]
pub struct Sequencer {
    queue: BinaryHeap<Reverse<Scheduled>>,
    next_order: u64,
    last_square_id: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules every square of `pattern` relative to `now`. Returns the
    /// number of activations added.
    pub fn launch(&mut self, pattern: &Pattern, now: Instant) -> usize {
        for square in &pattern.squares {
            let delay = seconds_to_duration(square.timing, DEFAULT_TIMING_SECS);
            let duration = seconds_to_duration(square.duration, DEFAULT_SQUARE_DURATION_SECS);
            let sweeps = (duration.as_secs_f64() / HIT_SWEEP_INTERVAL_SECS as f64).floor() as u32;

            let activation = Activation {
                row: square.row,
                col: square.col,
                launched_at: now,
                delay,
                duration,
                sweeps: sweeps.max(1),
                stage: Stage::Pending,
            };

            let order = self.next_order;
            self.next_order += 1;
            self.queue.push(Reverse(Scheduled {
                at: activation.next_fire(),
                order,
                activation,
            }));
        }

        debug!(
            "Launched pattern {} with {} squares",
            pattern.name,
            pattern.squares.len()
        );
        pattern.squares.len()
    }

    /// Fire time of the earliest pending step, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(scheduled)| scheduled.at)
    }

    /// Number of activations that have not been cleared yet.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Applies the earliest step due at or before `now`.
    pub fn fire_next(&mut self, now: Instant, session: &mut Session) -> Option<SequencerEvent> {
        if self.next_deadline()? > now {
            return None;
        }
        let Reverse(mut scheduled) = self.queue.pop()?;

        let event = self.step(&mut scheduled.activation, scheduled.at, session);
        if event.transition != Transition::Cleared {
            scheduled.at = scheduled.activation.next_fire();
            self.queue.push(Reverse(scheduled));
        }

        debug!(
            "Square {} at ({}, {}): {:?}, {} hit",
            event.square_id,
            event.row,
            event.col,
            event.transition,
            event.hits.len()
        );
        Some(event)
    }

    /// Applies every step due at or before `now`, in fire-time order.
    pub fn fire_due(&mut self, now: Instant, session: &mut Session) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.fire_next(now, session) {
            events.push(event);
        }
        events
    }

    fn step(
        &mut self,
        activation: &mut Activation,
        at: Instant,
        session: &mut Session,
    ) -> SequencerEvent {
        let (row, col) = (activation.row, activation.col);

        let (square_id, transition, hits) = match activation.stage {
            Stage::Pending => {
                self.last_square_id += 1;
                let id = self.last_square_id;
                session.add_active_square(ActiveSquare {
                    id,
                    row,
                    col,
                    phase: Phase::Warning,
                });
                activation.stage = Stage::Warning { id };
                (id, Transition::Warning, Vec::new())
            }
            Stage::Warning { id } => {
                session.remove_active_square(id);
                session.add_active_square(ActiveSquare {
                    id,
                    row,
                    col,
                    phase: Phase::Damage,
                });
                let hits = session.sweep_hits(row, col);
                activation.stage = Stage::Damage { id, sweeps_done: 1 };
                (id, Transition::Damage, hits)
            }
            Stage::Damage { id, sweeps_done } if sweeps_done < activation.sweeps => {
                let hits = session.sweep_hits(row, col);
                activation.stage = Stage::Damage {
                    id,
                    sweeps_done: sweeps_done + 1,
                };
                (id, Transition::Sweep, hits)
            }
            Stage::Damage { id, .. } => {
                session.remove_active_square(id);
                (id, Transition::Cleared, Vec::new())
            }
        };

        SequencerEvent {
            square_id,
            row,
            col,
            transition,
            hits,
            at,
        }
    }
}

fn seconds_to_duration(seconds: f64, fallback: f64) -> Duration {
    let seconds = if seconds.is_finite() && seconds >= 0.0 {
        seconds
    } else {
        fallback
    };
    Duration::from_secs_f64(seconds.min(MAX_SCHEDULE_SECS))
}
