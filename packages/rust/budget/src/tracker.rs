//! Joint cost-ceiling / wall-clock admission control.
//!
//! A single [`BudgetTracker`] is created per run and shared (via `Arc`) by the
//! scheduler, every worker, and the retry executor. All mutation goes through
//! one mutex so that a check and the matching update happen atomically: two
//! workers racing for the last slice of budget cannot both be admitted.
//!
//! Spend is split into two ledgers:
//! - *committed*: actual costs reported by finished calls, never decreases
//! - *reserved*: estimates held by in-flight tasks, replaced on commit
//!
//! Admission checks `committed + reserved + estimate <= ceiling`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use listscout_shared::{BudgetConfig, CancelReason};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stand-in deadline offset for limits too large to add to an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Admission errors
// ---------------------------------------------------------------------------

/// Why [`BudgetTracker::reserve`] refused to admit new work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    /// The estimate does not fit under the cost ceiling.
    #[error(
        "cost ceiling reached: ${committed_usd:.4} spent + ${reserved_usd:.4} reserved + ${requested_usd:.4} requested exceeds ${ceiling_usd:.2}"
    )]
    CostCeiling {
        committed_usd: f64,
        reserved_usd: f64,
        requested_usd: f64,
        ceiling_usd: f64,
    },

    /// No wall time is left.
    #[error("wall-time limit of {limit:?} exhausted")]
    WallTimeExhausted { limit: Duration },

    /// A commit overshot the ceiling earlier in the run.
    #[error("admission closed after the cost ceiling was overshot by ${overshoot_usd:.4}")]
    Closed { overshoot_usd: f64 },
}

impl AdmissionError {
    /// Outcome recorded for a task that was refused with this error.
    pub fn cancel_reason(&self) -> CancelReason {
        match self {
            Self::WallTimeExhausted { .. } => CancelReason::WallTime,
            Self::CostCeiling { .. } | Self::Closed { .. } => CancelReason::BudgetRefused,
        }
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// Provisional hold on part of the budget.
///
/// Must be handed back through [`BudgetTracker::commit`]. A reservation that
/// is dropped instead (aborted task) stays on the ledger until
/// [`BudgetTracker::settle_outstanding`] converts it into spend.
#[derive(Debug)]
#[must_use = "a reservation must be committed"]
pub struct Reservation {
    id: u64,
    estimate_usd: f64,
}

impl Reservation {
    pub fn estimate_usd(&self) -> f64 {
        self.estimate_usd
    }
}

// ---------------------------------------------------------------------------
// CostReport
// ---------------------------------------------------------------------------

/// Point-in-time summary of the budget, for logs and the run report.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub cost_ceiling_usd: f64,
    pub percentage_used: f64,
    /// Amount by which committed spend passed the ceiling (0 if it never did).
    pub overshoot_usd: f64,
    /// Largest estimate ever reserved; bounds how far spend may pass the ceiling.
    pub max_reservation_usd: f64,
    pub elapsed_secs: f64,
    pub wall_time_limit_secs: f64,
    pub refused_admissions: usize,
    pub admission_closed: bool,
}

// ---------------------------------------------------------------------------
// BudgetTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Ledger {
    committed_usd: f64,
    outstanding: HashMap<u64, f64>,
    next_id: u64,
    max_reservation_usd: f64,
    overshoot_usd: f64,
    refused: usize,
    closed: bool,
    warned: bool,
}

impl Ledger {
    fn reserved_usd(&self) -> f64 {
        self.outstanding.values().sum()
    }
}

/// Shared spend and wall-time gate for one run.
#[derive(Debug)]
pub struct BudgetTracker {
    ledger: Mutex<Ledger>,
    cost_ceiling_usd: f64,
    warn_fraction: f64,
    started: Instant,
    wall_time_limit: Duration,
}

impl BudgetTracker {
    /// Start tracking now with the given ceiling and wall-time limit.
    pub fn new(cost_ceiling_usd: f64, wall_time_limit: Duration) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            cost_ceiling_usd,
            warn_fraction: 0.8,
            started: Instant::now(),
            wall_time_limit,
        }
    }

    /// Build from the `[budget]` config section.
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(
            config.cost_ceiling_usd,
            Duration::from_secs(config.wall_time_secs),
        )
        .with_warn_fraction(config.warn_fraction)
    }

    /// Fraction of the ceiling at which a one-time spend warning is logged.
    pub fn with_warn_fraction(mut self, fraction: f64) -> Self {
        self.warn_fraction = fraction;
        self
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // Critical sections never panic mid-update.
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to admit work expected to cost `estimated_cost` USD.
    ///
    /// On success the estimate is held against the budget until the returned
    /// [`Reservation`] is committed. On refusal nothing is mutated apart from
    /// the refusal counter.
    pub fn reserve(&self, estimated_cost: f64) -> Result<Reservation, AdmissionError> {
        let estimate = if estimated_cost.is_nan() {
            0.0
        } else {
            estimated_cost.max(0.0)
        };

        let mut ledger = self.ledger();

        if self.remaining_wall_time().is_zero() {
            ledger.refused += 1;
            return Err(AdmissionError::WallTimeExhausted {
                limit: self.wall_time_limit,
            });
        }

        if ledger.closed {
            ledger.refused += 1;
            return Err(AdmissionError::Closed {
                overshoot_usd: ledger.overshoot_usd,
            });
        }

        let reserved_usd = ledger.reserved_usd();
        if ledger.committed_usd + reserved_usd + estimate > self.cost_ceiling_usd {
            ledger.refused += 1;
            return Err(AdmissionError::CostCeiling {
                committed_usd: ledger.committed_usd,
                reserved_usd,
                requested_usd: estimate,
                ceiling_usd: self.cost_ceiling_usd,
            });
        }

        let id = ledger.next_id;
        ledger.next_id += 1;
        ledger.outstanding.insert(id, estimate);
        ledger.max_reservation_usd = ledger.max_reservation_usd.max(estimate);

        debug!(
            reservation = id,
            estimate_usd = estimate,
            committed_usd = ledger.committed_usd,
            reserved_usd = reserved_usd + estimate,
            "budget reserved"
        );

        Ok(Reservation {
            id,
            estimate_usd: estimate,
        })
    }

    /// Replace a reservation with the actual cost of the work it admitted.
    ///
    /// The actual cost may be above or below the estimate. Spend that pushes
    /// the total past the ceiling is kept (it was really spent) and closes
    /// admission for the rest of the run.
    pub fn commit(&self, reservation: Reservation, actual_cost: f64) {
        let actual = if actual_cost.is_nan() {
            0.0
        } else {
            actual_cost.max(0.0)
        };

        let mut ledger = self.ledger();

        if ledger.outstanding.remove(&reservation.id).is_none() {
            warn!(
                reservation = reservation.id,
                "commit for a reservation that was already settled, ignoring"
            );
            return;
        }

        ledger.committed_usd += actual;
        self.after_spend(&mut ledger);

        debug!(
            reservation = reservation.id,
            estimate_usd = reservation.estimate_usd,
            actual_usd = actual,
            committed_usd = ledger.committed_usd,
            "budget committed"
        );
    }

    /// Convert every outstanding reservation into committed spend at its
    /// estimate. Returns how many reservations were settled.
    pub fn settle_outstanding(&self) -> usize {
        let mut ledger = self.ledger();
        let settled: Vec<(u64, f64)> = ledger.outstanding.drain().collect();
        for (id, estimate) in &settled {
            warn!(
                reservation = id,
                estimate_usd = estimate,
                "settling abandoned reservation at its estimate"
            );
            ledger.committed_usd += estimate;
        }
        if !settled.is_empty() {
            self.after_spend(&mut ledger);
        }
        settled.len()
    }

    fn after_spend(&self, ledger: &mut Ledger) {
        let ceiling = self.cost_ceiling_usd;

        if !ledger.warned && ledger.committed_usd >= ceiling * self.warn_fraction {
            ledger.warned = true;
            warn!(
                spent_usd = ledger.committed_usd,
                ceiling_usd = ceiling,
                "approaching cost ceiling"
            );
        }

        if ledger.committed_usd > ceiling {
            let overshoot = ledger.committed_usd - ceiling;
            if overshoot > ledger.overshoot_usd {
                ledger.overshoot_usd = overshoot;
            }
            if !ledger.closed {
                ledger.closed = true;
                warn!(
                    spent_usd = ledger.committed_usd,
                    ceiling_usd = ceiling,
                    overshoot_usd = overshoot,
                    "cost ceiling overshot, closing admission"
                );
            }
        }
    }

    /// Committed spend so far. Monotonically non-decreasing.
    pub fn spent_usd(&self) -> f64 {
        self.ledger().committed_usd
    }

    /// Sum of estimates currently held by in-flight work.
    pub fn reserved_usd(&self) -> f64 {
        self.ledger().reserved_usd()
    }

    pub fn cost_ceiling_usd(&self) -> f64 {
        self.cost_ceiling_usd
    }

    /// Wall time left before the run deadline. Shrinks between calls, so
    /// callers re-check before starting new work.
    pub fn remaining_wall_time(&self) -> Duration {
        self.wall_time_limit.saturating_sub(self.started.elapsed())
    }

    /// The instant at which the wall-time limit expires.
    pub fn deadline(&self) -> Instant {
        self.started
            .checked_add(self.wall_time_limit)
            .unwrap_or_else(|| self.started + FAR_FUTURE)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_wall_time().is_zero()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Snapshot for reporting.
    pub fn report(&self) -> CostReport {
        let ledger = self.ledger();
        let percentage_used = if self.cost_ceiling_usd > 0.0 {
            ledger.committed_usd / self.cost_ceiling_usd * 100.0
        } else {
            0.0
        };
        CostReport {
            spent_usd: ledger.committed_usd,
            reserved_usd: ledger.reserved_usd(),
            cost_ceiling_usd: self.cost_ceiling_usd,
            percentage_used,
            overshoot_usd: ledger.overshoot_usd,
            max_reservation_usd: ledger.max_reservation_usd,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            wall_time_limit_secs: self.wall_time_limit.as_secs_f64(),
            refused_admissions: ledger.refused,
            admission_closed: ledger.closed,
        }
    }
}
