use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use super::expr::{self, ExprError};
use super::watchpoint::{WatchpointId, WatchpointPool};
use super::Inspect;

/// A watchpoint whose expression changed value since the last check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchpointHit {
    pub id: WatchpointId,
    pub expression: String,
    pub old_value: i32,
    pub new_value: i32,
}

impl fmt::Display for WatchpointHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hardware watchpoint {}: {}", self.id, self.expression)?;
        writeln!(f, "Old value: {}", self.old_value)?;
        write!(f, "New value: {}", self.new_value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Unchanged,
    Changed(Vec<WatchpointHit>),
    /// Evaluation of `id` failed. Hits recorded before the failure are kept.
    Failed {
        id: WatchpointId,
        error: ExprError,
        hits: Vec<WatchpointHit>,
    },
}

impl CheckOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, CheckOutcome::Unchanged)
    }

    pub fn hits(&self) -> &[WatchpointHit] {
        match self {
            CheckOutcome::Unchanged => &[],
            CheckOutcome::Changed(hits) | CheckOutcome::Failed { hits, .. } => hits,
        }
    }
}

/// Re-evaluates every active watchpoint. A changed value bumps the hit count and becomes
/// the new baseline; the first evaluation failure ends the check.
pub fn check_all<S: Inspect + ?Sized>(pool: &mut WatchpointPool, state: &S) -> CheckOutcome {
    let mut hits = Vec::new();
    let mut failure = None;

    pool.visit_mut(|watchpoint| match expr::evaluate(&watchpoint.expression, state) {
        Ok(value) if value == watchpoint.baseline => true,
        Ok(value) => {
            watchpoint.hit_count += 1;
            info!(
                id = watchpoint.id,
                expression = watchpoint.expression.as_str(),
                old_value = watchpoint.baseline,
                new_value = value,
                "watchpoint hit"
            );
            hits.push(WatchpointHit {
                id: watchpoint.id,
                expression: watchpoint.expression.clone(),
                old_value: watchpoint.baseline,
                new_value: value,
            });
            watchpoint.baseline = value;
            true
        }
        Err(error) => {
            warn!(
                id = watchpoint.id,
                expression = watchpoint.expression.as_str(),
                %error,
                "watchpoint check failed"
            );
            failure = Some((watchpoint.id, error));
            false
        }
    });

    match failure {
        Some((id, error)) => CheckOutcome::Failed { id, error, hits },
        None if hits.is_empty() => CheckOutcome::Unchanged,
        None => CheckOutcome::Changed(hits),
    }
}
