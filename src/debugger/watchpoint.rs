use std::{collections::VecDeque, fmt};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::expr::{self, ExprError};
use super::Inspect;

pub type WatchpointId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchpointError {
    #[error("all {capacity} watchpoints are in use")]
    ResourceExhausted { capacity: usize },
    #[error("there is no watchpoint NO.{0}")]
    NotFound(WatchpointId),
    #[error("cannot watch `{expression}`: {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExprError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub id: WatchpointId,
    pub expression: String,
    pub baseline: i32,
    pub hit_count: u32,
}

/// Row of the `info w` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchpointInfo {
    pub id: WatchpointId,
    pub expression: String,
    pub hit_count: u32,
}

impl From<&Watchpoint> for WatchpointInfo {
    fn from(watchpoint: &Watchpoint) -> Self {
        Self {
            id: watchpoint.id,
            expression: watchpoint.expression.clone(),
            hit_count: watchpoint.hit_count,
        }
    }
}

impl fmt::Display for WatchpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6} {:<15} {}", self.id, self.expression, self.hit_count)
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    Active(Watchpoint),
}

/// Fixed arena of watchpoint slots. Every slot index is either on the free stack or in the
/// active list, never both; the active list is ordered newest first.
#[derive(Debug)]
pub struct WatchpointPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    active: VecDeque<usize>,
    next_id: WatchpointId,
}

impl WatchpointPool {
    pub const CAPACITY: usize = 32;

    pub fn new() -> Self {
        Self {
            slots: (0..Self::CAPACITY).map(|_| Slot::Free).collect(),
            // reversed so slot 0 is handed out first
            free: (0..Self::CAPACITY).rev().collect(),
            active: VecDeque::with_capacity(Self::CAPACITY),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Registers `expression` with its current value as baseline. Nothing is consumed when
    /// the pool is full or the expression does not evaluate.
    pub fn create<S: Inspect + ?Sized>(
        &mut self,
        expression: &str,
        state: &S,
    ) -> Result<WatchpointId, WatchpointError> {
        if self.free.is_empty() {
            return Err(WatchpointError::ResourceExhausted {
                capacity: Self::CAPACITY,
            });
        }
        let baseline =
            expr::evaluate(expression, state).map_err(|source| WatchpointError::Expression {
                expression: expression.to_owned(),
                source,
            })?;

        let index = match self.free.pop() {
            Some(index) => index,
            None => panic!("watchpoint free list emptied between check and pop"),
        };
        let id = self.next_id;
        self.next_id += 1;

        let slot = &mut self.slots[index];
        if let Slot::Active(existing) = slot {
            panic!(
                "free slot {} still holds watchpoint NO.{} ({:?})",
                index, existing.id, existing.expression
            );
        }
        *slot = Slot::Active(Watchpoint {
            id,
            expression: expression.to_owned(),
            baseline,
            hit_count: 0,
        });
        self.active.push_front(index);

        info!(id, expression, baseline, slot = index, "watchpoint created");
        Ok(id)
    }

    /// Returns whether a watchpoint with `id` existed and was removed.
    pub fn delete(&mut self, id: WatchpointId) -> bool {
        let position = self
            .active
            .iter()
            .position(|&index| self.watchpoint(index).id == id);
        let position = match position {
            Some(position) => position,
            None => return false,
        };

        let index = self.active.remove(position).unwrap_or_else(|| {
            panic!("active list lost position {} while deleting NO.{}", position, id)
        });
        self.slots[index] = Slot::Free;
        self.free.push(index);

        info!(id, slot = index, "watchpoint deleted");
        true
    }

    /// Snapshot of the active list, newest first.
    pub fn list(&self) -> Vec<WatchpointInfo> {
        self.iter().map(WatchpointInfo::from).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint> + '_ {
        self.active.iter().map(|&index| self.watchpoint(index))
    }

    pub fn get(&self, id: WatchpointId) -> Option<&Watchpoint> {
        self.iter().find(|watchpoint| watchpoint.id == id)
    }

    /// Visits every active watchpoint once, in list order, until `visit` returns `false`.
    pub(super) fn visit_mut(&mut self, mut visit: impl FnMut(&mut Watchpoint) -> bool) {
        for &index in &self.active {
            match &mut self.slots[index] {
                Slot::Active(watchpoint) => {
                    if !visit(watchpoint) {
                        break;
                    }
                }
                Slot::Free => panic!("active list refers to free slot {}", index),
            }
        }
    }

    fn watchpoint(&self, index: usize) -> &Watchpoint {
        match &self.slots[index] {
            Slot::Active(watchpoint) => watchpoint,
            Slot::Free => panic!("active list refers to free slot {}", index),
        }
    }
}

impl Default for WatchpointPool {
    fn default() -> Self {
        Self::new()
    }
}
