//! Logical build cursor.
//!
//! The cursor position is build-relative and starts at the origin. Step
//! coordinates are offsets from the position; `resolve` turns a build-relative
//! coordinate into a world coordinate. The position only moves through explicit
//! cursor steps or through `reconcile` after a bulk command.

use crate::world::BulkOutcome;
use blockwright_protocol::Vec3;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    origin: Vec3,
    position: Vec3,
    history: Vec<Vec3>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub corrected: bool,
    pub drift: Vec3,
    pub warning: Option<String>,
}

impl Cursor {
    pub fn new(origin: Vec3) -> Self {
        Self {
            origin,
            position: Vec3::ZERO,
            history: Vec::new(),
        }
    }

    /// Cursor restored from a checkpoint.
    pub fn at(origin: Vec3, position: Vec3) -> Self {
        Self {
            origin,
            position,
            history: Vec::new(),
        }
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn history(&self) -> &[Vec3] {
        &self.history
    }

    pub fn resolve(&self, relative: Vec3) -> Vec3 {
        self.origin + relative
    }

    /// Build-relative coordinate of a step-local offset.
    pub fn offset(&self, local: Vec3) -> Vec3 {
        self.position + local
    }

    pub fn move_by(&mut self, offset: Vec3) {
        self.history.push(self.position);
        self.position = self.position + offset;
    }

    /// Returns to the position before the last move. False when there is none.
    pub fn back(&mut self) -> bool {
        match self.history.pop() {
            Some(p) => {
                self.position = p;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.position = Vec3::ZERO;
        self.history.clear();
    }

    /// Compare where a bulk command was expected to end (build-relative max
    /// corner) against what the world reported, and correct small drift.
    pub fn reconcile(
        &mut self,
        expected_end: Vec3,
        outcome: &BulkOutcome,
        ceiling: f64,
    ) -> Reconciliation {
        let Some(actual) = outcome.actual_bounds else {
            let warning = (outcome.blocks_changed == Some(0))
                .then(|| "bulk command reported no changes; possible no-op".to_string());
            return Reconciliation {
                corrected: false,
                drift: Vec3::ZERO,
                warning,
            };
        };

        let actual_end = actual.max - self.origin;
        let drift = actual_end - expected_end;
        let magnitude = drift.length();
        if magnitude == 0.0 {
            return Reconciliation {
                corrected: false,
                drift,
                warning: None,
            };
        }
        if magnitude <= ceiling {
            let before = self.position;
            self.position = self.position + drift;
            info!(%drift, from = %before, to = %self.position, "cursor drift corrected");
            return Reconciliation {
                corrected: true,
                drift,
                warning: None,
            };
        }
        debug!(%drift, magnitude, ceiling, "drift above correction ceiling");
        Reconciliation {
            corrected: false,
            drift,
            warning: Some(format!(
                "bulk command ended at {actual_end}, expected {expected_end} (drift {magnitude:.1} > {ceiling}); cursor not corrected"
            )),
        }
    }
}
