use crate::bulk::WorldBulk;
use blockwright_protocol::{BlockType, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One individual placement: what was at `position` before we wrote to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VanillaEntry {
    pub position: Vec3,
    pub previous: BlockType,
}

/// One successfully dispatched bulk command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEntry {
    pub step_index: usize,
    pub command: WorldBulk,
    pub origin: Vec3,
    pub timestamp: String,
}

/// Undo entries recorded by one run, in recording order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunHistory {
    pub run_id: String,
    pub vanilla: Vec<VanillaEntry>,
    pub bulk: Vec<BulkEntry>,
}

impl RunHistory {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vanilla.is_empty() && self.bulk.is_empty()
    }
}

/// Per-run undo frames, newest last. Only the newest frame is undoable; once
/// undone it is dropped and the run before it becomes the newest.
#[derive(Debug, Clone)]
pub struct UndoHistory {
    runs: VecDeque<RunHistory>,
    retention: usize,
}

impl UndoHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            runs: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn push(&mut self, run: RunHistory) {
        self.runs.push_back(run);
        while self.runs.len() > self.retention {
            self.runs.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&RunHistory> {
        self.runs.back()
    }

    /// Removes and returns the newest frame if it holds anything to undo.
    pub fn take_latest(&mut self) -> Option<RunHistory> {
        if self.runs.back().is_some_and(|r| !r.is_empty()) {
            self.runs.pop_back()
        } else {
            None
        }
    }

    /// Drops a run's frame wherever it sits, for a run whose entries moved
    /// to another frame.
    pub fn remove_run(&mut self, run_id: &str) -> Option<RunHistory> {
        let at = self.runs.iter().position(|r| r.run_id == run_id)?;
        self.runs.remove(at)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
