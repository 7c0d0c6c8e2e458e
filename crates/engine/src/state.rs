use crate::error::{BuildError, BuildResult};
use blockwright_protocol::{BuildReport, Counters, Progress};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

/// Mutable bookkeeping of the active run. Owned by the run and passed down by
/// `&mut`; observers only see `ProgressState` snapshots.
#[derive(Debug)]
pub struct BuildRunState {
    pub run_id: String,
    pub counters: Counters,
    pub warnings: Vec<String>,
    pub started: Instant,
    pub step_index: usize,
    pub steps_completed: usize,
    pub cancelled: bool,
    /// Blocks requested so far (placements plus bulk estimates), checked against `max_blocks`.
    pub blocks_requested: u64,
}

impl BuildRunState {
    pub fn new(run_id: impl Into<String>, first_step: usize) -> Self {
        Self {
            run_id: run_id.into(),
            counters: Counters::default(),
            warnings: Vec::new(),
            started: Instant::now(),
            step_index: first_step,
            steps_completed: 0,
            cancelled: false,
            blocks_requested: 0,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, step = self.step_index, "{message}");
        self.warnings.push(message);
    }

    /// Fails if `blocks` more would exceed `limit`; charges nothing.
    pub fn ensure_room(&self, blocks: u64, limit: u64) -> BuildResult<u64> {
        let total = self.blocks_requested.saturating_add(blocks);
        if total > limit {
            return Err(BuildError::ResourceLimit { total, limit });
        }
        Ok(total)
    }

    pub fn charge(&mut self, blocks: u64, limit: u64) -> BuildResult<()> {
        self.blocks_requested = self.ensure_room(blocks, limit)?;
        Ok(())
    }

    pub fn refund(&mut self, blocks: u64) {
        self.blocks_requested = self.blocks_requested.saturating_sub(blocks);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    pub fn publish(&self, progress: &watch::Sender<ProgressState>) {
        progress.send_modify(|p| {
            p.blocks_placed = self.counters.blocks_placed;
            p.blocks_failed = self.counters.blocks_failed;
        });
    }

    pub fn report(&self) -> BuildReport {
        let c = &self.counters;
        BuildReport {
            run_id: self.run_id.clone(),
            blocks_placed: c.blocks_placed,
            blocks_failed: c.blocks_failed,
            blocks_skipped: c.blocks_skipped,
            bulk_ops: c.bulk_ops,
            fallbacks_used: c.fallbacks_used,
            warnings: self.warnings.clone(),
            duration_ms: self.elapsed_ms(),
            steps_completed: self.steps_completed,
            cancelled: self.cancelled,
        }
    }
}

/// What `Builder::progress` reads. Elapsed time freezes when the run ends.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub blocks_placed: u64,
    pub blocks_failed: u64,
    pub started: Option<Instant>,
    pub finished_after_ms: Option<u64>,
    pub active: bool,
}

impl ProgressState {
    pub fn started_now() -> Self {
        Self {
            started: Some(Instant::now()),
            active: true,
            ..Self::default()
        }
    }

    pub fn finish(&mut self) {
        self.active = false;
        self.finished_after_ms = Some(self.running_ms());
    }

    fn running_ms(&self) -> u64 {
        self.started
            .map(|s| s.elapsed().as_millis().try_into().unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            blocks_placed: self.blocks_placed,
            blocks_failed: self.blocks_failed,
            elapsed_ms: self.finished_after_ms.unwrap_or_else(|| self.running_ms()),
            is_active: self.active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_stops_at_the_limit() {
        let mut s = BuildRunState::new("r", 0);
        s.charge(60, 100).unwrap();
        let err = s.charge(50, 100).unwrap_err();
        assert!(matches!(err, BuildError::ResourceLimit { total: 110, limit: 100 }));
        s.refund(60);
        s.charge(100, 100).unwrap();
    }

    #[test]
    fn room_check_leaves_the_total_alone() {
        let mut s = BuildRunState::new("r", 0);
        s.charge(8, 10).unwrap();
        assert_eq!(s.ensure_room(2, 10).unwrap(), 10);
        assert!(matches!(
            s.ensure_room(20_000_000, 10),
            Err(BuildError::ResourceLimit { total: 20_000_008, limit: 10 })
        ));
        assert_eq!(s.blocks_requested, 8);
    }

    #[tokio::test]
    async fn published_progress_reaches_observers() {
        let (tx, rx) = watch::channel(ProgressState::started_now());
        let mut s = BuildRunState::new("r", 0);
        s.counters.blocks_placed = 7;
        s.counters.blocks_failed = 1;
        s.publish(&tx);
        let p = rx.borrow().snapshot();
        assert_eq!((p.blocks_placed, p.blocks_failed, p.is_active), (7, 1, true));
        tx.send_modify(ProgressState::finish);
        assert!(!rx.borrow().snapshot().is_active);
    }
}
