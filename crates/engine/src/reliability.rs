use crate::config::BuildConfig;
use crate::world::WorldAdapter;
use blockwright_protocol::{BlockType, Vec3};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Place,
    Bulk,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    /// Written and read back.
    Placed,
    /// Target block was already there; nothing was written.
    AlreadyPresent,
    /// Retries exhausted without a matching read-back.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub outcome: PlaceOutcome,
    /// Block read before the first write, if the read succeeded.
    pub previous: Option<BlockType>,
    /// At least one write call was acknowledged.
    pub written: bool,
}

/// Paced, verified access to the world for individual placements and moves.
pub struct Placer<'a> {
    world: &'a dyn WorldAdapter,
    config: &'a BuildConfig,
}

impl<'a> Placer<'a> {
    pub fn new(world: &'a dyn WorldAdapter, config: &'a BuildConfig) -> Self {
        Self { world, config }
    }

    /// Fixed pause after a remote call. Every write, bulk command and move goes through here.
    pub async fn pace(&self, kind: CallKind) {
        let limits = &self.config.rate_limit;
        let ms = match kind {
            CallKind::Place => limits.place_ms,
            CallKind::Bulk => limits.bulk_ms,
            CallKind::Move => limits.move_ms,
        };
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
    }

    pub async fn place_with_retry(&self, pos: Vec3, block: &BlockType, max_retries: u32) -> Placement {
        let previous = match self.world.read_block(pos).await {
            Ok(b) => Some(b),
            Err(e) => {
                debug!(%pos, "pre-read failed: {e:#}");
                None
            }
        };
        if previous.as_ref().is_some_and(|b| b.matches(block)) {
            return Placement {
                outcome: PlaceOutcome::AlreadyPresent,
                previous,
                written: false,
            };
        }

        let mut written = false;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                sleep(self.config.retry_delay(attempt - 1)).await;
            }
            let acked = match self.world.write_block(pos, block).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(%pos, attempt, "write failed: {e:#}");
                    false
                }
            };
            self.pace(CallKind::Place).await;
            written |= acked;
            if !acked {
                continue;
            }
            match self.world.read_block(pos).await {
                Ok(actual) if actual.matches(block) => {
                    return Placement {
                        outcome: PlaceOutcome::Placed,
                        previous,
                        written,
                    };
                }
                Ok(actual) => debug!(%pos, attempt, %actual, expected = %block, "read-back mismatch"),
                Err(e) => debug!(%pos, attempt, "read-back failed: {e:#}"),
            }
        }

        warn!(%pos, %block, attempts = max_retries + 1, "placement not verified");
        Placement {
            outcome: PlaceOutcome::Failed,
            previous,
            written,
        }
    }

    /// Brings the actor within `tolerance` of `target`.
    ///
    /// Returns false only when the actor never moved. An actor that moved but
    /// stopped short still counts as success; the command that follows may work
    /// from there.
    pub async fn move_and_verify(
        &self,
        target: Vec3,
        tolerance: f64,
        timeout: Duration,
    ) -> anyhow::Result<bool> {
        let start = self.world.actor_position().await?;
        if start.distance(target) < self.config.close_enough {
            return Ok(true);
        }

        self.world.move_actor(target).await?;
        self.pace(CallKind::Move).await;

        let deadline = Instant::now() + timeout;
        let mut last;
        loop {
            last = self.world.actor_position().await?;
            if last.distance(target) <= tolerance {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.config.move_poll()).await;
        }

        if last == start {
            warn!(%target, %start, "actor did not move");
            return Ok(false);
        }
        warn!(
            %target,
            reached = %last,
            distance = last.distance(target),
            "actor moved but stopped short of target"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxWorld, WorldCall};

    fn config() -> BuildConfig {
        BuildConfig::default().without_delays()
    }

    #[tokio::test]
    async fn existing_block_costs_no_writes() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        for i in 0..5 {
            world.set_block(Vec3::new(i, 0, 0), "minecraft:stone");
        }
        for i in 0..5 {
            let r = placer
                .place_with_retry(Vec3::new(i, 0, 0), &BlockType::new("stone"), 3)
                .await;
            assert_eq!(r.outcome, PlaceOutcome::AlreadyPresent);
            assert!(!r.written);
        }
        assert_eq!(world.writes(), 0);
    }

    #[tokio::test]
    async fn dropped_writes_are_retried_until_verified() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        let p = Vec3::new(1, 2, 3);
        world.drop_writes(p, 2);
        let r = placer.place_with_retry(p, &BlockType::new("glass"), 3).await;
        assert_eq!(r.outcome, PlaceOutcome::Placed);
        assert_eq!(r.previous, Some(BlockType::air()));
        assert_eq!(world.writes(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        let p = Vec3::new(0, 0, 0);
        world.drop_writes(p, 100);
        let r = placer.place_with_retry(p, &BlockType::new("glass"), 2).await;
        assert_eq!(r.outcome, PlaceOutcome::Failed);
        assert!(r.written);
        assert_eq!(world.writes(), 3);
    }

    #[tokio::test]
    async fn nearby_actor_is_not_moved() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        world.set_actor_position(Vec3::new(1, 0, 1));
        assert!(placer
            .move_and_verify(Vec3::new(2, 0, 2), 2.0, Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!world.calls().iter().any(|c| matches!(c, WorldCall::Move(_))));
    }

    #[tokio::test]
    async fn teleport_converges() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        let target = Vec3::new(100, 70, -40);
        assert!(placer
            .move_and_verify(target, 2.0, Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(world.actor_position().await.unwrap(), target);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_actor_times_out_as_failure() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        world.set_actor_stuck(true);
        let moved = placer
            .move_and_verify(Vec3::new(50, 0, 0), 2.0, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!moved);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_move_is_optimistic_success() {
        let world = SandboxWorld::new();
        let cfg = config();
        let placer = Placer::new(&world, &cfg);
        world.set_actor_miss(Vec3::new(6, 0, 0));
        let moved = placer
            .move_and_verify(Vec3::new(50, 0, 0), 2.0, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(moved);
        assert_eq!(world.actor_position().await.unwrap(), Vec3::new(56, 0, 0));
    }
}
