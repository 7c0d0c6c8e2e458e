//! Step dispatch: route generator output to bulk commands or individual
//! placements, and fall back when a bulk command cannot be used.

use crate::bulk::{BulkRegionDescriptor, Fallback};
use crate::config::BuildConfig;
use crate::cursor::Cursor;
use crate::error::{BuildError, BuildResult, Severity};
use crate::generator::{Generated, GeneratorContext, GeometryGenerator};
use crate::now_rfc3339;
use crate::optimize::{optimize, Batch};
use crate::reliability::{CallKind, PlaceOutcome, Placer};
use crate::state::{BuildRunState, ProgressState};
use crate::undo::{BulkEntry, RunHistory, VanillaEntry};
use crate::world::WorldAdapter;
use blockwright_protocol::{BlockPlacement, Blueprint, Step, StepOp};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cooperative stop requests, checked between steps and between placements.
#[derive(Debug, Default)]
pub struct StopSignal {
    cancel: AtomicBool,
    disconnected: AtomicBool,
}

impl StopSignal {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.disconnected.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// `Ok(true)` when the run should stop cleanly, an error when it must abort.
    pub fn check(&self) -> BuildResult<bool> {
        if self.is_disconnected() {
            return Err(BuildError::ActorDisconnected);
        }
        Ok(self.is_cancelled())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// At least one bulk command was replaced by its fallback.
    FallenBack,
    /// Stopped part-way by a cancel request.
    Cancelled,
}

/// Everything one run needs to execute its steps. Borrowed from the builder
/// for the duration of the run.
pub struct Dispatcher<'a> {
    pub world: &'a dyn WorldAdapter,
    pub generator: &'a dyn GeometryGenerator,
    pub config: &'a BuildConfig,
    pub blueprint: &'a Blueprint,
    pub bulk_available: bool,
    pub stop: &'a StopSignal,
    pub progress: &'a watch::Sender<ProgressState>,
}

impl Dispatcher<'_> {
    fn placer(&self) -> Placer<'_> {
        Placer::new(self.world, self.config)
    }

    /// Runs the generator once the op's estimated block count is known to
    /// fit under `max_blocks`, so oversized geometry is never built.
    fn generate_within_limit(
        &self,
        op: &StepOp,
        ctx: &GeneratorContext<'_>,
        state: &BuildRunState,
    ) -> BuildResult<Generated> {
        if let Some(blocks) = self.generator.estimate(op, ctx) {
            state.ensure_room(blocks, self.config.max_blocks)?;
        }
        self.generator.generate(op, ctx)
    }

    pub async fn execute_step(
        &self,
        index: usize,
        step: &Step,
        cursor: &mut Cursor,
        state: &mut BuildRunState,
        history: &mut RunHistory,
    ) -> BuildResult<StepOutcome> {
        match &step.op {
            StepOp::Move { offset } => {
                cursor.move_by(*offset);
                return Ok(StepOutcome::Succeeded);
            }
            StepOp::Back => {
                if !cursor.back() {
                    state.warn(format!("step {index}: `back` with no earlier cursor position"));
                }
                return Ok(StepOutcome::Succeeded);
            }
            StepOp::Reset => {
                cursor.reset();
                return Ok(StepOutcome::Succeeded);
            }
            _ => {}
        }

        let generated = {
            let ctx = GeneratorContext {
                cursor: &*cursor,
                bulk_available: self.bulk_available,
                blueprint: self.blueprint,
            };
            self.generate_within_limit(&step.op, &ctx, state)?
        };

        match generated {
            Generated::Bulk(mut descriptor) => {
                if descriptor.fallback.is_none() {
                    descriptor.fallback = step.fallback.clone().map(Fallback::Step);
                }
                self.bulk_or_fallback(index, descriptor, true, cursor, state, history)
                    .await
            }
            Generated::Placements(placements) => {
                self.place_batched(index, placements, cursor, state, history)
                    .await
            }
        }
    }

    async fn place_batched(
        &self,
        index: usize,
        placements: Vec<BlockPlacement>,
        cursor: &mut Cursor,
        state: &mut BuildRunState,
        history: &mut RunHistory,
    ) -> BuildResult<StepOutcome> {
        if !self.bulk_available || placements.len() <= self.config.batch_threshold {
            return Ok(if self.place_all(&placements, cursor, state, history).await? {
                StepOutcome::Succeeded
            } else {
                StepOutcome::Cancelled
            });
        }

        let batch = optimize(&placements, self.config.min_batch_size);
        let batch = if batch.is_partition_of(&placements) {
            batch
        } else {
            state.warn(format!(
                "step {index}: batching did not cover the input exactly; placing individually"
            ));
            Batch {
                bulk_ops: Vec::new(),
                leftovers: placements,
            }
        };
        debug!(
            step = index,
            bulk_ops = batch.bulk_ops.len(),
            batched = batch.batched_count(),
            leftovers = batch.leftovers.len(),
            "placements batched"
        );

        let mut fell_back = false;
        for op in batch.bulk_ops {
            if self.stop.check()? {
                return Ok(StepOutcome::Cancelled);
            }
            match self
                .bulk_or_fallback(index, op, false, cursor, state, history)
                .await?
            {
                StepOutcome::Cancelled => return Ok(StepOutcome::Cancelled),
                StepOutcome::FallenBack => fell_back = true,
                StepOutcome::Succeeded => {}
            }
        }
        if !self.place_all(&batch.leftovers, cursor, state, history).await? {
            return Ok(StepOutcome::Cancelled);
        }
        Ok(if fell_back {
            StepOutcome::FallenBack
        } else {
            StepOutcome::Succeeded
        })
    }

    async fn bulk_or_fallback(
        &self,
        index: usize,
        mut descriptor: BulkRegionDescriptor,
        anchored_move: bool,
        cursor: &mut Cursor,
        state: &mut BuildRunState,
        history: &mut RunHistory,
    ) -> BuildResult<StepOutcome> {
        state.charge(descriptor.estimated_count, self.config.max_blocks)?;

        let attempt = if self.bulk_available {
            self.dispatch_bulk(index, &descriptor, anchored_move, cursor, state, history)
                .await
        } else {
            Err(BuildError::bulk(
                descriptor.command.as_str(),
                "bulk commands are not available",
            ))
        };

        let err = match attempt {
            Ok(()) => return Ok(StepOutcome::Succeeded),
            Err(err) if err.severity() == Severity::Recoverable => err,
            Err(err) => return Err(err),
        };
        let Some(fallback) = descriptor.fallback.take() else {
            return Err(err);
        };

        state.warn(format!("step {index}: {err}; using fallback placements"));
        state.counters.fallbacks_used += 1;
        state.refund(descriptor.estimated_count);

        let placements = self.fallback_placements(fallback, cursor, state)?;
        Ok(if self.place_all(&placements, cursor, state, history).await? {
            StepOutcome::FallenBack
        } else {
            StepOutcome::Cancelled
        })
    }

    async fn dispatch_bulk(
        &self,
        index: usize,
        descriptor: &BulkRegionDescriptor,
        anchored_move: bool,
        cursor: &mut Cursor,
        state: &mut BuildRunState,
        history: &mut RunHistory,
    ) -> BuildResult<()> {
        let command = descriptor.to_world(cursor.origin());
        let placer = self.placer();

        if anchored_move && command.command.is_anchored() {
            let target = command.geometry.anchor();
            let moved = match placer
                .move_and_verify(target, self.config.move_tolerance, self.config.move_timeout())
                .await
            {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(%target, "move request failed: {e:#}");
                    false
                }
            };
            if !moved {
                return Err(BuildError::MoveConvergence { target });
            }
        }

        let result = self.world.dispatch_bulk(&command).await;
        placer.pace(CallKind::Bulk).await;
        let outcome = result
            .map_err(|e| BuildError::bulk(command.command.as_str(), format!("{e:#}")))?;

        history.bulk.push(BulkEntry {
            step_index: index,
            command,
            origin: cursor.origin(),
            timestamp: now_rfc3339(),
        });
        state.counters.bulk_ops += 1;
        state.counters.blocks_placed += outcome
            .blocks_changed
            .unwrap_or(descriptor.estimated_count);
        state.publish(self.progress);

        let expected_end = descriptor.geometry.bounds().max;
        let rec = cursor.reconcile(expected_end, &outcome, self.config.drift_ceiling);
        if let Some(w) = rec.warning {
            state.warn(format!("step {index}: {w}"));
        }
        Ok(())
    }

    fn fallback_placements(
        &self,
        fallback: Fallback,
        cursor: &Cursor,
        state: &BuildRunState,
    ) -> BuildResult<Vec<BlockPlacement>> {
        let step = match fallback {
            Fallback::Placements(placements) => return Ok(placements),
            Fallback::Step(step) => step,
        };
        let op = step.op.name().to_string();
        if step.op.is_cursor_op() {
            return Err(BuildError::Generator {
                op,
                reason: "a cursor step cannot stand in for geometry".to_string(),
            });
        }
        let ctx = GeneratorContext {
            cursor,
            bulk_available: false,
            blueprint: self.blueprint,
        };
        match self.generate_within_limit(&step.op, &ctx, state)? {
            Generated::Placements(placements) => Ok(placements),
            Generated::Bulk(_) => Err(BuildError::Generator {
                op,
                reason: "fallback step needs bulk commands".to_string(),
            }),
        }
    }

    /// Places build-relative blocks one at a time. `Ok(false)` means a cancel
    /// request stopped it part-way.
    async fn place_all(
        &self,
        placements: &[BlockPlacement],
        cursor: &Cursor,
        state: &mut BuildRunState,
        history: &mut RunHistory,
    ) -> BuildResult<bool> {
        state.charge(placements.len() as u64, self.config.max_blocks)?;
        let placer = self.placer();
        for p in placements {
            if self.stop.check()? {
                return Ok(false);
            }
            let pos = cursor.resolve(p.pos());
            let placed = placer
                .place_with_retry(pos, &p.block, self.config.max_retries)
                .await;
            match placed.outcome {
                PlaceOutcome::Placed => state.counters.blocks_placed += 1,
                PlaceOutcome::AlreadyPresent => state.counters.blocks_skipped += 1,
                PlaceOutcome::Failed => state.counters.blocks_failed += 1,
            }
            if placed.written {
                if let Some(previous) = placed.previous {
                    history.vanilla.push(VanillaEntry {
                        position: pos,
                        previous,
                    });
                }
            }
            state.publish(self.progress);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use crate::generator::Primitives;
    use crate::sandbox::{SandboxWorld, WorldCall};
    use blockwright_protocol::{BlockType, Size, Vec3};
    use std::sync::atomic::AtomicUsize;

    /// `Primitives`, counting how often geometry is actually built.
    #[derive(Default)]
    struct CountingGenerator {
        generated: AtomicUsize,
    }

    impl GeometryGenerator for CountingGenerator {
        fn generate(&self, op: &StepOp, ctx: &GeneratorContext<'_>) -> BuildResult<Generated> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            Primitives.generate(op, ctx)
        }

        fn estimate(&self, op: &StepOp, ctx: &GeneratorContext<'_>) -> Option<u64> {
            Primitives.estimate(op, ctx)
        }
    }

    fn huge_fill() -> StepOp {
        StepOp::Fill {
            from: Vec3::ZERO,
            to: Vec3::new(999, 19, 999),
            block: "stone".to_string(),
            hollow: false,
        }
    }

    struct Fixture {
        world: SandboxWorld,
        config: BuildConfig,
        blueprint: Blueprint,
        stop: StopSignal,
        progress: watch::Sender<ProgressState>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                world: SandboxWorld::new(),
                config: BuildConfig::default().without_delays(),
                blueprint: Blueprint {
                    size: Size {
                        width: 32,
                        height: 32,
                        depth: 32,
                    },
                    palette: Default::default(),
                    steps: vec![],
                },
                stop: StopSignal::default(),
                progress: watch::channel(ProgressState::started_now()).0,
            }
        }

        fn dispatcher(&self, bulk_available: bool) -> Dispatcher<'_> {
            Dispatcher {
                world: &self.world,
                generator: &Primitives,
                config: &self.config,
                blueprint: &self.blueprint,
                bulk_available,
                stop: &self.stop,
                progress: &self.progress,
            }
        }
    }

    fn sphere(block: &str) -> StepOp {
        StepOp::Sphere {
            center: Vec3::new(0, 4, 0),
            radius: 3,
            block: block.to_string(),
            hollow: false,
        }
    }

    #[tokio::test]
    async fn failing_bulk_uses_the_fallback() {
        let fx = Fixture::new();
        fx.world.set_reject_bulk(true);
        let step = Step::new(sphere("glass")).with_fallback(Step::new(StepOp::Fill {
            from: Vec3::new(-1, 3, -1),
            to: Vec3::new(1, 5, 1),
            block: "glass".to_string(),
            hollow: false,
        }));

        let mut cursor = Cursor::new(Vec3::new(100, 64, 100));
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let outcome = fx
            .dispatcher(true)
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();

        assert_eq!(outcome, StepOutcome::FallenBack);
        assert_eq!(state.counters.fallbacks_used, 1);
        assert_eq!(state.counters.blocks_placed, 27);
        assert_eq!(state.warnings.len(), 1);
        assert!(history.bulk.is_empty());
        assert_eq!(history.vanilla.len(), 27);
        let placed = Bounds::from_corners(Vec3::new(99, 67, 99), Vec3::new(101, 69, 101));
        assert_eq!(fx.world.count_in(placed, &BlockType::new("glass")), 27);
    }

    #[tokio::test]
    async fn failing_bulk_without_fallback_is_fatal() {
        let fx = Fixture::new();
        let step = Step::new(sphere("glass"));
        let mut cursor = Cursor::new(Vec3::ZERO);
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let err = fx
            .dispatcher(false)
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BulkCommand { .. }));
        assert_eq!(fx.world.writes(), 0);
    }

    #[tokio::test]
    async fn anchored_bulk_moves_the_actor_first() {
        let fx = Fixture::new();
        let step = Step::new(sphere("stone"));
        let mut cursor = Cursor::new(Vec3::new(200, 64, 0));
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        fx.dispatcher(true)
            .execute_step(3, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();

        let calls = fx.world.calls();
        let moved = calls
            .iter()
            .position(|c| *c == WorldCall::Move(Vec3::new(200, 68, 0)))
            .expect("move");
        let bulk = calls
            .iter()
            .position(|c| matches!(c, WorldCall::Bulk(..)))
            .expect("bulk");
        assert!(moved < bulk);
        assert_eq!(state.counters.bulk_ops, 1);
        assert_eq!(history.bulk.len(), 1);
        assert_eq!(history.bulk[0].step_index, 3);
    }

    #[tokio::test]
    async fn stuck_actor_falls_back() {
        let fx = Fixture::new();
        fx.world.set_actor_stuck(true);
        let mut config = fx.config.clone();
        config.move_timeout_ms = 0;
        let step = Step::new(sphere("stone")).with_fallback(Step::new(StepOp::Set {
            pos: Vec3::new(0, 4, 0),
            block: "stone".to_string(),
        }));
        let mut d = fx.dispatcher(true);
        d.config = &config;

        let mut cursor = Cursor::new(Vec3::new(300, 0, 0));
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let outcome = d
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::FallenBack);
        assert!(!fx.world.calls().iter().any(|c| matches!(c, WorldCall::Bulk(..))));
        assert_eq!(fx.world.block_at(Vec3::new(300, 4, 0)).as_str(), "stone");
    }

    #[tokio::test]
    async fn large_point_clouds_are_batched() {
        let fx = Fixture::new();
        let blocks = Bounds::from_corners(Vec3::ZERO, Vec3::new(4, 0, 4))
            .positions()
            .map(|p| BlockPlacement::new(p, BlockType::new("oak_planks")))
            .chain([BlockPlacement::new(Vec3::new(9, 0, 9), BlockType::new("torch"))])
            .collect();
        let step = Step::new(StepOp::Blocks { blocks });

        let mut cursor = Cursor::new(Vec3::new(0, 70, 0));
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        fx.dispatcher(true)
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();

        assert_eq!(state.counters.bulk_ops, 1);
        assert_eq!(state.counters.blocks_placed, 26);
        assert_eq!(fx.world.writes(), 1);
        // Optimizer output never triggers an actor move.
        assert!(!fx.world.calls().iter().any(|c| matches!(c, WorldCall::Move(_))));
        assert_eq!(fx.world.block_at(Vec3::new(9, 70, 9)).as_str(), "torch");
    }

    #[tokio::test]
    async fn cursor_steps_touch_nothing() {
        let fx = Fixture::new();
        let d = fx.dispatcher(true);
        let mut cursor = Cursor::new(Vec3::ZERO);
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let mv = Step::new(StepOp::Move {
            offset: Vec3::new(0, 3, 0),
        });
        d.execute_step(0, &mv, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();
        assert_eq!(cursor.position(), Vec3::new(0, 3, 0));
        for _ in 0..2 {
            d.execute_step(1, &Step::new(StepOp::Back), &mut cursor, &mut state, &mut history)
                .await
                .unwrap();
        }
        assert_eq!(cursor.position(), Vec3::ZERO);
        assert_eq!(state.warnings.len(), 1);
        assert!(fx.world.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_stops_between_placements() {
        let fx = Fixture::new();
        fx.stop.cancel();
        let step = Step::new(StepOp::Set {
            pos: Vec3::ZERO,
            block: "stone".to_string(),
        });
        let mut cursor = Cursor::new(Vec3::ZERO);
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let outcome = fx
            .dispatcher(false)
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
        assert_eq!(fx.world.writes(), 0);

        fx.stop.disconnect();
        let err = fx
            .dispatcher(false)
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ActorDisconnected));
    }

    #[tokio::test]
    async fn oversized_fill_is_rejected_before_generating() {
        let fx = Fixture::new();
        let counting = CountingGenerator::default();
        let config = BuildConfig {
            max_blocks: 10,
            ..fx.config.clone()
        };
        let mut d = fx.dispatcher(false);
        d.generator = &counting;
        d.config = &config;

        let mut cursor = Cursor::new(Vec3::ZERO);
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let err = d
            .execute_step(0, &Step::new(huge_fill()), &mut cursor, &mut state, &mut history)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ResourceLimit {
                total: 20_000_000,
                limit: 10
            }
        ));
        assert_eq!(counting.generated.load(Ordering::SeqCst), 0);
        assert_eq!(state.blocks_requested, 0);
        assert!(fx.world.calls().is_empty());
    }

    #[tokio::test]
    async fn oversized_fallback_is_rejected_before_generating() {
        let fx = Fixture::new();
        let counting = CountingGenerator::default();
        let config = BuildConfig {
            max_blocks: 200,
            ..fx.config.clone()
        };
        let mut d = fx.dispatcher(false);
        d.generator = &counting;
        d.config = &config;

        let step = Step::new(sphere("glass")).with_fallback(Step::new(huge_fill()));
        let mut cursor = Cursor::new(Vec3::ZERO);
        let mut state = BuildRunState::new("r", 0);
        let mut history = RunHistory::new("r");
        let err = d
            .execute_step(0, &step, &mut cursor, &mut state, &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ResourceLimit { limit: 200, .. }));
        // Only the sphere descriptor was built; the fallback fill never was.
        assert_eq!(counting.generated.load(Ordering::SeqCst), 1);
        assert_eq!(fx.world.writes(), 0);
    }
}
