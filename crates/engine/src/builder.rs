//! Build orchestrator: one active run at a time, checkpointed after every
//! step, with per-run undo frames.

use crate::config::BuildConfig;
use crate::cursor::Cursor;
use crate::dispatch::{Dispatcher, StepOutcome, StopSignal};
use crate::error::{BuildError, BuildResult};
use crate::generator::{GeometryGenerator, Primitives};
use crate::mutex::BuildMutex;
use crate::new_id;
use crate::reliability::{CallKind, PlaceOutcome, Placer};
use crate::state::{BuildRunState, ProgressState};
use crate::store::CheckpointStore;
use crate::undo::{RunHistory, UndoHistory};
use crate::world::WorldAdapter;
use blockwright_protocol::{
    Blueprint, BuildReport, CheckpointStatus, Counters, Progress, ResumableCheckpoint,
    UndoReport, Vec3,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{error, info, warn};

struct Inner {
    world: Arc<dyn WorldAdapter>,
    generator: Arc<dyn GeometryGenerator>,
    config: BuildConfig,
    store: CheckpointStore,
    mutex: BuildMutex,
    active: AtomicBool,
    stop: StopSignal,
    progress: watch::Sender<ProgressState>,
    history: Mutex<UndoHistory>,
}

impl Inner {
    fn history(&self) -> MutexGuard<'_, UndoHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Builder {
    inner: Arc<Inner>,
}

enum Source {
    Fresh { blueprint: Blueprint, origin: Vec3 },
    Resume(String),
}

/// Where a run starts: step index, cursor, counters and undo entries carried over.
struct Plan {
    blueprint: Blueprint,
    origin: Vec3,
    cursor: Vec3,
    start_index: usize,
    counters: Counters,
    history: RunHistory,
    resumed_from: Option<String>,
}

/// Clears the active flag and freezes progress when the run ends, however it ends.
struct ActiveFlag<'a>(&'a Inner);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::SeqCst);
        self.0.progress.send_modify(ProgressState::finish);
    }
}

struct ActiveRun {
    state: BuildRunState,
    cursor: Cursor,
    frame: RunHistory,
}

impl Builder {
    pub fn new(world: Arc<dyn WorldAdapter>, store: CheckpointStore, config: BuildConfig) -> Self {
        Self::with_generator(world, Arc::new(Primitives), store, config)
    }

    pub fn with_generator(
        world: Arc<dyn WorldAdapter>,
        generator: Arc<dyn GeometryGenerator>,
        store: CheckpointStore,
        config: BuildConfig,
    ) -> Self {
        let history = UndoHistory::new(config.undo_retention);
        Self {
            inner: Arc::new(Inner {
                world,
                generator,
                config,
                store,
                mutex: BuildMutex::new(),
                active: AtomicBool::new(false),
                stop: StopSignal::default(),
                progress: watch::channel(ProgressState::default()).0,
                history: Mutex::new(history),
            }),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.inner.store
    }

    /// Runs a blueprint at `origin`. Queues behind any run already in progress.
    pub async fn run(&self, blueprint: Blueprint, origin: Vec3) -> BuildResult<BuildReport> {
        self.execute(Source::Fresh { blueprint, origin }).await
    }

    /// Continues an interrupted run from its checkpoint as a new run.
    pub async fn resume(&self, run_id: &str) -> BuildResult<BuildReport> {
        self.execute(Source::Resume(run_id.to_string())).await
    }

    /// Asks the active run to stop after the current placement.
    pub fn cancel(&self) {
        if self.is_active() {
            info!("cancel requested");
        }
        self.inner.stop.cancel();
    }

    /// The actor left the world; the active run aborts with `ActorDisconnected`.
    pub fn notify_disconnected(&self) {
        warn!("actor disconnected");
        self.inner.stop.disconnect();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Progress {
        self.inner.progress.borrow().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.inner.progress.subscribe()
    }

    pub fn list_resumable(&self) -> BuildResult<Vec<ResumableCheckpoint>> {
        self.inner
            .store
            .list_resumable()
            .map_err(BuildError::Checkpoint)
    }

    async fn execute(&self, source: Source) -> BuildResult<BuildReport> {
        let inner = &*self.inner;
        let _permit = inner.mutex.acquire().await;
        if inner.active.swap(true, Ordering::SeqCst) {
            return Err(BuildError::ConcurrencyConflict);
        }
        let _active = ActiveFlag(inner);
        inner.stop.reset();
        inner.progress.send_replace(ProgressState::started_now());

        let plan = self.plan(source)?;
        let run_id = new_id("build");
        let bulk_available = inner.world.probe_bulk_capability().await;
        info!(
            run_id = %run_id,
            steps = plan.blueprint.steps.len(),
            start = plan.start_index,
            origin = %plan.origin,
            bulk_available,
            resumed_from = plan.resumed_from.as_deref().unwrap_or(""),
            "build started"
        );

        let mut run = ActiveRun {
            state: BuildRunState::new(&run_id, plan.start_index),
            cursor: Cursor::at(plan.origin, plan.cursor),
            frame: RunHistory {
                run_id: run_id.clone(),
                ..plan.history
            },
        };
        // Work carried over from a resumed checkpoint counts toward this
        // run's report and its block limit.
        let carried = &plan.counters;
        run.state.blocks_requested =
            carried.blocks_placed + carried.blocks_failed + carried.blocks_skipped;
        run.state.steps_completed = plan.start_index;
        run.state.counters = plan.counters;
        run.state.publish(&inner.progress);

        let created = inner.store.create(
            &run_id,
            &plan.blueprint,
            plan.origin,
            plan.cursor,
            plan.start_index,
            plan.resumed_from.as_deref(),
        );
        let created = created.and_then(|()| {
            if run.frame.is_empty() {
                return Ok(());
            }
            inner.store.record_step(
                &run_id,
                plan.start_index,
                plan.cursor,
                &run.state.counters,
                &run.frame.vanilla,
                &run.frame.bulk,
            )
        });
        if let Err(e) = created {
            run.state.warn(format!("checkpoint not created: {e:#}"));
        }

        let dispatcher = Dispatcher {
            world: inner.world.as_ref(),
            generator: inner.generator.as_ref(),
            config: &inner.config,
            blueprint: &plan.blueprint,
            bulk_available,
            stop: &inner.stop,
            progress: &inner.progress,
        };
        let result = self.run_steps(&dispatcher, &mut run).await;

        let ActiveRun { state, frame, .. } = run;
        inner.history().push(frame);

        match result {
            Ok(()) => {
                self.finish(&run_id, CheckpointStatus::Completed);
                let report = state.report();
                info!(
                    run_id = %run_id,
                    placed = report.blocks_placed,
                    failed = report.blocks_failed,
                    skipped = report.blocks_skipped,
                    bulk_ops = report.bulk_ops,
                    fallbacks = report.fallbacks_used,
                    cancelled = report.cancelled,
                    duration_ms = report.duration_ms,
                    "build finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.finish(&run_id, CheckpointStatus::Failed);
                error!(run_id = %run_id, step = state.step_index, kind = e.kind(), "build failed: {e}");
                Err(e)
            }
        }
    }

    /// Resolves the run source while holding the build lock, so a checkpoint
    /// cannot be resumed twice.
    fn plan(&self, source: Source) -> BuildResult<Plan> {
        let (blueprint, origin) = match source {
            Source::Fresh { blueprint, origin } => (blueprint, origin),
            Source::Resume(run_id) => return self.resume_plan(run_id),
        };
        Ok(Plan {
            blueprint,
            origin,
            cursor: Vec3::ZERO,
            start_index: 0,
            counters: Counters::default(),
            history: RunHistory::default(),
            resumed_from: None,
        })
    }

    fn resume_plan(&self, run_id: String) -> BuildResult<Plan> {
        let store = &self.inner.store;
        let checkpoint = store
            .get(&run_id)
            .map_err(BuildError::Checkpoint)?
            .ok_or_else(|| BuildError::UnknownRun(run_id.clone()))?;
        if !checkpoint.status.is_resumable() {
            return Err(BuildError::NotResumable(run_id));
        }
        let history = store.undo_entries(&run_id).map_err(BuildError::Checkpoint)?;
        store
            .set_status(&run_id, CheckpointStatus::Superseded)
            .map_err(BuildError::Checkpoint)?;
        // Its entries now belong to the resuming run's frame.
        self.inner.history().remove_run(&run_id);
        Ok(Plan {
            blueprint: checkpoint.blueprint,
            origin: checkpoint.origin,
            cursor: checkpoint.cursor,
            start_index: checkpoint.current_step_index,
            counters: checkpoint.counters,
            history,
            resumed_from: Some(run_id),
        })
    }

    async fn run_steps(&self, dispatcher: &Dispatcher<'_>, run: &mut ActiveRun) -> BuildResult<()> {
        let steps = &dispatcher.blueprint.steps;
        for index in run.state.step_index..steps.len() {
            if self.inner.stop.check()? {
                run.state.cancelled = true;
                break;
            }
            run.state.step_index = index;
            let marks = (run.frame.vanilla.len(), run.frame.bulk.len());

            let outcome = dispatcher
                .execute_step(
                    index,
                    &steps[index],
                    &mut run.cursor,
                    &mut run.state,
                    &mut run.frame,
                )
                .await;

            let next = match outcome {
                Ok(StepOutcome::Succeeded | StepOutcome::FallenBack) => index + 1,
                _ => index,
            };
            self.record_step(run, next, marks);

            match outcome? {
                StepOutcome::Cancelled => {
                    run.state.cancelled = true;
                    break;
                }
                StepOutcome::Succeeded | StepOutcome::FallenBack => {
                    run.state.steps_completed += 1;
                }
            }
        }
        if run.state.cancelled {
            info!(run_id = %run.state.run_id, step = run.state.step_index, "build cancelled");
        }
        Ok(())
    }

    fn record_step(&self, run: &mut ActiveRun, next: usize, (vanilla, bulk): (usize, usize)) {
        let saved = self.inner.store.record_step(
            &run.state.run_id,
            next,
            run.cursor.position(),
            &run.state.counters,
            &run.frame.vanilla[vanilla..],
            &run.frame.bulk[bulk..],
        );
        if let Err(e) = saved {
            run.state.warn(format!("checkpoint not updated: {e:#}"));
        }
    }

    fn finish(&self, run_id: &str, status: CheckpointStatus) {
        if let Err(e) = self.inner.store.set_status(run_id, status) {
            warn!(run_id, status = status.as_str(), "checkpoint status not saved: {e:#}");
        }
    }

    /// Reverts the most recent run: its bulk commands through the world
    /// adapter, then its individual placements newest first.
    pub async fn undo(&self) -> BuildResult<UndoReport> {
        let inner = &*self.inner;
        if self.is_active() {
            return Err(BuildError::ConcurrencyConflict);
        }
        let Some(_permit) = inner.mutex.try_acquire() else {
            return Err(BuildError::ConcurrencyConflict);
        };
        let frame = inner
            .history()
            .take_latest()
            .ok_or(BuildError::NoUndoAvailable)?;
        info!(
            run_id = %frame.run_id,
            bulk = frame.bulk.len(),
            placements = frame.vanilla.len(),
            "undo started"
        );

        let placer = Placer::new(inner.world.as_ref(), &inner.config);
        let mut report = UndoReport::default();
        if !frame.bulk.is_empty() {
            match inner.world.undo_bulk(&frame.bulk).await {
                Ok(()) => report.bulk_undone = frame.bulk.len(),
                Err(e) => warn!(run_id = %frame.run_id, "bulk undo failed: {e:#}"),
            }
            placer.pace(CallKind::Bulk).await;
        }
        for entry in frame.vanilla.iter().rev() {
            let restored = placer
                .place_with_retry(entry.position, &entry.previous, inner.config.max_retries)
                .await;
            match restored.outcome {
                PlaceOutcome::Failed => report.blocks_failed += 1,
                PlaceOutcome::Placed | PlaceOutcome::AlreadyPresent => {
                    report.blocks_restored += 1
                }
            }
        }
        info!(
            run_id = %frame.run_id,
            bulk_undone = report.bulk_undone,
            restored = report.blocks_restored,
            failed = report.blocks_failed,
            "undo finished"
        );
        Ok(report)
    }
}
