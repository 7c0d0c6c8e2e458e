//! In-memory world.
//!
//! Applies every call locally, rasterizes bulk commands and keeps a snapshot
//! per bulk command for `undo_bulk`. Failure knobs (rejected bulk commands,
//! writes that silently drop, a stuck actor) and a call log make it the
//! engine's test double; the server uses it as a dry-run target.

use crate::bounds::Bounds;
use crate::bulk::{BulkCommand, BulkGeometry, WorldBulk};
use crate::undo::BulkEntry;
use crate::world::{BulkOutcome, WorldAdapter};
use async_trait::async_trait;
use blockwright_protocol::{BlockType, Vec3};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum WorldCall {
    Read(Vec3),
    Write(Vec3, BlockType),
    Bulk(BulkCommand, BlockType),
    Move(Vec3),
    UndoBulk(usize),
}

type Snapshot = Vec<(Vec3, Option<BlockType>)>;

#[derive(Debug, Default)]
struct SandboxState {
    blocks: HashMap<Vec3, BlockType>,
    bulk_enabled: bool,
    reject_bulk: bool,
    /// Remaining writes to silently drop, per position.
    dropped_writes: HashMap<Vec3, u32>,
    actor: Vec3,
    actor_stuck: bool,
    /// Where a move lands relative to its target.
    actor_miss: Vec3,
    /// Shift applied to reported bulk bounds.
    reported_drift: Vec3,
    report_bounds: bool,
    latency: Duration,
    snapshots: Vec<Snapshot>,
    calls: Vec<WorldCall>,
}

#[derive(Debug)]
pub struct SandboxWorld {
    state: Mutex<SandboxState>,
}

impl Default for SandboxWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxWorld {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SandboxState {
                bulk_enabled: true,
                report_bounds: true,
                ..SandboxState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_bulk_enabled(&self, enabled: bool) {
        self.lock().bulk_enabled = enabled;
    }

    /// Bulk commands are advertised but every dispatch fails.
    pub fn set_reject_bulk(&self, reject: bool) {
        self.lock().reject_bulk = reject;
    }

    /// The next `count` writes to `pos` are acknowledged but have no effect.
    pub fn drop_writes(&self, pos: Vec3, count: u32) {
        self.lock().dropped_writes.insert(pos, count);
    }

    pub fn set_actor_stuck(&self, stuck: bool) {
        self.lock().actor_stuck = stuck;
    }

    pub fn set_actor_miss(&self, miss: Vec3) {
        self.lock().actor_miss = miss;
    }

    pub fn set_actor_position(&self, pos: Vec3) {
        self.lock().actor = pos;
    }

    pub fn set_reported_drift(&self, drift: Vec3) {
        self.lock().reported_drift = drift;
    }

    pub fn set_report_bounds(&self, report: bool) {
        self.lock().report_bounds = report;
    }

    /// Simulated round-trip time for every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_block(&self, pos: Vec3, block: impl Into<BlockType>) {
        self.lock().blocks.insert(pos, block.into());
    }

    pub fn block_at(&self, pos: Vec3) -> BlockType {
        self.lock().blocks.get(&pos).cloned().unwrap_or_else(BlockType::air)
    }

    /// Number of non-air blocks.
    pub fn solid_count(&self) -> usize {
        self.lock().blocks.values().filter(|b| !b.is_air()).count()
    }

    pub fn calls(&self) -> Vec<WorldCall> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, WorldCall::Write(..)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn rasterize(command: &WorldBulk, current: impl Fn(Vec3) -> BlockType) -> Vec<Vec3> {
    let bounds = command.geometry.bounds();
    let hollow = command.hollow;
    let inside = |p: Vec3| -> bool {
        match (command.command, command.geometry) {
            (BulkCommand::Walls, _) => bounds.on_walls(p),
            (BulkCommand::Replace, _) => command
                .target
                .as_ref()
                .is_some_and(|t| current(p).matches(t)),
            (_, BulkGeometry::Cuboid { .. }) => !hollow || bounds.on_shell(p),
            (_, BulkGeometry::Sphere { center, radius }) => {
                let d = p - center;
                let d2 = d.x * d.x + d.y * d.y + d.z * d.z;
                d2 <= radius * radius && (!hollow || d2 > (radius - 1) * (radius - 1))
            }
            (_, BulkGeometry::Cylinder { base, radius, .. }) => {
                let d = p - base;
                let d2 = d.x * d.x + d.z * d.z;
                d2 <= radius * radius && (!hollow || d2 > (radius - 1) * (radius - 1))
            }
            (_, BulkGeometry::Pyramid { base, height }) => {
                let d = p - base;
                let half = height - 1 - d.y;
                let (ax, az) = (d.x.abs(), d.z.abs());
                ax <= half && az <= half && (!hollow || ax == half || az == half)
            }
        }
    };
    bounds.positions().filter(|p| inside(*p)).collect()
}

#[async_trait]
impl WorldAdapter for SandboxWorld {
    async fn read_block(&self, pos: Vec3) -> anyhow::Result<BlockType> {
        self.delay().await;
        let mut s = self.lock();
        s.calls.push(WorldCall::Read(pos));
        Ok(s.blocks.get(&pos).cloned().unwrap_or_else(BlockType::air))
    }

    async fn write_block(&self, pos: Vec3, block: &BlockType) -> anyhow::Result<()> {
        self.delay().await;
        let mut s = self.lock();
        s.calls.push(WorldCall::Write(pos, block.clone()));
        if let Some(left) = s.dropped_writes.get_mut(&pos) {
            if *left > 0 {
                *left -= 1;
                return Ok(());
            }
        }
        s.blocks.insert(pos, block.clone());
        Ok(())
    }

    async fn dispatch_bulk(&self, command: &WorldBulk) -> anyhow::Result<BulkOutcome> {
        self.delay().await;
        let mut s = self.lock();
        s.calls
            .push(WorldCall::Bulk(command.command, command.block.clone()));
        if !s.bulk_enabled {
            anyhow::bail!("unknown command: {}", command.command);
        }
        if s.reject_bulk {
            anyhow::bail!("{} rejected by server", command.command);
        }

        let targets = {
            let blocks = &s.blocks;
            rasterize(command, |p| blocks.get(&p).cloned().unwrap_or_else(BlockType::air))
        };
        let mut snapshot = Vec::with_capacity(targets.len());
        for p in &targets {
            let prev = s.blocks.insert(*p, command.block.clone());
            snapshot.push((*p, prev));
        }
        s.snapshots.push(snapshot);

        let actual_bounds = s
            .report_bounds
            .then(|| command.geometry.bounds().translate(s.reported_drift));
        Ok(BulkOutcome {
            actual_bounds,
            blocks_changed: Some(targets.len() as u64),
        })
    }

    async fn actor_position(&self) -> anyhow::Result<Vec3> {
        self.delay().await;
        Ok(self.lock().actor)
    }

    async fn move_actor(&self, target: Vec3) -> anyhow::Result<()> {
        self.delay().await;
        let mut s = self.lock();
        s.calls.push(WorldCall::Move(target));
        if !s.actor_stuck {
            s.actor = target + s.actor_miss;
        }
        Ok(())
    }

    async fn probe_bulk_capability(&self) -> bool {
        self.lock().bulk_enabled
    }

    async fn undo_bulk(&self, entries: &[BulkEntry]) -> anyhow::Result<()> {
        self.delay().await;
        let mut s = self.lock();
        s.calls.push(WorldCall::UndoBulk(entries.len()));
        for _ in entries {
            let Some(snapshot) = s.snapshots.pop() else {
                anyhow::bail!("no bulk history left to undo");
            };
            for (p, prev) in snapshot.into_iter().rev() {
                match prev {
                    Some(b) => s.blocks.insert(p, b),
                    None => s.blocks.remove(&p),
                };
            }
        }
        Ok(())
    }
}

impl SandboxWorld {
    /// Positions inside `bounds` currently holding `block`.
    pub fn count_in(&self, bounds: Bounds, block: &BlockType) -> usize {
        let s = self.lock();
        bounds
            .positions()
            .filter(|p| s.blocks.get(p).is_some_and(|b| b.matches(block)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(command: BulkCommand, geometry: BulkGeometry, hollow: bool) -> WorldBulk {
        WorldBulk {
            command,
            geometry,
            block: BlockType::new("stone"),
            hollow,
            target: None,
        }
    }

    #[tokio::test]
    async fn fill_then_undo_restores_previous_blocks() {
        let world = SandboxWorld::new();
        world.set_block(Vec3::new(1, 0, 1), "dirt");
        let cmd = bulk(
            BulkCommand::Fill,
            BulkGeometry::Cuboid {
                from: Vec3::ZERO,
                to: Vec3::new(2, 2, 2),
            },
            false,
        );
        let out = world.dispatch_bulk(&cmd).await.unwrap();
        assert_eq!(out.blocks_changed, Some(27));
        assert_eq!(world.block_at(Vec3::new(1, 0, 1)).as_str(), "stone");

        world.undo_bulk(&[sample_entry(cmd)]).await.unwrap();
        assert_eq!(world.block_at(Vec3::new(1, 0, 1)).as_str(), "dirt");
        assert_eq!(world.solid_count(), 1);
    }

    #[tokio::test]
    async fn hollow_shapes_leave_the_inside_empty() {
        let world = SandboxWorld::new();
        let sphere = bulk(
            BulkCommand::Sphere,
            BulkGeometry::Sphere {
                center: Vec3::new(0, 10, 0),
                radius: 4,
            },
            true,
        );
        world.dispatch_bulk(&sphere).await.unwrap();
        assert!(world.block_at(Vec3::new(0, 10, 0)).is_air());
        assert_eq!(world.block_at(Vec3::new(0, 14, 0)).as_str(), "stone");

        let pyramid = bulk(
            BulkCommand::Pyramid,
            BulkGeometry::Pyramid {
                base: Vec3::new(50, 0, 50),
                height: 3,
            },
            false,
        );
        let out = world.dispatch_bulk(&pyramid).await.unwrap();
        assert_eq!(out.blocks_changed, Some(25 + 9 + 1));
    }

    #[tokio::test]
    async fn dropped_writes_are_acknowledged_without_effect() {
        let world = SandboxWorld::new();
        let p = Vec3::new(3, 3, 3);
        world.drop_writes(p, 1);
        world.write_block(p, &BlockType::new("glass")).await.unwrap();
        assert!(world.block_at(p).is_air());
        world.write_block(p, &BlockType::new("glass")).await.unwrap();
        assert_eq!(world.block_at(p).as_str(), "glass");
    }

    fn sample_entry(command: WorldBulk) -> BulkEntry {
        BulkEntry {
            step_index: 0,
            command,
            origin: Vec3::ZERO,
            timestamp: String::new(),
        }
    }
}
