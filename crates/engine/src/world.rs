use crate::bounds::Bounds;
use crate::bulk::WorldBulk;
use crate::undo::BulkEntry;
use async_trait::async_trait;
use blockwright_protocol::{BlockType, Vec3};
use serde::{Deserialize, Serialize};

/// What the remote side reported after a bulk command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Absolute region the command actually touched, when reported.
    pub actual_bounds: Option<Bounds>,
    pub blocks_changed: Option<u64>,
}

/// The remote world. All positions are absolute.
///
/// Implementations only perform the call; pacing, retries and verification
/// belong to the engine.
#[async_trait]
pub trait WorldAdapter: Send + Sync {
    async fn read_block(&self, pos: Vec3) -> anyhow::Result<BlockType>;

    async fn write_block(&self, pos: Vec3, block: &BlockType) -> anyhow::Result<()>;

    async fn dispatch_bulk(&self, command: &WorldBulk) -> anyhow::Result<BulkOutcome>;

    async fn actor_position(&self) -> anyhow::Result<Vec3>;

    /// Starts a move or teleport. Returning does not mean the actor has arrived.
    async fn move_actor(&self, target: Vec3) -> anyhow::Result<()>;

    async fn probe_bulk_capability(&self) -> bool;

    /// Reverts the given bulk commands, most recent last in `entries`.
    async fn undo_bulk(&self, entries: &[BulkEntry]) -> anyhow::Result<()>;
}
