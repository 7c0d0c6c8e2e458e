//! Blockwright build engine: turns blueprints into verified block placements
//! and bulk commands against a remote world.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;

pub mod bounds;
pub mod builder;
pub mod bulk;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod mutex;
pub mod optimize;
pub mod reliability;
pub mod sandbox;
pub mod state;
pub mod store;
pub mod undo;
pub mod world;

pub use bounds::Bounds;
pub use builder::Builder;
pub use bulk::{BulkCommand, BulkGeometry, BulkRegionDescriptor, WorldBulk};
pub use config::{BuildConfig, RateLimit};
pub use cursor::Cursor;
pub use error::{BuildError, BuildResult, Severity};
pub use generator::{Generated, GeneratorContext, GeometryGenerator, Primitives};
pub use optimize::{optimize, Batch};
pub use sandbox::SandboxWorld;
pub use store::CheckpointStore;
pub use world::{BulkOutcome, WorldAdapter};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub(crate) fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
