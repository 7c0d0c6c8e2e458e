use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Sub};

/// Integer block coordinate. Used both for build-relative and absolute world positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    pub fn length(self) -> f64 {
        let (x, y, z) = (self.x as f64, self.y as f64, self.z as f64);
        (x * x + y * y + z * z).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).length()
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A block identifier such as `stone` or `minecraft:oak_log[axis=y]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockType(pub String);

impl BlockType {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn air() -> Self {
        Self("air".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier without the `minecraft:` namespace and without block-state properties.
    pub fn base_name(&self) -> &str {
        let s = self.0.strip_prefix("minecraft:").unwrap_or(&self.0);
        match s.find('[') {
            Some(i) => &s[..i],
            None => s,
        }
    }

    /// True when both identifiers name the same block, ignoring namespace and state.
    pub fn matches(&self, other: &BlockType) -> bool {
        self.base_name() == other.base_name()
    }

    pub fn is_air(&self) -> bool {
        matches!(self.base_name(), "air" | "cave_air" | "void_air")
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub block: BlockType,
}

impl BlockPlacement {
    pub fn new(pos: Vec3, block: BlockType) -> Self {
        Self {
            x: pos.x,
            y: pos.y,
            z: pos.z,
            block,
        }
    }

    pub fn pos(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub size: Size,
    #[serde(default)]
    pub palette: BTreeMap<String, BlockType>,
    pub steps: Vec<Step>,
}

impl Blueprint {
    /// Palette keys win; anything else is taken as a literal block id.
    pub fn resolve_block(&self, reference: &str) -> BlockType {
        self.palette
            .get(reference)
            .cloned()
            .unwrap_or_else(|| BlockType::new(reference))
    }
}

/// One blueprint step. `fallback` is only consulted when the step went out as a bulk
/// command and that command failed (or bulk commands are unavailable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub op: StepOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<Step>>,
}

impl Step {
    pub fn new(op: StepOp) -> Self {
        Self { op, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: Step) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }
}

impl From<StepOp> for Step {
    fn from(op: StepOp) -> Self {
        Step::new(op)
    }
}

/// Step positions are relative to the cursor position at the time the step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepOp {
    Set {
        pos: Vec3,
        block: String,
    },
    Fill {
        from: Vec3,
        to: Vec3,
        block: String,
        #[serde(default)]
        hollow: bool,
    },
    Walls {
        from: Vec3,
        to: Vec3,
        block: String,
    },
    Line {
        from: Vec3,
        to: Vec3,
        block: String,
    },
    Blocks {
        blocks: Vec<BlockPlacement>,
    },
    Sphere {
        center: Vec3,
        radius: i32,
        block: String,
        #[serde(default)]
        hollow: bool,
    },
    Cylinder {
        base: Vec3,
        radius: i32,
        height: i32,
        block: String,
        #[serde(default)]
        hollow: bool,
    },
    Pyramid {
        base: Vec3,
        height: i32,
        block: String,
        #[serde(default)]
        hollow: bool,
    },
    Replace {
        from: Vec3,
        to: Vec3,
        target: String,
        block: String,
    },
    Move {
        offset: Vec3,
    },
    Back,
    Reset,
}

impl StepOp {
    pub fn name(&self) -> &'static str {
        match self {
            StepOp::Set { .. } => "set",
            StepOp::Fill { .. } => "fill",
            StepOp::Walls { .. } => "walls",
            StepOp::Line { .. } => "line",
            StepOp::Blocks { .. } => "blocks",
            StepOp::Sphere { .. } => "sphere",
            StepOp::Cylinder { .. } => "cylinder",
            StepOp::Pyramid { .. } => "pyramid",
            StepOp::Replace { .. } => "replace",
            StepOp::Move { .. } => "move",
            StepOp::Back => "back",
            StepOp::Reset => "reset",
        }
    }

    /// Cursor-only steps never touch the world.
    pub fn is_cursor_op(&self) -> bool {
        matches!(self, StepOp::Move { .. } | StepOp::Back | StepOp::Reset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub blocks_placed: u64,
    pub blocks_failed: u64,
    pub blocks_skipped: u64,
    pub bulk_ops: u64,
    pub fallbacks_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub run_id: String,
    pub blocks_placed: u64,
    pub blocks_failed: u64,
    pub blocks_skipped: u64,
    pub bulk_ops: u64,
    pub fallbacks_used: u64,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub steps_completed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub blocks_placed: u64,
    pub blocks_failed: u64,
    pub elapsed_ms: u64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoReport {
    pub bulk_undone: usize,
    pub blocks_restored: u64,
    pub blocks_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
    Superseded,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Runs that stopped before finishing their blueprint.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::InProgress | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumableCheckpoint {
    pub run_id: String,
    pub blueprint: Blueprint,
    pub origin: Vec3,
    /// Build-relative cursor position after the last completed step.
    pub cursor: Vec3,
    /// Index of the next step that has not completed yet.
    pub current_step_index: usize,
    pub counters: Counters,
    pub status: CheckpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub blueprint: Blueprint,
    #[serde(default)]
    pub origin: Vec3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const BUILDS: &str = "/api/builds";
    pub const CANCEL: &str = "/api/builds/cancel";
    pub const UNDO: &str = "/api/builds/undo";
    pub const PROGRESS: &str = "/api/builds/progress";
    pub const RESUMABLE: &str = "/api/builds/resumable";
    pub const RESUME: &str = "/api/builds/{run_id}/resume";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_matching_ignores_namespace_and_state() {
        let a = BlockType::new("minecraft:oak_log[axis=y]");
        assert!(a.matches(&BlockType::new("oak_log")));
        assert!(!a.matches(&BlockType::new("oak_planks")));
        assert!(BlockType::new("minecraft:cave_air").is_air());
    }

    #[test]
    fn step_parses_with_op_tag_and_fallback() {
        let json = r#"{
            "op": "sphere",
            "center": {"x": 0, "y": 5, "z": 0},
            "radius": 4,
            "block": "glass",
            "fallback": {"op": "set", "pos": {"x": 0, "y": 5, "z": 0}, "block": "glass"}
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.op.name(), "sphere");
        let fb = step.fallback.expect("fallback");
        assert_eq!(fb.op.name(), "set");
        assert!(fb.fallback.is_none());
    }

    #[test]
    fn palette_reference_resolves_before_literal() {
        let mut palette = BTreeMap::new();
        palette.insert("wall".to_string(), BlockType::new("stone_bricks"));
        let bp = Blueprint {
            size: Size::default(),
            palette,
            steps: vec![],
        };
        assert_eq!(bp.resolve_block("wall").as_str(), "stone_bricks");
        assert_eq!(bp.resolve_block("glass").as_str(), "glass");
    }

    #[test]
    fn cursor_ops_have_no_params() {
        let step: Step = serde_json::from_str(r#"{"op":"reset"}"#).unwrap();
        assert!(step.op.is_cursor_op());
        assert_eq!(
            serde_json::to_value(Step::new(StepOp::Back)).unwrap(),
            serde_json::json!({"op": "back"})
        );
    }
}
