use crate::bounds::Bounds;
use blockwright_protocol::{BlockPlacement, BlockType, Step, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkCommand {
    Fill,
    Walls,
    Pyramid,
    Cylinder,
    Sphere,
    Replace,
}

impl BulkCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkCommand::Fill => "fill",
            BulkCommand::Walls => "walls",
            BulkCommand::Pyramid => "pyramid",
            BulkCommand::Cylinder => "cylinder",
            BulkCommand::Sphere => "sphere",
            BulkCommand::Replace => "replace",
        }
    }

    /// Commands the remote side applies around the actor's own position.
    pub fn is_anchored(self) -> bool {
        matches!(
            self,
            BulkCommand::Pyramid | BulkCommand::Cylinder | BulkCommand::Sphere
        )
    }
}

impl fmt::Display for BulkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum BulkGeometry {
    Cuboid { from: Vec3, to: Vec3 },
    Sphere { center: Vec3, radius: i32 },
    Cylinder { base: Vec3, radius: i32, height: i32 },
    Pyramid { base: Vec3, height: i32 },
}

impl BulkGeometry {
    pub fn translate(&self, by: Vec3) -> Self {
        match *self {
            BulkGeometry::Cuboid { from, to } => BulkGeometry::Cuboid {
                from: from + by,
                to: to + by,
            },
            BulkGeometry::Sphere { center, radius } => BulkGeometry::Sphere {
                center: center + by,
                radius,
            },
            BulkGeometry::Cylinder {
                base,
                radius,
                height,
            } => BulkGeometry::Cylinder {
                base: base + by,
                radius,
                height,
            },
            BulkGeometry::Pyramid { base, height } => BulkGeometry::Pyramid {
                base: base + by,
                height,
            },
        }
    }

    /// The point an anchored command is issued from.
    pub fn anchor(&self) -> Vec3 {
        match *self {
            BulkGeometry::Cuboid { from, .. } => from,
            BulkGeometry::Sphere { center, .. } => center,
            BulkGeometry::Cylinder { base, .. } | BulkGeometry::Pyramid { base, .. } => base,
        }
    }

    pub fn bounds(&self) -> Bounds {
        match *self {
            BulkGeometry::Cuboid { from, to } => Bounds::from_corners(from, to),
            BulkGeometry::Sphere { center, radius } => {
                let r = Vec3::new(radius, radius, radius);
                Bounds::from_corners(center - r, center + r)
            }
            BulkGeometry::Cylinder {
                base,
                radius,
                height,
            } => Bounds::from_corners(
                base - Vec3::new(radius, 0, radius),
                base + Vec3::new(radius, height.max(1) - 1, radius),
            ),
            BulkGeometry::Pyramid { base, height } => {
                let r = height.max(1) - 1;
                Bounds::from_corners(base - Vec3::new(r, 0, r), base + Vec3::new(r, r, r))
            }
        }
    }
}

/// What to place instead when a bulk command cannot be used.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    /// A blueprint step, generated again with bulk commands disabled.
    Step(Box<Step>),
    /// Build-relative placements equivalent to the command.
    Placements(Vec<BlockPlacement>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkRegionDescriptor {
    pub command: BulkCommand,
    /// Build-relative geometry.
    pub geometry: BulkGeometry,
    pub block: BlockType,
    pub hollow: bool,
    /// Block replaced by a `replace` command.
    pub target: Option<BlockType>,
    pub estimated_count: u64,
    pub fallback: Option<Fallback>,
}

impl BulkRegionDescriptor {
    /// A solid `fill` over a box, carrying its footprint as the fallback.
    pub fn cuboid_fill(bounds: Bounds, block: BlockType) -> Self {
        let footprint = bounds
            .positions()
            .map(|p| BlockPlacement::new(p, block.clone()))
            .collect();
        Self {
            command: BulkCommand::Fill,
            geometry: BulkGeometry::Cuboid {
                from: bounds.min,
                to: bounds.max,
            },
            block,
            hollow: false,
            target: None,
            estimated_count: bounds.volume(),
            fallback: Some(Fallback::Placements(footprint)),
        }
    }

    /// Positions a solid cuboid `fill` covers. Other commands have no exact footprint here.
    pub fn cuboid_footprint(&self) -> Option<Bounds> {
        match (self.command, self.hollow, self.geometry) {
            (BulkCommand::Fill, false, BulkGeometry::Cuboid { from, to }) => {
                Some(Bounds::from_corners(from, to))
            }
            _ => None,
        }
    }

    /// Absolute form of this descriptor, ready for the world adapter.
    pub fn to_world(&self, origin: Vec3) -> WorldBulk {
        WorldBulk {
            command: self.command,
            geometry: self.geometry.translate(origin),
            block: self.block.clone(),
            hollow: self.hollow,
            target: self.target.clone(),
        }
    }
}

/// A bulk command in absolute world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldBulk {
    pub command: BulkCommand,
    pub geometry: BulkGeometry,
    pub block: BlockType,
    pub hollow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BlockType>,
}
