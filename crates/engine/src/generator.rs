//! Geometry generators: step parameters in, placements or a bulk descriptor out.
//!
//! `Primitives` covers the built-in step ops. Richer shape libraries plug in
//! through `GeometryGenerator`.

use crate::bounds::Bounds;
use crate::bulk::{BulkCommand, BulkGeometry, BulkRegionDescriptor};
use crate::cursor::Cursor;
use crate::error::{BuildError, BuildResult};
use blockwright_protocol::{BlockPlacement, BlockType, Blueprint, StepOp, Vec3};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    /// Build-relative placements, in placement order.
    Placements(Vec<BlockPlacement>),
    Bulk(BulkRegionDescriptor),
}

pub struct GeneratorContext<'a> {
    pub cursor: &'a Cursor,
    pub bulk_available: bool,
    pub blueprint: &'a Blueprint,
}

impl GeneratorContext<'_> {
    pub fn resolve_block(&self, reference: &str) -> BlockType {
        self.blueprint.resolve_block(reference)
    }

    /// Build-relative position of a step-local coordinate.
    pub fn at(&self, local: Vec3) -> Vec3 {
        self.cursor.offset(local)
    }
}

pub trait GeometryGenerator: Send + Sync {
    fn generate(&self, op: &StepOp, ctx: &GeneratorContext<'_>) -> BuildResult<Generated>;

    /// Blocks `generate` would request for `op`, computed without building
    /// them. The dispatcher checks this against the block limit first.
    fn estimate(&self, _op: &StepOp, _ctx: &GeneratorContext<'_>) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Primitives;

fn descriptor(
    command: BulkCommand,
    geometry: BulkGeometry,
    block: BlockType,
    hollow: bool,
    estimated_count: u64,
) -> Generated {
    Generated::Bulk(BulkRegionDescriptor {
        command,
        geometry,
        block,
        hollow,
        target: None,
        estimated_count: estimated_count.max(1),
        fallback: None,
    })
}

fn place_all(positions: impl Iterator<Item = Vec3>, block: &BlockType) -> Generated {
    Generated::Placements(
        positions
            .map(|p| BlockPlacement::new(p, block.clone()))
            .collect(),
    )
}

/// Voxels on the straight segment between two points, both ends included.
pub fn line_positions(from: Vec3, to: Vec3) -> Vec<Vec3> {
    let d = to - from;
    let n = d.x.abs().max(d.y.abs()).max(d.z.abs());
    if n == 0 {
        return vec![from];
    }
    let lerp = |a: i32, delta: i32, i: i32| a + (delta as f64 * i as f64 / n as f64).round() as i32;
    (0..=n)
        .map(|i| Vec3::new(lerp(from.x, d.x, i), lerp(from.y, d.y, i), lerp(from.z, d.z, i)))
        .collect()
}

fn sphere_estimate(radius: i32, hollow: bool) -> u64 {
    let r = radius.max(0) as f64;
    let v = if hollow { 4.0 * PI * r * r } else { 4.0 / 3.0 * PI * r * r * r };
    v.round() as u64
}

fn cylinder_estimate(radius: i32, height: i32, hollow: bool) -> u64 {
    let (r, h) = (radius.max(0) as f64, height.max(1) as f64);
    let v = if hollow { 2.0 * PI * r * h } else { PI * r * r * h };
    v.round() as u64
}

fn pyramid_estimate(height: i32, hollow: bool) -> u64 {
    (0..height.max(1) as u64)
        .map(|half| {
            let side = 2 * half + 1;
            if hollow && side > 2 {
                4 * (side - 1)
            } else {
                side * side
            }
        })
        .sum()
}

impl GeometryGenerator for Primitives {
    fn estimate(&self, op: &StepOp, _ctx: &GeneratorContext<'_>) -> Option<u64> {
        let count = match op {
            StepOp::Set { .. } => 1,
            StepOp::Fill {
                from, to, hollow, ..
            } => {
                let bounds = Bounds::from_corners(*from, *to);
                if *hollow {
                    bounds.shell_volume()
                } else {
                    bounds.volume()
                }
            }
            StepOp::Walls { from, to, .. } => Bounds::from_corners(*from, *to).walls_volume(),
            StepOp::Line { from, to, .. } => {
                let d = *to - *from;
                d.x.unsigned_abs().max(d.y.unsigned_abs()).max(d.z.unsigned_abs()) as u64 + 1
            }
            StepOp::Blocks { blocks } => blocks.len() as u64,
            StepOp::Sphere { radius, hollow, .. } => sphere_estimate(*radius, *hollow),
            StepOp::Cylinder {
                radius,
                height,
                hollow,
                ..
            } => cylinder_estimate(*radius, *height, *hollow),
            StepOp::Pyramid { height, hollow, .. } => pyramid_estimate(*height, *hollow),
            StepOp::Replace { from, to, .. } => Bounds::from_corners(*from, *to).volume(),
            StepOp::Move { .. } | StepOp::Back | StepOp::Reset => return None,
        };
        Some(count)
    }

    fn generate(&self, op: &StepOp, ctx: &GeneratorContext<'_>) -> BuildResult<Generated> {
        let generated = match op {
            StepOp::Set { pos, block } => Generated::Placements(vec![BlockPlacement::new(
                ctx.at(*pos),
                ctx.resolve_block(block),
            )]),
            StepOp::Fill {
                from,
                to,
                block,
                hollow,
            } => {
                let bounds = Bounds::from_corners(ctx.at(*from), ctx.at(*to));
                let block = ctx.resolve_block(block);
                if ctx.bulk_available {
                    let count = if *hollow { bounds.shell_volume() } else { bounds.volume() };
                    descriptor(
                        BulkCommand::Fill,
                        BulkGeometry::Cuboid {
                            from: bounds.min,
                            to: bounds.max,
                        },
                        block,
                        *hollow,
                        count,
                    )
                } else if *hollow {
                    place_all(bounds.positions().filter(|p| bounds.on_shell(*p)), &block)
                } else {
                    place_all(bounds.positions(), &block)
                }
            }
            StepOp::Walls { from, to, block } => {
                let bounds = Bounds::from_corners(ctx.at(*from), ctx.at(*to));
                let block = ctx.resolve_block(block);
                if ctx.bulk_available {
                    descriptor(
                        BulkCommand::Walls,
                        BulkGeometry::Cuboid {
                            from: bounds.min,
                            to: bounds.max,
                        },
                        block,
                        false,
                        bounds.walls_volume(),
                    )
                } else {
                    place_all(bounds.positions().filter(|p| bounds.on_walls(*p)), &block)
                }
            }
            StepOp::Line { from, to, block } => place_all(
                line_positions(ctx.at(*from), ctx.at(*to)).into_iter(),
                &ctx.resolve_block(block),
            ),
            StepOp::Blocks { blocks } => Generated::Placements(
                blocks
                    .iter()
                    .map(|b| BlockPlacement::new(ctx.at(b.pos()), ctx.resolve_block(b.block.as_str())))
                    .collect(),
            ),
            StepOp::Sphere {
                center,
                radius,
                block,
                hollow,
            } => descriptor(
                BulkCommand::Sphere,
                BulkGeometry::Sphere {
                    center: ctx.at(*center),
                    radius: *radius,
                },
                ctx.resolve_block(block),
                *hollow,
                sphere_estimate(*radius, *hollow),
            ),
            StepOp::Cylinder {
                base,
                radius,
                height,
                block,
                hollow,
            } => descriptor(
                BulkCommand::Cylinder,
                BulkGeometry::Cylinder {
                    base: ctx.at(*base),
                    radius: *radius,
                    height: *height,
                },
                ctx.resolve_block(block),
                *hollow,
                cylinder_estimate(*radius, *height, *hollow),
            ),
            StepOp::Pyramid {
                base,
                height,
                block,
                hollow,
            } => descriptor(
                BulkCommand::Pyramid,
                BulkGeometry::Pyramid {
                    base: ctx.at(*base),
                    height: *height,
                },
                ctx.resolve_block(block),
                *hollow,
                pyramid_estimate(*height, *hollow),
            ),
            StepOp::Replace {
                from,
                to,
                target,
                block,
            } => {
                let bounds = Bounds::from_corners(ctx.at(*from), ctx.at(*to));
                let mut generated = descriptor(
                    BulkCommand::Replace,
                    BulkGeometry::Cuboid {
                        from: bounds.min,
                        to: bounds.max,
                    },
                    ctx.resolve_block(block),
                    false,
                    bounds.volume(),
                );
                if let Generated::Bulk(d) = &mut generated {
                    d.target = Some(ctx.resolve_block(target));
                }
                generated
            }
            StepOp::Move { .. } | StepOp::Back | StepOp::Reset => {
                return Err(BuildError::Generator {
                    op: op.name().to_string(),
                    reason: "cursor steps have no geometry".to_string(),
                });
            }
        };
        Ok(generated)
    }
}
