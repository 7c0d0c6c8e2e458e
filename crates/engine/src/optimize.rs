//! Point-cloud batching.
//!
//! Turns loose block placements into `fill` commands plus leftovers. Two
//! greedy strategies: rectangles for planar sets, axis runs for everything
//! else. Both scan in a fixed order (sorted rows for rectangles, input order
//! for runs), so the same input always yields the same batch, but neither
//! searches for a globally minimal cover.
//!
//! Every input placement ends up in exactly one bulk op footprint or in the
//! leftovers. Positions listed more than once are never batched; all of their
//! occurrences come back as leftovers in input order.

use crate::bounds::Bounds;
use crate::bulk::BulkRegionDescriptor;
use blockwright_protocol::{BlockPlacement, BlockType, Vec3};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn of(self, v: Vec3) -> i32 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }

    fn step(self, v: Vec3, k: i32) -> Vec3 {
        match self {
            Axis::X => Vec3::new(v.x + k, v.y, v.z),
            Axis::Y => Vec3::new(v.x, v.y + k, v.z),
            Axis::Z => Vec3::new(v.x, v.y, v.z + k),
        }
    }

    /// (row, column) axes of the plane perpendicular to `self`.
    fn plane(self) -> (Axis, Axis) {
        match self {
            Axis::Y => (Axis::Z, Axis::X),
            Axis::X => (Axis::Y, Axis::Z),
            Axis::Z => (Axis::Y, Axis::X),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub bulk_ops: Vec<BulkRegionDescriptor>,
    pub leftovers: Vec<BlockPlacement>,
}

impl Batch {
    pub fn batched_count(&self) -> u64 {
        self.bulk_ops.iter().map(|op| op.estimated_count).sum()
    }

    /// True when the batch covers `input` exactly: same multiset of positions,
    /// same block at each batched position.
    pub fn is_partition_of(&self, input: &[BlockPlacement]) -> bool {
        let mut remaining: HashMap<(Vec3, BlockType), usize> = HashMap::new();
        for p in input {
            *remaining.entry((p.pos(), p.block.clone())).or_default() += 1;
        }
        for op in &self.bulk_ops {
            let Some(bounds) = op.cuboid_footprint() else {
                return false;
            };
            if !bounds.positions().all(|p| take(&mut remaining, p, &op.block)) {
                return false;
            }
        }
        if !self
            .leftovers
            .iter()
            .all(|p| take(&mut remaining, p.pos(), &p.block))
        {
            return false;
        }
        remaining.values().all(|n| *n == 0)
    }
}

fn take(remaining: &mut HashMap<(Vec3, BlockType), usize>, pos: Vec3, block: &BlockType) -> bool {
    match remaining.get_mut(&(pos, block.clone())) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

/// Picks the rectangle decomposer for planar input, axis runs otherwise.
pub fn optimize(placements: &[BlockPlacement], min_batch_size: usize) -> Batch {
    match constant_axis(placements) {
        Some(axis) => greedy_rectangles(placements, axis, min_batch_size * 2),
        None => axis_runs(placements, min_batch_size),
    }
}

/// First axis (Y, then X, then Z) on which every placement shares one coordinate.
pub fn constant_axis(placements: &[BlockPlacement]) -> Option<Axis> {
    let first = placements.first()?.pos();
    [Axis::Y, Axis::X, Axis::Z]
        .into_iter()
        .find(|axis| placements.iter().all(|p| axis.of(p.pos()) == axis.of(first)))
}

fn duplicated_positions(placements: &[BlockPlacement]) -> HashSet<Vec3> {
    let mut seen = HashSet::new();
    placements
        .iter()
        .map(BlockPlacement::pos)
        .filter(|p| !seen.insert(*p))
        .collect()
}

fn leftovers_excluding(placements: &[BlockPlacement], batched: &HashSet<Vec3>) -> Vec<BlockPlacement> {
    placements
        .iter()
        .filter(|p| !batched.contains(&p.pos()))
        .cloned()
        .collect()
}

type Cell = (i32, i32);

fn is_free(present: &HashSet<Cell>, consumed: &HashSet<Cell>, cell: Cell) -> bool {
    present.contains(&cell) && !consumed.contains(&cell)
}

/// Greedy rectangle cover of a planar point set whose `constant` coordinate is fixed.
pub fn greedy_rectangles(placements: &[BlockPlacement], constant: Axis, min_area: usize) -> Batch {
    let Some(first) = placements.first() else {
        return Batch::default();
    };
    let fixed = constant.of(first.pos());
    let (row_axis, col_axis) = constant.plane();
    let to_world = |row: i32, col: i32| -> Vec3 {
        let mut v = Vec3::ZERO;
        for (axis, value) in [(constant, fixed), (row_axis, row), (col_axis, col)] {
            match axis {
                Axis::X => v.x = value,
                Axis::Y => v.y = value,
                Axis::Z => v.z = value,
            }
        }
        v
    };

    let dupes = duplicated_positions(placements);
    let mut order: Vec<&BlockType> = Vec::new();
    let mut groups: HashMap<&BlockType, Vec<Cell>> = HashMap::new();
    for p in placements.iter().filter(|p| !dupes.contains(&p.pos())) {
        let pos = p.pos();
        groups
            .entry(&p.block)
            .or_insert_with(|| {
                order.push(&p.block);
                Vec::new()
            })
            .push((row_axis.of(pos), col_axis.of(pos)));
    }

    let mut batch = Batch::default();
    let mut batched: HashSet<Vec3> = HashSet::new();
    for block in order {
        let mut cells = groups.remove(block).unwrap_or_default();
        cells.sort_unstable();
        let present: HashSet<Cell> = cells.iter().copied().collect();
        let mut consumed: HashSet<Cell> = HashSet::new();

        for &(row, col) in &cells {
            if consumed.contains(&(row, col)) {
                continue;
            }
            let mut width = 1;
            while is_free(&present, &consumed, (row, col + width)) {
                width += 1;
            }
            let mut height = 1;
            while (0..width).all(|i| is_free(&present, &consumed, (row + height, col + i))) {
                height += 1;
            }
            if ((width * height) as usize) < min_area {
                continue;
            }
            for r in row..row + height {
                for c in col..col + width {
                    consumed.insert((r, c));
                    batched.insert(to_world(r, c));
                }
            }
            let bounds = Bounds::from_corners(
                to_world(row, col),
                to_world(row + height - 1, col + width - 1),
            );
            batch
                .bulk_ops
                .push(BulkRegionDescriptor::cuboid_fill(bounds, block.clone()));
        }
    }

    batch.leftovers = leftovers_excluding(placements, &batched);
    batch
}

/// Longest same-block run from each point along +X, +Y or +Z, scanned in input order.
pub fn axis_runs(placements: &[BlockPlacement], min_run: usize) -> Batch {
    let dupes = duplicated_positions(placements);
    let index: HashMap<Vec3, &BlockType> = placements
        .iter()
        .filter(|p| !dupes.contains(&p.pos()))
        .map(|p| (p.pos(), &p.block))
        .collect();

    let mut batch = Batch::default();
    let mut consumed: HashSet<Vec3> = HashSet::new();
    for p in placements {
        let start = p.pos();
        if dupes.contains(&start) || consumed.contains(&start) {
            continue;
        }
        let run_len = |axis: Axis| -> i32 {
            let mut k = 1;
            loop {
                let next = axis.step(start, k);
                if consumed.contains(&next) || index.get(&next) != Some(&&p.block) {
                    return k;
                }
                k += 1;
            }
        };
        let mut best = (Axis::X, 0);
        for axis in Axis::ALL {
            let len = run_len(axis);
            if len > best.1 {
                best = (axis, len);
            }
        }
        let (axis, len) = best;
        if (len as usize) < min_run {
            continue;
        }
        let end = axis.step(start, len - 1);
        for k in 0..len {
            consumed.insert(axis.step(start, k));
        }
        batch.bulk_ops.push(BulkRegionDescriptor::cuboid_fill(
            Bounds::from_corners(start, end),
            p.block.clone(),
        ));
    }

    batch.leftovers = leftovers_excluding(placements, &consumed);
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkGeometry;

    fn place(x: i32, y: i32, z: i32, block: &str) -> BlockPlacement {
        BlockPlacement::new(Vec3::new(x, y, z), BlockType::new(block))
    }

    fn footprint_total(batch: &Batch) -> usize {
        batch
            .bulk_ops
            .iter()
            .map(|op| op.cuboid_footprint().unwrap().volume() as usize)
            .sum()
    }

    /// xorshift, good enough to scatter test points.
    fn scatter(seed: u64, n: usize, span: i32) -> Vec<BlockPlacement> {
        let mut s = seed;
        let mut next = move || {
            s ^= s << 13;
            s ^= s >> 7;
            s ^= s << 17;
            s
        };
        let blocks = ["stone", "glass", "oak_planks"];
        (0..n)
            .map(|_| {
                let x = (next() % span as u64) as i32;
                let y = (next() % span as u64) as i32;
                let z = (next() % span as u64) as i32;
                place(x, y, z, blocks[(next() % 3) as usize])
            })
            .collect()
    }

    #[test]
    fn dense_rectangle_becomes_one_fill() {
        let input: Vec<_> = (0..5)
            .flat_map(|x| (0..4).map(move |z| place(x, 3, z, "stone")))
            .collect();
        let batch = optimize(&input, 4);
        assert!(batch.leftovers.is_empty());
        assert_eq!(batch.bulk_ops.len(), 1);
        assert_eq!(
            batch.bulk_ops[0].geometry,
            BulkGeometry::Cuboid {
                from: Vec3::new(0, 3, 0),
                to: Vec3::new(4, 3, 3)
            }
        );
        assert_eq!(batch.bulk_ops[0].estimated_count, 20);
    }

    #[test]
    fn small_rectangles_stay_leftovers() {
        let input = vec![
            place(0, 0, 0, "stone"),
            place(1, 0, 0, "stone"),
            place(0, 0, 1, "stone"),
        ];
        let batch = optimize(&input, 4);
        assert!(batch.bulk_ops.is_empty());
        assert_eq!(batch.leftovers, input);
    }

    #[test]
    fn rectangles_split_by_block_type() {
        let mut input = Vec::new();
        for x in 0..4 {
            for z in 0..4 {
                let block = if x < 2 { "stone" } else { "glass" };
                input.push(place(x, 0, z, block));
            }
        }
        let batch = greedy_rectangles(&input, Axis::Y, 8);
        assert_eq!(batch.bulk_ops.len(), 2);
        assert!(batch.leftovers.is_empty());
        assert!(batch.is_partition_of(&input));
    }

    #[test]
    fn vertical_wall_uses_its_own_plane() {
        let input: Vec<_> = (0..3)
            .flat_map(|y| (0..6).map(move |x| place(x, y, 7, "bricks")))
            .collect();
        assert_eq!(constant_axis(&input), Some(Axis::Z));
        let batch = optimize(&input, 4);
        assert_eq!(batch.bulk_ops.len(), 1);
        assert_eq!(batch.bulk_ops[0].estimated_count, 18);
    }

    #[test]
    fn longest_axis_wins() {
        let mut input: Vec<_> = (0..10).map(|y| place(0, y, 0, "log")).collect();
        input.push(place(1, 0, 0, "log"));
        input.push(place(2, 0, 0, "log"));
        // Off-plane point so the set is not planar.
        input.push(place(5, 5, 5, "log"));
        assert_eq!(constant_axis(&input), None);

        let batch = optimize(&input, 3);
        let first = &batch.bulk_ops[0];
        assert_eq!(
            first.geometry,
            BulkGeometry::Cuboid {
                from: Vec3::new(0, 0, 0),
                to: Vec3::new(0, 9, 0)
            }
        );
        assert_eq!(first.estimated_count, 10);
        assert!(batch.is_partition_of(&input));
    }

    #[test]
    fn runs_do_not_cross_block_types() {
        let input = vec![
            place(0, 0, 0, "stone"),
            place(1, 0, 0, "stone"),
            place(2, 0, 0, "glass"),
            place(3, 0, 0, "stone"),
            place(0, 1, 1, "stone"),
        ];
        let batch = axis_runs(&input, 3);
        assert!(batch.bulk_ops.is_empty());
        assert_eq!(batch.leftovers.len(), 5);
    }

    #[test]
    fn duplicate_positions_are_never_batched() {
        let mut input: Vec<_> = (0..6).map(|x| place(x, 0, 0, "stone")).collect();
        input.push(place(2, 0, 0, "glass"));
        let batch = axis_runs(&input, 2);
        assert!(batch.is_partition_of(&input));
        let dup: Vec<_> = batch
            .leftovers
            .iter()
            .filter(|p| p.pos() == Vec3::new(2, 0, 0))
            .map(|p| p.block.as_str())
            .collect();
        assert_eq!(dup, ["stone", "glass"]);
    }

    #[test]
    fn every_placement_lands_in_exactly_one_bucket() {
        for seed in 1..20u64 {
            let input = scatter(seed * 7919, 300, 6);
            for min in [2, 3, 4] {
                let batch = optimize(&input, min);
                assert_eq!(
                    batch.leftovers.len() + footprint_total(&batch),
                    input.len(),
                    "seed {seed} min {min}"
                );
                assert!(batch.is_partition_of(&input), "seed {seed} min {min}");
            }
        }
    }

    #[test]
    fn planar_scatter_partitions_exactly() {
        for seed in 1..20u64 {
            let input: Vec<_> = scatter(seed * 104_729, 200, 8)
                .into_iter()
                .map(|mut p| {
                    p.y = 0;
                    p
                })
                .collect();
            let batch = optimize(&input, 2);
            assert_eq!(batch.leftovers.len() + footprint_total(&batch), input.len());
            assert!(batch.is_partition_of(&input));
        }
    }

    #[test]
    fn same_input_same_batch() {
        let input = scatter(42, 150, 5);
        assert_eq!(optimize(&input, 3), optimize(&input, 3));
    }

    #[test]
    fn empty_input() {
        let batch = optimize(&[], 4);
        assert!(batch.bulk_ops.is_empty() && batch.leftovers.is_empty());
    }
}
