use blockwright_protocol::Vec3;
use serde::{Deserialize, Serialize};

/// Inclusive axis-aligned box normalized from two arbitrary corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn from_corners(a: Vec3, b: Vec3) -> Self {
        Self {
            min: Vec3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Vec3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    pub fn width(&self) -> u32 {
        (self.max.x - self.min.x) as u32 + 1
    }

    pub fn height(&self) -> u32 {
        (self.max.y - self.min.y) as u32 + 1
    }

    pub fn depth(&self) -> u32 {
        (self.max.z - self.min.z) as u32 + 1
    }

    pub fn volume(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * self.depth() as u64
    }

    /// Blocks on the outer shell of the box.
    pub fn shell_volume(&self) -> u64 {
        let (w, h, d) = (self.width() as u64, self.height() as u64, self.depth() as u64);
        if w <= 2 || h <= 2 || d <= 2 {
            return self.volume();
        }
        self.volume() - (w - 2) * (h - 2) * (d - 2)
    }

    /// Blocks on the four vertical faces (no floor, no ceiling).
    pub fn walls_volume(&self) -> u64 {
        let (w, h, d) = (self.width() as u64, self.height() as u64, self.depth() as u64);
        if w <= 2 || d <= 2 {
            return self.volume();
        }
        (w * d - (w - 2) * (d - 2)) * h
    }

    pub fn contains(&self, p: Vec3) -> bool {
        (self.min.x..=self.max.x).contains(&p.x)
            && (self.min.y..=self.max.y).contains(&p.y)
            && (self.min.z..=self.max.z).contains(&p.z)
    }

    pub fn on_shell(&self, p: Vec3) -> bool {
        p.x == self.min.x
            || p.x == self.max.x
            || p.y == self.min.y
            || p.y == self.max.y
            || p.z == self.min.z
            || p.z == self.max.z
    }

    pub fn on_walls(&self, p: Vec3) -> bool {
        p.x == self.min.x || p.x == self.max.x || p.z == self.min.z || p.z == self.max.z
    }

    pub fn translate(&self, by: Vec3) -> Self {
        Self {
            min: self.min + by,
            max: self.max + by,
        }
    }

    /// Every position in the box, y-major (bottom layer first), then z, then x.
    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        let b = *self;
        (b.min.y..=b.max.y).flat_map(move |y| {
            (b.min.z..=b.max.z)
                .flat_map(move |z| (b.min.x..=b.max.x).map(move |x| Vec3::new(x, y, z)))
        })
    }
}
