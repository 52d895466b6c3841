//! World geometry, bounding shapes and movement constraints

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::util::time::tick_delta;

/// 2D world-space vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length_sq(self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    pub fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Unit vector in the same direction, or `fallback` for a zero vector
    pub fn normalize_or(self, fallback: Vec2) -> Vec2 {
        let len = self.length();
        if len > 1e-6 {
            Vec2::new(self.x / len, self.y / len)
        } else {
            fallback
        }
    }

    pub fn min(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x.min(other.x), self.y.min(other.y))
    }

    pub fn max(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x.max(other.x), self.y.max(other.y))
    }

    pub fn clamp(self, lo: Vec2, hi: Vec2) -> Vec2 {
        Vec2::new(self.x.clamp(lo.x, hi.x), self.y.clamp(lo.y, hi.y))
    }

    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).length()
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    /// Square box with the given half extent around `center`
    pub fn around(center: Vec2, half_extent: f32) -> Self {
        let ext = Vec2::new(half_extent, half_extent);
        Self::new(center - ext, center + ext)
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    /// Closest point inside the box to `point`
    pub fn closest_point(&self, point: Vec2) -> Vec2 {
        point.clamp(self.min, self.max)
    }

    pub fn intersects_circle(&self, center: Vec2, radius: f32) -> bool {
        self.closest_point(center).distance(center) <= radius
    }
}

/// Bounding shape of a world object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Collider {
    Circle { center: Vec2, radius: f32 },
    Rect(Aabb),
}

impl Collider {
    pub fn circle(center: Vec2, radius: f32) -> Self {
        Collider::Circle { center, radius }
    }

    pub fn rect(center: Vec2, half_width: f32, half_height: f32) -> Self {
        let ext = Vec2::new(half_width, half_height);
        Collider::Rect(Aabb::new(center - ext, center + ext))
    }

    pub fn aabb(&self) -> Aabb {
        match *self {
            Collider::Circle { center, radius } => Aabb::around(center, radius),
            Collider::Rect(aabb) => aabb,
        }
    }

    pub fn center(&self) -> Vec2 {
        match *self {
            Collider::Circle { center, .. } => center,
            Collider::Rect(aabb) => (aabb.min + aabb.max) * 0.5,
        }
    }

    /// Same shape moved so that its center sits at `pos`
    pub fn moved_to(&self, pos: Vec2) -> Collider {
        match *self {
            Collider::Circle { radius, .. } => Collider::Circle { center: pos, radius },
            Collider::Rect(aabb) => {
                let half = (aabb.max - aabb.min) * 0.5;
                Collider::Rect(Aabb::new(pos - half, pos + half))
            }
        }
    }

    /// Exact overlap test between two shapes
    pub fn intersects(&self, other: &Collider) -> bool {
        match (*self, *other) {
            (Collider::Circle { center: a, radius: ra }, Collider::Circle { center: b, radius: rb }) => {
                PhysicsSystem::check_circle_collision(a, ra, b, rb)
            }
            (Collider::Circle { center, radius }, Collider::Rect(aabb))
            | (Collider::Rect(aabb), Collider::Circle { center, radius }) => {
                aabb.intersects_circle(center, radius)
            }
            (Collider::Rect(a), Collider::Rect(b)) => a.overlaps(&b),
        }
    }
}

/// Movement tuning for player avatars
#[derive(Debug, Clone, Copy)]
pub struct MoveStats {
    /// Units per second at full input
    pub max_speed: f32,
    /// Avatar collision radius
    pub radius: f32,
}

impl Default for MoveStats {
    fn default() -> Self {
        Self {
            max_speed: 12.0,
            radius: 1.0,
        }
    }
}

/// Stateless movement and collision helpers
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance a position by one tick of directional input, clamped to the world bounds
    pub fn step_position(
        pos: Vec2,
        move_dir: Vec2,
        stats: &MoveStats,
        tick_rate: u32,
        world_max: Vec2,
    ) -> Vec2 {
        let dt = tick_delta(tick_rate);
        let dir = move_dir.normalize_or(Vec2::ZERO);
        let next = pos + dir * (stats.max_speed * dt);
        let margin = Vec2::new(stats.radius, stats.radius);
        next.clamp(margin, world_max - margin)
    }

    /// Check if a point is inside a circular zone
    pub fn is_in_zone(point: Vec2, zone_center: Vec2, zone_radius: f32) -> bool {
        (point - zone_center).length_sq() <= zone_radius * zone_radius
    }

    pub fn check_circle_collision(a: Vec2, radius_a: f32, b: Vec2, radius_b: f32) -> bool {
        let combined = radius_a + radius_b;
        (b - a).length_sq() <= combined * combined
    }

    /// Distance along a ray at which it first enters a circle, if it does within `max_dist`
    pub fn ray_circle(origin: Vec2, dir: Vec2, max_dist: f32, center: Vec2, radius: f32) -> Option<f32> {
        let to_center = center - origin;
        let proj = to_center.dot(dir);
        let closest_sq = to_center.length_sq() - proj * proj;
        let r_sq = radius * radius;
        if closest_sq > r_sq {
            return None;
        }
        let half_chord = (r_sq - closest_sq).sqrt();
        let t = if proj - half_chord >= 0.0 {
            proj - half_chord
        } else if proj + half_chord >= 0.0 {
            0.0
        } else {
            return None;
        };
        (t <= max_dist).then_some(t)
    }
}
