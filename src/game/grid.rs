//! Uniform-grid broadphase
//!
//! Each object is stored in every cell its bounding box touches. Queries return
//! a superset of the true overlaps; callers re-test exact geometry if needed.
//! The grid is layer-agnostic.

use std::collections::{HashMap, HashSet};

use super::objects::ObjectId;
use super::physics::{Aabb, Collider, Vec2};

/// Inclusive range of cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellRange {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

impl CellRange {
    fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    fn cells(self) -> impl Iterator<Item = (usize, usize)> {
        (self.y0..=self.y1).flat_map(move |y| (self.x0..=self.x1).map(move |x| (x, y)))
    }
}

pub struct Grid {
    cell_size: f32,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<ObjectId>>,
    membership: HashMap<ObjectId, CellRange>,
}

impl Grid {
    /// Grid covering `[0, width] x [0, height]`; positions outside clamp to edge cells
    pub fn new(width: f32, height: f32, cell_size: f32) -> Self {
        let cell_size = cell_size.max(1.0);
        let cols = ((width / cell_size).ceil() as usize).max(1);
        let rows = ((height / cell_size).ceil() as usize).max(1);
        Self {
            cell_size,
            cols,
            rows,
            cells: vec![Vec::new(); cols * rows],
            membership: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.membership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.membership.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.membership.contains_key(&id)
    }

    fn coord(&self, v: f32, max: usize) -> usize {
        if v <= 0.0 {
            0
        } else {
            ((v / self.cell_size) as usize).min(max - 1)
        }
    }

    fn range(&self, aabb: &Aabb) -> CellRange {
        CellRange {
            x0: self.coord(aabb.min.x, self.cols),
            y0: self.coord(aabb.min.y, self.rows),
            x1: self.coord(aabb.max.x, self.cols),
            y1: self.coord(aabb.max.y, self.rows),
        }
    }

    fn cell_index(&self, x: usize, y: usize) -> usize {
        y * self.cols + x
    }

    fn cell_aabb(&self, x: usize, y: usize) -> Aabb {
        let min = Vec2::new(x as f32 * self.cell_size, y as f32 * self.cell_size);
        Aabb::new(min, min + Vec2::new(self.cell_size, self.cell_size))
    }

    pub fn insert(&mut self, id: ObjectId, shape: &Collider) {
        if self.membership.contains_key(&id) {
            self.update_position(id, shape);
            return;
        }
        let range = self.range(&shape.aabb());
        for (x, y) in range.cells() {
            let idx = self.cell_index(x, y);
            self.cells[idx].push(id);
        }
        self.membership.insert(id, range);
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let Some(range) = self.membership.remove(&id) else {
            return false;
        };
        for (x, y) in range.cells() {
            let idx = self.cell_index(x, y);
            self.remove_from_cell(idx, id);
        }
        true
    }

    fn remove_from_cell(&mut self, idx: usize, id: ObjectId) {
        let cell = &mut self.cells[idx];
        if let Some(pos) = cell.iter().position(|&other| other == id) {
            cell.swap_remove(pos);
        }
    }

    /// Move an object, touching only the cells that entered or left its footprint
    pub fn update_position(&mut self, id: ObjectId, shape: &Collider) {
        let new_range = self.range(&shape.aabb());
        let Some(old_range) = self.membership.get(&id).copied() else {
            self.insert(id, shape);
            return;
        };
        if old_range == new_range {
            return;
        }
        for (x, y) in old_range.cells() {
            if !new_range.contains(x, y) {
                let idx = self.cell_index(x, y);
                self.remove_from_cell(idx, id);
            }
        }
        for (x, y) in new_range.cells() {
            if !old_range.contains(x, y) {
                let idx = self.cell_index(x, y);
                self.cells[idx].push(id);
            }
        }
        self.membership.insert(id, new_range);
    }

    /// Every id whose cells overlap the rectangle
    pub fn intersect_rect(&self, min: Vec2, max: Vec2) -> HashSet<ObjectId> {
        let mut out = HashSet::new();
        self.intersect_rect_into(&Aabb::new(min, max), &mut out);
        out
    }

    pub fn intersect_rect_into(&self, aabb: &Aabb, out: &mut HashSet<ObjectId>) {
        for (x, y) in self.range(aabb).cells() {
            out.extend(self.cells[self.cell_index(x, y)].iter().copied());
        }
    }

    /// Every id whose cells overlap the circle
    pub fn intersect_circle(&self, center: Vec2, radius: f32) -> HashSet<ObjectId> {
        let mut out = HashSet::new();
        for (x, y) in self.range(&Aabb::around(center, radius)).cells() {
            if self.cell_aabb(x, y).intersects_circle(center, radius) || self.is_edge(x, y) {
                out.extend(self.cells[self.cell_index(x, y)].iter().copied());
            }
        }
        out
    }

    /// Edge cells also hold everything clamped in from outside the grid
    fn is_edge(&self, x: usize, y: usize) -> bool {
        x == 0 || y == 0 || x + 1 == self.cols || y + 1 == self.rows
    }

    pub fn intersect_collider(&self, shape: &Collider) -> HashSet<ObjectId> {
        match *shape {
            Collider::Circle { center, radius } => self.intersect_circle(center, radius),
            Collider::Rect(aabb) => self.intersect_rect(aabb.min, aabb.max),
        }
    }
}
