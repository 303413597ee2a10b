// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tile-hashed change detection.
//!
//! The framebuffer is covered by a grid of 64x64 tiles (edge tiles
//! clipped). Each capture hashes every tile and compares against the
//! stored hash; changed tiles are merged into a small set of covering
//! rectangles via 4-neighbour connected components. When most of the
//! screen changed, region bookkeeping is pointless and a single
//! full-framebuffer rectangle is reported instead.

use md5::{Digest, Md5};

use crate::framebuffer::Region;

/// Detector tile edge length in pixels.
pub const TILE_SIZE: u16 = 64;

/// Upper bound on rectangles reported per frame.
const MAX_RECTANGLES: usize = 32;

/// Above this fraction of dirty tiles a single full-screen rectangle
/// is reported.
const FULL_UPDATE_RATIO_PERCENT: usize = 75;

/// Result of one detection pass.
#[derive(Debug, Clone)]
pub struct ChangeReport {
    /// Minimal covering set of changed regions, at most [`MAX_RECTANGLES`].
    pub regions: Vec<Region>,
    /// How many tiles changed this pass.
    pub dirty_tiles: usize,
    /// Tile count of the whole grid.
    pub total_tiles: usize,
}

impl ChangeReport {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Per-connection tile hash grid.
pub struct ChangeDetector {
    width: u16,
    height: u16,
    tiles_x: usize,
    tiles_y: usize,
    /// Row-major tile hashes; None until first seeded.
    hashes: Vec<Option<[u8; 16]>>,
    /// Consecutive detection passes with zero dirty tiles.
    clean_streak: u32,
}

impl ChangeDetector {
    pub fn new(width: u16, height: u16) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE) as usize;
        let tiles_y = height.div_ceil(TILE_SIZE) as usize;
        Self {
            width,
            height,
            tiles_x,
            tiles_y,
            hashes: vec![None; tiles_x * tiles_y],
            clean_streak: 0,
        }
    }

    /// Drop all state, e.g. after a desktop resize. Every tile becomes
    /// dirty on the next pass.
    pub fn resize(&mut self, width: u16, height: u16) {
        *self = ChangeDetector::new(width, height);
    }

    /// Mark everything dirty without changing dimensions, forcing the next
    /// pass to report a full update.
    pub fn invalidate(&mut self) {
        self.hashes.fill(None);
        self.clean_streak = 0;
    }

    /// Two consecutive passes saw no change; incremental requests may be
    /// answered with an empty update.
    pub fn quiescent(&self) -> bool {
        self.clean_streak >= 2
    }

    /// Hash all tiles of `pixels` (BGRA, full framebuffer), update stored
    /// hashes, and report the changed regions.
    pub fn detect(&mut self, pixels: &[u8]) -> ChangeReport {
        debug_assert_eq!(
            pixels.len(),
            self.width as usize * self.height as usize * 4
        );
        let mut dirty = vec![false; self.tiles_x * self.tiles_y];
        let mut dirty_count = 0usize;

        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let hash = self.hash_tile(pixels, tx, ty);
                let idx = ty * self.tiles_x + tx;
                if self.hashes[idx] != Some(hash) {
                    dirty[idx] = true;
                    dirty_count += 1;
                    self.hashes[idx] = Some(hash);
                }
            }
        }

        if dirty_count == 0 {
            self.clean_streak = self.clean_streak.saturating_add(1);
        } else {
            self.clean_streak = 0;
        }

        let total = self.tiles_x * self.tiles_y;
        let regions = if dirty_count == 0 {
            Vec::new()
        } else if dirty_count * 100 > total * FULL_UPDATE_RATIO_PERCENT {
            vec![Region::new(0, 0, self.width, self.height)]
        } else {
            self.merge_dirty(&dirty)
        };

        ChangeReport {
            regions,
            dirty_tiles: dirty_count,
            total_tiles: total,
        }
    }

    fn hash_tile(&self, pixels: &[u8], tx: usize, ty: usize) -> [u8; 16] {
        let x0 = tx * TILE_SIZE as usize;
        let y0 = ty * TILE_SIZE as usize;
        let x1 = (x0 + TILE_SIZE as usize).min(self.width as usize);
        let y1 = (y0 + TILE_SIZE as usize).min(self.height as usize);
        let row_bytes = (x1 - x0) * 4;

        let mut hasher = Md5::new();
        for y in y0..y1 {
            let start = (y * self.width as usize + x0) * 4;
            hasher.update(&pixels[start..start + row_bytes]);
        }
        hasher.finalize().into()
    }

    /// Turn the dirty tile bitmap into bounding-box regions: connected
    /// components with 4-neighbour connectivity, then merge any boxes
    /// that overlap, then reduce to the rectangle cap by joining the
    /// closest pairs.
    fn merge_dirty(&self, dirty: &[bool]) -> Vec<Region> {
        let mut visited = vec![false; dirty.len()];
        let mut boxes: Vec<Region> = Vec::new();

        for start in 0..dirty.len() {
            if !dirty[start] || visited[start] {
                continue;
            }
            // Flood fill one component, tracking its tile bounding box.
            let mut stack = vec![start];
            visited[start] = true;
            let (mut min_tx, mut max_tx) = (start % self.tiles_x, start % self.tiles_x);
            let (mut min_ty, mut max_ty) = (start / self.tiles_x, start / self.tiles_x);
            while let Some(idx) = stack.pop() {
                let tx = idx % self.tiles_x;
                let ty = idx / self.tiles_x;
                min_tx = min_tx.min(tx);
                max_tx = max_tx.max(tx);
                min_ty = min_ty.min(ty);
                max_ty = max_ty.max(ty);
                let mut push = |n: usize| {
                    if dirty[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if tx > 0 {
                    push(idx - 1);
                }
                if tx + 1 < self.tiles_x {
                    push(idx + 1);
                }
                if ty > 0 {
                    push(idx - self.tiles_x);
                }
                if ty + 1 < self.tiles_y {
                    push(idx + self.tiles_x);
                }
            }
            boxes.push(self.tile_box_to_region(min_tx, min_ty, max_tx, max_ty));
        }

        // Bounding boxes of separate components can still overlap; fold
        // those together until the set is disjoint.
        let mut merged = true;
        while merged {
            merged = false;
            'outer: for i in 0..boxes.len() {
                for j in (i + 1)..boxes.len() {
                    if boxes[i].intersect(&boxes[j]).is_some() {
                        let union = boxes[i].union(&boxes[j]);
                        boxes.swap_remove(j);
                        boxes[i] = union;
                        merged = true;
                        break 'outer;
                    }
                }
            }
        }

        // Enforce the cap by joining the closest pair repeatedly.
        while boxes.len() > MAX_RECTANGLES {
            let mut best = (0, 1, u32::MAX);
            for i in 0..boxes.len() {
                for j in (i + 1)..boxes.len() {
                    let gap = boxes[i].gap(&boxes[j]);
                    if gap < best.2 {
                        best = (i, j, gap);
                    }
                }
            }
            let union = boxes[best.0].union(&boxes[best.1]);
            boxes.swap_remove(best.1);
            boxes[best.0] = union;
        }

        boxes
    }

    fn tile_box_to_region(
        &self,
        min_tx: usize,
        min_ty: usize,
        max_tx: usize,
        max_ty: usize,
    ) -> Region {
        let x = (min_tx * TILE_SIZE as usize) as u16;
        let y = (min_ty * TILE_SIZE as usize) as u16;
        let x_end = (((max_tx + 1) * TILE_SIZE as usize).min(self.width as usize)) as u16;
        let y_end = (((max_ty + 1) * TILE_SIZE as usize).min(self.height as usize)) as u16;
        Region::new(x, y, x_end - x, y_end - y)
    }
}
