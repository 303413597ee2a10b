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

//! Per-connection framebuffer snapshots.
//!
//! Each session keeps the last frame it captured plus the one before it.
//! The previous frame exists for exactly two jobs: the change detector's
//! baseline and the CopyRect source search. The search only ever reports
//! a source whose previous-frame bytes equal the current rectangle
//! byte-for-byte, so a CopyRect emitted from it is always safe.

use crate::source::CapturedFrame;

/// An axis-aligned framebuffer region. Width and height are at least 1
/// for every region the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Left edge.
    pub x: u16,
    /// Top edge.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Region {
    /// Region from its corner and dimensions.
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Pixel count.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn right(&self) -> u32 {
        u32::from(self.x) + u32::from(self.width)
    }

    fn bottom(&self) -> u32 {
        u32::from(self.y) + u32::from(self.height)
    }

    /// Overlapping part of two regions, if any.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if u32::from(x1) < x2 && u32::from(y1) < y2 {
            Some(Region::new(
                x1,
                y1,
                (x2 - u32::from(x1)) as u16,
                (y2 - u32::from(y1)) as u16,
            ))
        } else {
            None
        }
    }

    /// Bounding box of two regions.
    pub fn union(&self, other: &Region) -> Region {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Region::new(x1, y1, (x2 - u32::from(x1)) as u16, (y2 - u32::from(y1)) as u16)
    }

    /// Chebyshev gap between two regions; zero when they touch or overlap.
    pub fn gap(&self, other: &Region) -> u32 {
        let dx = if self.right() <= u32::from(other.x) {
            u32::from(other.x) - self.right()
        } else if other.right() <= u32::from(self.x) {
            u32::from(self.x) - other.right()
        } else {
            0
        };
        let dy = if self.bottom() <= u32::from(other.y) {
            u32::from(other.y) - self.bottom()
        } else if other.bottom() <= u32::from(self.y) {
            u32::from(self.y) - other.bottom()
        } else {
            0
        };
        dx.max(dy)
    }

    /// Clamp this region to a framebuffer. Returns None if it lies fully
    /// outside or is degenerate.
    pub fn clamp_to(&self, fb_width: u16, fb_height: u16) -> Option<Region> {
        self.intersect(&Region::new(0, 0, fb_width, fb_height))
    }
}

/// The last-sent pixel snapshot plus the previous one.
///
/// Pixels are BGRA, 4 bytes per pixel, owned exclusively by the session.
pub struct FrameBuffer {
    current: Vec<u8>,
    previous: Vec<u8>,
    width: u16,
    height: u16,
    /// A frame has been installed since creation or the last resize.
    installed: bool,
    /// The previous buffer holds a real earlier frame, not the zero
    /// fill from construction. Only then may CopyRect sources refer to
    /// it: the client has actually seen that content.
    has_previous: bool,
}

/// Offsets tried by the CopyRect source search, most common scroll
/// distances first. Both signs of each offset are probed.
const SCROLL_LADDER: [i32; 8] = [1, 2, 3, 5, 8, 13, 21, 32];

impl FrameBuffer {
    pub fn new(width: u16, height: u16) -> Self {
        let len = width as usize * height as usize * 4;
        Self {
            current: vec![0; len],
            previous: vec![0; len],
            width,
            height,
            installed: false,
            has_previous: false,
        }
    }

    /// Current framebuffer width.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Current framebuffer height.
    pub fn height(&self) -> u16 {
        self.height
    }

    /// The current snapshot as tightly packed BGRA bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.current
    }

    /// Install a freshly captured frame, rotating the current one into the
    /// previous slot. Returns true if the dimensions changed (the caller
    /// must then emit a desktop-size update and reset its detector).
    pub fn install(&mut self, frame: &CapturedFrame) -> bool {
        let resized = frame.width != self.width || frame.height != self.height;
        if resized {
            self.width = frame.width;
            self.height = frame.height;
            self.current = frame.pixels.clone();
            self.previous = Vec::new();
            self.has_previous = false;
        } else {
            std::mem::swap(&mut self.current, &mut self.previous);
            self.current.clear();
            self.current.extend_from_slice(&frame.pixels);
            self.has_previous = self.installed;
        }
        self.installed = true;
        resized
    }

    /// Copy out one rectangle of the current frame as tightly packed BGRA.
    /// The region must already be clamped to the framebuffer.
    pub fn extract(&self, region: &Region) -> Vec<u8> {
        let fw = self.width as usize;
        let mut out = Vec::with_capacity(region.width as usize * region.height as usize * 4);
        for row in region.y..region.y + region.height {
            let start = (row as usize * fw + region.x as usize) * 4;
            out.extend_from_slice(&self.current[start..start + region.width as usize * 4]);
        }
        out
    }

    /// Whether ~95% of the rectangle is a single colour. Samples rows to
    /// stay cheap on large rectangles.
    pub fn is_mostly_solid(&self, region: &Region) -> bool {
        let fw = self.width as usize;
        let first = {
            let off = (region.y as usize * fw + region.x as usize) * 4;
            [
                self.current[off],
                self.current[off + 1],
                self.current[off + 2],
            ]
        };
        let mut total = 0u32;
        let mut matching = 0u32;
        let row_step = (region.height / 16).max(1);
        let col_step = (region.width / 16).max(1);
        let mut row = region.y;
        while row < region.y + region.height {
            let mut col = region.x;
            while col < region.x + region.width {
                let off = (row as usize * fw + col as usize) * 4;
                total += 1;
                if self.current[off] == first[0]
                    && self.current[off + 1] == first[1]
                    && self.current[off + 2] == first[2]
                {
                    matching += 1;
                }
                col += col_step;
            }
            row += row_step;
        }
        matching * 100 >= total * 95
    }

    /// Search the previous frame for a source whose content equals this
    /// rectangle of the current frame.
    ///
    /// The search is a bounded ladder of pure translations (vertical then
    /// horizontal), which covers scrolling and window drags. A hit is only
    /// reported after a full byte-for-byte comparison, so the caller can
    /// emit CopyRect without further checks.
    pub fn find_copy_source(&self, region: &Region) -> Option<(u16, u16)> {
        if !self.has_previous || self.previous.len() != self.current.len() {
            return None;
        }
        for offset in SCROLL_LADDER {
            for sign in [1, -1] {
                let dy = offset * sign;
                let src_y = i32::from(region.y) + dy;
                if src_y < 0 || src_y + i32::from(region.height) > i32::from(self.height) {
                    continue;
                }
                if self.region_matches_previous(region, region.x, src_y as u16) {
                    return Some((region.x, src_y as u16));
                }
            }
        }
        for offset in SCROLL_LADDER {
            for sign in [1, -1] {
                let dx = offset * sign;
                let src_x = i32::from(region.x) + dx;
                if src_x < 0 || src_x + i32::from(region.width) > i32::from(self.width) {
                    continue;
                }
                if self.region_matches_previous(region, src_x as u16, region.y) {
                    return Some((src_x as u16, region.y));
                }
            }
        }
        None
    }

    /// Byte-for-byte comparison of the current rectangle against the
    /// previous frame at (src_x, src_y).
    fn region_matches_previous(&self, region: &Region, src_x: u16, src_y: u16) -> bool {
        let fw = self.width as usize;
        let row_bytes = region.width as usize * 4;
        for row in 0..region.height as usize {
            let cur = ((region.y as usize + row) * fw + region.x as usize) * 4;
            let prev = ((src_y as usize + row) * fw + src_x as usize) * 4;
            if self.current[cur..cur + row_bytes] != self.previous[prev..prev + row_bytes] {
                return false;
            }
        }
        true
    }
}
