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

//! Per-rectangle encoder selection.
//!
//! Selection weighs the client's advertised encodings (a preference
//! list, in the order the client sent it), a cheap content hint, the
//! rectangle's share of the framebuffer, and the network profile.
//! First matching rule wins:
//!
//! 1. scrolling with a verified source region -> CopyRect
//! 2. solid -> RRE
//! 3. WAN -> ZRLE, else Hextile
//! 4. LAN -> Raw for small rectangles, Zlib for large ones once warmed
//!    up, JPEG for large dynamic ones, ZRLE otherwise
//! 5. localhost -> Raw
//! 6. fallback chain Hextile -> RRE -> Raw
//!
//! Raw is always eligible: RFC 6143 requires every client to accept it
//! whether or not it was listed.

use crate::config::{NetworkProfile, ServerConfig};
use crate::encoding::Encoder;
use crate::protocol::{
    ENCODING_COPYRECT, ENCODING_HEXTILE, ENCODING_RRE, ENCODING_TIGHT, ENCODING_ZLIB,
    ENCODING_ZRLE,
};

/// What the scheduler should do with one rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Emit a CopyRect referencing this source position.
    CopyRect { src_x: u16, src_y: u16 },
    /// Encode the pixels with this encoder.
    Encode(Encoder),
}

/// Coarse classification of a rectangle's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHint {
    /// Unchanged for a while or first appearance.
    Static,
    /// Changed in consecutive frames.
    Dynamic,
    /// Translated content from the previous frame.
    Scrolling,
    /// At least 95% one colour.
    Solid,
}

/// Inputs the scheduler gathers for one rectangle.
#[derive(Debug, Clone, Copy)]
pub struct RectProfile {
    /// Content classification.
    pub hint: ContentHint,
    /// Rectangle area divided by framebuffer area, in [0, 1].
    pub area_ratio: f64,
    /// Rectangle area in pixels.
    pub pixel_count: u64,
    /// Verified CopyRect source, when the scroll search hit.
    pub copy_source: Option<(u16, u16)>,
}

/// Encoder picker bound to one connection's configuration and profile.
pub struct EncoderSelector {
    profile: NetworkProfile,
    tight_available: bool,
    jpeg_available: bool,
    lan_raw_area_threshold: f64,
    lan_raw_max_pixels: u64,
    lan_prefer_zlib: bool,
    lan_zlib_area_threshold: f64,
    lan_zlib_min_pixels: u64,
    lan_jpeg_area_threshold: f64,
    lan_jpeg_min_pixels: u64,
}

impl EncoderSelector {
    pub fn new(config: &ServerConfig, profile: NetworkProfile) -> Self {
        let tight_available =
            config.enable_tight_encoding && !config.tight_disable_for_ultravnc;
        Self {
            profile,
            tight_available,
            jpeg_available: tight_available
                && config.enable_jpeg_encoding
                && cfg!(feature = "turbojpeg"),
            lan_raw_area_threshold: config.lan_raw_area_threshold,
            lan_raw_max_pixels: u64::from(config.lan_raw_max_pixels),
            lan_prefer_zlib: config.lan_prefer_zlib,
            lan_zlib_area_threshold: config.lan_zlib_area_threshold,
            lan_zlib_min_pixels: u64::from(config.lan_zlib_min_pixels),
            lan_jpeg_area_threshold: config.lan_jpeg_area_threshold,
            lan_jpeg_min_pixels: u64::from(config.lan_jpeg_min_pixels),
        }
    }

    /// Pick the handling for one rectangle. `client_encodings` is the
    /// verbatim signed list from SetEncodings; `zlib_warmed_up` reports
    /// whether the connection is past its Zlib warm-up request count.
    pub fn select(
        &self,
        rect: &RectProfile,
        client_encodings: &[i32],
        zlib_warmed_up: bool,
    ) -> Selection {
        let supports = |id: i32| client_encodings.contains(&id);

        if rect.hint == ContentHint::Scrolling && supports(ENCODING_COPYRECT) {
            if let Some((src_x, src_y)) = rect.copy_source {
                return Selection::CopyRect { src_x, src_y };
            }
        }

        if rect.hint == ContentHint::Solid && supports(ENCODING_RRE) {
            return Selection::Encode(Encoder::Rre);
        }

        match self.profile {
            NetworkProfile::Wan => {
                if supports(ENCODING_ZRLE) {
                    return Selection::Encode(Encoder::Zrle);
                }
                if supports(ENCODING_HEXTILE) {
                    return Selection::Encode(Encoder::Hextile);
                }
            }
            NetworkProfile::Lan => {
                if rect.area_ratio < self.lan_raw_area_threshold
                    && rect.pixel_count < self.lan_raw_max_pixels
                {
                    return Selection::Encode(Encoder::Raw);
                }
                if self.lan_prefer_zlib
                    && rect.area_ratio >= self.lan_zlib_area_threshold
                    && rect.pixel_count >= self.lan_zlib_min_pixels
                    && zlib_warmed_up
                    && supports(ENCODING_ZLIB)
                {
                    return Selection::Encode(Encoder::Zlib);
                }
                if self.jpeg_available
                    && rect.hint == ContentHint::Dynamic
                    && rect.area_ratio >= self.lan_jpeg_area_threshold
                    && rect.pixel_count >= self.lan_jpeg_min_pixels
                    && supports(ENCODING_TIGHT)
                {
                    return Selection::Encode(Encoder::Tight);
                }
                if supports(ENCODING_ZRLE) {
                    return Selection::Encode(Encoder::Zrle);
                }
            }
            NetworkProfile::Localhost => {
                return Selection::Encode(Encoder::Raw);
            }
        }

        if self.tight_available && supports(ENCODING_TIGHT) {
            return Selection::Encode(Encoder::Tight);
        }
        if supports(ENCODING_HEXTILE) {
            return Selection::Encode(Encoder::Hextile);
        }
        if supports(ENCODING_RRE) {
            return Selection::Encode(Encoder::Rre);
        }
        Selection::Encode(Encoder::Raw)
    }
}
