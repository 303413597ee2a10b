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

//! RRE encoding (2) - rise-and-run-length (RFC 6143 Section 7.7.3).
//!
//! The rectangle becomes a background colour plus a list of axis-aligned,
//! non-overlapping subrectangles that together with the background cover
//! every pixel. The background is the most frequent pixel; subrectangles
//! are grown greedily, first along the row and then downwards.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::error::RfbError;
use crate::protocol::PixelFormat;
use crate::translate;

/// Encode one rectangle. Errors when the result cannot beat Raw, which
/// the dispatch layer turns into a Raw rectangle.
pub fn encode(
    pixels_bgra: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>, RfbError> {
    let data = translate::convert(pixels_bgra, format);
    let bpp = format.bytes_per_pixel();
    let w = width as usize;
    let h = height as usize;
    if data.len() != w * h * bpp {
        return Err(RfbError::Encoder("rre: pixel count mismatch".into()));
    }

    let pixel_at =
        |x: usize, y: usize| translate::get_pixel(&data[(y * w + x) * bpp..], format);

    // Most frequent pixel wins the background slot.
    let mut counts: HashMap<u32, u32> = HashMap::new();
    for y in 0..h {
        for x in 0..w {
            *counts.entry(pixel_at(x, y)).or_insert(0) += 1;
        }
    }
    let background = counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(value, _)| value)
        .unwrap_or(0);

    // Anything past this count makes RRE bigger than Raw; bail early.
    let raw_len = w * h * bpp;
    let max_subrects = raw_len.saturating_sub(4 + bpp) / (bpp + 8);

    let mut subrects: Vec<(u32, usize, usize, usize, usize)> = Vec::new();
    let mut covered = vec![false; w * h];

    for y in 0..h {
        for x in 0..w {
            if covered[y * w + x] {
                continue;
            }
            let value = pixel_at(x, y);
            if value == background {
                covered[y * w + x] = true;
                continue;
            }

            // Grow right, then down as long as full rows match.
            let mut rect_w = 1;
            while x + rect_w < w
                && !covered[y * w + x + rect_w]
                && pixel_at(x + rect_w, y) == value
            {
                rect_w += 1;
            }
            let mut rect_h = 1;
            'grow: while y + rect_h < h {
                for dx in 0..rect_w {
                    if covered[(y + rect_h) * w + x + dx]
                        || pixel_at(x + dx, y + rect_h) != value
                    {
                        break 'grow;
                    }
                }
                rect_h += 1;
            }

            for dy in 0..rect_h {
                for dx in 0..rect_w {
                    covered[(y + dy) * w + x + dx] = true;
                }
            }
            subrects.push((value, x, y, rect_w, rect_h));
            if subrects.len() > max_subrects {
                return Err(RfbError::Encoder("rre: more bytes than raw".into()));
            }
        }
    }

    let mut out = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 8));
    out.put_u32(subrects.len() as u32);
    let mut pixel_buf = Vec::with_capacity(bpp);
    translate::put_pixel(&mut pixel_buf, background, format);
    out.put_slice(&pixel_buf);
    for (value, x, y, rect_w, rect_h) in subrects {
        pixel_buf.clear();
        translate::put_pixel(&mut pixel_buf, value, format);
        out.put_slice(&pixel_buf);
        out.put_u16(x as u16);
        out.put_u16(y as u16);
        out.put_u16(rect_w as u16);
        out.put_u16(rect_h as u16);
    }
    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal reference decoder: background fill plus subrectangles,
    /// producing client-format pixel values.
    fn decode(encoded: &[u8], width: usize, height: usize, format: &PixelFormat) -> Vec<u32> {
        let bpp = format.bytes_per_pixel();
        let count = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        let mut offset = 4;
        let background = translate::get_pixel(&encoded[offset..], format);
        offset += bpp;
        let mut out = vec![background; width * height];
        for _ in 0..count {
            let value = translate::get_pixel(&encoded[offset..], format);
            offset += bpp;
            let x = u16::from_be_bytes(encoded[offset..offset + 2].try_into().unwrap()) as usize;
            let y =
                u16::from_be_bytes(encoded[offset + 2..offset + 4].try_into().unwrap()) as usize;
            let w =
                u16::from_be_bytes(encoded[offset + 4..offset + 6].try_into().unwrap()) as usize;
            let h =
                u16::from_be_bytes(encoded[offset + 6..offset + 8].try_into().unwrap()) as usize;
            offset += 8;
            for dy in 0..h {
                for dx in 0..w {
                    out[(y + dy) * width + (x + dx)] = value;
                }
            }
        }
        assert_eq!(offset, encoded.len());
        out
    }

    fn expected_values(pixels: &[u8], format: &PixelFormat) -> Vec<u32> {
        let data = translate::convert(pixels, format);
        let bpp = format.bytes_per_pixel();
        data.chunks_exact(bpp)
            .map(|chunk| translate::get_pixel(chunk, format))
            .collect()
    }

    fn bgra(b: u8, g: u8, r: u8) -> [u8; 4] {
        [b, g, r, 255]
    }

    #[test]
    fn solid_rectangle_has_no_subrects() {
        let pixels: Vec<u8> = std::iter::repeat(bgra(9, 9, 9)).take(64).flatten().collect();
        let format = PixelFormat::bgra32();
        let encoded = encode(&pixels, 8, 8, &format).unwrap();
        assert_eq!(u32::from_be_bytes(encoded[0..4].try_into().unwrap()), 0);
        assert_eq!(encoded.len(), 4 + 4);
        assert_eq!(decode(&encoded, 8, 8, &format), expected_values(&pixels, &format));
    }

    #[test]
    fn two_tone_round_trip() {
        // Background with one foreground block.
        let mut pixels = Vec::new();
        for y in 0..8 {
            for x in 0..8 {
                if (2..5).contains(&x) && (3..6).contains(&y) {
                    pixels.extend_from_slice(&bgra(0, 0, 255));
                } else {
                    pixels.extend_from_slice(&bgra(255, 255, 255));
                }
            }
        }
        let format = PixelFormat::bgra32();
        let encoded = encode(&pixels, 8, 8, &format).unwrap();
        // One merged subrectangle is enough for a solid block.
        assert_eq!(u32::from_be_bytes(encoded[0..4].try_into().unwrap()), 1);
        assert_eq!(decode(&encoded, 8, 8, &format), expected_values(&pixels, &format));
    }

    #[test]
    fn multi_colour_round_trip_rgb565() {
        let mut pixels = Vec::new();
        for y in 0u8..6 {
            for x in 0u8..6 {
                pixels.extend_from_slice(&bgra(x * 40, y * 40, 128));
            }
        }
        let format = PixelFormat::rgb565();
        match encode(&pixels, 6, 6, &format) {
            Ok(encoded) => {
                assert_eq!(decode(&encoded, 6, 6, &format), expected_values(&pixels, &format));
            }
            // Too busy for RRE is a legal answer; the dispatcher will
            // send Raw instead.
            Err(RfbError::Encoder(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn noise_is_rejected() {
        let mut pixels = vec![0u8; 16 * 16 * 4];
        for (i, byte) in pixels.iter_mut().enumerate() {
            *byte = (i.wrapping_mul(131) % 251) as u8;
        }
        assert!(encode(&pixels, 16, 16, &PixelFormat::bgra32()).is_err());
    }
}
