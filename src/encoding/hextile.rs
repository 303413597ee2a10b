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

//! Hextile encoding (5) - 16x16 tiles (RFC 6143 Section 7.7.4).
//!
//! Tiles are walked in raster order, right and bottom edge tiles
//! clipped. Every tile opens with a subencoding byte; background and
//! foreground pixels carry over from tile to tile and are re-sent only
//! when they change. A raw tile invalidates both carried colours.

use bytes::{BufMut, BytesMut};

use crate::error::RfbError;
use crate::protocol::{
    PixelFormat, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED,
    HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};
use crate::translate;

const TILE: usize = 16;

/// Encode one rectangle as Hextile tiles.
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
        return Err(RfbError::Encoder("hextile: pixel count mismatch".into()));
    }

    let mut out = BytesMut::new();
    let mut carried_bg: Option<u32> = None;
    let mut carried_fg: Option<u32> = None;

    for tile_y in (0..h).step_by(TILE) {
        let tile_h = TILE.min(h - tile_y);
        for tile_x in (0..w).step_by(TILE) {
            let tile_w = TILE.min(w - tile_x);

            // Tile pixel values in raster order.
            let mut tile = Vec::with_capacity(tile_w * tile_h);
            for y in 0..tile_h {
                for x in 0..tile_w {
                    let off = ((tile_y + y) * w + tile_x + x) * bpp;
                    tile.push(translate::get_pixel(&data[off..], format));
                }
            }

            let encoded = encode_tile(
                &tile,
                tile_w,
                tile_h,
                bpp,
                format,
                &mut carried_bg,
                &mut carried_fg,
            );
            match encoded {
                Some(body) => out.put_slice(&body),
                None => {
                    // Raw tile: subencoding byte then verbatim pixels.
                    out.put_u8(HEXTILE_RAW);
                    let mut buf = Vec::with_capacity(tile.len() * bpp);
                    for &value in &tile {
                        translate::put_pixel(&mut buf, value, format);
                    }
                    out.put_slice(&buf);
                    carried_bg = None;
                    carried_fg = None;
                }
            }
        }
    }
    Ok(out.to_vec())
}

/// Encode one tile in the compact forms, or None when raw is the better
/// (or only) choice.
fn encode_tile(
    tile: &[u32],
    tile_w: usize,
    tile_h: usize,
    bpp: usize,
    format: &PixelFormat,
    carried_bg: &mut Option<u32>,
    carried_fg: &mut Option<u32>,
) -> Option<Vec<u8>> {
    let raw_size = 1 + tile.len() * bpp;

    // Count distinct colours; beyond a handful the compact forms lose.
    let mut colours: Vec<(u32, usize)> = Vec::new();
    for &value in tile {
        if let Some(entry) = colours.iter_mut().find(|(v, _)| *v == value) {
            entry.1 += 1;
            continue;
        }
        if colours.len() == 16 {
            return None;
        }
        colours.push((value, 1));
    }
    colours.sort_by(|a, b| b.1.cmp(&a.1));
    let background = colours[0].0;

    let mut body = Vec::new();
    let mut subencoding = 0u8;

    if *carried_bg != Some(background) {
        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
        translate::put_pixel(&mut body, background, format);
        *carried_bg = Some(background);
    }

    if colours.len() == 1 {
        let mut out = vec![subencoding];
        out.extend_from_slice(&body);
        return Some(out);
    }

    let subrects = find_subrects(tile, tile_w, tile_h, background);
    if subrects.len() > 255 {
        return None;
    }

    let size;
    if colours.len() == 2 {
        // Single foreground: subrects carry no colour.
        let foreground = colours[1].0;
        if *carried_fg != Some(foreground) {
            subencoding |= HEXTILE_FOREGROUND_SPECIFIED;
            translate::put_pixel(&mut body, foreground, format);
            *carried_fg = Some(foreground);
        }
        subencoding |= HEXTILE_ANY_SUBRECTS;
        body.push(subrects.len() as u8);
        for &(_, x, y, sw, sh) in &subrects {
            body.push(((x as u8) << 4) | y as u8);
            body.push((((sw - 1) as u8) << 4) | (sh - 1) as u8);
        }
        size = 1 + body.len();
    } else {
        // Multi-colour: every subrect brings its own pixel. The carried
        // foreground no longer matches what the client will track.
        subencoding |= HEXTILE_ANY_SUBRECTS | HEXTILE_SUBRECTS_COLOURED;
        *carried_fg = None;
        body.push(subrects.len() as u8);
        for &(value, x, y, sw, sh) in &subrects {
            translate::put_pixel(&mut body, value, format);
            body.push(((x as u8) << 4) | y as u8);
            body.push((((sw - 1) as u8) << 4) | (sh - 1) as u8);
        }
        size = 1 + body.len();
    }

    if size >= raw_size {
        return None;
    }

    let mut out = vec![subencoding];
    out.extend_from_slice(&body);
    Some(out)
}

/// Greedy non-background subrectangle cover within a tile, identical
/// growth strategy to the RRE encoder but bounded to 16x16.
fn find_subrects(
    tile: &[u32],
    tile_w: usize,
    tile_h: usize,
    background: u32,
) -> Vec<(u32, usize, usize, usize, usize)> {
    let mut covered = vec![false; tile.len()];
    let mut subrects = Vec::new();

    for y in 0..tile_h {
        for x in 0..tile_w {
            if covered[y * tile_w + x] {
                continue;
            }
            let value = tile[y * tile_w + x];
            if value == background {
                covered[y * tile_w + x] = true;
                continue;
            }
            let mut sw = 1;
            while x + sw < tile_w
                && !covered[y * tile_w + x + sw]
                && tile[y * tile_w + x + sw] == value
            {
                sw += 1;
            }
            let mut sh = 1;
            'grow: while y + sh < tile_h {
                for dx in 0..sw {
                    if covered[(y + sh) * tile_w + x + dx]
                        || tile[(y + sh) * tile_w + x + dx] != value
                    {
                        break 'grow;
                    }
                }
                sh += 1;
            }
            for dy in 0..sh {
                for dx in 0..sw {
                    covered[(y + dy) * tile_w + x + dx] = true;
                }
            }
            subrects.push((value, x, y, sw, sh));
        }
    }
    subrects
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference decoder with bg/fg inheritance, mirroring a client.
    fn decode(
        encoded: &[u8],
        width: usize,
        height: usize,
        format: &PixelFormat,
    ) -> Vec<u32> {
        let bpp = format.bytes_per_pixel();
        let mut out = vec![0u32; width * height];
        let mut offset = 0usize;
        let mut bg = 0u32;
        let mut fg = 0u32;

        for tile_y in (0..height).step_by(TILE) {
            let tile_h = TILE.min(height - tile_y);
            for tile_x in (0..width).step_by(TILE) {
                let tile_w = TILE.min(width - tile_x);
                let sub = encoded[offset];
                offset += 1;

                if sub & HEXTILE_RAW != 0 {
                    for y in 0..tile_h {
                        for x in 0..tile_w {
                            out[(tile_y + y) * width + tile_x + x] =
                                translate::get_pixel(&encoded[offset..], format);
                            offset += bpp;
                        }
                    }
                    continue;
                }
                if sub & HEXTILE_BACKGROUND_SPECIFIED != 0 {
                    bg = translate::get_pixel(&encoded[offset..], format);
                    offset += bpp;
                }
                if sub & HEXTILE_FOREGROUND_SPECIFIED != 0 {
                    fg = translate::get_pixel(&encoded[offset..], format);
                    offset += bpp;
                }
                for y in 0..tile_h {
                    for x in 0..tile_w {
                        out[(tile_y + y) * width + tile_x + x] = bg;
                    }
                }
                if sub & HEXTILE_ANY_SUBRECTS != 0 {
                    let count = encoded[offset] as usize;
                    offset += 1;
                    for _ in 0..count {
                        let value = if sub & HEXTILE_SUBRECTS_COLOURED != 0 {
                            let v = translate::get_pixel(&encoded[offset..], format);
                            offset += bpp;
                            v
                        } else {
                            fg
                        };
                        let xy = encoded[offset];
                        let wh = encoded[offset + 1];
                        offset += 2;
                        let (x, y) = ((xy >> 4) as usize, (xy & 0x0F) as usize);
                        let (w, h) = ((wh >> 4) as usize + 1, (wh & 0x0F) as usize + 1);
                        for dy in 0..h {
                            for dx in 0..w {
                                out[(tile_y + y + dy) * width + tile_x + x + dx] = value;
                            }
                        }
                    }
                }
            }
        }
        assert_eq!(offset, encoded.len());
        out
    }

    fn values_of(pixels: &[u8], format: &PixelFormat) -> Vec<u32> {
        translate::convert(pixels, format)
            .chunks_exact(format.bytes_per_pixel())
            .map(|chunk| translate::get_pixel(chunk, format))
            .collect()
    }

    fn round_trip(pixels: &[u8], w: usize, h: usize, format: &PixelFormat) {
        let encoded = encode(pixels, w as u16, h as u16, format).unwrap();
        assert_eq!(decode(&encoded, w, h, format), values_of(pixels, format));
    }

    #[test]
    fn solid_rect_uses_background_only() {
        let pixels: Vec<u8> = (0..32 * 32).flat_map(|_| [40u8, 50, 60, 255]).collect();
        let format = PixelFormat::bgra32();
        let encoded = encode(&pixels, 32, 32, &format).unwrap();
        // First tile: bg specified (1 + 4 bytes); remaining three tiles
        // inherit it (1 byte each).
        assert_eq!(encoded.len(), 5 + 3);
        round_trip(&pixels, 32, 32, &format);
    }

    #[test]
    fn two_colour_round_trip() {
        let mut pixels = Vec::new();
        for y in 0..20 {
            for x in 0..24 {
                if (x + y) % 7 == 0 {
                    pixels.extend_from_slice(&[0u8, 0, 0, 255]);
                } else {
                    pixels.extend_from_slice(&[255u8, 255, 255, 255]);
                }
            }
        }
        round_trip(&pixels, 24, 20, &PixelFormat::bgra32());
    }

    #[test]
    fn multi_colour_round_trip() {
        let mut pixels = Vec::new();
        for _y in 0..16 {
            for x in 0u8..16 {
                let band = (x / 4) * 60;
                pixels.extend_from_slice(&[band, 30, 100, 255]);
            }
        }
        let format = PixelFormat::bgra32();
        let encoded = encode(&pixels, 16, 16, &format).unwrap();
        // Four colours force the coloured-subrect form, not raw.
        assert_eq!(encoded[0] & HEXTILE_RAW, 0);
        assert_eq!(
            encoded[0] & HEXTILE_SUBRECTS_COLOURED,
            HEXTILE_SUBRECTS_COLOURED
        );
        round_trip(&pixels, 16, 16, &format);
    }

    #[test]
    fn noisy_tiles_fall_back_to_raw_and_round_trip() {
        let mut pixels = vec![0u8; 16 * 16 * 4];
        for (i, byte) in pixels.iter_mut().enumerate() {
            *byte = (i.wrapping_mul(109) % 256) as u8;
        }
        let format = PixelFormat::bgra32();
        let encoded = encode(&pixels, 16, 16, &format).unwrap();
        assert_eq!(encoded[0] & HEXTILE_RAW, HEXTILE_RAW);
        round_trip(&pixels, 16, 16, &format);
    }

    #[test]
    fn clipped_edge_tiles_round_trip() {
        // 40x18 leaves 8-wide and 2-tall edge tiles.
        let mut pixels = Vec::new();
        for y in 0..18u8 {
            for x in 0..40u8 {
                let value = if x < 20 { 10 } else { 200 };
                pixels.extend_from_slice(&[value, value, y, 255]);
            }
        }
        round_trip(&pixels, 40, 18, &PixelFormat::bgra32());
    }

    #[test]
    fn rgb565_round_trip() {
        let mut pixels = Vec::new();
        for y in 0..16u8 {
            for x in 0..16u8 {
                let on = (x < 8) ^ (y < 8);
                pixels.extend_from_slice(if on {
                    &[0u8, 128, 255, 255]
                } else {
                    &[255u8, 128, 0, 255]
                });
            }
        }
        round_trip(&pixels, 16, 16, &PixelFormat::rgb565());
    }
}
