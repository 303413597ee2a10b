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

//! ZRLE encoding (16) - zlib-compressed RLE over 64x64 tiles
//! (RFC 6143 Section 7.7.5).
//!
//! Each tile opens with a subencoding byte: bit 7 is the RLE flag, bits
//! 0-6 the palette size. The forms this encoder emits:
//!
//! - `0` raw CPIXELs
//! - `1` solid tile (one CPIXEL)
//! - `2..=16` packed palette, indices bit-packed MSB-first with each row
//!   padded to a byte boundary
//! - `128` plain RLE of (CPIXEL, length) runs
//! - `130..=255` palette RLE (palette size = subencoding - 128)
//!
//! Run lengths encode `length - 1` as zero or more 255 bytes plus a
//! final byte below 255. The concatenated tile bodies of a rectangle are
//! deflated through the connection's persistent ZRLE stream and framed
//! as `u32 compressed_length` + bytes.
//!
//! A CPIXEL is 3 bytes instead of 4 when the format is 32bpp with depth
//! at most 24 and all channels fit in either the least or the most
//! significant 3 bytes of the pixel.

use bytes::{BufMut, BytesMut};

use crate::encoding::streams::ZlibStream;
use crate::error::RfbError;
use crate::protocol::PixelFormat;
use crate::translate;

const TILE: usize = 64;
const MAX_PALETTE: usize = 127;

/// How a pixel value is squeezed into a CPIXEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CPixelMode {
    /// Full pixel width; no compression applies.
    Full,
    /// Channels occupy the least significant 3 bytes.
    Low3,
    /// Channels occupy the most significant 3 bytes.
    High3,
}

fn cpixel_mode(format: &PixelFormat) -> CPixelMode {
    if format.bits_per_pixel != 32 || format.depth > 24 {
        return CPixelMode::Full;
    }
    let mask = (u32::from(format.red_max) << format.red_shift)
        | (u32::from(format.green_max) << format.green_shift)
        | (u32::from(format.blue_max) << format.blue_shift);
    if mask & 0xFF00_0000 == 0 {
        CPixelMode::Low3
    } else if mask & 0x0000_00FF == 0 {
        CPixelMode::High3
    } else {
        CPixelMode::Full
    }
}

fn cpixel_len(mode: CPixelMode, format: &PixelFormat) -> usize {
    match mode {
        CPixelMode::Full => format.bytes_per_pixel(),
        _ => 3,
    }
}

fn put_cpixel(out: &mut Vec<u8>, value: u32, mode: CPixelMode, format: &PixelFormat) {
    match (mode, format.big_endian) {
        (CPixelMode::Full, _) => translate::put_pixel(out, value, format),
        (CPixelMode::Low3, false) => out.extend_from_slice(&value.to_le_bytes()[0..3]),
        (CPixelMode::Low3, true) => out.extend_from_slice(&value.to_be_bytes()[1..4]),
        (CPixelMode::High3, false) => out.extend_from_slice(&value.to_le_bytes()[1..4]),
        (CPixelMode::High3, true) => out.extend_from_slice(&value.to_be_bytes()[0..3]),
    }
}

/// `length - 1` as repeated 255 bytes and a final byte below 255.
fn put_run_length(out: &mut Vec<u8>, run: usize) {
    let mut v = run - 1;
    while v >= 255 {
        out.push(255);
        v -= 255;
    }
    out.push(v as u8);
}

fn run_length_bytes(run: usize) -> usize {
    (run - 1) / 255 + 1
}

/// Encode one rectangle through the connection's persistent ZRLE stream.
pub fn encode(
    pixels_bgra: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
    stream: &mut ZlibStream,
) -> Result<Vec<u8>, RfbError> {
    let data = translate::convert(pixels_bgra, format);
    let bpp = format.bytes_per_pixel();
    let w = width as usize;
    let h = height as usize;
    if data.len() != w * h * bpp {
        return Err(RfbError::Encoder("zrle: pixel count mismatch".into()));
    }
    let mode = cpixel_mode(format);

    let mut body = Vec::new();
    for tile_y in (0..h).step_by(TILE) {
        let tile_h = TILE.min(h - tile_y);
        for tile_x in (0..w).step_by(TILE) {
            let tile_w = TILE.min(w - tile_x);
            let mut tile = Vec::with_capacity(tile_w * tile_h);
            for y in 0..tile_h {
                for x in 0..tile_w {
                    let off = ((tile_y + y) * w + tile_x + x) * bpp;
                    tile.push(translate::get_pixel(&data[off..], format));
                }
            }
            encode_tile(&mut body, &tile, tile_w, tile_h, mode, format);
        }
    }

    let compressed = stream.compress(&body)?;
    let mut out = BytesMut::with_capacity(4 + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.put_slice(&compressed);
    Ok(out.to_vec())
}

/// Pick the smallest of the tile forms and append subencoding + body.
fn encode_tile(
    out: &mut Vec<u8>,
    tile: &[u32],
    tile_w: usize,
    tile_h: usize,
    mode: CPixelMode,
    format: &PixelFormat,
) {
    let cp = cpixel_len(mode, format);
    let area = tile.len();

    // Palette in first-seen order; abandoned past the ZRLE limit.
    let mut palette: Vec<u32> = Vec::new();
    for &value in tile {
        if !palette.contains(&value) {
            palette.push(value);
            if palette.len() > MAX_PALETTE {
                break;
            }
        }
    }

    if palette.len() == 1 {
        out.push(1);
        put_cpixel(out, tile[0], mode, format);
        return;
    }

    // Raster-order runs, shared by both RLE forms.
    let mut runs: Vec<(u32, usize)> = Vec::new();
    for &value in tile {
        if let Some(last) = runs.last_mut() {
            if last.0 == value {
                last.1 += 1;
                continue;
            }
        }
        runs.push((value, 1));
    }

    let palette_usable = palette.len() <= MAX_PALETTE;
    let raw_size = area * cp;
    let plain_rle_size: usize = runs
        .iter()
        .map(|&(_, len)| cp + run_length_bytes(len))
        .sum();
    let packed_size = if palette_usable && palette.len() <= 16 {
        let bits = packed_bits(palette.len());
        Some(palette.len() * cp + tile_h * (tile_w * bits).div_ceil(8))
    } else {
        None
    };
    let palette_rle_size = if palette_usable {
        Some(
            palette.len() * cp
                + runs
                    .iter()
                    .map(|&(_, len)| if len == 1 { 1 } else { 1 + run_length_bytes(len) })
                    .sum::<usize>(),
        )
    } else {
        None
    };

    let mut best = (raw_size, 0u8);
    if let Some(size) = packed_size {
        if size < best.0 {
            best = (size, 1);
        }
    }
    if plain_rle_size < best.0 {
        best = (plain_rle_size, 2);
    }
    if let Some(size) = palette_rle_size {
        if size < best.0 {
            best = (size, 3);
        }
    }

    match best.1 {
        1 => {
            // Packed palette.
            out.push(palette.len() as u8);
            for &value in &palette {
                put_cpixel(out, value, mode, format);
            }
            let bits = packed_bits(palette.len());
            for row in tile.chunks(tile_w) {
                let mut acc = 0u8;
                let mut nbits = 0u8;
                for &value in row {
                    let index = palette.iter().position(|&p| p == value).unwrap() as u8;
                    acc = (acc << bits) | index;
                    nbits += bits as u8;
                    if nbits == 8 {
                        out.push(acc);
                        acc = 0;
                        nbits = 0;
                    }
                }
                if nbits > 0 {
                    out.push(acc << (8 - nbits));
                }
            }
        }
        2 => {
            // Plain RLE.
            out.push(128);
            for &(value, len) in &runs {
                put_cpixel(out, value, mode, format);
                put_run_length(out, len);
            }
        }
        3 => {
            // Palette RLE.
            out.push(128 + palette.len() as u8);
            for &value in &palette {
                put_cpixel(out, value, mode, format);
            }
            for &(value, len) in &runs {
                let index = palette.iter().position(|&p| p == value).unwrap() as u8;
                if len == 1 {
                    out.push(index);
                } else {
                    out.push(index | 0x80);
                    put_run_length(out, len);
                }
            }
        }
        _ => {
            // Raw CPIXELs.
            out.push(0);
            for &value in tile {
                put_cpixel(out, value, mode, format);
            }
        }
    }
}

fn packed_bits(palette_len: usize) -> usize {
    match palette_len {
        0..=2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    struct Cursor<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn u8(&mut self) -> u8 {
            let b = self.data[self.pos];
            self.pos += 1;
            b
        }

        fn take(&mut self, n: usize) -> &'a [u8] {
            let s = &self.data[self.pos..self.pos + n];
            self.pos += n;
            s
        }
    }

    fn get_cpixel(cursor: &mut Cursor<'_>, mode: CPixelMode, format: &PixelFormat) -> u32 {
        match (mode, format.big_endian) {
            (CPixelMode::Full, _) => {
                let bytes = cursor.take(format.bytes_per_pixel());
                translate::get_pixel(bytes, format)
            }
            (CPixelMode::Low3, false) => {
                let b = cursor.take(3);
                u32::from_le_bytes([b[0], b[1], b[2], 0])
            }
            (CPixelMode::Low3, true) => {
                let b = cursor.take(3);
                u32::from_be_bytes([0, b[0], b[1], b[2]])
            }
            (CPixelMode::High3, false) => {
                let b = cursor.take(3);
                u32::from_le_bytes([0, b[0], b[1], b[2]])
            }
            (CPixelMode::High3, true) => {
                let b = cursor.take(3);
                u32::from_be_bytes([b[0], b[1], b[2], 0])
            }
        }
    }

    fn read_run_length(cursor: &mut Cursor<'_>) -> usize {
        let mut len = 1usize;
        loop {
            let b = cursor.u8();
            len += b as usize;
            if b < 255 {
                return len;
            }
        }
    }

    /// Reference decoder for the encoder's output: inflate through a
    /// persistent inflater, then walk the 64x64 tiles.
    struct RefDecoder {
        inflater: Decompress,
    }

    impl RefDecoder {
        fn new() -> Self {
            Self {
                inflater: Decompress::new(true),
            }
        }

        fn decode(
            &mut self,
            encoded: &[u8],
            width: usize,
            height: usize,
            format: &PixelFormat,
        ) -> Vec<u32> {
            let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
            assert_eq!(encoded.len(), 4 + len);
            let body = self.inflate(&encoded[4..]);
            let mode = cpixel_mode(format);

            let mut out = vec![0u32; width * height];
            let mut cursor = Cursor {
                data: &body,
                pos: 0,
            };
            for tile_y in (0..height).step_by(TILE) {
                let tile_h = TILE.min(height - tile_y);
                for tile_x in (0..width).step_by(TILE) {
                    let tile_w = TILE.min(width - tile_x);
                    let tile = decode_tile(&mut cursor, tile_w, tile_h, mode, format);
                    for y in 0..tile_h {
                        for x in 0..tile_w {
                            out[(tile_y + y) * width + tile_x + x] = tile[y * tile_w + x];
                        }
                    }
                }
            }
            assert_eq!(cursor.pos, body.len(), "trailing tile bytes");
            out
        }

        fn inflate(&mut self, input: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            let mut chunk = vec![0u8; 256 * 1024];
            let mut consumed = 0usize;
            loop {
                let before_in = self.inflater.total_in();
                let before_out = self.inflater.total_out();
                self.inflater
                    .decompress(&input[consumed..], &mut chunk, FlushDecompress::Sync)
                    .unwrap();
                let in_used = (self.inflater.total_in() - before_in) as usize;
                let out_used = (self.inflater.total_out() - before_out) as usize;
                consumed += in_used;
                out.extend_from_slice(&chunk[..out_used]);
                if consumed >= input.len() && out_used < chunk.len() {
                    break;
                }
            }
            out
        }
    }

    fn decode_tile(
        cursor: &mut Cursor<'_>,
        tile_w: usize,
        tile_h: usize,
        mode: CPixelMode,
        format: &PixelFormat,
    ) -> Vec<u32> {
        let area = tile_w * tile_h;
        let sub = cursor.u8();
        let rle = sub & 0x80 != 0;
        let pal_size = (sub & 0x7F) as usize;
        match (pal_size, rle) {
            (1, false) => {
                let value = get_cpixel(cursor, mode, format);
                vec![value; area]
            }
            (0, false) => (0..area).map(|_| get_cpixel(cursor, mode, format)).collect(),
            (0, true) => {
                let mut out = Vec::with_capacity(area);
                while out.len() < area {
                    let value = get_cpixel(cursor, mode, format);
                    let run = read_run_length(cursor);
                    out.extend(std::iter::repeat(value).take(run));
                }
                assert_eq!(out.len(), area);
                out
            }
            (2..=16, false) => {
                let palette: Vec<u32> =
                    (0..pal_size).map(|_| get_cpixel(cursor, mode, format)).collect();
                let bits = packed_bits(pal_size);
                let mut out = Vec::with_capacity(area);
                for _ in 0..tile_h {
                    let row_bytes = (tile_w * bits).div_ceil(8);
                    let packed = cursor.take(row_bytes);
                    for x in 0..tile_w {
                        let bit_off = x * bits;
                        let byte = packed[bit_off / 8];
                        let shift = 8 - bits - (bit_off % 8);
                        let index = ((byte >> shift) as usize) & ((1 << bits) - 1);
                        out.push(palette[index]);
                    }
                }
                out
            }
            (2..=127, true) => {
                let palette: Vec<u32> =
                    (0..pal_size).map(|_| get_cpixel(cursor, mode, format)).collect();
                let mut out = Vec::with_capacity(area);
                while out.len() < area {
                    let byte = cursor.u8();
                    let index = (byte & 0x7F) as usize;
                    let run = if byte & 0x80 != 0 {
                        read_run_length(cursor)
                    } else {
                        1
                    };
                    out.extend(std::iter::repeat(palette[index]).take(run));
                }
                assert_eq!(out.len(), area);
                out
            }
            other => panic!("unexpected subencoding {other:?}"),
        }
    }

    fn values_of(pixels: &[u8], format: &PixelFormat) -> Vec<u32> {
        translate::convert(pixels, format)
            .chunks_exact(format.bytes_per_pixel())
            .map(|chunk| translate::get_pixel(chunk, format))
            .collect()
    }

    fn round_trip(pixels: &[u8], w: usize, h: usize, format: &PixelFormat) {
        let mut stream = ZlibStream::new(6);
        let encoded = encode(pixels, w as u16, h as u16, format, &mut stream).unwrap();
        let mut decoder = RefDecoder::new();
        assert_eq!(
            decoder.decode(&encoded, w, h, format),
            values_of(pixels, format)
        );
    }

    #[test]
    fn cpixel_mode_selection() {
        assert_eq!(cpixel_mode(&PixelFormat::bgra32()), CPixelMode::Low3);
        assert_eq!(cpixel_mode(&PixelFormat::rgb565()), CPixelMode::Full);
        let mut high = PixelFormat::bgra32();
        high.red_shift = 24;
        high.green_shift = 16;
        high.blue_shift = 8;
        assert_eq!(cpixel_mode(&high), CPixelMode::High3);
        let mut full_depth = PixelFormat::bgra32();
        full_depth.depth = 32;
        assert_eq!(cpixel_mode(&full_depth), CPixelMode::Full);
    }

    #[test]
    fn run_length_wire_form() {
        let mut out = Vec::new();
        put_run_length(&mut out, 11);
        assert_eq!(out, vec![10]);
        out.clear();
        put_run_length(&mut out, 256);
        assert_eq!(out, vec![255, 0]);
        out.clear();
        put_run_length(&mut out, 356);
        assert_eq!(out, vec![255, 100]);
        out.clear();
        put_run_length(&mut out, 511);
        assert_eq!(out, vec![255, 255, 0]);
    }

    #[test]
    fn solid_tile() {
        let pixels: Vec<u8> = (0..64 * 64).flat_map(|_| [1u8, 2, 3, 255]).collect();
        round_trip(&pixels, 64, 64, &PixelFormat::bgra32());
    }

    #[test]
    fn two_colour_packed_palette() {
        let mut pixels = Vec::new();
        for y in 0..64 {
            for x in 0..64 {
                if (x + y) % 2 == 0 {
                    pixels.extend_from_slice(&[0u8, 0, 0, 255]);
                } else {
                    pixels.extend_from_slice(&[255u8, 255, 255, 255]);
                }
            }
        }
        round_trip(&pixels, 64, 64, &PixelFormat::bgra32());
    }

    #[test]
    fn horizontal_bands_use_rle() {
        let mut pixels = Vec::new();
        for y in 0u8..64 {
            for _x in 0..64 {
                pixels.extend_from_slice(&[y.wrapping_mul(4), 0, 0, 255]);
            }
        }
        round_trip(&pixels, 64, 64, &PixelFormat::bgra32());
    }

    #[test]
    fn gradient_falls_back_to_raw_cpixels() {
        let mut pixels = Vec::new();
        for y in 0u32..32 {
            for x in 0u32..32 {
                let v = (y * 32 + x) % 256;
                pixels.extend_from_slice(&[v as u8, (v / 2) as u8, (255 - v) as u8, 255]);
            }
        }
        round_trip(&pixels, 32, 32, &PixelFormat::bgra32());
    }

    #[test]
    fn multi_tile_rect_with_clipped_edges() {
        // 130x70: 2x2 tile grid with 2- and 6-pixel edge tiles.
        let mut pixels = Vec::new();
        for y in 0..70u32 {
            for x in 0..130u32 {
                let banded = ((x / 13) * 20) as u8;
                pixels.extend_from_slice(&[banded, (y % 5) as u8 * 40, 7, 255]);
            }
        }
        round_trip(&pixels, 130, 70, &PixelFormat::bgra32());
    }

    #[test]
    fn rgb565_uses_full_pixels() {
        let mut pixels = Vec::new();
        for y in 0..64u32 {
            for x in 0..64u32 {
                let on = (x / 8 + y / 8) % 2 == 0;
                pixels.extend_from_slice(if on {
                    &[10u8, 200, 60, 255]
                } else {
                    &[200u8, 10, 60, 255]
                });
            }
        }
        round_trip(&pixels, 64, 64, &PixelFormat::rgb565());
    }

    #[test]
    fn stream_continuity_across_rectangles() {
        // One connection-long deflate stream, one client inflater: the
        // second rectangle only decodes if both sides kept their state.
        let format = PixelFormat::bgra32();
        let mut stream = ZlibStream::new(6);
        let mut decoder = RefDecoder::new();

        let first: Vec<u8> = (0..64 * 64).flat_map(|_| [9u8, 9, 9, 255]).collect();
        let second: Vec<u8> = (0..64 * 64)
            .flat_map(|i: u32| [(i % 7) as u8, 9, 9, 255])
            .collect();

        let enc1 = encode(&first, 64, 64, &format, &mut stream).unwrap();
        let enc2 = encode(&second, 64, 64, &format, &mut stream).unwrap();

        assert_eq!(decoder.decode(&enc1, 64, 64, &format), values_of(&first, &format));
        assert_eq!(decoder.decode(&enc2, 64, 64, &format), values_of(&second, &format));
    }
}
