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

//! Pixel translation from the server's internal BGRA buffers to the
//! client's negotiated pixel format.
//!
//! Translation happens before encoding per RFC 6143: every encoder
//! operates on pixels already in the client's layout. The native-format
//! path is a straight copy with the padding byte zeroed (RFB carries no
//! alpha).

use crate::protocol::PixelFormat;

/// Extract (r, g, b) from one BGRA pixel.
#[inline]
fn bgra_rgb(pixel: &[u8]) -> (u8, u8, u8) {
    (pixel[2], pixel[1], pixel[0])
}

/// Pack an 8-bit-per-channel colour into a pixel value for `format`.
#[inline]
pub fn pack_rgb(r: u8, g: u8, b: u8, format: &PixelFormat) -> u32 {
    let scale = |c: u8, max: u16| (u32::from(c) * u32::from(max)) / 255;
    (scale(r, format.red_max) << format.red_shift)
        | (scale(g, format.green_max) << format.green_shift)
        | (scale(b, format.blue_max) << format.blue_shift)
}

/// Serialize a packed pixel value using the format's width and endianness.
#[inline]
pub fn put_pixel(out: &mut Vec<u8>, value: u32, format: &PixelFormat) {
    match (format.bytes_per_pixel(), format.big_endian) {
        (1, _) => out.push(value as u8),
        (2, false) => out.extend_from_slice(&(value as u16).to_le_bytes()),
        (2, true) => out.extend_from_slice(&(value as u16).to_be_bytes()),
        (4, false) => out.extend_from_slice(&value.to_le_bytes()),
        _ => out.extend_from_slice(&value.to_be_bytes()),
    }
}

/// Read a packed pixel value back out of client-format bytes.
#[inline]
pub fn get_pixel(bytes: &[u8], format: &PixelFormat) -> u32 {
    match (format.bytes_per_pixel(), format.big_endian) {
        (1, _) => u32::from(bytes[0]),
        (2, false) => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
        (2, true) => u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
        (4, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Convert a tightly packed BGRA buffer to the client's pixel format.
///
/// Output length is exactly `pixel_count * format.bytes_per_pixel()`.
pub fn convert(src_bgra: &[u8], format: &PixelFormat) -> Vec<u8> {
    debug_assert_eq!(src_bgra.len() % 4, 0);
    let pixel_count = src_bgra.len() / 4;

    if format.is_native_bgra() {
        // Fast path: same layout, just clear the padding byte.
        let mut out = src_bgra.to_vec();
        for pixel in out.chunks_exact_mut(4) {
            pixel[3] = 0;
        }
        return out;
    }

    let mut out = Vec::with_capacity(pixel_count * format.bytes_per_pixel());
    for pixel in src_bgra.chunks_exact(4) {
        let (r, g, b) = bgra_rgb(pixel);
        put_pixel(&mut out, pack_rgb(r, g, b, format), format);
    }
    out
}

/// Recover 8-bit (r, g, b) from a packed pixel value. Channels are
/// rescaled from the format's max back to 255; lossy for reduced depths.
pub fn unpack_rgb(value: u32, format: &PixelFormat) -> (u8, u8, u8) {
    let extract = |shift: u8, max: u16| {
        let channel = (value >> shift) & u32::from(max);
        ((channel * 255) / u32::from(max)) as u8
    };
    (
        extract(format.red_shift, format.red_max),
        extract(format.green_shift, format.green_max),
        extract(format.blue_shift, format.blue_max),
    )
}
