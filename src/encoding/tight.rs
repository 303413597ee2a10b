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

//! Tight encoding (7).
//!
//! Three modes, picked by content:
//!
//! - **Fill** (0x80): one TPIXEL for solid rectangles.
//! - **Basic**: palette filter for rectangles of up to 16 colours
//!   (1-bit rows for two colours, bytes otherwise), copy filter for the
//!   rest. Filtered data of 12 bytes or more goes through one of the
//!   connection's persistent Tight zlib streams and is framed with the
//!   1..3-byte compact length; shorter data is sent verbatim.
//! - **JPEG** (0x90): lossy, only with the `turbojpeg` feature.
//!
//! Stream assignment follows convention: 0 full-colour, 1 mono,
//! 2 indexed palette. Streams are never reset mid-session.
//!
//! A TPIXEL is 3 bytes (R, G, B) whenever the client format is 32bpp,
//! depth 24, with 255 channel maxima; otherwise it is a full pixel.

use crate::encoding::streams::CompressionStreams;
use crate::error::RfbError;
use crate::protocol::PixelFormat;
use crate::translate;

const FILL: u8 = 0x80;
#[cfg(feature = "turbojpeg")]
const JPEG: u8 = 0x90;
const EXPLICIT_FILTER: u8 = 0x40;
const FILTER_PALETTE: u8 = 0x01;

const STREAM_FULL_COLOUR: usize = 0;
const STREAM_MONO: usize = 1;
const STREAM_INDEXED: usize = 2;

/// Below this filtered size the data is sent without compression.
const MIN_BYTES_TO_COMPRESS: usize = 12;

fn uses_tpixel(format: &PixelFormat) -> bool {
    format.bits_per_pixel == 32
        && format.depth == 24
        && format.red_max == 255
        && format.green_max == 255
        && format.blue_max == 255
}

fn put_tpixel(out: &mut Vec<u8>, value: u32, format: &PixelFormat) {
    if uses_tpixel(format) {
        let (r, g, b) = translate::unpack_rgb(value, format);
        out.extend_from_slice(&[r, g, b]);
    } else {
        translate::put_pixel(out, value, format);
    }
}

/// The 1..3-byte compact length representation.
fn put_compact_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else if len < 16384 {
        out.push((len & 0x7F) as u8 | 0x80);
        out.push((len >> 7) as u8);
    } else {
        out.push((len & 0x7F) as u8 | 0x80);
        out.push(((len >> 7) & 0x7F) as u8 | 0x80);
        out.push((len >> 14) as u8);
    }
}

/// Encode one rectangle with Tight, picking the mode by content.
pub fn encode(
    pixels_bgra: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
    streams: &mut CompressionStreams,
    jpeg_quality: u8,
) -> Result<Vec<u8>, RfbError> {
    let w = width as usize;
    let h = height as usize;
    if pixels_bgra.len() != w * h * 4 {
        return Err(RfbError::Encoder("tight: pixel count mismatch".into()));
    }

    // Pixel values in the client's format, needed by every mode.
    let data = translate::convert(pixels_bgra, format);
    let bpp = format.bytes_per_pixel();
    let values: Vec<u32> = data
        .chunks_exact(bpp)
        .map(|chunk| translate::get_pixel(chunk, format))
        .collect();

    // Palette of up to 17 entries; one entry means a solid fill, more
    // than 16 rules the palette filter out.
    let mut palette: Vec<u32> = Vec::new();
    for &value in &values {
        if !palette.contains(&value) {
            palette.push(value);
            if palette.len() > 16 {
                break;
            }
        }
    }

    if palette.len() == 1 {
        let mut out = vec![FILL];
        put_tpixel(&mut out, palette[0], format);
        return Ok(out);
    }

    if palette.len() <= 16 {
        return encode_palette(&values, w, h, &palette, format, streams);
    }

    #[cfg(feature = "turbojpeg")]
    if jpeg_quality > 0 {
        return encode_jpeg(pixels_bgra, width, height, jpeg_quality);
    }
    let _ = jpeg_quality;

    encode_copy(&values, format, streams)
}

/// Basic compression, palette filter.
fn encode_palette(
    values: &[u32],
    w: usize,
    h: usize,
    palette: &[u32],
    format: &PixelFormat,
    streams: &mut CompressionStreams,
) -> Result<Vec<u8>, RfbError> {
    let mono = palette.len() == 2;
    let stream_id = if mono { STREAM_MONO } else { STREAM_INDEXED };

    let mut filtered = Vec::new();
    if mono {
        // One bit per pixel, rows padded to byte boundaries, MSB first.
        for row in values.chunks(w) {
            let mut acc = 0u8;
            let mut nbits = 0u8;
            for &value in row {
                let bit = u8::from(value == palette[1]);
                acc = (acc << 1) | bit;
                nbits += 1;
                if nbits == 8 {
                    filtered.push(acc);
                    acc = 0;
                    nbits = 0;
                }
            }
            if nbits > 0 {
                filtered.push(acc << (8 - nbits));
            }
        }
    } else {
        for &value in values {
            let index = palette.iter().position(|&p| p == value).unwrap() as u8;
            filtered.push(index);
        }
    }
    debug_assert_eq!(
        filtered.len(),
        if mono { w.div_ceil(8) * h } else { w * h }
    );

    let mut out = vec![
        ((stream_id as u8) << 4) | EXPLICIT_FILTER,
        FILTER_PALETTE,
        (palette.len() - 1) as u8,
    ];
    for &value in palette {
        put_tpixel(&mut out, value, format);
    }
    append_basic_data(&mut out, &filtered, stream_id, streams)?;
    Ok(out)
}

/// Basic compression, implicit copy filter through stream 0.
fn encode_copy(
    values: &[u32],
    format: &PixelFormat,
    streams: &mut CompressionStreams,
) -> Result<Vec<u8>, RfbError> {
    let mut filtered = Vec::with_capacity(values.len() * 3);
    for &value in values {
        put_tpixel(&mut filtered, value, format);
    }
    let mut out = vec![(STREAM_FULL_COLOUR as u8) << 4];
    append_basic_data(&mut out, &filtered, STREAM_FULL_COLOUR, streams)?;
    Ok(out)
}

/// Small payloads go uncompressed without a length; larger ones are
/// deflated through the chosen persistent stream and length-prefixed.
fn append_basic_data(
    out: &mut Vec<u8>,
    filtered: &[u8],
    stream_id: usize,
    streams: &mut CompressionStreams,
) -> Result<(), RfbError> {
    if filtered.len() < MIN_BYTES_TO_COMPRESS {
        out.extend_from_slice(filtered);
        return Ok(());
    }
    let compressed = streams.tight(stream_id).compress(filtered)?;
    put_compact_length(out, compressed.len());
    out.extend_from_slice(&compressed);
    Ok(())
}

#[cfg(feature = "turbojpeg")]
fn encode_jpeg(
    pixels_bgra: &[u8],
    width: u16,
    height: u16,
    quality: u8,
) -> Result<Vec<u8>, RfbError> {
    use turbojpeg::{Image, PixelFormat as JpegPixelFormat};

    let image = Image {
        pixels: pixels_bgra,
        width: width as usize,
        pitch: width as usize * 4,
        height: height as usize,
        format: JpegPixelFormat::BGRA,
    };
    let jpeg = turbojpeg::compress(image, i32::from(quality), turbojpeg::Subsamp::Sub2x2)
        .map_err(|e| RfbError::Encoder(format!("jpeg compression failed: {e}")))?;

    let mut out = vec![JPEG];
    put_compact_length(&mut out, jpeg.len());
    out.extend_from_slice(&jpeg);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn inflate(input: &[u8]) -> Vec<u8> {
        let mut inflater = Decompress::new(true);
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 256 * 1024];
        let mut consumed = 0usize;
        loop {
            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            inflater
                .decompress(&input[consumed..], &mut chunk, FlushDecompress::Sync)
                .unwrap();
            let in_used = (inflater.total_in() - before_in) as usize;
            let out_used = (inflater.total_out() - before_out) as usize;
            consumed += in_used;
            out.extend_from_slice(&chunk[..out_used]);
            if consumed >= input.len() && out_used < chunk.len() {
                break;
            }
        }
        out
    }

    fn read_compact_length(data: &[u8]) -> (usize, usize) {
        let mut len = (data[0] & 0x7F) as usize;
        if data[0] & 0x80 == 0 {
            return (len, 1);
        }
        len |= ((data[1] & 0x7F) as usize) << 7;
        if data[1] & 0x80 == 0 {
            return (len, 2);
        }
        len |= (data[2] as usize) << 14;
        (len, 3)
    }

    #[test]
    fn compact_length_boundaries() {
        let mut out = Vec::new();
        put_compact_length(&mut out, 127);
        assert_eq!(out, vec![127]);
        out.clear();
        put_compact_length(&mut out, 128);
        assert_eq!(out, vec![0x80, 1]);
        out.clear();
        put_compact_length(&mut out, 16384);
        assert_eq!(out, vec![0x80, 0x80, 1]);

        for len in [0usize, 127, 128, 16383, 16384, 100_000] {
            let mut buf = Vec::new();
            put_compact_length(&mut buf, len);
            assert_eq!(read_compact_length(&buf), (len, buf.len()));
        }
    }

    #[test]
    fn solid_rect_is_fill_mode() {
        let pixels: Vec<u8> = (0..8 * 8).flat_map(|_| [10u8, 20, 30, 255]).collect();
        let format = PixelFormat::bgra32();
        let mut streams = CompressionStreams::new(6);
        let out = encode(&pixels, 8, 8, &format, &mut streams, 0).unwrap();
        // Control byte + 3-byte TPIXEL (r, g, b).
        assert_eq!(out, vec![FILL, 30, 20, 10]);
    }

    #[test]
    fn mono_rect_uses_palette_filter_on_stream_one() {
        let mut pixels = Vec::new();
        for y in 0..16 {
            for x in 0..16 {
                if (x + y) % 2 == 0 {
                    pixels.extend_from_slice(&[0u8, 0, 0, 255]);
                } else {
                    pixels.extend_from_slice(&[255u8, 255, 255, 255]);
                }
            }
        }
        let format = PixelFormat::bgra32();
        let mut streams = CompressionStreams::new(6);
        let out = encode(&pixels, 16, 16, &format, &mut streams, 0).unwrap();

        assert_eq!(out[0], (STREAM_MONO as u8) << 4 | EXPLICIT_FILTER);
        assert_eq!(out[1], FILTER_PALETTE);
        assert_eq!(out[2], 1); // palette size - 1
        // Two 3-byte palette entries follow, then the compressed bitmap.
        let (len, len_bytes) = read_compact_length(&out[9..]);
        let compressed = &out[9 + len_bytes..];
        assert_eq!(compressed.len(), len);
        let bitmap = inflate(compressed);
        assert_eq!(bitmap.len(), 2 * 16); // 16 rows of 2 bytes
        // First row starts with the palette[0] colour at even columns:
        // bit pattern 01010101.
        assert_eq!(bitmap[0], 0b0101_0101);
    }

    #[test]
    fn full_colour_round_trip_through_stream_zero() {
        let mut pixels = Vec::new();
        for i in 0u32..(16 * 16) {
            pixels.extend_from_slice(&[
                (i % 251) as u8,
                (i * 3 % 251) as u8,
                (i * 7 % 251) as u8,
                255,
            ]);
        }
        let format = PixelFormat::bgra32();
        let mut streams = CompressionStreams::new(6);
        let out = encode(&pixels, 16, 16, &format, &mut streams, 0).unwrap();

        assert_eq!(out[0], 0x00); // stream 0, implicit copy filter
        let (len, len_bytes) = read_compact_length(&out[1..]);
        let tpixels = inflate(&out[1 + len_bytes..1 + len_bytes + len]);
        assert_eq!(tpixels.len(), 16 * 16 * 3);
        // TPIXEL order is R, G, B; source pixel 1 was BGRA (1, 3, 7).
        assert_eq!(&tpixels[0..3], &[0, 0, 0]);
        assert_eq!(&tpixels[3..6], &[7, 3, 1]);
    }

    #[test]
    fn tiny_palette_data_is_uncompressed() {
        // 2x2 two-colour rect: filtered bitmap is 2 bytes, below the
        // compression threshold, so it rides along verbatim.
        let pixels = [
            0u8, 0, 0, 255, 255, 255, 255, 255, //
            255, 255, 255, 255, 0, 0, 0, 255,
        ];
        let format = PixelFormat::bgra32();
        let mut streams = CompressionStreams::new(6);
        let out = encode(&pixels, 2, 2, &format, &mut streams, 0).unwrap();
        assert_eq!(out[0], (STREAM_MONO as u8) << 4 | EXPLICIT_FILTER);
        // header(3) + palette(6) + 2 raw bitmap bytes
        assert_eq!(out.len(), 3 + 6 + 2);
        assert_eq!(&out[9..], &[0b0100_0000, 0b1000_0000]);
    }
}
