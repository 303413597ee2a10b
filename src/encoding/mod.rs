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

//! Rectangle encoders.
//!
//! Each encoder maps (BGRA pixels, dimensions, client pixel format) to
//! the wire bytes that follow a rectangle header. Translation to the
//! client's pixel layout happens inside the encoder, so callers hand over
//! raw snapshot pixels.
//!
//! The family is a closed set dispatched statically through [`Encoder`].
//! Raw is the baseline every other encoder may fall back to: a stateless
//! encoder whose output is not smaller than Raw is discarded in favour
//! of Raw. Stream-backed encoders (ZRLE, Zlib, Tight) cannot be
//! discarded after the fact - their deflate context has already advanced
//! - so they are guarded by an up-front size heuristic instead, and an
//! error inside one of them is fatal for the connection.

pub mod hextile;
pub mod rre;
pub mod selector;
pub mod streams;
pub mod tight;
pub mod zlib;
pub mod zrle;

use bytes::{BufMut, BytesMut};

use crate::error::RfbError;
use crate::protocol::{
    PixelFormat, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_TIGHT, ENCODING_ZLIB,
    ENCODING_ZRLE,
};
use crate::translate;
pub use streams::{CompressionStreams, ZlibStream};

/// Below this many Raw bytes a stream encoder is never worth its
/// per-rectangle overhead.
const STREAM_MIN_RAW_BYTES: usize = 64;

/// The pixel-data encoders this server implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // variants map 1:1 onto RFC 6143 encoding names
pub enum Encoder {
    Raw,
    Rre,
    Hextile,
    Zrle,
    Zlib,
    Tight,
}

/// Everything an encoder needs besides the pixels.
pub struct EncodeContext<'a> {
    /// The client's negotiated pixel format.
    pub format: &'a PixelFormat,
    /// The connection's persistent deflate streams.
    pub streams: &'a mut CompressionStreams,
    /// JPEG quality for Tight's lossy mode, already clamped to the
    /// configured range.
    pub jpeg_quality: u8,
}

impl Encoder {
    /// Wire identifier (RFC 6143 Section 7.7).
    pub fn id(self) -> i32 {
        match self {
            Encoder::Raw => ENCODING_RAW,
            Encoder::Rre => ENCODING_RRE,
            Encoder::Hextile => ENCODING_HEXTILE,
            Encoder::Zrle => ENCODING_ZRLE,
            Encoder::Zlib => ENCODING_ZLIB,
            Encoder::Tight => ENCODING_TIGHT,
        }
    }

    /// Encoders with no cross-rectangle state. Only these may run on the
    /// parallel worker pool; stream-backed encoders must stay on the
    /// session task to keep their deflate output FIFO.
    pub fn is_stateless(self) -> bool {
        matches!(self, Encoder::Raw | Encoder::Rre | Encoder::Hextile)
    }

    /// Encode one rectangle and return `(actual encoding id, bytes)`.
    ///
    /// A stateless encoder that errors or fails to beat Raw is silently
    /// replaced by Raw. Stream encoder failures propagate; the caller
    /// must close the connection because the peer's inflater state is no
    /// longer reproducible.
    pub fn encode(
        self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<(i32, Vec<u8>), RfbError> {
        let raw_len = pixels.len() / 4 * ctx.format.bytes_per_pixel();
        match self {
            Encoder::Raw => Ok((ENCODING_RAW, encode_raw(pixels, ctx.format))),
            Encoder::Rre | Encoder::Hextile => {
                let result = match self {
                    Encoder::Rre => rre::encode(pixels, width, height, ctx.format),
                    _ => hextile::encode(pixels, width, height, ctx.format),
                };
                match result {
                    Ok(encoded) if encoded.len() < raw_len => Ok((self.id(), encoded)),
                    Ok(_) => Ok((ENCODING_RAW, encode_raw(pixels, ctx.format))),
                    Err(e) => {
                        log::warn!("{:?} encoder failed, sending Raw: {e}", self);
                        Ok((ENCODING_RAW, encode_raw(pixels, ctx.format)))
                    }
                }
            }
            Encoder::Zrle | Encoder::Zlib | Encoder::Tight => {
                if raw_len <= STREAM_MIN_RAW_BYTES {
                    return Ok((ENCODING_RAW, encode_raw(pixels, ctx.format)));
                }
                let encoded = match self {
                    Encoder::Zrle => {
                        zrle::encode(pixels, width, height, ctx.format, ctx.streams.zrle())?
                    }
                    Encoder::Zlib => zlib::encode(pixels, ctx.format, ctx.streams.zlib())?,
                    _ => tight::encode(
                        pixels,
                        width,
                        height,
                        ctx.format,
                        ctx.streams,
                        ctx.jpeg_quality,
                    )?,
                };
                Ok((self.id(), encoded))
            }
        }
    }

    /// Encode without touching connection state. Returns `None` for
    /// encoders that need their deflate streams.
    pub fn encode_stateless(
        self,
        pixels: &[u8],
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Option<(i32, Vec<u8>)> {
        if !self.is_stateless() {
            return None;
        }
        let raw_len = pixels.len() / 4 * format.bytes_per_pixel();
        let encoded = match self {
            Encoder::Rre => rre::encode(pixels, width, height, format).ok(),
            Encoder::Hextile => hextile::encode(pixels, width, height, format).ok(),
            _ => None,
        };
        match encoded {
            Some(bytes) if bytes.len() < raw_len => Some((self.id(), bytes)),
            _ => Some((ENCODING_RAW, encode_raw(pixels, format))),
        }
    }
}

/// Raw encoding (0): the converted pixels, nothing else.
pub fn encode_raw(pixels: &[u8], format: &PixelFormat) -> Vec<u8> {
    translate::convert(pixels, format)
}

/// CopyRect encoding (1): just the source position. The caller has
/// already proven the source region of the previous framebuffer equals
/// the destination content.
pub fn encode_copy_rect(src_x: u16, src_y: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(src_x);
    buf.put_u16(src_y);
    buf.to_vec()
}
