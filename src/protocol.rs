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

//! RFB (Remote Framebuffer) protocol constants and wire structures.
//!
//! This module provides the building blocks for RFB communication as
//! specified in RFC 6143: version negotiation, security handshake values,
//! message types, encoding identifiers, the 16-byte pixel format, and an
//! incremental decoder for client messages.
//!
//! # Protocol Overview
//!
//! An RFB connection passes through four phases:
//! 1. **Protocol Version** - server and client agree on 3.3, 3.7, or 3.8
//! 2. **Security Handshake** - authentication selection and execution
//! 3. **Initialization** - ClientInit / ServerInit exchange
//! 4. **Normal Operation** - client messages in, framebuffer updates out
//!
//! All multi-byte integers on the wire are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::RfbError;

/// The version string the server always advertises first.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

// Client-to-Server message types (RFC 6143 Section 7.5).

/// Client changes its preferred pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Client lists the encodings it supports, in preference order.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Client asks for a (possibly incremental) framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Key press or release.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Pointer movement or button change.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Client pushes clipboard text.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;
/// ContinuousUpdates extension: enable(u8) + x,y,w,h (u16 each).
pub const CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES: u8 = 150;

// Server-to-Client message types (RFC 6143 Section 7.6).

/// One or more rectangles of (pseudo-)encoded screen data.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Never sent in true-colour mode; kept for protocol completeness.
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
/// Audible bell on the client.
pub const SERVER_MSG_BELL: u8 = 2;
/// Server pushes clipboard text.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;
/// ContinuousUpdates extension acknowledgement.
pub const SERVER_MSG_END_OF_CONTINUOUS_UPDATES: u8 = 150;

// Encoding types (RFC 6143 Section 7.7).

/// Raw: uncompressed pixels in the client's format.
pub const ENCODING_RAW: i32 = 0;
/// CopyRect: copy a region already on the client's screen.
pub const ENCODING_COPYRECT: i32 = 1;
/// RRE: background plus coloured subrectangles.
pub const ENCODING_RRE: i32 = 2;
/// Hextile: 16x16 tiles with per-tile subencodings.
pub const ENCODING_HEXTILE: i32 = 5;
/// Zlib: raw pixels through a persistent deflate stream.
pub const ENCODING_ZLIB: i32 = 6;
/// Tight: filtered and compressed, optionally JPEG.
pub const ENCODING_TIGHT: i32 = 7;
/// ZRLE: zlib-compressed run-length encoding over 64x64 tiles.
pub const ENCODING_ZRLE: i32 = 16;

// Pseudo-encodings: capability declarations, not pixel data.

/// Rich cursor shape updates.
pub const ENCODING_CURSOR: i32 = -239;
/// Framebuffer dimension change notifications.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
/// Client accepts a LastRect marker terminating an update early.
pub const ENCODING_LAST_RECT: i32 = -224;
/// Multi-screen aware desktop size extension.
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;
/// Client understands the ContinuousUpdates extension.
pub const ENCODING_CONTINUOUS_UPDATES: i32 = -313;

// Hextile subencoding flags (RFC 6143 Section 7.7.4).

/// Tile is sent as raw pixels; all other flags are clear.
pub const HEXTILE_RAW: u8 = 0x01;
/// A background pixel precedes the tile body.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 0x02;
/// A foreground pixel precedes the tile body.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 0x04;
/// A subrectangle count and subrectangles follow.
pub const HEXTILE_ANY_SUBRECTS: u8 = 0x08;
/// Each subrectangle carries its own pixel value.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 0x10;

// Security types and results (RFC 6143 Sections 7.1.2, 7.1.3).

/// Connection failed; a reason string follows.
pub const SECURITY_TYPE_INVALID: u8 = 0;
/// No authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;
/// DES challenge/response VNC authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

/// Security handshake succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;
/// Security handshake failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// The protocol versions this server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// RFB 3.3: security type announced as a single u32.
    Rfb33,
    /// RFB 3.7: security type list, no result after None.
    Rfb37,
    /// RFB 3.8: security type list plus failure reason strings.
    Rfb38,
}

impl ProtocolVersion {
    /// Interpret the client's 12-byte version reply.
    ///
    /// RFC 6143 Section 7.1.1: other version numbers are reported by some
    /// clients but must be interpreted as 3.3 since they do not implement
    /// the different handshakes of 3.7 and 3.8. A claim above 3.8 is
    /// clamped down to the highest version the server supports.
    pub fn negotiate(reply: &[u8; 12]) -> Self {
        match reply {
            b"RFB 003.003\n" => ProtocolVersion::Rfb33,
            b"RFB 003.007\n" => ProtocolVersion::Rfb37,
            b"RFB 003.008\n" => ProtocolVersion::Rfb38,
            other => {
                if other.starts_with(b"RFB 003.") {
                    let minor = &other[8..11];
                    if minor.iter().all(u8::is_ascii_digit)
                        && minor > b"008".as_slice()
                        && other[11] == b'\n'
                    {
                        return ProtocolVersion::Rfb38;
                    }
                }
                ProtocolVersion::Rfb33
            }
        }
    }

    /// Whether this version uses the 3.7+ security type list handshake.
    pub fn has_security_list(self) -> bool {
        self >= ProtocolVersion::Rfb37
    }

    /// Whether a failure reason string follows SecurityResult = Failed.
    pub fn sends_failure_reason(self) -> bool {
        self >= ProtocolVersion::Rfb38
    }
}

/// The 16-byte pixel format structure (RFC 6143 Section 7.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel on the wire: 8, 16, or 32.
    pub bits_per_pixel: u8,
    /// Colour depth in useful bits, at most `bits_per_pixel`.
    pub depth: u8,
    /// Multi-byte pixels are sent big-endian.
    pub big_endian: bool,
    /// True colour; palette formats are unsupported here.
    pub true_colour: bool,
    /// Maximum red value, always 2^n - 1.
    pub red_max: u16,
    /// Maximum green value, always 2^n - 1.
    pub green_max: u16,
    /// Maximum blue value, always 2^n - 1.
    pub blue_max: u16,
    /// Bit position of the red channel.
    pub red_shift: u8,
    /// Bit position of the green channel.
    pub green_shift: u8,
    /// Bit position of the blue channel.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The server's native format: 32bpp, depth 24, little-endian,
    /// channels at shifts 16/8/0. A BGRA byte buffer is already in this
    /// layout, which is what makes the Raw fast path a plain copy.
    pub fn bgra32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 16-bit RGB565, the most common reduced format.
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    /// Whether this format is the native BGRA layout, enabling the
    /// copy-only translation path.
    pub fn is_native_bgra(&self) -> bool {
        self.bits_per_pixel == 32
            && !self.big_endian
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
            && self.red_shift == 16
            && self.green_shift == 8
            && self.blue_shift == 0
    }

    /// Validate the invariants the server relies on: bpp in {8,16,32},
    /// depth <= bpp, true colour (palettes are unsupported), max fields of
    /// the form 2^n - 1, in-range non-overlapping shifts.
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        if !self.true_colour {
            return false;
        }
        let power_of_two_minus_one =
            |max: u16| max > 0 && (u32::from(max) + 1).is_power_of_two();
        if !power_of_two_minus_one(self.red_max)
            || !power_of_two_minus_one(self.green_max)
            || !power_of_two_minus_one(self.blue_max)
        {
            return false;
        }
        let bpp = u32::from(self.bits_per_pixel);
        for (max, shift) in [
            (self.red_max, self.red_shift),
            (self.green_max, self.green_shift),
            (self.blue_max, self.blue_shift),
        ] {
            let width = (u32::from(max) + 1).trailing_zeros();
            if u32::from(shift) + width > bpp {
                return false;
            }
        }
        // Channel masks must not overlap.
        let r = u64::from(self.red_max) << self.red_shift;
        let g = u64::from(self.green_max) << self.green_shift;
        let b = u64::from(self.blue_max) << self.blue_shift;
        (r & g) == 0 && (r & b) == 0 && (g & b) == 0
    }

    /// Serialize into the 16-byte wire layout.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(u8::from(self.big_endian));
        buf.put_u8(u8::from(self.true_colour));
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Parse the 16-byte wire layout. The caller guarantees 16 bytes are
    /// available.
    pub fn read_from(buf: &mut BytesMut) -> Self {
        let bits_per_pixel = buf.get_u8();
        let depth = buf.get_u8();
        let big_endian = buf.get_u8() != 0;
        let true_colour = buf.get_u8() != 0;
        let red_max = buf.get_u16();
        let green_max = buf.get_u16();
        let blue_max = buf.get_u16();
        let red_shift = buf.get_u8();
        let green_shift = buf.get_u8();
        let blue_shift = buf.get_u8();
        buf.advance(3); // padding
        Self {
            bits_per_pixel,
            depth,
            big_endian,
            true_colour,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        }
    }
}

/// The ServerInit message (RFC 6143 Section 7.3.2).
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's natural pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name shown by the viewer.
    pub name: String,
}

impl ServerInit {
    /// Serialize: width, height, pixel format, name length, name bytes.
    #[allow(clippy::cast_possible_truncation)] // name length is bounded well below u32::MAX
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);
        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// A rectangle header inside a FramebufferUpdate message.
#[derive(Debug, Clone, Copy)]
pub struct Rectangle {
    /// Left edge.
    pub x: u16,
    /// Top edge.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding of the payload that follows the header.
    pub encoding: i32,
}

impl Rectangle {
    /// Write the 12-byte rectangle header: x, y, w, h, encoding.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

/// Size limits enforced while decoding client messages.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Longest accepted SetEncodings list.
    pub max_set_encodings: usize,
    /// Largest accepted ClientCutText payload in bytes.
    pub max_client_cut_text: usize,
}

/// Decoded client-to-server messages.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // field meanings are given by RFC 6143 Section 7.5
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest {
        incremental: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    KeyEvent {
        down: bool,
        keysym: u32,
    },
    PointerEvent {
        button_mask: u8,
        x: u16,
        y: u16,
    },
    ClientCutText(Vec<u8>),
    EnableContinuousUpdates {
        enable: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
}

impl ClientMessage {
    /// Try to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(Some(..))` and consumes the bytes on success,
    /// `Ok(None)` when the buffer holds only a message prefix (read more
    /// and retry), and `Err` on a malformed message - at which point the
    /// stream cannot be resynchronised and the connection must close.
    pub fn decode(
        buf: &mut BytesMut,
        limits: &DecodeLimits,
    ) -> Result<Option<ClientMessage>, RfbError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let msg_type = buf[0];
        match msg_type {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                if buf.len() < 20 {
                    return Ok(None);
                }
                buf.advance(4); // type + 3 padding
                let format = PixelFormat::read_from(buf);
                Ok(Some(ClientMessage::SetPixelFormat(format)))
            }
            CLIENT_MSG_SET_ENCODINGS => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if count > limits.max_set_encodings {
                    return Err(RfbError::Protocol(format!(
                        "SetEncodings count {count} exceeds limit {}",
                        limits.max_set_encodings
                    )));
                }
                if buf.len() < 4 + count * 4 {
                    return Ok(None);
                }
                buf.advance(4); // type + padding + count
                let mut encodings = Vec::with_capacity(count);
                for _ in 0..count {
                    encodings.push(buf.get_i32());
                }
                Ok(Some(ClientMessage::SetEncodings(encodings)))
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                buf.advance(1);
                let incremental = buf.get_u8() != 0;
                let x = buf.get_u16();
                let y = buf.get_u16();
                let width = buf.get_u16();
                let height = buf.get_u16();
                Ok(Some(ClientMessage::FramebufferUpdateRequest {
                    incremental,
                    x,
                    y,
                    width,
                    height,
                }))
            }
            CLIENT_MSG_KEY_EVENT => {
                if buf.len() < 8 {
                    return Ok(None);
                }
                buf.advance(1);
                let down = buf.get_u8() != 0;
                buf.advance(2); // padding
                let keysym = buf.get_u32();
                Ok(Some(ClientMessage::KeyEvent { down, keysym }))
            }
            CLIENT_MSG_POINTER_EVENT => {
                if buf.len() < 6 {
                    return Ok(None);
                }
                buf.advance(1);
                let button_mask = buf.get_u8();
                let x = buf.get_u16();
                let y = buf.get_u16();
                Ok(Some(ClientMessage::PointerEvent { button_mask, x, y }))
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                if buf.len() < 8 {
                    return Ok(None);
                }
                let length =
                    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                if length > limits.max_client_cut_text {
                    return Err(RfbError::ResourceLimit(format!(
                        "ClientCutText length {length} exceeds limit {}",
                        limits.max_client_cut_text
                    )));
                }
                if buf.len() < 8 + length {
                    return Ok(None);
                }
                buf.advance(8); // type + 3 padding + length
                let text = buf.split_to(length).to_vec();
                Ok(Some(ClientMessage::ClientCutText(text)))
            }
            CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                buf.advance(1);
                let enable = buf.get_u8() != 0;
                let x = buf.get_u16();
                let y = buf.get_u16();
                let width = buf.get_u16();
                let height = buf.get_u16();
                Ok(Some(ClientMessage::EnableContinuousUpdates {
                    enable,
                    x,
                    y,
                    width,
                    height,
                }))
            }
            other => Err(RfbError::Protocol(format!(
                "unknown client message type {other}"
            ))),
        }
    }
}
