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

//! External collaborator interfaces: screen acquisition and input injection.
//!
//! The server core never touches a physical display. Hosts supply a
//! [`ScreenSource`] that produces BGRA frames and an [`InputSink`] that
//! receives the keyboard, pointer, and clipboard traffic the clients send.
//! Both are shared across all connections; implementations may serialise
//! internally but must tolerate concurrent callers.

use std::time::Instant;

/// A rectangular capture region request, in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    /// Left edge.
    pub x: u16,
    /// Top edge.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

/// One captured frame. Pixels are tightly packed BGRA, 4 bytes per pixel,
/// `width * height * 4` bytes total.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// BGRA pixel bytes.
    pub pixels: Vec<u8>,
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Monotonic acquisition timestamp.
    pub timestamp: Instant,
}

/// Why a capture did not produce a frame.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// Nothing available this cycle (display locked, compositor busy).
    /// The scheduler skips the cycle and tries again.
    Unavailable,
    /// The source is gone for good. The connection terminates.
    Fatal(String),
}

/// Cursor shape reported by sources that can capture the system cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Hotspot x offset within the shape.
    pub hotspot_x: u16,
    /// Hotspot y offset within the shape.
    pub hotspot_y: u16,
    /// Shape width in pixels.
    pub width: u16,
    /// Shape height in pixels.
    pub height: u16,
    /// BGRA pixels, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    /// Row-padded 1-bit transparency mask, `ceil(width / 8) * height` bytes.
    pub mask: Vec<u8>,
}

/// Supplies display frames to the server.
///
/// `capture` must be side-effect-free from the server's perspective and
/// reasonably fast; it is called once per update cycle per connection.
pub trait ScreenSource: Send + Sync {
    /// Capture the display, or the given sub-region of it.
    fn capture(&self, region: Option<CaptureRegion>) -> Result<CapturedFrame, CaptureError>;

    /// Current cursor shape, for sources that can provide one. The default
    /// reports none, which disables the cursor pseudo-encoding.
    fn cursor(&self) -> Option<CursorShape> {
        None
    }
}

/// Receives input events decoded from clients. Best-effort: failures are
/// logged by the caller and dropped, never propagated to the client.
pub trait InputSink: Send + Sync {
    /// A key was pressed or released. `keysym` is an X11 keysym.
    fn inject_key(&self, keysym: u32, pressed: bool);

    /// Pointer moved or a button changed. `buttons` is the full current
    /// button bitmask (bit 0 = left, bit 1 = middle, bit 2 = right).
    fn inject_pointer(&self, x: i32, y: i32, buttons: u8);

    /// Client pushed clipboard text (Latin-1 bytes per RFC 6143).
    fn set_clipboard(&self, text: &[u8]);
}

/// Input sink that discards everything. Useful for view-only servers
/// and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInputSink;

impl InputSink for NullInputSink {
    fn inject_key(&self, _keysym: u32, _pressed: bool) {}
    fn inject_pointer(&self, _x: i32, _y: i32, _buttons: u8) {}
    fn set_clipboard(&self, _text: &[u8]) {}
}

/// Screen source backed by a fixed in-memory frame. The frame can be
/// swapped at runtime, which makes it handy for tests and headless demos.
pub struct StaticFrameSource {
    frame: std::sync::Mutex<CapturedFrame>,
}

impl StaticFrameSource {
    /// Create a source around an initial BGRA frame.
    ///
    /// # Panics
    ///
    /// Panics if `pixels.len() != width * height * 4`.
    pub fn new(pixels: Vec<u8>, width: u16, height: u16) -> Self {
        assert_eq!(pixels.len(), width as usize * height as usize * 4);
        Self {
            frame: std::sync::Mutex::new(CapturedFrame {
                pixels,
                width,
                height,
                timestamp: Instant::now(),
            }),
        }
    }

    /// Replace the whole frame.
    pub fn set_frame(&self, pixels: Vec<u8>, width: u16, height: u16) {
        assert_eq!(pixels.len(), width as usize * height as usize * 4);
        let mut frame = self.frame.lock().unwrap();
        frame.pixels = pixels;
        frame.width = width;
        frame.height = height;
        frame.timestamp = Instant::now();
    }
}

impl ScreenSource for StaticFrameSource {
    fn capture(&self, region: Option<CaptureRegion>) -> Result<CapturedFrame, CaptureError> {
        let frame = self.frame.lock().unwrap();
        match region {
            None => Ok(CapturedFrame {
                pixels: frame.pixels.clone(),
                width: frame.width,
                height: frame.height,
                timestamp: Instant::now(),
            }),
            Some(r) => {
                let fw = frame.width as usize;
                if r.x + r.width > frame.width || r.y + r.height > frame.height {
                    return Err(CaptureError::Fatal("capture region out of bounds".into()));
                }
                let mut pixels = Vec::with_capacity(r.width as usize * r.height as usize * 4);
                for row in r.y..r.y + r.height {
                    let start = (row as usize * fw + r.x as usize) * 4;
                    pixels.extend_from_slice(&frame.pixels[start..start + r.width as usize * 4]);
                }
                Ok(CapturedFrame {
                    pixels,
                    width: r.width,
                    height: r.height,
                    timestamp: Instant::now(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_full_and_region_capture() {
        let mut pixels = vec![0u8; 4 * 4 * 4];
        // Mark pixel (2, 1) so we can find it in a sub-capture.
        let offset = (4 + 2) * 4;
        pixels[offset] = 0xAA;
        let source = StaticFrameSource::new(pixels, 4, 4);

        let full = source.capture(None).unwrap();
        assert_eq!(full.width, 4);
        assert_eq!(full.pixels.len(), 64);

        let region = source
            .capture(Some(CaptureRegion {
                x: 2,
                y: 1,
                width: 2,
                height: 2,
            }))
            .unwrap();
        assert_eq!(region.pixels.len(), 16);
        assert_eq!(region.pixels[0], 0xAA);
    }

    #[test]
    fn region_out_of_bounds_is_fatal() {
        let source = StaticFrameSource::new(vec![0u8; 16], 2, 2);
        let err = source
            .capture(Some(CaptureRegion {
                x: 1,
                y: 1,
                width: 2,
                height: 2,
            }))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Fatal(_)));
    }
}
