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

//! Test-side RFB client helpers shared by the integration tests.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use rfbserver::InputSink;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A decoded rectangle from a FramebufferUpdate.
#[derive(Debug)]
pub struct UpdateRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
    pub payload: Vec<u8>,
}

/// Minimal viewer-side protocol driver. Only understands the encodings
/// the tests negotiate (Raw, CopyRect, DesktopSize).
pub struct RfbClient<S> {
    pub stream: S,
    /// Bytes per pixel of the currently negotiated format.
    pub bpp: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RfbClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, bpp: 4 }
    }

    async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(READ_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    /// Exchange versions, claiming the given client version string.
    pub async fn exchange_versions(&mut self, client_version: &str) -> String {
        let server_version = self.read_exact(12).await;
        self.stream
            .write_all(client_version.as_bytes())
            .await
            .unwrap();
        String::from_utf8(server_version).unwrap()
    }

    /// 3.7/3.8 security negotiation expecting exactly one offered type.
    pub async fn negotiate_security(&mut self, expected_type: u8) {
        let count = self.read_exact(1).await[0] as usize;
        assert_eq!(count, 1, "expected one security type");
        let types = self.read_exact(count).await;
        assert_eq!(types[0], expected_type);
        self.stream.write_all(&[expected_type]).await.unwrap();
    }

    pub async fn read_security_result(&mut self) -> u32 {
        let word = self.read_exact(4).await;
        u32::from_be_bytes(word.try_into().unwrap())
    }

    /// ClientInit then ServerInit. Returns (width, height, name).
    pub async fn initialize(&mut self, shared: bool) -> (u16, u16, String) {
        self.stream.write_all(&[u8::from(shared)]).await.unwrap();
        let head = self.read_exact(4).await;
        let width = u16::from_be_bytes([head[0], head[1]]);
        let height = u16::from_be_bytes([head[2], head[3]]);
        let _pixel_format = self.read_exact(16).await;
        let len = self.read_exact(4).await;
        let len = u32::from_be_bytes(len.try_into().unwrap()) as usize;
        let name = String::from_utf8(self.read_exact(len).await).unwrap();
        (width, height, name)
    }

    /// The whole None-auth 3.8 preamble in one call.
    pub async fn handshake_38_none(&mut self) -> (u16, u16, String) {
        let server_version = self.exchange_versions("RFB 003.008\n").await;
        assert_eq!(server_version, "RFB 003.008\n");
        self.negotiate_security(1).await;
        assert_eq!(self.read_security_result().await, 0);
        self.initialize(true).await
    }

    pub async fn set_encodings(&mut self, encodings: &[i32]) {
        let mut msg = vec![2u8, 0];
        msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
        for &encoding in encodings {
            msg.extend_from_slice(&encoding.to_be_bytes());
        }
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn set_pixel_format(&mut self, format_bytes: &[u8; 16], bpp: usize) {
        let mut msg = vec![0u8, 0, 0, 0];
        msg.extend_from_slice(format_bytes);
        self.stream.write_all(&msg).await.unwrap();
        self.bpp = bpp;
    }

    pub async fn request_update(&mut self, incremental: bool, x: u16, y: u16, w: u16, h: u16) {
        let mut msg = vec![3u8, u8::from(incremental)];
        msg.extend_from_slice(&x.to_be_bytes());
        msg.extend_from_slice(&y.to_be_bytes());
        msg.extend_from_slice(&w.to_be_bytes());
        msg.extend_from_slice(&h.to_be_bytes());
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn key_event(&mut self, down: bool, keysym: u32) {
        let mut msg = vec![4u8, u8::from(down), 0, 0];
        msg.extend_from_slice(&keysym.to_be_bytes());
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn pointer_event(&mut self, buttons: u8, x: u16, y: u16) {
        let mut msg = vec![5u8, buttons];
        msg.extend_from_slice(&x.to_be_bytes());
        msg.extend_from_slice(&y.to_be_bytes());
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn cut_text(&mut self, text: &[u8]) {
        let mut msg = vec![6u8, 0, 0, 0];
        msg.extend_from_slice(&(text.len() as u32).to_be_bytes());
        msg.extend_from_slice(text);
        self.stream.write_all(&msg).await.unwrap();
    }

    /// Read one FramebufferUpdate and its rectangles.
    pub async fn read_update(&mut self) -> Vec<UpdateRect> {
        let head = self.read_exact(4).await;
        assert_eq!(head[0], 0, "expected FramebufferUpdate");
        let count = u16::from_be_bytes([head[2], head[3]]) as usize;
        let mut rects = Vec::with_capacity(count);
        for _ in 0..count {
            let header = self.read_exact(12).await;
            let x = u16::from_be_bytes([header[0], header[1]]);
            let y = u16::from_be_bytes([header[2], header[3]]);
            let width = u16::from_be_bytes([header[4], header[5]]);
            let height = u16::from_be_bytes([header[6], header[7]]);
            let encoding =
                i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
            let payload_len = match encoding {
                0 => width as usize * height as usize * self.bpp, // Raw
                1 => 4,                                           // CopyRect
                -223 => 0,                                        // DesktopSize
                other => panic!("test client cannot size encoding {other}"),
            };
            let payload = self.read_exact(payload_len).await;
            rects.push(UpdateRect {
                x,
                y,
                width,
                height,
                encoding,
                payload,
            });
        }
        rects
    }

    /// Assert that no server bytes arrive within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(window, self.stream.read(&mut byte)).await {
            Err(_) => {} // timed out: silence, as expected
            Ok(Ok(0)) => panic!("connection closed while expecting silence"),
            Ok(Ok(_)) => panic!("unexpected server data {byte:?}"),
            Ok(Err(e)) => panic!("read error while expecting silence: {e}"),
        }
    }
}

/// Input sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingInputSink {
    pub keys: Mutex<Vec<(u32, bool)>>,
    pub pointers: Mutex<Vec<(i32, i32, u8)>>,
    pub clipboard: Mutex<Vec<Vec<u8>>>,
}

impl InputSink for RecordingInputSink {
    fn inject_key(&self, keysym: u32, pressed: bool) {
        self.keys.lock().unwrap().push((keysym, pressed));
    }

    fn inject_pointer(&self, x: i32, y: i32, buttons: u8) {
        self.pointers.lock().unwrap().push((x, y, buttons));
    }

    fn set_clipboard(&self, text: &[u8]) {
        self.clipboard.lock().unwrap().push(text.to_vec());
    }
}

/// A BGRA frame filled with one colour.
pub fn solid_frame(width: u16, height: u16, b: u8, g: u8, r: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for _ in 0..(width as usize * height as usize) {
        pixels.extend_from_slice(&[b, g, r, 255]);
    }
    pixels
}
