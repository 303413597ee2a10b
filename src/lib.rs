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

//! # rfbserver
//!
//! A pure Rust RFB (Remote Framebuffer / VNC) server core implementing
//! RFC 6143 for protocol versions 3.3, 3.7, and 3.8. Raw RFB and
//! WebSocket clients share a single listening port; the transport is
//! sniffed per connection.
//!
//! The crate is the protocol and encoding engine only. Screen capture
//! and input injection are supplied by the host through the
//! [`ScreenSource`] and [`InputSink`] traits.
//!
//! ## Features
//!
//! - **Encodings**: Raw, CopyRect, RRE, Hextile, Zlib, ZRLE, and
//!   optionally Tight (with JPEG via the `turbojpeg` feature), selected
//!   per rectangle from content and network profile
//! - **Change detection**: tile-hashed dirty regions drive incremental
//!   updates; scrolling is recognised and sent as CopyRect
//! - **WebSocket**: RFC 6455 binary framing for browser clients (noVNC)
//!   on the same port as raw RFB
//! - **Async I/O**: built on Tokio, one task per connection
//! - **VNC authentication**: DES challenge/response per RFC 6143
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfbserver::{NullInputSink, ServerConfig, StaticFrameSource, VncServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A 1280x800 test-pattern screen; real hosts implement
//!     // ScreenSource over their capture stack.
//!     let source = Arc::new(StaticFrameSource::new(
//!         vec![0u8; 1280 * 800 * 4],
//!         1280,
//!         800,
//!     ));
//!
//!     let server = VncServer::new(
//!         ServerConfig::default(),
//!         source,
//!         Arc::new(NullInputSink),
//!     );
//!     server.listen().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Your Application              │
//! │   ScreenSource  /  InputSink impls      │
//! └──────────────────┬──────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │         VncServer (supervisor)          │
//! │  listener · pool · shutdown · health    │
//! └──────────────────┬──────────────────────┘
//!                    │ per connection
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!   ┌─────────┐ ┌─────────┐ ┌─────────┐
//!   │Session 1│ │Session 2│ │Session N│   raw TCP or WebSocket
//!   └─────────┘ └─────────┘ └─────────┘
//!        │           │           │
//!        ▼           ▼           ▼
//!   snapshot → tile diff → encoder select → encode → send
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod detector;
pub mod encoding;
pub mod error;
pub mod framebuffer;
pub mod protocol;
pub mod server;
pub mod source;
pub mod transport;
pub mod websocket;

// Internal modules
mod auth;
mod session;
mod translate;

// Re-exports
pub use config::{NetworkProfile, ServerConfig};
pub use error::{Result, RfbError};
pub use framebuffer::Region;
pub use protocol::PixelFormat;
pub use server::{HealthStatus, VncServer};
pub use source::{
    CaptureError, CaptureRegion, CapturedFrame, CursorShape, InputSink, NullInputSink,
    ScreenSource, StaticFrameSource,
};

/// VNC protocol version advertised by the server.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
