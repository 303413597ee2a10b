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

//! Error types for the RFB server.
//!
//! Every error carries enough context to decide its blast radius: all of
//! them terminate at most the connection they occurred on. The supervisor
//! and other sessions are never affected by a failure in one session.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RfbError>;

/// All error conditions the server distinguishes.
#[derive(Debug, Error)]
pub enum RfbError {
    /// Malformed RFB message, unknown message type, or an oversized field.
    /// The byte stream cannot be resynchronised; the connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// VNC authentication challenge mismatch.
    #[error("authentication failed")]
    Authentication,

    /// WebSocket upgrade failure. The server replies 400 Bad Request
    /// before closing.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Socket read/write failure, EOF, or timeout.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The screen source could not produce a frame this cycle; the update
    /// cycle is skipped and the connection continues.
    #[error("capture unavailable")]
    CaptureUnavailable,

    /// The screen source failed permanently. The connection is closed and
    /// server health is marked degraded.
    #[error("capture failed: {0}")]
    CaptureFatal(String),

    /// Inconsistency inside an encoder. The affected rectangle falls back
    /// to Raw; only a failure of Raw itself propagates.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// A per-connection buffer limit was exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl RfbError {
    /// Whether this error is transient for the update cycle rather than
    /// fatal for the connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, RfbError::CaptureUnavailable)
    }

    /// Errors caused by the remote peer rather than the server or host.
    /// These are logged at INFO since they are routine on flaky clients.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            RfbError::Protocol(_)
                | RfbError::Authentication
                | RfbError::Handshake(_)
                | RfbError::Transport(_)
        )
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        RfbError::Protocol(msg.into())
    }
}
