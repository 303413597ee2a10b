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

//! Transport multiplexing: raw RFB and WebSocket on the same port.
//!
//! A fresh connection is sniffed by reading its first three bytes with a
//! bounded timeout. "GET" means an HTTP upgrade is coming and the
//! connection is routed through the WebSocket adapter; anything else
//! (including silence - RFB clients wait for the server to speak first)
//! is raw RFB. The sniffed bytes are replayed into whichever path wins,
//! so the peek is non-destructive.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::RfbError;
use crate::websocket::{self, WebSocketLimits, WebSocketStream};

/// A stream with already-read bytes stitched back onto its front.
pub struct PrefixedStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PrefixedStream<S> {
    /// Wrap `inner`, replaying `prefix` before its own bytes.
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The two transports a connection can resolve to.
pub enum Transport<S> {
    /// Plain RFB over the underlying stream.
    Raw(PrefixedStream<S>),
    /// RFB tunnelled through RFC 6455 binary frames.
    WebSocket(WebSocketStream<S>),
}

impl<S> Transport<S> {
    /// Whether the WebSocket path was taken.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Transport::WebSocket(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Transport<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Raw(s) => Pin::new(s).poll_read(cx, buf),
            Transport::WebSocket(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Transport<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Raw(s) => Pin::new(s).poll_write(cx, buf),
            Transport::WebSocket(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Raw(s) => Pin::new(s).poll_flush(cx),
            Transport::WebSocket(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Raw(s) => Pin::new(s).poll_shutdown(cx),
            Transport::WebSocket(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Sniff the first bytes and resolve the transport.
///
/// RFB clients say nothing until the server sends its version string,
/// so hitting the detect timeout with an empty buffer is the normal raw
/// path, not an error.
pub async fn detect<S>(
    mut stream: S,
    detect_timeout: Duration,
    limits: WebSocketLimits,
) -> Result<Transport<S>, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sniffed = BytesMut::with_capacity(16);
    let deadline = tokio::time::Instant::now() + detect_timeout;

    while sniffed.len() < 3 {
        match tokio::time::timeout_at(deadline, stream.read_buf(&mut sniffed)).await {
            Ok(Ok(0)) => break, // EOF; hand the bytes to the raw path
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break, // silent client: raw RFB
        }
    }

    if sniffed.len() >= 3 && &sniffed[..3] == b"GET" {
        log::info!("websocket upgrade detected");
        let ws = websocket::accept(stream, sniffed, limits).await?;
        Ok(Transport::WebSocket(ws))
    } else {
        Ok(Transport::Raw(PrefixedStream::new(sniffed, stream)))
    }
}
