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

//! WebSocket transport adapter (RFC 6455) for browser VNC clients.
//!
//! [`accept`] performs the HTTP upgrade; the resulting
//! [`WebSocketStream`] implements `AsyncRead + AsyncWrite`, so the RFB
//! engine runs unchanged over it. Incoming binary and continuation
//! frames are defragmented into the read stream; outbound bytes are
//! chunked into unmasked binary frames. Pings are answered with pongs,
//! a close frame reads as EOF, and oversized frames or reassembly
//! buffers tear the connection down with close code 1009.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::RfbError;

/// RFC 6455 handshake GUID.
const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Outbound frames never exceed this payload size.
const WRITE_MTU: usize = 64 * 1024;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_TOO_BIG: u16 = 1009;

/// Limits enforced by the adapter.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketLimits {
    /// Upper bound on the HTTP upgrade request.
    pub max_handshake_bytes: usize,
    /// Largest accepted single frame payload.
    pub max_payload_bytes: usize,
    /// Largest defragmentation buffer before close 1009.
    pub max_buffer_bytes: usize,
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(MAGIC_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Perform the server side of the WebSocket upgrade.
///
/// `preface` holds bytes the transport sniffer already pulled off the
/// socket; they are treated as the start of the HTTP request. On any
/// validation failure a `400 Bad Request` is written before the error
/// is returned.
pub async fn accept<S>(
    mut stream: S,
    preface: BytesMut,
    limits: WebSocketLimits,
) -> Result<WebSocketStream<S>, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = preface;
    let header_end = loop {
        if let Some(pos) = find_header_end(&request) {
            break pos;
        }
        if request.len() > limits.max_handshake_bytes {
            return reject(stream, "handshake exceeds size limit").await;
        }
        let n = stream.read_buf(&mut request).await?;
        if n == 0 {
            return Err(RfbError::Handshake("eof during websocket handshake".into()));
        }
    };

    let head = String::from_utf8_lossy(&request[..header_end]).into_owned();
    let mut leftover = request;
    leftover.advance(header_end + 4);

    let headers = match parse_headers(&head) {
        Some(headers) => headers,
        None => return reject(stream, "malformed http request").await,
    };

    if !header_contains(&headers, "upgrade", "websocket") {
        return reject(stream, "missing Upgrade: websocket").await;
    }
    if !header_contains(&headers, "connection", "upgrade") {
        return reject(stream, "missing Connection: Upgrade").await;
    }
    if headers
        .iter()
        .find(|(name, _)| name == "sec-websocket-version")
        .map(|(_, value)| value.trim() != "13")
        .unwrap_or(true)
    {
        return reject(stream, "unsupported websocket version").await;
    }
    let Some(key) = headers
        .iter()
        .find(|(name, _)| name == "sec-websocket-key")
        .map(|(_, value)| value.trim().to_owned())
    else {
        return reject(stream, "missing Sec-WebSocket-Key").await;
    };

    // Echo the binary subprotocol only when the client offered it.
    let offers_binary = headers
        .iter()
        .filter(|(name, _)| name == "sec-websocket-protocol")
        .flat_map(|(_, value)| value.split(','))
        .any(|proto| proto.trim().eq_ignore_ascii_case("binary"));

    let mut response = String::new();
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(&key)));
    if offers_binary {
        response.push_str("Sec-WebSocket-Protocol: binary\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    log::info!("websocket handshake completed");
    Ok(WebSocketStream {
        inner: stream,
        limits,
        read_buf: leftover,
        payload: BytesMut::new(),
        write_buf: BytesMut::new(),
        peer_closed: false,
        close_sent: false,
    })
}

async fn reject<S, T>(mut stream: S, reason: &str) -> Result<T, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
        .await;
    let _ = stream.flush().await;
    Err(RfbError::Handshake(reason.to_string()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Parse request headers into lowercase-name pairs. Returns None when
/// the request line is not an HTTP GET.
fn parse_headers(head: &str) -> Option<Vec<(String, String)>> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.starts_with("GET ") || !request_line.contains("HTTP/1.1") {
        return None;
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Some(headers)
}

/// Case-insensitive, comma-list-aware header token check.
fn header_contains(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(header, _)| header == name)
        .flat_map(|(_, value)| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Build one unmasked server frame.
fn encode_frame(opcode: u8, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(payload.len() + 10);
    frame.put_u8(0x80 | opcode); // FIN always set
    if payload.len() <= 125 {
        frame.put_u8(payload.len() as u8);
    } else if payload.len() <= 65535 {
        frame.put_u8(126);
        frame.put_u16(payload.len() as u16);
    } else {
        frame.put_u8(127);
        frame.put_u64(payload.len() as u64);
    }
    frame.put_slice(payload);
    frame
}

fn close_payload(code: u16) -> [u8; 2] {
    code.to_be_bytes()
}

/// One parsed inbound frame.
struct Frame {
    opcode: u8,
    payload: BytesMut,
}

/// A WebSocket connection carrying RFB bytes in binary frames.
pub struct WebSocketStream<S> {
    inner: S,
    limits: WebSocketLimits,
    /// Raw bytes read from the socket, not yet parsed into frames.
    read_buf: BytesMut,
    /// Defragmented binary payload ready for the RFB engine.
    payload: BytesMut,
    /// Frames queued for the socket (data, pongs, close).
    write_buf: BytesMut,
    /// Peer sent a close frame; reads return EOF.
    peer_closed: bool,
    close_sent: bool,
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Try to parse one complete frame out of `read_buf`.
    fn parse_frame(&mut self) -> Result<Option<Frame>, io::Error> {
        if self.read_buf.len() < 2 {
            return Ok(None);
        }
        let opcode = self.read_buf[0] & 0x0F;
        let masked = self.read_buf[1] & 0x80 != 0;
        let mut payload_len = u64::from(self.read_buf[1] & 0x7F);
        let mut offset = 2usize;
        if payload_len == 126 {
            if self.read_buf.len() < 4 {
                return Ok(None);
            }
            payload_len = u64::from(u16::from_be_bytes([self.read_buf[2], self.read_buf[3]]));
            offset = 4;
        } else if payload_len == 127 {
            if self.read_buf.len() < 10 {
                return Ok(None);
            }
            payload_len = u64::from_be_bytes(self.read_buf[2..10].try_into().unwrap());
            offset = 10;
        }

        if payload_len > self.limits.max_payload_bytes as u64 {
            self.queue_close(CLOSE_TOO_BIG);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket frame exceeds payload limit",
            ));
        }
        let payload_len = payload_len as usize;

        let mask_len = if masked { 4 } else { 0 };
        if self.read_buf.len() < offset + mask_len + payload_len {
            return Ok(None);
        }

        self.read_buf.advance(offset);
        let mask: Option<[u8; 4]> = if masked {
            let key = [
                self.read_buf[0],
                self.read_buf[1],
                self.read_buf[2],
                self.read_buf[3],
            ];
            self.read_buf.advance(4);
            Some(key)
        } else {
            None
        };
        let mut payload = self.read_buf.split_to(payload_len);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        Ok(Some(Frame { opcode, payload }))
    }

    fn queue_close(&mut self, code: u16) {
        if !self.close_sent {
            self.close_sent = true;
            self.write_buf
                .extend_from_slice(&encode_frame(OPCODE_CLOSE, &close_payload(code)));
        }
    }

    /// Best-effort drain of `write_buf`; pending is fine, errors are not.
    fn flush_write_buf(&mut self, cx: &mut Context<'_>) -> Result<(), io::Error> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => break,
            }
        }
        Ok(())
    }

    /// Process parsed frames until payload bytes are available or more
    /// socket data is needed. Returns true when the peer closed.
    fn pump_frames(&mut self) -> Result<bool, io::Error> {
        while let Some(frame) = self.parse_frame()? {
            match frame.opcode {
                OPCODE_BINARY | OPCODE_CONTINUATION => {
                    if self.payload.len() + frame.payload.len() > self.limits.max_buffer_bytes {
                        self.queue_close(CLOSE_TOO_BIG);
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "websocket reassembly buffer exceeded",
                        ));
                    }
                    self.payload.unsplit(frame.payload);
                }
                OPCODE_PING => {
                    self.write_buf
                        .extend_from_slice(&encode_frame(OPCODE_PONG, &frame.payload));
                }
                OPCODE_PONG => {}
                OPCODE_CLOSE => {
                    self.queue_close(CLOSE_NORMAL);
                    self.peer_closed = true;
                    return Ok(true);
                }
                OPCODE_TEXT => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected websocket text frame",
                    ));
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported websocket opcode {other:#x}"),
                    ));
                }
            }
        }
        Ok(false)
    }
}

impl<S> AsyncRead for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.payload.is_empty() {
                let n = this.payload.len().min(buf.remaining());
                buf.put_slice(&this.payload.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.peer_closed {
                return Poll::Ready(Ok(())); // EOF
            }

            let closed = match this.pump_frames() {
                Ok(closed) => closed,
                Err(e) => {
                    // Push out any close frame queued by the pump so the
                    // peer learns why before the error tears us down.
                    let _ = this.flush_write_buf(cx);
                    return Poll::Ready(Err(e));
                }
            };
            // Pongs and close replies queued by the pump should not wait
            // for the next explicit write.
            this.flush_write_buf(cx)?;
            if closed {
                return Poll::Ready(Ok(()));
            }
            if !this.payload.is_empty() {
                continue;
            }

            let mut chunk = [0u8; 16 * 1024];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(())); // socket EOF
                    }
                    this.read_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        for chunk in buf.chunks(WRITE_MTU) {
            this.write_buf
                .extend_from_slice(&encode_frame(OPCODE_BINARY, chunk));
        }
        this.flush_write_buf(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.flush_write_buf(cx)?;
        if !this.write_buf.is_empty() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.queue_close(CLOSE_NORMAL);
        this.flush_write_buf(cx)?;
        if !this.write_buf.is_empty() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn limits() -> WebSocketLimits {
        WebSocketLimits {
            max_handshake_bytes: 16 * 1024,
            max_payload_bytes: 1024 * 1024,
            max_buffer_bytes: 4 * 1024 * 1024,
        }
    }

    /// Client-side helper: mask and frame a payload.
    fn client_frame(opcode: u8, payload: &[u8], fin: bool) -> Vec<u8> {
        let key = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = Vec::new();
        frame.push(if fin { 0x80 } else { 0x00 } | opcode);
        if payload.len() <= 125 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 65535 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&key);
        for (i, &byte) in payload.iter().enumerate() {
            frame.push(byte ^ key[i % 4]);
        }
        frame
    }

    #[test]
    fn rfc6455_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn handshake_and_binary_round_trip() {
        let (client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept(server, BytesMut::new(), limits()).await.unwrap()
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let request = "GET / HTTP/1.1\r\n\
                       Host: localhost\r\n\
                       Upgrade: websocket\r\n\
                       Connection: keep-alive, Upgrade\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\
                       Sec-WebSocket-Protocol: binary\r\n\r\n";
        client_write.write_all(request.as_bytes()).await.unwrap();

        let mut response = vec![0u8; 1024];
        let n = client_read.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.contains("Sec-WebSocket-Protocol: binary"));

        let mut ws = server_task.await.unwrap();

        // Client -> server across two fragments.
        client_write
            .write_all(&client_frame(OPCODE_BINARY, b"RFB 0", false))
            .await
            .unwrap();
        client_write
            .write_all(&client_frame(OPCODE_CONTINUATION, b"03.008\n", true))
            .await
            .unwrap();
        let mut incoming = [0u8; 12];
        ws.read_exact(&mut incoming).await.unwrap();
        assert_eq!(&incoming, b"RFB 003.008\n");

        // Server -> client: one unmasked binary frame.
        ws.write_all(b"hello").await.unwrap();
        ws.flush().await.unwrap();
        let mut frame = [0u8; 7];
        client_read.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x80 | OPCODE_BINARY);
        assert_eq!(frame[1], 5); // unmasked
        assert_eq!(&frame[2..], b"hello");
    }

    #[tokio::test]
    async fn ping_gets_pong_and_close_reads_eof() {
        let (client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept(server, BytesMut::new(), limits()).await.unwrap()
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let request = "GET /vnc HTTP/1.1\r\n\
                       Upgrade: WebSocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        client_write.write_all(request.as_bytes()).await.unwrap();
        let mut response = vec![0u8; 1024];
        let n = client_read.read(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 101"));

        let mut ws = server_task.await.unwrap();
        let reader = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            let n = ws.read(&mut byte).await.unwrap();
            assert_eq!(n, 0); // close frame becomes EOF
        });

        client_write
            .write_all(&client_frame(OPCODE_PING, b"ka", true))
            .await
            .unwrap();
        // Expect a pong echoing the payload.
        let mut pong = [0u8; 4];
        client_read.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong[0], 0x80 | OPCODE_PONG);
        assert_eq!(pong[1], 2);
        assert_eq!(&pong[2..], b"ka");

        client_write
            .write_all(&client_frame(OPCODE_CLOSE, &close_payload(CLOSE_NORMAL), true))
            .await
            .unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_fails_with_1009() {
        let (client, server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept(
                server,
                BytesMut::new(),
                WebSocketLimits {
                    max_handshake_bytes: 16 * 1024,
                    max_payload_bytes: 16,
                    max_buffer_bytes: 64,
                },
            )
            .await
            .unwrap()
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let request = "GET / HTTP/1.1\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        client_write.write_all(request.as_bytes()).await.unwrap();
        let mut response = vec![0u8; 1024];
        let n = client_read.read(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 101"));

        let mut ws = server_task.await.unwrap();
        client_write
            .write_all(&client_frame(OPCODE_BINARY, &[0u8; 64], true))
            .await
            .unwrap();

        let mut byte = [0u8; 1];
        assert!(ws.read(&mut byte).await.is_err());
        // The server queued a 1009 close before erroring out.
        let mut close = [0u8; 4];
        client_read.read_exact(&mut close).await.unwrap();
        assert_eq!(close[0], 0x80 | OPCODE_CLOSE);
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), CLOSE_TOO_BIG);
    }

    #[tokio::test]
    async fn bad_handshake_gets_400() {
        let (client, server) = duplex(8 * 1024);
        let server_task =
            tokio::spawn(async move { accept(server, BytesMut::new(), limits()).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = vec![0u8; 256];
        let n = client_read.read(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 400"));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(RfbError::Handshake(_))
        ));
    }
}
