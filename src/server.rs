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

//! Server supervisor: listener, connection pool, shutdown, health.
//!
//! The supervisor owns the listening socket and a registry of running
//! sessions. Each accepted connection gets its own task that owns its
//! socket end to end; the registry keeps only weak membership data -
//! session id, last-activity timestamp, a command channel, and the task
//! handle - never session-private state.
//!
//! Shutdown is cooperative: INT/TERM/HUP (or [`VncServer::shutdown`])
//! flip a watch flag every session observes at its next suspension
//! point. Sessions get a grace period to finish their current update,
//! then stragglers are aborted. A background health task reaps
//! connections idle past `client_socket_timeout`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::ServerConfig;
use crate::error::{Result, RfbError};
use crate::protocol::{ProtocolVersion, PROTOCOL_VERSION};
use crate::session::{ClientSession, SessionCommand, SessionContext};
use crate::source::{InputSink, ScreenSource};
use crate::transport;
use crate::websocket::WebSocketLimits;

/// Unique session ids across the server's lifetime.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How long sessions get to finish their current update on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Sent to clients rejected because the pool is full.
const POOL_FULL_REASON: &str = "Too many connections";

/// Point-in-time server health.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// False once a session died from a fatal capture error.
    pub healthy: bool,
    /// Time since the supervisor was created.
    pub uptime: Duration,
    /// Sessions currently registered.
    pub active_connections: usize,
    /// Connections accepted over the server's lifetime.
    pub total_connections: u64,
}

/// Weak registry entry for one running session.
struct SessionHandle {
    id: u64,
    peer: Option<SocketAddr>,
    last_activity: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// The VNC server supervisor.
#[derive(Clone)]
pub struct VncServer {
    config: Arc<ServerConfig>,
    source: Arc<dyn ScreenSource>,
    input: Arc<dyn InputSink>,
    sessions: Arc<RwLock<Vec<SessionHandle>>>,
    shutdown_tx: watch::Sender<bool>,
    started: Instant,
    total_connections: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl VncServer {
    /// Build a server around its external collaborators. Nothing is
    /// bound until [`VncServer::listen`].
    pub fn new(
        config: ServerConfig,
        source: Arc<dyn ScreenSource>,
        input: Arc<dyn InputSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            source,
            input,
            sessions: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            started: Instant::now(),
            total_connections: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Installs INT/TERM/HUP handlers (Unix) that trigger the same
    /// cooperative shutdown as [`VncServer::shutdown`].
    pub async fn listen(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("VNC server listening on {addr}");

        self.install_signal_handlers();
        let reaper = self.spawn_idle_reaper();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            // Per-connection task so a slow transport
                            // sniff cannot stall the accept loop.
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.accept_connection(stream, peer).await;
                            });
                        }
                        Err(e) => log::error!("accept failed: {e}"),
                    }
                }
            }
        }

        drop(listener); // stop accepting before draining sessions
        reaper.abort();
        self.drain_sessions().await;
        log::info!("VNC server stopped");
        Ok(())
    }

    /// Trigger cooperative shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current health snapshot. Degraded means a session hit a fatal
    /// capture error; the listener itself is still serving.
    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: !self.degraded.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
            active_connections: self.sessions.read().await.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }

    /// Push clipboard text to every connected client.
    pub async fn send_cut_text_to_all(&self, text: &[u8]) {
        let sessions = self.sessions.read().await;
        for session in sessions.iter() {
            let _ = session
                .commands
                .send(SessionCommand::ServerCutText(text.to_vec()));
        }
    }

    /// Ring the bell on every connected client.
    pub async fn send_bell_to_all(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.iter() {
            let _ = session.commands.send(SessionCommand::Bell);
        }
    }

    /// Serve an already-established connection from any byte stream.
    ///
    /// This is the seam the TCP accept path goes through, and it lets
    /// hosts bring their own transports. Pool limits apply. Returns the
    /// session id.
    pub async fn attach_stream<S>(&self, stream: S, peer: Option<IpAddr>) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.sessions.read().await.len() >= self.config.max_connections {
            tokio::spawn(reject_with_reason(stream));
            return Err(RfbError::ResourceLimit("connection pool full".into()));
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(AtomicU64::new(unix_seconds()));
        let ctx = SessionContext {
            config: self.config.clone(),
            source: self.source.clone(),
            input: self.input.clone(),
        };
        let session = ClientSession::new(
            stream,
            peer,
            id,
            &ctx,
            self.shutdown_tx.subscribe(),
            command_rx,
            last_activity.clone(),
        );

        let sessions = self.sessions.clone();
        let degraded = self.degraded.clone();
        let task = tokio::spawn(async move {
            let result = session.run().await;
            if let Err(RfbError::CaptureFatal(_)) = &result {
                degraded.store(true, Ordering::Relaxed);
            }
            // Drop our own registry entry; the JoinHandle inside simply
            // detaches.
            sessions.write().await.retain(|s| s.id != id);
        });

        self.sessions.write().await.push(SessionHandle {
            id,
            peer: None,
            last_activity,
            commands: command_tx,
            task,
        });
        Ok(id)
    }

    async fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        log::info!("connection from {peer}");
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("set_nodelay failed for {peer}: {e}");
        }

        let result = if self.config.enable_websocket {
            let limits = WebSocketLimits {
                max_handshake_bytes: self.config.websocket_max_handshake_bytes,
                max_payload_bytes: self.config.websocket_max_payload_bytes,
                max_buffer_bytes: self.config.websocket_max_buffer_bytes,
            };
            match transport::detect(stream, self.config.websocket_detect_timeout(), limits)
                .await
            {
                Ok(transport) => self.attach_stream(transport, Some(peer.ip())).await,
                Err(e) => {
                    log::info!("transport detection failed for {peer}: {e}");
                    return;
                }
            }
        } else {
            self.attach_stream(stream, Some(peer.ip())).await
        };

        match result {
            Ok(id) => {
                // Record the address for operator-facing enumeration.
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
                    session.peer = Some(peer);
                }
            }
            Err(e) => log::warn!("rejected connection from {peer}: {e}"),
        }
    }

    fn install_signal_handlers(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let shutdown_tx = self.shutdown_tx.clone();
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(mut int), Ok(mut term), Ok(mut hup)) => {
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = int.recv() => log::info!("SIGINT received"),
                            _ = term.recv() => log::info!("SIGTERM received"),
                            _ = hup.recv() => log::info!("SIGHUP received"),
                        }
                        let _ = shutdown_tx.send(true);
                    });
                }
                _ => log::warn!("failed to install signal handlers"),
            }
        }
    }

    /// Periodically drop connections with no traffic inside
    /// `client_socket_timeout`.
    fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
        let sessions = self.sessions.clone();
        let timeout = self.config.socket_timeout();
        tokio::spawn(async move {
            let period = (timeout / 4).max(Duration::from_secs(1));
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let now = unix_seconds();
                let mut guard = sessions.write().await;
                guard.retain(|session| {
                    let idle = now.saturating_sub(session.last_activity.load(Ordering::Relaxed));
                    if Duration::from_secs(idle) > timeout {
                        log::info!(
                            "dropping idle session {} (peer {:?}, idle {idle}s)",
                            session.id,
                            session.peer
                        );
                        session.task.abort();
                        false
                    } else {
                        true
                    }
                });
            }
        })
    }

    /// Give sessions the grace period to wind down, then abort the rest.
    async fn drain_sessions(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            std::mem::take(&mut *sessions)
        };
        if handles.is_empty() {
            return;
        }
        log::info!("waiting for {} session(s) to finish", handles.len());
        let start = Instant::now();
        for mut handle in handles {
            let remaining = SHUTDOWN_GRACE.saturating_sub(start.elapsed());
            if tokio::time::timeout(remaining, &mut handle.task).await.is_err() {
                log::warn!("session {} did not stop in time, aborting", handle.id);
                handle.task.abort();
            }
        }
    }
}

/// Tell a surplus client why it is being turned away.
///
/// 3.7/3.8 clients get an empty security-type list followed by a reason
/// string; a 3.3 client is simply closed, since its handshake has no
/// channel for a reason before the security word.
async fn reject_with_reason<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;
        stream.flush().await?;
        let mut reply = [0u8; 12];
        stream.read_exact(&mut reply).await?;
        let version = ProtocolVersion::negotiate(&reply);
        if version.has_security_list() {
            let mut buf = BytesMut::new();
            buf.put_u8(0); // zero security types: connection failed
            buf.put_u32(POOL_FULL_REASON.len() as u32);
            buf.put_slice(POOL_FULL_REASON.as_bytes());
            stream.write_all(&buf).await?;
            stream.flush().await?;
        }
        std::io::Result::Ok(())
    };
    // Bounded so a stalled client cannot pin the rejection task.
    let _ = tokio::time::timeout(Duration::from_secs(5), exchange).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{NullInputSink, StaticFrameSource};

    fn test_server(max_connections: usize) -> VncServer {
        let config = ServerConfig {
            max_connections,
            ..Default::default()
        };
        let source = Arc::new(StaticFrameSource::new(vec![0u8; 64 * 64 * 4], 64, 64));
        VncServer::new(config, source, Arc::new(NullInputSink))
    }

    #[tokio::test]
    async fn pool_cap_rejects_with_reason() {
        let server = test_server(0);
        let (client, server_end) = tokio::io::duplex(4096);
        let err = server.attach_stream(server_end, None).await.unwrap_err();
        assert!(matches!(err, RfbError::ResourceLimit(_)));

        // The rejected client still gets a protocol-level explanation.
        let (mut read, mut write) = tokio::io::split(client);
        let mut version = [0u8; 12];
        read.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, PROTOCOL_VERSION.as_bytes());
        write.write_all(b"RFB 003.008\n").await.unwrap();

        let mut count = [0u8; 1];
        read.read_exact(&mut count).await.unwrap();
        assert_eq!(count[0], 0);
        let mut len = [0u8; 4];
        read.read_exact(&mut len).await.unwrap();
        let mut reason = vec![0u8; u32::from_be_bytes(len) as usize];
        read.read_exact(&mut reason).await.unwrap();
        assert_eq!(reason, POOL_FULL_REASON.as_bytes());
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let server = test_server(4);
        let health = server.health().await;
        assert!(health.healthy);
        assert_eq!(health.active_connections, 0);
        assert_eq!(health.total_connections, 0);

        let (client, server_end) = tokio::io::duplex(4096);
        let id = server.attach_stream(server_end, None).await.unwrap();
        assert!(id > 0);
        let health = server.health().await;
        assert_eq!(health.active_connections, 1);
        assert_eq!(health.total_connections, 1);

        // Closing the peer ends the session; drain joins it.
        drop(client);
        server.shutdown();
        server.drain_sessions().await;
        assert_eq!(server.health().await.active_connections, 0);
    }
}
