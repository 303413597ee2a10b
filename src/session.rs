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

//! Per-connection RFB session: handshake, message dispatch, and the
//! capture-to-send update scheduler.
//!
//! Each session is driven by exactly one task and owns all of its state:
//! the socket (or WebSocket adapter), framebuffer snapshots, tile
//! hashes, and compression streams. The main loop multiplexes three
//! inputs - client bytes, server commands (clipboard/bell broadcasts),
//! and a pacing tick that runs the update pipeline:
//! capture -> diff -> select encoder per rectangle -> encode -> send.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::auth::VncAuthenticator;
use crate::config::{NetworkProfile, ServerConfig};
use crate::detector::ChangeDetector;
use crate::encoding::selector::{ContentHint, EncoderSelector, RectProfile, Selection};
use crate::encoding::{self, CompressionStreams, EncodeContext};
use crate::error::{Result, RfbError};
use crate::framebuffer::{FrameBuffer, Region};
use crate::protocol::{
    ClientMessage, DecodeLimits, PixelFormat, ProtocolVersion, Rectangle, ServerInit,
    ENCODING_CONTINUOUS_UPDATES, ENCODING_COPYRECT, ENCODING_CURSOR, ENCODING_DESKTOP_SIZE,
    ENCODING_EXTENDED_DESKTOP_SIZE, ENCODING_LAST_RECT, PROTOCOL_VERSION,
    SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH,
    SERVER_MSG_BELL, SERVER_MSG_END_OF_CONTINUOUS_UPDATES, SERVER_MSG_FRAMEBUFFER_UPDATE,
    SERVER_MSG_SERVER_CUT_TEXT,
};
use crate::source::{CaptureError, CursorShape, InputSink, ScreenSource};

/// Cadence of the scheduler tick; actual pacing is enforced against the
/// profile's frame interval on top of this.
const TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Minimum rectangle area worth a CopyRect source search.
const SCROLL_SEARCH_MIN_AREA: u64 = 32 * 32;

/// Commands the supervisor can push into a running session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Send ServerCutText with this (Latin-1) payload.
    ServerCutText(Vec<u8>),
    /// Ring the client's bell.
    Bell,
}

/// Connection lifecycle, used for logging and loop control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Accepted,
    VersionNegotiated,
    SecurityNegotiated,
    Initialized,
    Serving,
    Closing,
}

/// A client's advertised pseudo-encoding capabilities.
#[derive(Debug, Default, Clone, Copy)]
struct PseudoCaps {
    cursor: bool,
    desktop_size: bool,
    extended_desktop_size: bool,
    continuous_updates: bool,
    last_rect: bool,
}

/// An outstanding FramebufferUpdateRequest, possibly the union of a
/// coalesced burst.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    incremental: bool,
    region: Region,
    received: Instant,
}

/// Shared collaborators handed to every session.
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub source: Arc<dyn ScreenSource>,
    pub input: Arc<dyn InputSink>,
}

/// One RFB connection, exclusively owned by its driving task.
pub struct ClientSession<S> {
    stream: S,
    session_id: u64,
    config: Arc<ServerConfig>,
    source: Arc<dyn ScreenSource>,
    input: Arc<dyn InputSink>,
    profile: NetworkProfile,
    state: SessionState,
    version: ProtocolVersion,
    pixel_format: PixelFormat,
    client_encodings: Vec<i32>,
    caps: PseudoCaps,
    framebuffer: FrameBuffer,
    detector: ChangeDetector,
    selector: EncoderSelector,
    streams: CompressionStreams,
    pending: Option<PendingRequest>,
    continuous_region: Option<Region>,
    button_state: u8,
    read_buf: BytesMut,
    limits: DecodeLimits,
    last_send: Instant,
    /// Set after answering a clean incremental request with an empty
    /// update; cleared when anything changes on screen.
    sent_empty_since_change: bool,
    update_request_count: u32,
    /// Previous update's rectangles, for the dynamic-content hint.
    last_dirty: Vec<Region>,
    last_cursor: Option<CursorShape>,
    /// EndOfContinuousUpdates owed to the client (sent from the main
    /// loop so the message handler stays synchronous).
    cu_ack_pending: bool,
    cu_acked: bool,
    jpeg_quality: u8,
    last_activity: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)] // session wiring mirrors the supervisor's registry entry
    pub fn new(
        stream: S,
        peer: Option<IpAddr>,
        session_id: u64,
        ctx: &SessionContext,
        shutdown: watch::Receiver<bool>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        last_activity: Arc<AtomicU64>,
    ) -> Self {
        let config = ctx.config.clone();
        let profile = config.profile_for(peer);
        let selector = EncoderSelector::new(&config, profile);
        let streams = CompressionStreams::new(config.zrle_level(profile));
        let limits = DecodeLimits {
            max_set_encodings: config.max_set_encodings,
            max_client_cut_text: config.max_client_cut_text,
        };
        let jpeg_quality = config
            .lan_jpeg_quality_initial
            .clamp(config.lan_jpeg_quality_min, config.lan_jpeg_quality_max);
        Self {
            stream,
            session_id,
            source: ctx.source.clone(),
            input: ctx.input.clone(),
            profile,
            state: SessionState::Accepted,
            version: ProtocolVersion::Rfb38,
            pixel_format: PixelFormat::bgra32(),
            client_encodings: vec![crate::protocol::ENCODING_RAW],
            caps: PseudoCaps::default(),
            framebuffer: FrameBuffer::new(0, 0),
            detector: ChangeDetector::new(0, 0),
            selector,
            streams,
            pending: None,
            continuous_region: None,
            button_state: 0,
            read_buf: BytesMut::with_capacity(4096),
            limits,
            last_send: Instant::now(),
            sent_empty_since_change: false,
            update_request_count: 0,
            last_dirty: Vec::new(),
            last_cursor: None,
            cu_ack_pending: false,
            cu_acked: false,
            jpeg_quality,
            last_activity,
            shutdown,
            commands,
            config,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!(
            "session {}: {:?} -> {:?}",
            self.session_id,
            self.state,
            state
        );
        self.state = state;
    }

    /// Drive the connection from handshake to close.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_inner().await;
        self.set_state(SessionState::Closing);
        let _ = self.stream.shutdown().await;
        match &result {
            Ok(()) => log::info!("session {} closed", self.session_id),
            Err(e) if e.is_peer_error() => {
                log::info!("session {} closed: {e}", self.session_id);
            }
            Err(e) => log::warn!("session {} failed: {e}", self.session_id),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.handshake().await?;
        self.set_state(SessionState::Serving);

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        log::info!("session {} shutting down", self.session_id);
                        return Ok(());
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::ServerCutText(text)) => {
                            self.send_server_cut_text(&text).await?;
                        }
                        Some(SessionCommand::Bell) => self.send_bell().await?,
                        None => {} // supervisor gone; shutdown signal will follow
                    }
                }
                read = self.stream.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        return Ok(()); // peer closed
                    }
                    self.touch();
                    self.process_messages()?;
                    if self.cu_ack_pending {
                        self.cu_ack_pending = false;
                        self.send_end_of_continuous_updates().await?;
                    }
                }
                _ = tick.tick() => {
                    self.update_cycle().await?;
                }
            }
        }
    }

    fn touch(&self) {
        self.last_activity.store(unix_seconds(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn handshake(&mut self) -> Result<()> {
        self.stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;
        self.stream.flush().await?;

        let mut version_reply = [0u8; 12];
        self.stream.read_exact(&mut version_reply).await?;
        self.version = ProtocolVersion::negotiate(&version_reply);
        self.set_state(SessionState::VersionNegotiated);
        log::info!(
            "session {}: client version {:?} ({})",
            self.session_id,
            self.version,
            String::from_utf8_lossy(&version_reply).trim_end()
        );

        self.security_handshake().await?;
        self.set_state(SessionState::SecurityNegotiated);

        // ClientInit: the shared flag is honoured implicitly (this server
        // always permits sharing), so it is only logged.
        let mut shared = [0u8; 1];
        self.stream.read_exact(&mut shared).await?;
        log::info!(
            "session {}: ClientInit shared={}",
            self.session_id,
            shared[0]
        );

        // The screen source defines the framebuffer geometry.
        let frame = self.capture()?.ok_or_else(|| {
            RfbError::CaptureFatal("screen source empty during initialization".into())
        })?;
        self.framebuffer.install(&frame);
        self.detector
            .resize(self.framebuffer.width(), self.framebuffer.height());

        let server_init = ServerInit {
            framebuffer_width: self.framebuffer.width(),
            framebuffer_height: self.framebuffer.height(),
            pixel_format: PixelFormat::bgra32(),
            name: self.config.desktop_name.clone(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.set_state(SessionState::Initialized);
        log::info!(
            "session {}: initialized {}x{} \"{}\"",
            self.session_id,
            self.framebuffer.width(),
            self.framebuffer.height(),
            self.config.desktop_name
        );
        Ok(())
    }

    async fn security_handshake(&mut self) -> Result<()> {
        let security_type = if self.config.requires_auth() {
            SECURITY_TYPE_VNC_AUTH
        } else {
            SECURITY_TYPE_NONE
        };

        if self.version.has_security_list() {
            self.stream.write_all(&[1, security_type]).await?;
            self.stream.flush().await?;
            let mut chosen = [0u8; 1];
            self.stream.read_exact(&mut chosen).await?;
            if chosen[0] != security_type {
                self.send_security_result(false, "unsupported security type")
                    .await?;
                return Err(RfbError::Protocol(format!(
                    "client selected unsupported security type {}",
                    chosen[0]
                )));
            }
        } else {
            // 3.3: the server simply announces the type as a u32.
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(u32::from(security_type));
            self.stream.write_all(&buf).await?;
            self.stream.flush().await?;
        }

        if security_type == SECURITY_TYPE_VNC_AUTH {
            let auth = VncAuthenticator::new(&self.config.password);
            let challenge = VncAuthenticator::generate_challenge();
            self.stream.write_all(&challenge).await?;
            self.stream.flush().await?;

            let mut response = [0u8; 16];
            self.stream.read_exact(&mut response).await?;
            if !auth.verify(&challenge, &response) {
                self.send_security_result(false, "Authentication failed")
                    .await?;
                return Err(RfbError::Authentication);
            }
            self.send_security_result(true, "").await?;
        } else if self.version.sends_failure_reason() {
            // None: only 3.8 sends an explicit SecurityResult.
            self.send_security_result(true, "").await?;
        }
        Ok(())
    }

    async fn send_security_result(&mut self, ok: bool, reason: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u32(if ok {
            SECURITY_RESULT_OK
        } else {
            SECURITY_RESULT_FAILED
        });
        if !ok && self.version.sends_failure_reason() {
            buf.put_u32(reason.len() as u32);
            buf.put_slice(reason.as_bytes());
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client messages
    // ------------------------------------------------------------------

    fn process_messages(&mut self) -> Result<()> {
        while let Some(message) = ClientMessage::decode(&mut self.read_buf, &self.limits)? {
            self.handle_message(message)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::SetPixelFormat(format) => {
                if !format.is_valid() {
                    return Err(RfbError::Protocol(format!(
                        "invalid pixel format: {format:?}"
                    )));
                }
                log::info!(
                    "session {}: pixel format {}bpp depth {} shifts r{} g{} b{}",
                    self.session_id,
                    format.bits_per_pixel,
                    format.depth,
                    format.red_shift,
                    format.green_shift,
                    format.blue_shift
                );
                self.pixel_format = format;
                // The client re-requests after a format switch; whatever
                // was pending would be in the wrong format.
                self.pending = None;
            }
            ClientMessage::SetEncodings(encodings) => {
                self.caps = PseudoCaps {
                    cursor: encodings.contains(&ENCODING_CURSOR),
                    desktop_size: encodings.contains(&ENCODING_DESKTOP_SIZE),
                    extended_desktop_size: encodings.contains(&ENCODING_EXTENDED_DESKTOP_SIZE),
                    continuous_updates: encodings.contains(&ENCODING_CONTINUOUS_UPDATES),
                    last_rect: encodings.contains(&ENCODING_LAST_RECT),
                };
                log::info!(
                    "session {}: {} encodings {:?}, capabilities {:?}",
                    self.session_id,
                    encodings.len(),
                    encodings,
                    self.caps
                );
                self.client_encodings = encodings;
                if self.caps.continuous_updates && !self.cu_acked {
                    self.cu_acked = true;
                    self.cu_ack_pending = true;
                }
            }
            ClientMessage::FramebufferUpdateRequest {
                incremental,
                x,
                y,
                width,
                height,
            } => {
                self.update_request_count = self.update_request_count.saturating_add(1);
                let Some(region) = Region::new(x, y, width, height)
                    .clamp_to(self.framebuffer.width(), self.framebuffer.height())
                else {
                    return Ok(()); // nothing visible requested
                };
                let request = PendingRequest {
                    incremental,
                    region,
                    received: Instant::now(),
                };
                self.pending = Some(match self.pending {
                    Some(existing) if self.config.enable_request_coalescing => PendingRequest {
                        incremental: existing.incremental && incremental,
                        region: existing.region.union(&region),
                        received: existing.received,
                    },
                    _ => request,
                });
                if !incremental {
                    // A full refresh must be answered with pixels even if
                    // nothing changed.
                    self.sent_empty_since_change = false;
                }
            }
            ClientMessage::KeyEvent { down, keysym } => {
                self.input.inject_key(keysym, down);
            }
            ClientMessage::PointerEvent { button_mask, x, y } => {
                let transitions = button_mask ^ self.button_state;
                if transitions != 0 {
                    log::debug!(
                        "session {}: buttons changed {transitions:#010b}",
                        self.session_id
                    );
                }
                self.button_state = button_mask;
                self.input
                    .inject_pointer(i32::from(x), i32::from(y), button_mask);
            }
            ClientMessage::ClientCutText(text) => {
                self.input.set_clipboard(&text);
            }
            ClientMessage::EnableContinuousUpdates {
                enable,
                x,
                y,
                width,
                height,
            } => {
                if !self.caps.continuous_updates {
                    return Err(RfbError::Protocol(
                        "EnableContinuousUpdates without advertised support".into(),
                    ));
                }
                if enable {
                    self.continuous_region = Region::new(x, y, width, height)
                        .clamp_to(self.framebuffer.width(), self.framebuffer.height());
                    log::info!(
                        "session {}: continuous updates on {:?}",
                        self.session_id,
                        self.continuous_region
                    );
                } else {
                    self.continuous_region = None;
                    // Disabling is confirmed with EndOfContinuousUpdates.
                    self.cu_ack_pending = true;
                    log::info!("session {}: continuous updates off", self.session_id);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update scheduling
    // ------------------------------------------------------------------

    fn capture(&mut self) -> Result<Option<crate::source::CapturedFrame>> {
        match self.source.capture(None) {
            Ok(frame) => Ok(Some(frame)),
            Err(CaptureError::Unavailable) => Ok(None),
            Err(CaptureError::Fatal(msg)) => Err(RfbError::CaptureFatal(msg)),
        }
    }

    async fn update_cycle(&mut self) -> Result<()> {
        let cu_active = self.continuous_region.is_some();
        if self.pending.is_none() && !cu_active {
            return Ok(());
        }

        // Frame pacing per profile.
        let interval = self.config.frame_interval(self.profile);
        if !interval.is_zero() && self.last_send.elapsed() < interval {
            return Ok(());
        }

        let Some(frame) = self.capture()? else {
            return Ok(()); // transient capture failure: skip this cycle
        };

        let resized = self.framebuffer.install(&frame);
        if resized {
            self.detector
                .resize(self.framebuffer.width(), self.framebuffer.height());
            log::info!(
                "session {}: desktop resized to {}x{}",
                self.session_id,
                self.framebuffer.width(),
                self.framebuffer.height()
            );
        }

        let report_regions = if self.config.enable_region_detection {
            let report = self.detector.detect(self.framebuffer.pixels());
            report.regions
        } else {
            vec![Region::new(
                0,
                0,
                self.framebuffer.width(),
                self.framebuffer.height(),
            )]
        };
        if !report_regions.is_empty() {
            self.sent_empty_since_change = false;
        }

        // Scope to the request (or continuous) region.
        let scope = match (self.pending, self.continuous_region) {
            (Some(request), _) => request.region,
            (None, Some(region)) => region,
            (None, None) => return Ok(()),
        };
        let mut regions: Vec<Region> = report_regions
            .iter()
            .filter_map(|r| r.intersect(&scope))
            .collect();

        let incremental = self.pending.map_or(true, |p| p.incremental);
        if !incremental {
            // Non-incremental: re-send the whole requested region.
            regions = vec![scope];
        }

        if regions.is_empty() && !resized {
            return self.answer_clean_cycle(cu_active).await;
        }

        self.send_update(&regions, resized).await?;
        self.last_dirty = regions;
        self.pending = None;
        self.last_send = Instant::now();
        self.touch();
        Ok(())
    }

    /// Nothing changed. Depending on configuration either answer the
    /// pending request with an empty update now, hold it until the
    /// deferral deadline, or keep withholding after the first empty.
    async fn answer_clean_cycle(&mut self, cu_active: bool) -> Result<()> {
        let Some(request) = self.pending else {
            return Ok(()); // continuous mode pushes only on change
        };
        if !request.incremental {
            // A forced refresh always produces pixels, so getting here
            // means the region fell outside the framebuffer; answer with
            // an empty update to keep the request/response pairing.
            self.send_empty_update().await?;
            self.pending = None;
            return Ok(());
        }
        if !self.config.enable_request_coalescing {
            self.send_empty_update().await?;
            self.pending = None;
            return Ok(());
        }
        if cu_active {
            // The continuous stream will answer when a change arrives.
            return Ok(());
        }
        let deadline = self.config.deferral_deadline(self.profile);
        if self.detector.quiescent()
            && !self.sent_empty_since_change
            && request.received.elapsed() >= deadline
        {
            self.send_empty_update().await?;
            self.sent_empty_since_change = true;
            self.pending = None;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server messages
    // ------------------------------------------------------------------

    async fn send_empty_update(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(0);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn send_update(&mut self, regions: &[Region], resized: bool) -> Result<()> {
        // Pseudo-rectangles first: geometry, then cursor, then pixels.
        let mut pseudo = BytesMut::new();
        let mut pseudo_count = 0u16;

        if resized && (self.caps.extended_desktop_size || self.caps.desktop_size) {
            self.write_desktop_size_rect(&mut pseudo);
            pseudo_count += 1;
        }
        if self.config.enable_cursor_encoding && self.caps.cursor {
            if let Some(shape) = self.source.cursor() {
                if self.last_cursor.as_ref() != Some(&shape) {
                    self.write_cursor_rect(&mut pseudo, &shape);
                    self.last_cursor = Some(shape);
                    pseudo_count += 1;
                }
            }
        }

        let encoded = self.encode_regions(regions).await?;

        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(pseudo_count + encoded.len() as u16);
        buf.extend_from_slice(&pseudo);
        for (region, encoding_id, payload) in &encoded {
            Rectangle {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                encoding: *encoding_id,
            }
            .write_header(&mut buf);
            buf.extend_from_slice(payload);
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Encode every region, preserving detector order on the wire.
    /// Stateless rectangles may be encoded on the blocking pool when
    /// parallel encoding is enabled; stream-backed ones stay inline.
    async fn encode_regions(
        &mut self,
        regions: &[Region],
    ) -> Result<Vec<(Region, i32, Vec<u8>)>> {
        let fb_area = u64::from(self.framebuffer.width()) * u64::from(self.framebuffer.height());
        let zlib_warmed = self.update_request_count > self.config.lan_zlib_warmup_requests;

        // Pass 1: classify and select.
        let mut plan: Vec<(Region, Selection)> = Vec::with_capacity(regions.len());
        for &region in regions {
            let profile = self.profile_rect(&region, fb_area);
            let selection = self
                .selector
                .select(&profile, &self.client_encodings, zlib_warmed);
            plan.push((region, selection));
        }

        // Pass 2: encode. Parallel workers get an index so results can
        // be stitched back in detector order (CopyRect semantics depend
        // on it).
        let parallel = self.config.enable_parallel_encoding
            && plan
                .iter()
                .filter(|(_, s)| matches!(s, Selection::Encode(e) if e.is_stateless()))
                .count()
                > 1;

        let max_workers = self.config.encoding_threads.unwrap_or(usize::MAX).max(1);
        let mut results: Vec<Option<(Region, i32, Vec<u8>)>> = vec![None; plan.len()];
        let mut workers = Vec::new();

        for (index, &(region, selection)) in plan.iter().enumerate() {
            match selection {
                Selection::CopyRect { src_x, src_y } => {
                    results[index] =
                        Some((region, ENCODING_COPYRECT, encoding::encode_copy_rect(src_x, src_y)));
                }
                Selection::Encode(encoder)
                    if parallel && encoder.is_stateless() && workers.len() < max_workers =>
                {
                    let pixels = self.framebuffer.extract(&region);
                    let format = self.pixel_format.clone();
                    let (w, h) = (region.width, region.height);
                    workers.push((
                        index,
                        region,
                        tokio::task::spawn_blocking(move || {
                            encoder
                                .encode_stateless(&pixels, w, h, &format)
                                .expect("stateless encoder")
                        }),
                    ));
                }
                Selection::Encode(encoder) => {
                    let pixels = self.framebuffer.extract(&region);
                    let mut ctx = EncodeContext {
                        format: &self.pixel_format,
                        streams: &mut self.streams,
                        jpeg_quality: self.jpeg_quality,
                    };
                    let (id, payload) =
                        encoder.encode(&pixels, region.width, region.height, &mut ctx)?;
                    results[index] = Some((region, id, payload));
                }
            }
        }

        for (index, region, handle) in workers {
            let (id, payload) = handle
                .await
                .map_err(|e| RfbError::Encoder(format!("encoder worker failed: {e}")))?;
            results[index] = Some((region, id, payload));
        }

        Ok(results.into_iter().map(|r| r.expect("encoded rect")).collect())
    }

    fn profile_rect(&self, region: &Region, fb_area: u64) -> RectProfile {
        let area = region.area();
        let area_ratio = if fb_area == 0 {
            0.0
        } else {
            area as f64 / fb_area as f64
        };

        let copy_source = if area >= SCROLL_SEARCH_MIN_AREA
            && self.client_encodings.contains(&ENCODING_COPYRECT)
        {
            self.framebuffer.find_copy_source(region)
        } else {
            None
        };

        let hint = if copy_source.is_some() {
            ContentHint::Scrolling
        } else if self.framebuffer.is_mostly_solid(region) {
            ContentHint::Solid
        } else if self
            .last_dirty
            .iter()
            .any(|previous| previous.intersect(region).is_some())
        {
            ContentHint::Dynamic
        } else {
            ContentHint::Static
        };

        RectProfile {
            hint,
            area_ratio,
            pixel_count: area,
            copy_source,
        }
    }

    fn write_desktop_size_rect(&self, buf: &mut BytesMut) {
        let width = self.framebuffer.width();
        let height = self.framebuffer.height();
        if self.caps.extended_desktop_size {
            // x = reason (0: server-initiated), y = result code.
            Rectangle {
                x: 0,
                y: 0,
                width,
                height,
                encoding: ENCODING_EXTENDED_DESKTOP_SIZE,
            }
            .write_header(buf);
            buf.put_u8(1); // one screen
            buf.put_bytes(0, 3);
            buf.put_u32(1); // screen id
            buf.put_u16(0);
            buf.put_u16(0);
            buf.put_u16(width);
            buf.put_u16(height);
            buf.put_u32(0); // flags
        } else {
            Rectangle {
                x: 0,
                y: 0,
                width,
                height,
                encoding: ENCODING_DESKTOP_SIZE,
            }
            .write_header(buf);
        }
    }

    fn write_cursor_rect(&self, buf: &mut BytesMut, shape: &CursorShape) {
        Rectangle {
            x: shape.hotspot_x,
            y: shape.hotspot_y,
            width: shape.width,
            height: shape.height,
            encoding: ENCODING_CURSOR,
        }
        .write_header(buf);
        buf.extend_from_slice(&crate::translate::convert(&shape.pixels, &self.pixel_format));
        buf.extend_from_slice(&shape.mask);
    }

    async fn send_server_cut_text(&mut self, text: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 + text.len());
        buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        buf.put_bytes(0, 3);
        buf.put_u32(text.len() as u32);
        buf.put_slice(text);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_bell(&mut self) -> Result<()> {
        self.stream.write_all(&[SERVER_MSG_BELL]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Confirm the ContinuousUpdates extension to a client that just
    /// advertised it (or disabled it).
    async fn send_end_of_continuous_updates(&mut self) -> Result<()> {
        self.stream
            .write_all(&[SERVER_MSG_END_OF_CONTINUOUS_UPDATES])
            .await?;
        self.stream.flush().await?;
        Ok(())
    }
}
