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

//! Server configuration and network profiles.
//!
//! [`ServerConfig`] carries every recognised option with its default; hosts
//! construct it directly or deserialize it from whatever configuration layer
//! they use (file, CLI, environment). The server itself never parses files.
//!
//! [`NetworkProfile`] drives encoder selection and frame pacing. It is
//! autodetected from the peer address unless `network_profile_override`
//! pins it.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Coarse classification of the path between server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProfile {
    /// Client connects over the loopback interface.
    Localhost,
    /// Client is on a private or link-local network.
    Lan,
    /// Everything else.
    Wan,
}

impl NetworkProfile {
    /// Classify a peer address. Unparseable or public addresses get the
    /// most conservative profile.
    pub fn detect(peer: IpAddr) -> Self {
        if peer.is_loopback() {
            return NetworkProfile::Localhost;
        }
        let private = match peer {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => {
                // fc00::/7 unique-local, fe80::/10 link-local
                let seg = v6.segments()[0];
                (seg & 0xfe00) == 0xfc00 || (seg & 0xffc0) == 0xfe80
            }
        };
        if private {
            NetworkProfile::Lan
        } else {
            NetworkProfile::Wan
        }
    }
}

/// Complete server configuration with RFC-conservative defaults.
///
/// Field names and defaults follow the recognised option list; unknown
/// fields in deserialized input are rejected so typos surface early.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the listening socket.
    pub host: String,
    /// Listening TCP port serving both raw RFB and WebSocket.
    pub port: u16,
    /// VNC password. Empty disables VNC authentication (None only).
    pub password: String,
    /// Desktop name advertised in ServerInit.
    pub desktop_name: String,

    /// Target FPS on WAN profiles.
    pub frame_rate: u32,
    /// Target FPS on LAN profiles.
    pub lan_frame_rate: u32,
    /// Pin the network profile instead of autodetecting from the peer IP.
    pub network_profile_override: Option<NetworkProfile>,
    /// Capture downscale factor, for screen sources that support
    /// scaling. The protocol core never rescales pixels itself.
    pub scale_factor: f64,

    /// Connection pool cap. Arrivals beyond it are rejected.
    pub max_connections: usize,
    /// When false, every update covers the full framebuffer instead of the
    /// change detector's rectangles.
    pub enable_region_detection: bool,
    /// Offer the cursor pseudo-encoding to clients that support it.
    pub enable_cursor_encoding: bool,

    /// Offer the Tight encoding.
    pub enable_tight_encoding: bool,
    /// Allow Tight's lossy JPEG mode (requires the `turbojpeg` feature).
    pub enable_jpeg_encoding: bool,
    /// Accepted for compatibility; no H.264 encoder is registered.
    pub enable_h264_encoding: bool,
    /// Encode independent rectangles on a bounded worker pool.
    pub enable_parallel_encoding: bool,
    /// Suppress Tight entirely for UltraVNC viewer compatibility.
    pub tight_disable_for_ultravnc: bool,
    /// Worker count for parallel encoding. None lets the runtime decide.
    pub encoding_threads: Option<usize>,

    /// Accept WebSocket upgrades on the VNC port.
    pub enable_websocket: bool,
    /// How long to wait for the first bytes when sniffing the transport.
    pub websocket_detect_timeout: f64,
    /// Upper bound on the HTTP upgrade request.
    pub websocket_max_handshake_bytes: usize,
    /// Per-frame payload cap; larger frames close with 1009.
    pub websocket_max_payload_bytes: usize,
    /// Reassembly buffer cap across continuation frames.
    pub websocket_max_buffer_bytes: usize,

    /// Upper bound on the SetEncodings list length.
    pub max_set_encodings: usize,
    /// Upper bound on ClientCutText payloads.
    pub max_client_cut_text: usize,
    /// Idle connections past this many seconds are dropped.
    pub client_socket_timeout: f64,
    /// Merge bursts of FramebufferUpdateRequests into one pending request.
    pub enable_request_coalescing: bool,

    // LAN tuning. Area thresholds are fractions of the framebuffer.
    /// Rectangles below this share of the screen go Raw on LAN.
    pub lan_raw_area_threshold: f64,
    /// Raw is skipped above this pixel count even under the threshold.
    pub lan_raw_max_pixels: u32,
    /// Consider Zlib at all for large LAN rectangles.
    pub lan_prefer_zlib: bool,
    /// Minimum screen share before Zlib is considered.
    pub lan_zlib_area_threshold: f64,
    /// Minimum pixel count before Zlib is considered.
    pub lan_zlib_min_pixels: u32,
    /// Deflate level for the LAN Zlib stream.
    pub lan_zlib_compression_level: u32,
    /// Number of update requests before Zlib is considered warmed up.
    pub lan_zlib_warmup_requests: u32,
    /// Minimum screen share before JPEG is considered.
    pub lan_jpeg_area_threshold: f64,
    /// Minimum pixel count before JPEG is considered.
    pub lan_jpeg_min_pixels: u32,
    /// Starting JPEG quality.
    pub lan_jpeg_quality_initial: u8,
    /// Lower bound for adaptive JPEG quality.
    pub lan_jpeg_quality_min: u8,
    /// Upper bound for adaptive JPEG quality.
    pub lan_jpeg_quality_max: u8,
    /// ZRLE deflate level on LAN profiles.
    pub lan_zrle_compression_level: u32,
    /// ZRLE deflate level on WAN profiles.
    pub wan_zrle_compression_level: u32,

    /// Log level hint for the host's logger setup.
    pub log_level: String,
    /// Log file hint for the host's logger setup.
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5900,
            password: String::new(),
            desktop_name: "PyVNC".to_string(),
            frame_rate: 30,
            lan_frame_rate: 60,
            network_profile_override: None,
            scale_factor: 1.0,
            max_connections: 10,
            enable_region_detection: true,
            enable_cursor_encoding: false,
            enable_tight_encoding: false,
            enable_jpeg_encoding: false,
            enable_h264_encoding: false,
            enable_parallel_encoding: false,
            tight_disable_for_ultravnc: true,
            encoding_threads: None,
            enable_websocket: true,
            websocket_detect_timeout: 0.25,
            websocket_max_handshake_bytes: 16 * 1024,
            websocket_max_payload_bytes: 16 * 1024 * 1024,
            websocket_max_buffer_bytes: 32 * 1024 * 1024,
            max_set_encodings: 32,
            max_client_cut_text: 1024 * 1024,
            client_socket_timeout: 30.0,
            enable_request_coalescing: true,
            lan_raw_area_threshold: 0.02,
            lan_raw_max_pixels: 65_536,
            lan_prefer_zlib: true,
            lan_zlib_area_threshold: 0.25,
            lan_zlib_min_pixels: 262_144,
            lan_zlib_compression_level: 3,
            lan_zlib_warmup_requests: 10,
            lan_jpeg_area_threshold: 0.5,
            lan_jpeg_min_pixels: 262_144,
            lan_jpeg_quality_initial: 80,
            lan_jpeg_quality_min: 40,
            lan_jpeg_quality_max: 95,
            lan_zrle_compression_level: 3,
            wan_zrle_compression_level: 6,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the profile for a peer, honouring the override.
    pub fn profile_for(&self, peer: Option<IpAddr>) -> NetworkProfile {
        if let Some(profile) = self.network_profile_override {
            return profile;
        }
        match peer {
            Some(ip) => NetworkProfile::detect(ip),
            None => NetworkProfile::Wan,
        }
    }

    /// Minimum spacing between framebuffer updates for a profile.
    /// Localhost is unpaced.
    pub fn frame_interval(&self, profile: NetworkProfile) -> Duration {
        let fps = match profile {
            NetworkProfile::Localhost => return Duration::ZERO,
            NetworkProfile::Lan => self.lan_frame_rate,
            NetworkProfile::Wan => self.frame_rate,
        };
        if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / f64::from(fps))
        }
    }

    /// How long a clean incremental request may be deferred before the
    /// server answers with an empty update.
    pub fn deferral_deadline(&self, profile: NetworkProfile) -> Duration {
        let interval = self.frame_interval(profile);
        if interval.is_zero() {
            // Localhost still needs a bound so idle clients get an answer.
            Duration::from_millis(66)
        } else {
            interval * 2
        }
    }

    /// Whether VNC authentication is required.
    pub fn requires_auth(&self) -> bool {
        !self.password.is_empty()
    }

    /// ZRLE deflate level for a profile.
    pub fn zrle_level(&self, profile: NetworkProfile) -> u32 {
        match profile {
            NetworkProfile::Wan => self.wan_zrle_compression_level,
            _ => self.lan_zrle_compression_level,
        }
    }

    /// `client_socket_timeout` as a [`Duration`].
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.client_socket_timeout)
    }

    /// `websocket_detect_timeout` as a [`Duration`].
    pub fn websocket_detect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.websocket_detect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_detection() {
        assert_eq!(
            NetworkProfile::detect("127.0.0.1".parse().unwrap()),
            NetworkProfile::Localhost
        );
        assert_eq!(
            NetworkProfile::detect("::1".parse().unwrap()),
            NetworkProfile::Localhost
        );
        assert_eq!(
            NetworkProfile::detect("192.168.1.20".parse().unwrap()),
            NetworkProfile::Lan
        );
        assert_eq!(
            NetworkProfile::detect("10.0.0.7".parse().unwrap()),
            NetworkProfile::Lan
        );
        assert_eq!(
            NetworkProfile::detect("172.20.1.1".parse().unwrap()),
            NetworkProfile::Lan
        );
        assert_eq!(
            NetworkProfile::detect("169.254.9.9".parse().unwrap()),
            NetworkProfile::Lan
        );
        assert_eq!(
            NetworkProfile::detect("8.8.8.8".parse().unwrap()),
            NetworkProfile::Wan
        );
        assert_eq!(
            NetworkProfile::detect("fe80::1".parse().unwrap()),
            NetworkProfile::Lan
        );
        assert_eq!(
            NetworkProfile::detect("2001:db8::1".parse().unwrap()),
            NetworkProfile::Wan
        );
    }

    #[test]
    fn override_wins() {
        let config = ServerConfig {
            network_profile_override: Some(NetworkProfile::Wan),
            ..Default::default()
        };
        assert_eq!(
            config.profile_for(Some("127.0.0.1".parse().unwrap())),
            NetworkProfile::Wan
        );
    }

    #[test]
    fn frame_pacing() {
        let config = ServerConfig::default();
        assert_eq!(
            config.frame_interval(NetworkProfile::Localhost),
            Duration::ZERO
        );
        assert_eq!(
            config.frame_interval(NetworkProfile::Wan),
            Duration::from_secs_f64(1.0 / 30.0)
        );
        assert_eq!(
            config.frame_interval(NetworkProfile::Lan),
            Duration::from_secs_f64(1.0 / 60.0)
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5900);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_set_encodings, 32);
        assert_eq!(config.max_client_cut_text, 1024 * 1024);
        assert!((config.websocket_detect_timeout - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.websocket_max_handshake_bytes, 16 * 1024);
        assert!(!config.requires_auth());
        assert!(config.enable_request_coalescing);
    }
}
