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

//! Persistent per-connection deflate streams.
//!
//! RFB requires zlib continuity across updates: the client feeds every
//! ZRLE/Zlib/Tight payload of a connection into one long-lived inflater
//! per stream, so the server must compress through matching long-lived
//! deflaters. Streams are created lazily, flushed with `Z_SYNC_FLUSH` at
//! every update boundary so the client can frame individual updates, and
//! NEVER reset mid-session - a reset would desynchronise the peer's
//! dictionary. They die with the session.

use flate2::{Compress, Compression, FlushCompress};

use crate::error::RfbError;

/// One persistent deflate context.
pub struct ZlibStream {
    compress: Compress,
}

impl ZlibStream {
    /// Fresh deflate context at the given level (clamped to 0..=9).
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.min(9)), true),
        }
    }

    /// Compress `input` and flush with `Z_SYNC_FLUSH`, preserving the
    /// dictionary for the next call.
    ///
    /// A failure here is fatal for the connection: once the deflater
    /// errors, the peer's inflater state is unrecoverable.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, RfbError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut chunk = vec![0u8; input.len().clamp(4096, 256 * 1024) + 64];
        let mut consumed = 0usize;

        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            self.compress
                .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| RfbError::Encoder(format!("deflate failed: {e}")))?;

            let in_used = (self.compress.total_in() - before_in) as usize;
            let out_used = (self.compress.total_out() - before_out) as usize;
            consumed += in_used;
            out.extend_from_slice(&chunk[..out_used]);

            if consumed >= input.len() {
                // Flush is complete once the deflater had spare output
                // space left over.
                if out_used < chunk.len() {
                    break;
                }
            } else if in_used == 0 && out_used == 0 {
                return Err(RfbError::Encoder("deflate made no progress".into()));
            }
        }
        Ok(out)
    }
}

/// The up-to-four deflate contexts a connection may own: one for ZRLE,
/// one for Zlib, and Tight's streams 0..3 (0 = full-colour, 1 = mono,
/// 2 = indexed palette, 3 = reserved).
pub struct CompressionStreams {
    level: u32,
    zrle: Option<ZlibStream>,
    zlib: Option<ZlibStream>,
    tight: [Option<ZlibStream>; 4],
}

impl CompressionStreams {
    /// Empty stream set; contexts are created on first use at `level`.
    pub fn new(level: u32) -> Self {
        Self {
            level,
            zrle: None,
            zlib: None,
            tight: [None, None, None, None],
        }
    }

    /// The ZRLE stream.
    pub fn zrle(&mut self) -> &mut ZlibStream {
        self.zrle.get_or_insert_with(|| ZlibStream::new(self.level))
    }

    /// The Zlib-encoding stream.
    pub fn zlib(&mut self) -> &mut ZlibStream {
        self.zlib.get_or_insert_with(|| ZlibStream::new(self.level))
    }

    /// One of Tight's four streams.
    pub fn tight(&mut self, stream_id: usize) -> &mut ZlibStream {
        debug_assert!(stream_id < 4);
        self.tight[stream_id].get_or_insert_with(|| ZlibStream::new(self.level))
    }
}
