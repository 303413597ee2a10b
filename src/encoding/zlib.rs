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

//! Zlib encoding (6): the Raw pixel bytes deflated through the
//! connection's dedicated persistent stream, framed as
//! `u32 compressed_length` + bytes.

use bytes::{BufMut, BytesMut};

use crate::encoding::streams::ZlibStream;
use crate::error::RfbError;
use crate::protocol::PixelFormat;
use crate::translate;

/// Encode one rectangle through the connection's Zlib stream.
pub fn encode(
    pixels_bgra: &[u8],
    format: &PixelFormat,
    stream: &mut ZlibStream,
) -> Result<Vec<u8>, RfbError> {
    let raw = translate::convert(pixels_bgra, format);
    let compressed = stream.compress(&raw)?;
    let mut out = BytesMut::with_capacity(4 + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.put_slice(&compressed);
    Ok(out.to_vec())
}
