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

//! VNC Authentication (security type 2, RFC 6143 Section 7.2.2).
//!
//! Challenge-response over DES with the historical VNC quirk: the
//! password is truncated or zero-padded to 8 bytes and each key byte has
//! its bits reversed before it is used as the DES key. The 16-byte
//! challenge is encrypted as two independent 8-byte ECB blocks.
//!
//! VNC Authentication is a legacy scheme; use it only on trusted
//! networks or behind an encrypted tunnel.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Verifier for the VNC authentication handshake of a single connection.
pub struct VncAuthenticator {
    key: [u8; 8],
}

impl VncAuthenticator {
    /// Build an authenticator from the configured password. The password
    /// is truncated or zero-padded to 8 bytes per the protocol.
    pub fn new(password: &str) -> Self {
        let mut key = [0u8; 8];
        for (slot, &byte) in key.iter_mut().zip(password.as_bytes().iter().take(8)) {
            *slot = reverse_bits(byte);
        }
        Self { key }
    }

    /// Generate the random 16-byte challenge sent to the client.
    pub fn generate_challenge() -> [u8; 16] {
        let mut challenge = [0u8; 16];
        rand::rng().fill(&mut challenge);
        challenge
    }

    /// Check the client's 16-byte response against our own encryption of
    /// the challenge.
    pub fn verify(&self, challenge: &[u8; 16], response: &[u8]) -> bool {
        response == self.encrypt(challenge)
    }

    /// Encrypt the challenge as two 8-byte DES blocks in ECB mode.
    pub fn encrypt(&self, challenge: &[u8; 16]) -> [u8; 16] {
        // An 8-byte key can never be rejected here.
        let cipher = Des::new_from_slice(&self.key).expect("8-byte DES key");

        let mut out = [0u8; 16];
        for (i, block) in challenge.chunks_exact(8).enumerate() {
            let mut chunk: [u8; 8] = block.try_into().expect("8-byte block");
            let mut ga = chunk.into();
            cipher.encrypt_block(&mut ga);
            chunk.copy_from_slice(&ga);
            out[i * 8..(i + 1) * 8].copy_from_slice(&chunk);
        }
        out
    }
}

/// Reverse the bits within one byte, the "VNC bit-swap" applied to every
/// password byte before keying DES.
fn reverse_bits(byte: u8) -> u8 {
    byte.reverse_bits()
}
