// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! The Olm message wire format.
//!
//! ```text
//! +---------+-------------------------------------------+--------+
//! | version | protobuf fields                           | MAC    |
//! | 0x03    | 1: ratchet key, 2: chain index, 4: body   | 8 bytes|
//! +---------+-------------------------------------------+--------+
//! ```
//!
//! The MAC covers the version byte and all the fields.

use std::fmt;

use prost::Message;
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey};

use crate::{ciphers::TRUNCATED_MAC_SIZE, utilities::MessageDecodeError};

const VERSION: u8 = 3;

#[derive(Clone, PartialEq, Message)]
struct OlmMessageBody {
    #[prost(bytes = "vec", optional, tag = "1")]
    ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    chain_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    ciphertext: Option<Vec<u8>>,
}

/// An encrypted Olm message.
#[derive(Clone, PartialEq, Eq)]
pub struct OlmMessage {
    ratchet_key: Curve25519PublicKey,
    chain_index: u32,
    ciphertext: Vec<u8>,
    /// The encoded version byte and fields, the MAC input.
    body: Vec<u8>,
    mac: [u8; TRUNCATED_MAC_SIZE],
}

impl fmt::Debug for OlmMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OlmMessage")
            .field("ratchet_key", &self.ratchet_key)
            .field("chain_index", &self.chain_index)
            .field("ciphertext_length", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl OlmMessage {
    pub(crate) fn new(
        ratchet_key: Curve25519PublicKey,
        chain_index: u32,
        ciphertext: Vec<u8>,
    ) -> Self {
        let fields = OlmMessageBody {
            ratchet_key: Some(ratchet_key.to_bytes().to_vec()),
            chain_index: Some(chain_index),
            ciphertext: Some(ciphertext.clone()),
        };

        let mut body = vec![VERSION];
        body.extend(fields.encode_to_vec());

        Self { ratchet_key, chain_index, ciphertext, body, mac: [0u8; TRUNCATED_MAC_SIZE] }
    }

    /// The ratchet key of the chain the message was encrypted with.
    pub fn ratchet_key(&self) -> Curve25519PublicKey {
        self.ratchet_key
    }

    /// The index of the message in its chain.
    pub fn chain_index(&self) -> u32 {
        self.chain_index
    }

    /// The encrypted payload.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub(crate) fn mac_input(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn mac(&self) -> &[u8] {
        &self.mac
    }

    pub(crate) fn set_mac(&mut self, mac: [u8; TRUNCATED_MAC_SIZE]) {
        self.mac = mac;
    }

    /// Decode a message from its binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageDecodeError> {
        let minimal_length = 1 + TRUNCATED_MAC_SIZE;

        if bytes.len() < minimal_length {
            return Err(MessageDecodeError::MessageTooShort {
                expected: minimal_length,
                got: bytes.len(),
            });
        }

        if bytes[0] != VERSION {
            return Err(MessageDecodeError::UnsupportedVersion(bytes[0]));
        }

        let (body, mac) = bytes.split_at(bytes.len() - TRUNCATED_MAC_SIZE);

        let fields = OlmMessageBody::decode(&body[1..])?;

        let ratchet_key = fields
            .ratchet_key
            .and_then(|key| Curve25519PublicKey::from_slice(&key).ok())
            .ok_or(MessageDecodeError::InvalidField("ratchet_key"))?;

        let mut mac_bytes = [0u8; TRUNCATED_MAC_SIZE];
        mac_bytes.copy_from_slice(mac);

        Ok(Self {
            ratchet_key,
            chain_index: fields
                .chain_index
                .ok_or(MessageDecodeError::InvalidField("chain_index"))?,
            ciphertext: fields.ciphertext.ok_or(MessageDecodeError::InvalidField("ciphertext"))?,
            body: body.to_vec(),
            mac: mac_bytes,
        })
    }

    /// Encode the message into its binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.body.as_slice(), self.mac.as_slice()].concat()
    }

    /// Decode a message from unpadded base64.
    pub fn from_base64(message: &str) -> Result<Self, MessageDecodeError> {
        Self::from_bytes(&base64_decode(message)?)
    }

    /// Encode the message as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.to_bytes())
    }
}
