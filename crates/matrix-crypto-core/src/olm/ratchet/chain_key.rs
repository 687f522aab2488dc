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

use std::fmt;

use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ciphers::{hmac_sha256, AesHmacSha2Key, OLM_KEYS_INFO},
    olm::messages::OlmMessage,
    pickle::{
        PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter, U32_PICKLE_LENGTH,
    },
    OlmError,
};

const MESSAGE_KEY_SEED: &[u8; 1] = b"\x01";
const CHAIN_KEY_SEED: &[u8; 1] = b"\x02";

/// The length of a chain key or a message key.
pub const KEY_LENGTH: usize = 32;

/// The symmetric half of the Double Ratchet.
///
/// Every message key of a chain is derived from the chain key at the
/// corresponding index, the chain key itself only ever moves forward.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: Box<[u8; KEY_LENGTH]>,
    index: u32,
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

impl ChainKey {
    /// The number of bytes a pickled chain key occupies.
    pub const PICKLE_LENGTH: usize = KEY_LENGTH + U32_PICKLE_LENGTH;

    /// Create a new chain key at index 0.
    pub fn new(key: Box<[u8; KEY_LENGTH]>) -> Self {
        Self { key, index: 0 }
    }

    /// The index of the message key this chain key will produce next.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The raw chain key.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Move the chain one step forward.
    ///
    /// `key' = HMAC-SHA-256(key, 0x02)`, `index' = index + 1`.
    pub fn advance(&mut self) {
        let mut next = hmac_sha256(self.key.as_slice(), CHAIN_KEY_SEED);
        self.key.copy_from_slice(&next);
        next.zeroize();

        self.index = self.index.wrapping_add(1);
    }

    /// Return the chain key one step further, leaving `self` untouched.
    pub fn next(&self) -> ChainKey {
        let mut next = self.clone();
        next.advance();

        next
    }

    /// Derive the message key for the current index.
    ///
    /// `message_key = HMAC-SHA-256(key, 0x01)`.
    pub fn create_message_key(&self) -> MessageKey {
        let mut key = hmac_sha256(self.key.as_slice(), MESSAGE_KEY_SEED);
        let message_key = MessageKey::new(&key, self.index);
        key.zeroize();

        message_key
    }
}

impl PickleEncode for ChainKey {
    fn pickle_len(&self) -> usize {
        Self::PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_bytes(self.key.as_slice())?;
        writer.write_u32(self.index)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for ChainKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let key = reader.read_secret()?;
        let index = reader.read_u32()?;

        Ok((Self { key, index }, reader.consumed()))
    }
}

/// A single-use key encrypting exactly one Olm message.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: Box<[u8]>,
    index: u32,
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

impl MessageKey {
    /// The number of bytes a pickled message key occupies.
    pub const PICKLE_LENGTH: usize = KEY_LENGTH + U32_PICKLE_LENGTH;

    /// Create a message key from raw key material.
    ///
    /// Key material of a length other than 32 bytes is kept as is but will be
    /// pickled as an all-zero key.
    pub fn new(key: &[u8], index: u32) -> Self {
        Self { key: key.into(), index }
    }

    /// The chain index this key belongs to.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The raw message key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    fn cipher(&self) -> AesHmacSha2Key {
        AesHmacSha2Key::from_secret(&self.key, OLM_KEYS_INFO)
    }

    /// Encrypt a plaintext into an Olm message sent from `ratchet_key`.
    pub(crate) fn encrypt(&self, ratchet_key: Curve25519PublicKey, plaintext: &[u8]) -> OlmMessage {
        let cipher = self.cipher();
        let ciphertext = cipher.encrypt(plaintext);

        let mut message = OlmMessage::new(ratchet_key, self.index, ciphertext);
        let mac = cipher.create_truncated_mac(message.mac_input());
        message.set_mac(mac);

        message
    }

    /// Check the MAC of the message and decrypt it.
    pub(crate) fn decrypt(&self, message: &OlmMessage) -> Result<Vec<u8>, OlmError> {
        let cipher = self.cipher();

        cipher
            .verify_truncated_mac(message.mac_input(), message.mac())
            .map_err(|_| OlmError::InvalidMac)?;

        cipher.decrypt(message.ciphertext()).map_err(|_| OlmError::InvalidPadding)
    }
}

impl PickleEncode for MessageKey {
    fn pickle_len(&self) -> usize {
        Self::PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_fixed_bytes(&self.key, KEY_LENGTH)?;
        writer.write_u32(self.index)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for MessageKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let key: Box<[u8]> = reader.read_secret::<KEY_LENGTH>()?;
        let index = reader.read_u32()?;

        Ok((Self { key, index }, reader.consumed()))
    }
}
