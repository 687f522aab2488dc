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

use vodozemac::{Ed25519Keypair, Ed25519PublicKey};

use super::{
    message::MegolmMessage,
    ratchet::MegolmRatchet,
    session_keys::{ExportedSessionKey, SessionKey},
};

/// The sending side of a Megolm session.
///
/// Every message gets encrypted with the next key the ratchet produces and
/// signed with the Ed25519 key of the session.
pub struct GroupSession {
    ratchet: MegolmRatchet,
    signing_key: Ed25519Keypair,
}

impl fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSession")
            .field("session_id", &self.session_id())
            .field("message_index", &self.message_index())
            .finish_non_exhaustive()
    }
}

impl GroupSession {
    /// Create a new random group session.
    pub fn new() -> Self {
        Self { ratchet: MegolmRatchet::new(), signing_key: Ed25519Keypair::new() }
    }

    /// The ID of the session, the base64 encoded public signing key.
    pub fn session_id(&self) -> String {
        self.signing_key.public_key().to_base64()
    }

    /// The public part of the key signing the messages of this session.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key.public_key()
    }

    /// The index the next message will be encrypted with.
    pub fn message_index(&self) -> u32 {
        self.ratchet.index()
    }

    /// The signed session key at the current index, to be shared with the
    /// room members.
    pub fn session_key(&self) -> SessionKey {
        let signing_key = self.signing_key.public_key();
        let signed =
            SessionKey::signed_bytes(self.ratchet.index(), &self.ratchet.to_bytes(), &signing_key);
        let signature = self.signing_key.sign(&signed);

        SessionKey::new(&self.ratchet, signing_key, signature)
    }

    /// Export the session at the current index.
    pub fn export(&self) -> ExportedSessionKey {
        ExportedSessionKey::new(&self.ratchet, self.signing_key.public_key())
    }

    /// Encrypt the plaintext and move the ratchet forward.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> MegolmMessage {
        let cipher = self.ratchet.cipher();
        let message_index = self.ratchet.index();

        let ciphertext = cipher.encrypt(plaintext);
        let body = MegolmMessage::encode_body(message_index, &ciphertext);
        let mac = cipher.create_truncated_mac(&body);

        let signature = self.signing_key.sign(&[body.as_slice(), mac.as_slice()].concat());

        self.ratchet.advance();

        MegolmMessage::new(message_index, ciphertext, body, mac, signature)
    }
}

impl Default for GroupSession {
    fn default() -> Self {
        Self::new()
    }
}
