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

use hkdf::Hkdf;
use sha2::Sha256;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    chain_key::{ChainKey, KEY_LENGTH},
    chains::RatchetKeyPair,
};
use crate::pickle::{PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter};

const ROOT_INFO: &[u8] = b"OLM_ROOT";
const RATCHET_INFO: &[u8] = b"OLM_RATCHET";

/// The root of the Double Ratchet, every Diffie-Hellman step mixes a new
/// shared secret into it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct RootKey {
    key: Box<[u8; KEY_LENGTH]>,
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKey").finish_non_exhaustive()
    }
}

fn split_secret(mut expanded: Box<[u8; 2 * KEY_LENGTH]>) -> (RootKey, ChainKey) {
    let mut root_key = Box::new([0u8; KEY_LENGTH]);
    let mut chain_key = Box::new([0u8; KEY_LENGTH]);

    root_key.copy_from_slice(&expanded[..KEY_LENGTH]);
    chain_key.copy_from_slice(&expanded[KEY_LENGTH..]);
    expanded.zeroize();

    (RootKey { key: root_key }, ChainKey::new(chain_key))
}

impl RootKey {
    /// Derive the initial root key and chain key out of the secret both sides
    /// agreed on when the session was created.
    pub(crate) fn from_shared_secret(shared_secret: &[u8]) -> (RootKey, ChainKey) {
        let mut expanded = Box::new([0u8; 2 * KEY_LENGTH]);

        Hkdf::<Sha256>::new(None, shared_secret)
            .expand(ROOT_INFO, expanded.as_mut_slice())
            .expect("We should be able to expand the shared secret into 64 bytes");

        split_secret(expanded)
    }

    /// Perform a Diffie-Hellman ratchet step.
    ///
    /// Returns the new root key and the chain key of the chain belonging to
    /// the exchanged ratchet keys.
    pub(crate) fn advance(
        &self,
        our_ratchet_key: &RatchetKeyPair,
        their_ratchet_key: &Curve25519PublicKey,
    ) -> (RootKey, ChainKey) {
        let shared_secret = our_ratchet_key.secret_key().diffie_hellman(their_ratchet_key);
        let mut expanded = Box::new([0u8; 2 * KEY_LENGTH]);

        Hkdf::<Sha256>::new(Some(self.key.as_slice()), shared_secret.as_bytes())
            .expand(RATCHET_INFO, expanded.as_mut_slice())
            .expect("We should be able to expand the shared secret into 64 bytes");

        split_secret(expanded)
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl PickleEncode for RootKey {
    fn pickle_len(&self) -> usize {
        KEY_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_bytes(self.key.as_slice())?;

        Ok(writer.finish())
    }
}

impl PickleDecode for RootKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let key = reader.read_secret()?;

        Ok((Self { key }, reader.consumed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_keys() {
        let (root_key, _) = RootKey::from_shared_secret(b"shared secret");

        let alice = RatchetKeyPair::new();
        let bob = RatchetKeyPair::new();

        let (alice_root, alice_chain) = root_key.advance(&alice, &bob.public_key());
        let (bob_root, bob_chain) = root_key.advance(&bob, &alice.public_key());

        assert_eq!(alice_root.as_bytes(), bob_root.as_bytes());
        assert_eq!(alice_chain.as_bytes(), bob_chain.as_bytes());
        assert_eq!(alice_chain.index(), 0);
        assert_ne!(alice_root.as_bytes(), root_key.as_bytes());
    }
}
