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

use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::Zeroize;

use super::chain_key::{ChainKey, MessageKey};
use crate::pickle::{
    PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter, PUBLIC_KEY_PICKLE_LENGTH,
};

/// Our side of the Diffie-Hellman ratchet, a Curve25519 key pair.
pub struct RatchetKeyPair {
    secret_key: Curve25519SecretKey,
    public_key: Curve25519PublicKey,
}

impl fmt::Debug for RatchetKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl RatchetKeyPair {
    /// The number of bytes a pickled key pair occupies.
    pub const PICKLE_LENGTH: usize = 2 * PUBLIC_KEY_PICKLE_LENGTH;

    /// Generate a new random ratchet key pair.
    pub fn new() -> Self {
        Self::from_secret_key(Curve25519SecretKey::new())
    }

    /// Create a ratchet key pair out of an existing secret key.
    pub fn from_secret_key(secret_key: Curve25519SecretKey) -> Self {
        let public_key = Curve25519PublicKey::from(&secret_key);
        Self { secret_key, public_key }
    }

    /// The public half of the key pair.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    pub(crate) fn secret_key(&self) -> &Curve25519SecretKey {
        &self.secret_key
    }
}

impl Default for RatchetKeyPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PickleEncode for RatchetKeyPair {
    fn pickle_len(&self) -> usize {
        Self::PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write(&self.public_key)?;

        let mut secret = self.secret_key.to_bytes();
        let result = writer.write_bytes(secret.as_slice());
        secret.zeroize();
        result?;

        Ok(writer.finish())
    }
}

impl PickleDecode for RatchetKeyPair {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let public_key: Curve25519PublicKey = reader.read()?;

        let mut secret = reader.read_secret::<32>()?;
        let secret_key = Curve25519SecretKey::from_slice(&secret);
        secret.zeroize();

        if Curve25519PublicKey::from(&secret_key) != public_key {
            return Err(PickleError::Malformed(
                "the ratchet public key doesn't match the secret key",
            ));
        }

        Ok((Self { secret_key, public_key }, reader.consumed()))
    }
}

/// The chain we use to encrypt messages.
///
/// There's at most one sender chain at any time, it gets replaced whenever
/// the other side answers with a new ratchet key.
#[derive(Debug)]
pub struct SenderChain {
    ratchet_key: RatchetKeyPair,
    chain_key: ChainKey,
}

impl SenderChain {
    /// Create a new sender chain at index 0.
    pub fn new(ratchet_key: RatchetKeyPair, chain_key: ChainKey) -> Self {
        Self { ratchet_key, chain_key }
    }

    /// Our ratchet key pair for this chain.
    pub fn ratchet_key(&self) -> &RatchetKeyPair {
        &self.ratchet_key
    }

    /// The public ratchet key the other side will see on our messages.
    pub fn public_ratchet_key(&self) -> Curve25519PublicKey {
        self.ratchet_key.public_key()
    }

    /// The current chain key.
    pub fn chain_key(&self) -> &ChainKey {
        &self.chain_key
    }

    /// The index of the next message we'll send on this chain.
    pub fn chain_index(&self) -> u32 {
        self.chain_key.index()
    }

    /// Move the chain one step forward.
    pub fn advance(&mut self) {
        self.chain_key.advance();
    }

    /// Derive the message key for the current index.
    pub fn create_message_key(&self) -> MessageKey {
        self.chain_key.create_message_key()
    }
}

impl PickleEncode for SenderChain {
    fn pickle_len(&self) -> usize {
        self.ratchet_key.pickle_len() + self.chain_key.pickle_len()
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write(&self.ratchet_key)?;
        writer.write(&self.chain_key)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for SenderChain {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let ratchet_key = reader.read()?;
        let chain_key = reader.read()?;

        Ok((Self { ratchet_key, chain_key }, reader.consumed()))
    }
}

/// A chain we use to decrypt messages the other side sent from one of its
/// ratchet keys.
#[derive(Clone, Debug)]
pub struct ReceiverChain {
    ratchet_key: Curve25519PublicKey,
    chain_key: ChainKey,
}

impl ReceiverChain {
    /// Create a new receiver chain for the given ratchet key.
    pub fn new(ratchet_key: Curve25519PublicKey, chain_key: ChainKey) -> Self {
        Self { ratchet_key, chain_key }
    }

    /// The ratchet key of the other side this chain belongs to.
    pub fn ratchet_key(&self) -> Curve25519PublicKey {
        self.ratchet_key
    }

    /// The current chain key.
    pub fn chain_key(&self) -> &ChainKey {
        &self.chain_key
    }

    /// The index of the next message we expect on this chain.
    pub fn chain_index(&self) -> u32 {
        self.chain_key.index()
    }

    /// Does this chain decrypt messages sent from the given ratchet key.
    pub fn belongs_to(&self, ratchet_key: &Curve25519PublicKey) -> bool {
        &self.ratchet_key == ratchet_key
    }

    /// Move the chain one step forward.
    pub fn advance(&mut self) {
        self.chain_key.advance();
    }

    /// Derive the message key for the current index.
    pub fn create_message_key(&self) -> MessageKey {
        self.chain_key.create_message_key()
    }
}

impl PickleEncode for ReceiverChain {
    fn pickle_len(&self) -> usize {
        self.ratchet_key.pickle_len() + self.chain_key.pickle_len()
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write(&self.ratchet_key)?;
        writer.write(&self.chain_key)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for ReceiverChain {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let ratchet_key = reader.read()?;
        let chain_key = reader.read()?;

        Ok((Self { ratchet_key, chain_key }, reader.consumed()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::olm::ratchet::chain_key::KEY_LENGTH;

    #[test]
    fn chains_delegate_to_the_chain_key() {
        let mut sender = SenderChain::new(RatchetKeyPair::new(), ChainKey::new(Box::new([1; 32])));
        let mut receiver =
            ReceiverChain::new(sender.public_ratchet_key(), ChainKey::new(Box::new([1; 32])));

        assert!(receiver.belongs_to(&sender.public_ratchet_key()));

        sender.advance();
        receiver.advance();

        assert_eq!(sender.chain_index(), 1);
        assert_eq!(
            sender.create_message_key().as_bytes(),
            receiver.create_message_key().as_bytes()
        );
    }

    #[test]
    fn sender_chain_pickle_layout() {
        let sender = SenderChain::new(RatchetKeyPair::new(), ChainKey::new(Box::new([7; 32])));
        let pickle = sender.to_pickle_bytes();

        assert_eq!(pickle.len(), 2 * 32 + KEY_LENGTH + 4);
        assert_eq!(&pickle[..32], sender.public_ratchet_key().as_bytes());

        let restored = SenderChain::from_pickle_bytes(&pickle).unwrap();
        assert_eq!(restored.public_ratchet_key(), sender.public_ratchet_key());
        assert_eq!(restored.chain_key().as_bytes(), sender.chain_key().as_bytes());
    }

    #[test]
    fn mismatched_key_pair_is_malformed() {
        let sender = SenderChain::new(RatchetKeyPair::new(), ChainKey::new(Box::new([7; 32])));
        let mut pickle = sender.to_pickle_bytes();
        pickle[..32].copy_from_slice(RatchetKeyPair::new().public_key().as_bytes());

        assert_matches!(SenderChain::from_pickle_bytes(&pickle), Err(PickleError::Malformed(_)));
    }

    #[test]
    fn receiver_chain_pickle_is_key_then_chain_key() {
        let ratchet_key = RatchetKeyPair::new().public_key();
        let mut receiver = ReceiverChain::new(ratchet_key, ChainKey::new(Box::new([2; 32])));
        receiver.advance();

        let pickle = receiver.to_pickle_bytes();
        assert_eq!(pickle.len(), receiver.pickle_len());
        assert_eq!(&pickle[..32], ratchet_key.as_bytes());
        assert_eq!(&pickle[32..64], receiver.chain_key().as_bytes());
        assert_eq!(&pickle[64..], &[0, 0, 0, 1]);
    }
}
