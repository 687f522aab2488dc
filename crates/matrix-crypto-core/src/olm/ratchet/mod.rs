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

//! The Olm Double Ratchet.
//!
//! A [`Ratchet`] combines a root key with at most one [`SenderChain`], a
//! bounded list of [`ReceiverChain`]s and a bounded store of
//! [`SkippedMessageKeys`]. Sending on a session without a sender chain performs
//! a Diffie-Hellman step against the newest receiver chain, receiving a
//! message from a ratchet key we don't know yet performs a Diffie-Hellman step
//! against our sender chain and retires the sender chain.
//!
//! Decryption never modifies the ratchet unless the MAC of the message
//! verified, a forged or corrupted message leaves the state untouched.

mod chain_key;
mod chains;
mod root_key;
mod skipped_keys;

use std::collections::VecDeque;

pub use chain_key::{ChainKey, MessageKey, KEY_LENGTH};
pub use chains::{RatchetKeyPair, ReceiverChain, SenderChain};
pub(crate) use root_key::RootKey;
pub use skipped_keys::{SkippedMessageKey, SkippedMessageKeys};
use tracing::{debug, trace};
use vodozemac::Curve25519PublicKey;

use super::messages::OlmMessage;
use crate::{
    pickle::{list_pickle_len, PickleEncode, PickleError, PickleReader, PickleWriter},
    OlmError,
};

/// Bounds on the amount of state a [`Ratchet`] keeps around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetConfig {
    /// How many receiver chains are kept, older chains are discarded.
    pub max_receiver_chains: usize,
    /// How many skipped message keys are kept, older keys are discarded.
    pub max_skipped_message_keys: usize,
    /// How far ahead of a chain a message may be before we refuse to derive
    /// the keys in between.
    pub max_message_gap: u32,
}

impl RatchetConfig {
    /// The default number of receiver chains.
    pub const MAX_RECEIVER_CHAINS: usize = 5;
    /// The default number of skipped message keys.
    pub const MAX_SKIPPED_MESSAGE_KEYS: usize = SkippedMessageKeys::DEFAULT_CAPACITY;
    /// The default message gap.
    pub const MAX_MESSAGE_GAP: u32 = 2000;
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_receiver_chains: Self::MAX_RECEIVER_CHAINS,
            max_skipped_message_keys: Self::MAX_SKIPPED_MESSAGE_KEYS,
            max_message_gap: Self::MAX_MESSAGE_GAP,
        }
    }
}

/// The Double Ratchet state of a single Olm session.
#[derive(Debug)]
pub struct Ratchet {
    root_key: RootKey,
    sender_chain: Option<SenderChain>,
    /// Newest chain first.
    receiver_chains: VecDeque<ReceiverChain>,
    skipped_message_keys: SkippedMessageKeys,
    config: RatchetConfig,
}

impl Ratchet {
    /// Initialise the ratchet of the side that created the session.
    ///
    /// The session creator can send right away, its first sender chain is
    /// derived from the shared secret.
    pub fn initialise_as_alice(shared_secret: &[u8], our_ratchet_key: RatchetKeyPair) -> Self {
        let (root_key, chain_key) = RootKey::from_shared_secret(shared_secret);

        Self {
            root_key,
            sender_chain: Some(SenderChain::new(our_ratchet_key, chain_key)),
            receiver_chains: VecDeque::new(),
            skipped_message_keys: SkippedMessageKeys::new(),
            config: RatchetConfig::default(),
        }
    }

    /// Initialise the ratchet of the side that received the pre-key message.
    ///
    /// The receiving side first gets a receiver chain for the ratchet key of
    /// the creator, its sender chain is created on the first reply.
    pub fn initialise_as_bob(shared_secret: &[u8], their_ratchet_key: Curve25519PublicKey) -> Self {
        let (root_key, chain_key) = RootKey::from_shared_secret(shared_secret);

        Self {
            root_key,
            sender_chain: None,
            receiver_chains: VecDeque::from([ReceiverChain::new(their_ratchet_key, chain_key)]),
            skipped_message_keys: SkippedMessageKeys::new(),
            config: RatchetConfig::default(),
        }
    }

    /// Use the given bounds for this ratchet.
    ///
    /// State that exceeds the new bounds is discarded, oldest first.
    pub fn with_config(mut self, config: RatchetConfig) -> Self {
        self.config = config;
        self.receiver_chains.truncate(config.max_receiver_chains);
        self.skipped_message_keys.set_capacity(config.max_skipped_message_keys);

        self
    }

    /// The bounds this ratchet uses.
    pub fn config(&self) -> RatchetConfig {
        self.config
    }

    /// The active sender chain, if we have one.
    pub fn sender_chain(&self) -> Option<&SenderChain> {
        self.sender_chain.as_ref()
    }

    /// The receiver chains, newest first.
    pub fn receiver_chains(&self) -> impl ExactSizeIterator<Item = &ReceiverChain> {
        self.receiver_chains.iter()
    }

    /// The skipped message keys.
    pub fn skipped_message_keys(&self) -> &SkippedMessageKeys {
        &self.skipped_message_keys
    }

    fn create_sender_chain(&mut self) -> Result<SenderChain, OlmError> {
        let their_ratchet_key = self
            .receiver_chains
            .front()
            .map(ReceiverChain::ratchet_key)
            .ok_or(OlmError::MissingChain)?;

        let ratchet_key = RatchetKeyPair::new();
        let (root_key, chain_key) = self.root_key.advance(&ratchet_key, &their_ratchet_key);
        self.root_key = root_key;

        debug!(
            our_ratchet_key = ?ratchet_key.public_key(),
            ?their_ratchet_key,
            "Created a new sender chain",
        );

        Ok(SenderChain::new(ratchet_key, chain_key))
    }

    /// Encrypt a plaintext, advancing the sender chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<OlmMessage, OlmError> {
        if self.sender_chain.is_none() {
            let sender_chain = self.create_sender_chain()?;
            self.sender_chain = Some(sender_chain);
        }

        let sender_chain = self.sender_chain.as_mut().ok_or(OlmError::MissingChain)?;

        let message_key = sender_chain.create_message_key();
        sender_chain.advance();

        Ok(message_key.encrypt(sender_chain.public_ratchet_key(), plaintext))
    }

    /// Decrypt a message, advancing or creating the matching receiver chain.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<Vec<u8>, OlmError> {
        let ratchet_key = message.ratchet_key();
        let index = message.chain_index();

        if let Some(message_key) = self.skipped_message_keys.get(&ratchet_key, index) {
            let plaintext = message_key.decrypt(message)?;
            self.skipped_message_keys.take(&ratchet_key, index);

            trace!(?ratchet_key, index, "Decrypted a message using a skipped message key");

            return Ok(plaintext);
        }

        if let Some(position) = self.receiver_chains.iter().position(|c| c.belongs_to(&ratchet_key))
        {
            let chain = &self.receiver_chains[position];

            if index < chain.chain_index() {
                return Err(OlmError::ReplayOrUnknownMessage { index });
            }

            let mut chain = chain.clone();
            let (plaintext, skipped) = Self::decrypt_on_chain(&self.config, &mut chain, message)?;

            self.receiver_chains[position] = chain;
            self.record_skipped_keys(skipped);

            Ok(plaintext)
        } else {
            let sender_chain = self.sender_chain.as_ref().ok_or(OlmError::MissingChain)?;

            let (root_key, chain_key) =
                self.root_key.advance(sender_chain.ratchet_key(), &ratchet_key);
            let mut chain = ReceiverChain::new(ratchet_key, chain_key);
            let (plaintext, skipped) = Self::decrypt_on_chain(&self.config, &mut chain, message)?;

            debug!(their_ratchet_key = ?ratchet_key, "Created a new receiver chain");

            self.root_key = root_key;
            self.sender_chain = None;
            self.receiver_chains.push_front(chain);
            self.receiver_chains.truncate(self.config.max_receiver_chains);
            self.record_skipped_keys(skipped);

            Ok(plaintext)
        }
    }

    /// Advance a detached copy of a chain up to the index of the message and
    /// decrypt it.
    ///
    /// Returns the plaintext and the keys of the messages that were skipped
    /// over, the caller commits both only if this succeeds.
    fn decrypt_on_chain(
        config: &RatchetConfig,
        chain: &mut ReceiverChain,
        message: &OlmMessage,
    ) -> Result<(Vec<u8>, Vec<SkippedMessageKey>), OlmError> {
        let index = message.chain_index();
        let skipped = index - chain.chain_index();

        if skipped > config.max_message_gap {
            return Err(OlmError::TooManySkippedMessages { skipped, max: config.max_message_gap });
        }

        let mut skipped_keys = Vec::with_capacity(skipped as usize);

        while chain.chain_index() < index {
            let message_key = chain.create_message_key();
            skipped_keys.push(SkippedMessageKey::new(chain.ratchet_key(), message_key));
            chain.advance();
        }

        let plaintext = chain.create_message_key().decrypt(message)?;
        chain.advance();

        Ok((plaintext, skipped_keys))
    }

    fn record_skipped_keys(&mut self, skipped: Vec<SkippedMessageKey>) {
        for key in skipped {
            self.skipped_message_keys.insert(key);
        }
    }

    /// Decode a ratchet from its pickle, using the given bounds.
    ///
    /// Pickles holding more chains or skipped keys than the bounds allow are
    /// rejected as malformed.
    pub(crate) fn decode_with_config(
        source: &[u8],
        config: RatchetConfig,
    ) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);

        let root_key = reader.read()?;
        let mut sender_chains = reader.read_list::<SenderChain>(1)?;
        let receiver_chains = reader.read_list::<ReceiverChain>(config.max_receiver_chains)?;
        let skipped_message_keys =
            reader.read_list::<SkippedMessageKey>(config.max_skipped_message_keys)?;

        let ratchet = Self {
            root_key,
            sender_chain: sender_chains.pop(),
            receiver_chains: receiver_chains.into(),
            skipped_message_keys: SkippedMessageKeys::from_keys(
                skipped_message_keys,
                config.max_skipped_message_keys,
            ),
            config,
        };

        Ok((ratchet, reader.consumed()))
    }
}

impl PickleEncode for Ratchet {
    fn pickle_len(&self) -> usize {
        self.root_key.pickle_len()
            + list_pickle_len(self.sender_chain.iter())
            + list_pickle_len(self.receiver_chains.iter())
            + list_pickle_len(self.skipped_message_keys.iter())
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;

        writer.write(&self.root_key)?;
        writer.write_list(self.sender_chain.iter())?;
        writer.write_list(self.receiver_chains.iter())?;
        writer.write_list(self.skipped_message_keys.iter())?;

        Ok(writer.finish())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches2::assert_let;

    use super::*;

    const SHARED_SECRET: &[u8] = b"a shared secret both sides agreed on";

    pub(crate) fn ratchet_pair() -> (Ratchet, Ratchet) {
        let alice_ratchet_key = RatchetKeyPair::new();
        let public_key = alice_ratchet_key.public_key();

        let alice = Ratchet::initialise_as_alice(SHARED_SECRET, alice_ratchet_key);
        let bob = Ratchet::initialise_as_bob(SHARED_SECRET, public_key);

        (alice, bob)
    }

    fn encrypt_many(ratchet: &mut Ratchet, count: usize) -> Vec<OlmMessage> {
        (0..count).map(|i| ratchet.encrypt(format!("Message {i}").as_bytes()).unwrap()).collect()
    }

    #[test]
    fn in_order_messages_decrypt() {
        let (mut alice, mut bob) = ratchet_pair();

        for message in encrypt_many(&mut alice, 3) {
            bob.decrypt(&message).unwrap();
        }

        let reply = bob.encrypt(b"Hi Alice").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"Hi Alice");

        assert!(
            alice.sender_chain().is_none(),
            "Receiving a new ratchet key retires the sender chain"
        );
        assert_eq!(alice.receiver_chains().len(), 1);

        let answer = alice.encrypt(b"Hi Bob").unwrap();
        assert_ne!(answer.ratchet_key(), reply.ratchet_key());
        assert_eq!(answer.chain_index(), 0);
        assert_eq!(bob.decrypt(&answer).unwrap(), b"Hi Bob");
    }

    #[test]
    fn out_of_order_messages_decrypt_from_skipped_keys() {
        let (mut alice, mut bob) = ratchet_pair();
        let messages = encrypt_many(&mut alice, 8);

        for message in &messages[..5] {
            bob.decrypt(message).unwrap();
        }

        assert_eq!(bob.receiver_chains().next().unwrap().chain_index(), 5);

        assert_eq!(bob.decrypt(&messages[7]).unwrap(), b"Message 7");
        assert_eq!(bob.skipped_message_keys().len(), 2);
        assert_eq!(bob.decrypt(&messages[5]).unwrap(), b"Message 5");
        assert_eq!(bob.decrypt(&messages[6]).unwrap(), b"Message 6");
        assert!(bob.skipped_message_keys().is_empty());
    }

    #[test]
    fn earlier_message_after_a_jump_decrypts() {
        let (mut alice, mut bob) = ratchet_pair();
        let messages = encrypt_many(&mut alice, 8);

        bob.decrypt(&messages[0]).unwrap();
        bob.decrypt(&messages[1]).unwrap();
        bob.decrypt(&messages[2]).unwrap();
        bob.decrypt(&messages[7]).unwrap();

        let indices: Vec<u32> =
            bob.skipped_message_keys().iter().map(|k| k.message_key().index()).collect();
        assert_eq!(indices, [6, 5, 4, 3], "Exactly the keys in between were recorded");

        assert_eq!(bob.decrypt(&messages[3]).unwrap(), b"Message 3");
    }

    #[test]
    fn replayed_message_is_rejected() {
        let (mut alice, mut bob) = ratchet_pair();
        let message = alice.encrypt(b"Once").unwrap();

        bob.decrypt(&message).unwrap();

        assert_let!(Err(OlmError::ReplayOrUnknownMessage { index: 0 }) = bob.decrypt(&message));
    }

    #[test]
    fn evicted_skipped_key_is_unknown() {
        let (mut alice, bob) = ratchet_pair();
        let config = RatchetConfig { max_skipped_message_keys: 2, ..Default::default() };
        let mut bob = bob.with_config(config);

        let messages = encrypt_many(&mut alice, 6);
        bob.decrypt(&messages[5]).unwrap();

        assert_eq!(bob.skipped_message_keys().len(), 2);
        assert_eq!(bob.decrypt(&messages[4]).unwrap(), b"Message 4");
        assert_let!(Err(OlmError::ReplayOrUnknownMessage { index: 1 }) = bob.decrypt(&messages[1]));
    }

    #[test]
    fn too_large_gaps_are_refused() {
        let (mut alice, bob) = ratchet_pair();
        let mut bob = bob.with_config(RatchetConfig { max_message_gap: 10, ..Default::default() });

        let messages = encrypt_many(&mut alice, 12);

        let result = bob.decrypt(&messages[11]);
        assert_let!(Err(OlmError::TooManySkippedMessages { skipped: 11, max: 10 }) = result);
        assert_eq!(bob.decrypt(&messages[10]).unwrap(), b"Message 10");
    }

    #[test]
    fn failed_decryption_leaves_the_ratchet_untouched() {
        let (mut alice, mut bob) = ratchet_pair();
        let messages = encrypt_many(&mut alice, 4);
        bob.decrypt(&messages[0]).unwrap();

        let before = bob.to_pickle_bytes();

        let mut bytes = messages[3].to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let forged = OlmMessage::from_bytes(&bytes).unwrap();

        assert_let!(Err(OlmError::InvalidMac) = bob.decrypt(&forged));
        assert_eq!(bob.to_pickle_bytes(), before);

        // A message from an unknown ratchet key that fails to decrypt doesn't
        // create a chain either.
        let (mut mallory, _) = ratchet_pair();
        let reply = bob.encrypt(b"Hello").unwrap();
        let mallory_before = mallory.to_pickle_bytes();

        assert_let!(Err(OlmError::InvalidMac) = mallory.decrypt(&reply));
        assert_eq!(mallory.to_pickle_bytes(), mallory_before);

        assert_eq!(bob.decrypt(&messages[3]).unwrap(), b"Message 3");
    }

    #[test]
    fn receiving_side_cannot_encrypt_without_a_chain_to_reply_to() {
        let (_, bob) = ratchet_pair();
        let mut bob =
            bob.with_config(RatchetConfig { max_receiver_chains: 0, ..Default::default() });

        assert_let!(Err(OlmError::MissingChain) = bob.encrypt(b"Nobody to talk to"));
    }

    #[test]
    fn receiver_chains_are_bounded() {
        let (mut alice, bob) = ratchet_pair();
        let mut bob =
            bob.with_config(RatchetConfig { max_receiver_chains: 2, ..Default::default() });

        for round in 0..4 {
            let message = alice.encrypt(format!("Round {round}").as_bytes()).unwrap();
            bob.decrypt(&message).unwrap();

            let reply = bob.encrypt(b"Ack").unwrap();
            alice.decrypt(&reply).unwrap();
        }

        assert_eq!(bob.receiver_chains().len(), 2);
    }

    #[test]
    fn pickle_roundtrip_keeps_the_session_working() {
        let (mut alice, mut bob) = ratchet_pair();
        let messages = encrypt_many(&mut alice, 4);
        bob.decrypt(&messages[2]).unwrap();

        let pickle = bob.to_pickle_bytes();
        assert_eq!(pickle.len(), bob.pickle_len());

        let (mut restored, consumed) =
            Ratchet::decode_with_config(&pickle, RatchetConfig::default()).unwrap();
        assert_eq!(consumed, pickle.len());
        assert_eq!(restored.to_pickle_bytes(), pickle);

        assert_eq!(restored.decrypt(&messages[0]).unwrap(), b"Message 0");
        assert_eq!(restored.decrypt(&messages[3]).unwrap(), b"Message 3");
    }

    #[test]
    fn pickle_with_too_many_skipped_keys_is_malformed() {
        let (mut alice, mut bob) = ratchet_pair();
        let messages = encrypt_many(&mut alice, 10);
        bob.decrypt(&messages[9]).unwrap();

        let pickle = bob.to_pickle_bytes();
        let config = RatchetConfig { max_skipped_message_keys: 4, ..Default::default() };

        assert_let!(Err(PickleError::Malformed(_)) = Ratchet::decode_with_config(&pickle, config));
    }
}
