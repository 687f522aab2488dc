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

use std::collections::VecDeque;

use tracing::trace;
use vodozemac::Curve25519PublicKey;

use super::chain_key::MessageKey;
use crate::pickle::{PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter};

/// A message key we derived while skipping over messages that didn't arrive
/// yet, tagged with the ratchet key of the chain it belongs to.
#[derive(Clone, Debug)]
pub struct SkippedMessageKey {
    ratchet_key: Curve25519PublicKey,
    message_key: MessageKey,
}

impl SkippedMessageKey {
    /// Create a new skipped message key entry.
    pub fn new(ratchet_key: Curve25519PublicKey, message_key: MessageKey) -> Self {
        Self { ratchet_key, message_key }
    }

    /// The ratchet key of the chain the message key was derived from.
    pub fn ratchet_key(&self) -> Curve25519PublicKey {
        self.ratchet_key
    }

    /// The skipped message key.
    pub fn message_key(&self) -> &MessageKey {
        &self.message_key
    }

    fn matches(&self, ratchet_key: &Curve25519PublicKey, index: u32) -> bool {
        &self.ratchet_key == ratchet_key && self.message_key.index() == index
    }
}

impl PickleEncode for SkippedMessageKey {
    fn pickle_len(&self) -> usize {
        self.ratchet_key.pickle_len() + self.message_key.pickle_len()
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write(&self.ratchet_key)?;
        writer.write(&self.message_key)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for SkippedMessageKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let ratchet_key = reader.read()?;
        let message_key = reader.read()?;

        Ok((Self { ratchet_key, message_key }, reader.consumed()))
    }
}

/// A bounded store of skipped message keys.
///
/// The newest key sits at the front, once the store grows past its capacity
/// the oldest keys get dropped from the back.
#[derive(Clone, Debug)]
pub struct SkippedMessageKeys {
    keys: VecDeque<SkippedMessageKey>,
    capacity: usize,
}

impl SkippedMessageKeys {
    /// The number of skipped message keys libolm keeps around.
    pub const DEFAULT_CAPACITY: usize = 40;

    /// Create an empty store with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty store holding at most `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { keys: VecDeque::with_capacity(capacity), capacity }
    }

    pub(crate) fn from_keys(keys: Vec<SkippedMessageKey>, capacity: usize) -> Self {
        let mut store = Self { keys: keys.into(), capacity };
        store.evict();

        store
    }

    /// The maximal number of keys this store holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict();
    }

    /// The number of keys in the store.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Is the store empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over the keys, newest first.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &SkippedMessageKey> {
        self.keys.iter()
    }

    /// Remember a skipped message key, evicting the oldest keys if the store
    /// is over capacity afterwards.
    pub fn record(&mut self, ratchet_key: Curve25519PublicKey, message_key: MessageKey) {
        self.insert(SkippedMessageKey::new(ratchet_key, message_key));
    }

    pub(crate) fn insert(&mut self, key: SkippedMessageKey) {
        self.keys.push_front(key);
        self.evict();
    }

    fn evict(&mut self) {
        while self.keys.len() > self.capacity {
            if let Some(evicted) = self.keys.pop_back() {
                trace!(
                    ratchet_key = ?evicted.ratchet_key,
                    index = evicted.message_key.index(),
                    "Dropping the oldest skipped message key",
                );
            }
        }
    }

    /// Find the key for the given ratchet key and chain index.
    pub fn get(&self, ratchet_key: &Curve25519PublicKey, index: u32) -> Option<&MessageKey> {
        self.keys.iter().find(|k| k.matches(ratchet_key, index)).map(|k| &k.message_key)
    }

    /// Remove and return the key for the given ratchet key and chain index.
    pub fn take(&mut self, ratchet_key: &Curve25519PublicKey, index: u32) -> Option<MessageKey> {
        let position = self.keys.iter().position(|k| k.matches(ratchet_key, index))?;
        self.keys.remove(position).map(|k| k.message_key)
    }
}

impl Default for SkippedMessageKeys {
    fn default() -> Self {
        Self::new()
    }
}
