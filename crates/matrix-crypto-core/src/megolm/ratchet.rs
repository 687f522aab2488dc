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

use rand::{thread_rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ciphers::{hmac_sha256, AesHmacSha2Key, MEGOLM_KEYS_INFO},
    pickle::{
        PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter, U32_PICKLE_LENGTH,
    },
};

pub(crate) const RATCHET_PART_COUNT: usize = 4;
pub(crate) const RATCHET_PART_LENGTH: usize = 32;
pub(crate) const RATCHET_LENGTH: usize = RATCHET_PART_COUNT * RATCHET_PART_LENGTH;

const SEEDS: [[u8; 1]; RATCHET_PART_COUNT] = [[0x00], [0x01], [0x02], [0x03]];

/// The Megolm ratchet, four 32 byte parts and a counter.
///
/// Part `R(i)` is rekeyed every `2^(8 * (3 - i))` steps, which allows the
/// ratchet to be moved forward by any amount with at most 1020 hash
/// operations.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MegolmRatchet {
    parts: Box<[[u8; RATCHET_PART_LENGTH]; RATCHET_PART_COUNT]>,
    counter: u32,
}

impl fmt::Debug for MegolmRatchet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MegolmRatchet").field("counter", &self.counter).finish_non_exhaustive()
    }
}

impl MegolmRatchet {
    pub(crate) const PICKLE_LENGTH: usize = RATCHET_LENGTH + U32_PICKLE_LENGTH;

    /// Create a new random ratchet starting at index 0.
    pub(crate) fn new() -> Self {
        let mut rng = thread_rng();
        let mut ratchet = Self {
            parts: Box::new([[0u8; RATCHET_PART_LENGTH]; RATCHET_PART_COUNT]),
            counter: 0,
        };

        for part in ratchet.parts.iter_mut() {
            rng.fill_bytes(part);
        }

        ratchet
    }

    /// Create a ratchet out of its serialized form.
    pub(crate) fn from_bytes(bytes: &[u8; RATCHET_LENGTH], counter: u32) -> Self {
        let mut parts = Box::new([[0u8; RATCHET_PART_LENGTH]; RATCHET_PART_COUNT]);

        for (part, chunk) in parts.iter_mut().zip(bytes.chunks_exact(RATCHET_PART_LENGTH)) {
            part.copy_from_slice(chunk);
        }

        Self { parts, counter }
    }

    /// The index of the message key this ratchet produces.
    pub(crate) fn index(&self) -> u32 {
        self.counter
    }

    /// The serialized ratchet parts.
    pub(crate) fn to_bytes(&self) -> Box<[u8; RATCHET_LENGTH]> {
        let mut bytes = Box::new([0u8; RATCHET_LENGTH]);

        for (chunk, part) in bytes.chunks_exact_mut(RATCHET_PART_LENGTH).zip(self.parts.iter()) {
            chunk.copy_from_slice(part);
        }

        bytes
    }

    /// The message cipher for the current index.
    pub(crate) fn cipher(&self) -> AesHmacSha2Key {
        let bytes = self.to_bytes();
        AesHmacSha2Key::from_secret(bytes.as_slice(), MEGOLM_KEYS_INFO)
    }

    fn rehash_part(&mut self, from: usize, to: usize) {
        let mut next = hmac_sha256(&self.parts[from], &SEEDS[to]);
        self.parts[to] = next;
        next.zeroize();
    }

    /// Move the ratchet one step forward.
    pub(crate) fn advance(&mut self) {
        let mut mask: u32 = 0x00FF_FFFF;
        let mut h = 0;

        self.counter = self.counter.wrapping_add(1);

        // Find the highest part that has to be rekeyed.
        while h < RATCHET_PART_COUNT {
            if self.counter & mask == 0 {
                break;
            }

            h += 1;
            mask >>= 8;
        }

        // Rekey the parts below, from the lowest up, and finally part h
        // itself.
        for i in (h..RATCHET_PART_COUNT).rev() {
            self.rehash_part(h, i);
        }
    }

    /// Move the ratchet forward to the given index.
    ///
    /// Moving to an earlier index wraps the counter around, callers only move
    /// forward.
    pub(crate) fn advance_to(&mut self, advance_to: u32) {
        for j in 0..RATCHET_PART_COUNT {
            let shift = (RATCHET_PART_COUNT - j - 1) * 8;
            let mask: u32 = !0u32 << shift;

            let mut steps = (advance_to >> shift).wrapping_sub(self.counter >> shift) & 0xff;

            if steps == 0 {
                // Either this part doesn't need to move or it needs to move
                // all the way around.
                if advance_to < self.counter {
                    steps = 0x100;
                } else {
                    continue;
                }
            }

            // For all but the last step we can just rehash this part in place.
            while steps > 1 {
                self.rehash_part(j, j);
                steps -= 1;
            }

            // On the last step we also need to reset all the lower parts.
            for k in (j..RATCHET_PART_COUNT).rev() {
                self.rehash_part(j, k);
            }

            self.counter = advance_to & mask;
        }
    }
}

impl PickleEncode for MegolmRatchet {
    fn pickle_len(&self) -> usize {
        Self::PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;

        for part in self.parts.iter() {
            writer.write_bytes(part)?;
        }
        writer.write_u32(self.counter)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for MegolmRatchet {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);

        let mut bytes = reader.read_secret::<RATCHET_LENGTH>()?;
        let counter = reader.read_u32()?;
        let ratchet = Self::from_bytes(&bytes, counter);
        bytes.zeroize();

        Ok((ratchet, reader.consumed()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn step_by_step(ratchet: &MegolmRatchet, to: u32) -> MegolmRatchet {
        let mut ratchet = ratchet.clone();

        while ratchet.index() < to {
            ratchet.advance();
        }

        ratchet
    }

    #[test]
    fn advancing_rekeys_the_lowest_part() {
        let mut ratchet = MegolmRatchet::from_bytes(&[1; RATCHET_LENGTH], 0);
        let before = ratchet.to_bytes();

        ratchet.advance();
        let after = ratchet.to_bytes();

        assert_eq!(ratchet.index(), 1);
        assert_eq!(&after[..96], &before[..96]);
        assert_eq!(&after[96..], &hmac_sha256(&[1; 32], &[0x03]));
    }

    #[test]
    fn rollover_rekeys_the_higher_parts() {
        let ratchet = MegolmRatchet::from_bytes(&[2; RATCHET_LENGTH], 0xFF);
        let mut advanced = ratchet.clone();
        advanced.advance();

        let before = ratchet.to_bytes();
        let after = advanced.to_bytes();

        assert_eq!(advanced.index(), 0x100);
        assert_eq!(&after[..64], &before[..64]);
        assert_eq!(&after[64..96], &hmac_sha256(&before[64..96], &[0x02]));
        assert_eq!(&after[96..], &hmac_sha256(&before[64..96], &[0x03]));
    }

    #[test]
    fn advance_to_matches_single_steps() {
        let ratchet = MegolmRatchet::from_bytes(&[3; RATCHET_LENGTH], 0);

        for target in [1, 255, 256, 257, 1000, 0x1_0000] {
            let mut fast = ratchet.clone();
            fast.advance_to(target);

            let slow = step_by_step(&ratchet, target);

            assert_eq!(fast.index(), target);
            assert_eq!(fast.to_bytes(), slow.to_bytes(), "Ratchets differ at index {target}");
        }
    }

    #[test]
    fn pickle_is_parts_then_counter() {
        let ratchet = MegolmRatchet::from_bytes(&[4; RATCHET_LENGTH], 7);
        let pickle = ratchet.to_pickle_bytes();

        assert_eq!(pickle.len(), MegolmRatchet::PICKLE_LENGTH);
        assert_eq!(&pickle[..RATCHET_LENGTH], &[4; RATCHET_LENGTH]);
        assert_eq!(&pickle[RATCHET_LENGTH..], &[0, 0, 0, 7]);

        let restored = MegolmRatchet::from_pickle_bytes(&pickle).unwrap();
        assert_eq!(restored.to_bytes(), ratchet.to_bytes());
        assert_eq!(restored.index(), 7);
    }

    proptest! {
        #[test]
        fn advance_to_from_any_start(start in 0u32..2000, distance in 0u32..600) {
            let ratchet = step_by_step(&MegolmRatchet::from_bytes(&[5; RATCHET_LENGTH], 0), start);
            let target = start + distance;

            let mut fast = ratchet.clone();
            fast.advance_to(target);

            prop_assert_eq!(fast.index(), target);
            prop_assert_eq!(fast.to_bytes(), step_by_step(&ratchet, target).to_bytes());
        }
    }
}
