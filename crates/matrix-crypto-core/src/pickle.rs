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

//! Fixed-layout binary pickling of ratchet state.
//!
//! Every pickleable value knows the exact number of bytes it occupies, writes
//! itself into a caller supplied buffer and reports how many bytes it wrote.
//! Decoding is the mirror operation and reports how many bytes were consumed
//! so composite values can be decoded field by field.
//!
//! The layout is compatible with the unencrypted libolm pickle format:
//!
//! * integers are 32-bit unsigned big-endian,
//! * booleans are a single byte, `0` or `1`,
//! * keys are their raw bytes,
//! * lists are a 32-bit element count followed by the elements.

use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The number of bytes a pickled `u32` occupies.
pub const U32_PICKLE_LENGTH: usize = 4;
/// The number of bytes a pickled `bool` occupies.
pub const BOOL_PICKLE_LENGTH: usize = 1;
/// The number of bytes a pickled Curve25519 or Ed25519 public key occupies.
pub const PUBLIC_KEY_PICKLE_LENGTH: usize = 32;

/// Error type describing failures while pickling or unpickling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickleError {
    /// The buffer that should receive the pickle is too small.
    #[error("the pickle target is too short, {needed} bytes needed, {available} available")]
    BufferTooShort {
        /// The number of bytes the pickle needs.
        needed: usize,
        /// The number of bytes the target buffer has.
        available: usize,
    },

    /// The pickle ended before a value could be fully read.
    #[error("the pickle is truncated, {needed} more bytes needed, {available} left")]
    Truncated {
        /// The number of bytes the value needs.
        needed: usize,
        /// The number of bytes that are left in the pickle.
        available: usize,
    },

    /// The pickle contains a value that isn't valid.
    #[error("the pickle is malformed: {0}")]
    Malformed(&'static str),

    /// The pickle was created by an unsupported version of the format.
    #[error("the pickle version {0} is not supported")]
    UnsupportedVersion(u32),
}

/// A value with a fixed-layout binary pickle.
pub trait PickleEncode {
    /// The exact number of bytes [`PickleEncode::encode`] will write.
    fn pickle_len(&self) -> usize;

    /// Write the pickle into the start of `target`.
    ///
    /// Returns the number of bytes written, which is always equal to
    /// [`PickleEncode::pickle_len`]. Fails with
    /// [`PickleError::BufferTooShort`] before writing anything if the target
    /// can't hold the pickle.
    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError>;

    /// Pickle the value into a freshly allocated buffer.
    fn to_pickle_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.pickle_len()];
        let written = self
            .encode(&mut buffer)
            .expect("A buffer of pickle_len() bytes always fits the pickle");
        buffer.truncate(written);

        buffer
    }
}

/// A value that can be restored from its fixed-layout binary pickle.
pub trait PickleDecode: Sized {
    /// Read a value from the start of `source`.
    ///
    /// Returns the value and the number of bytes consumed.
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError>;

    /// Read a value that must span the whole of `source`.
    fn from_pickle_bytes(source: &[u8]) -> Result<Self, PickleError> {
        let (value, consumed) = Self::decode(source)?;

        if consumed != source.len() {
            Err(PickleError::Malformed("trailing bytes after the pickle"))
        } else {
            Ok(value)
        }
    }
}

/// Cursor writing pickled values into a fixed size buffer.
#[derive(Debug)]
pub struct PickleWriter<'a> {
    target: &'a mut [u8],
    position: usize,
}

impl<'a> PickleWriter<'a> {
    /// Create a writer that will write exactly `needed` bytes into `target`.
    ///
    /// The length check happens up front so a failed encode never leaves a
    /// partially written pickle behind.
    pub fn new(target: &'a mut [u8], needed: usize) -> Result<Self, PickleError> {
        if target.len() < needed {
            Err(PickleError::BufferTooShort { needed, available: target.len() })
        } else {
            Ok(Self { target, position: 0 })
        }
    }

    fn take(&mut self, length: usize) -> Result<&mut [u8], PickleError> {
        let available = self.target.len() - self.position;

        if available < length {
            return Err(PickleError::BufferTooShort { needed: length, available });
        }

        let start = self.position;
        self.position += length;

        Ok(&mut self.target[start..start + length])
    }

    /// Write a nested pickleable value.
    pub fn write<T: PickleEncode + ?Sized>(&mut self, value: &T) -> Result<(), PickleError> {
        let written = value.encode(&mut self.target[self.position..])?;
        self.position += written;

        Ok(())
    }

    /// Write a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), PickleError> {
        self.take(U32_PICKLE_LENGTH)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Write a boolean as a single byte.
    pub fn write_bool(&mut self, value: bool) -> Result<(), PickleError> {
        self.take(BOOL_PICKLE_LENGTH)?[0] = u8::from(value);
        Ok(())
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PickleError> {
        self.take(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Write a field that always occupies `length` bytes.
    ///
    /// If `bytes` doesn't have exactly `length` bytes the field is filled with
    /// zeroes instead, the pickle keeps its fixed layout either way.
    pub fn write_fixed_bytes(&mut self, bytes: &[u8], length: usize) -> Result<(), PickleError> {
        let target = self.take(length)?;

        if bytes.len() == length {
            target.copy_from_slice(bytes);
        } else {
            target.fill(0);
        }

        Ok(())
    }

    /// Write a list as an element count followed by the elements.
    pub fn write_list<'i, T, I>(&mut self, items: I) -> Result<(), PickleError>
    where
        T: PickleEncode + 'i,
        I: ExactSizeIterator<Item = &'i T>,
    {
        let count =
            u32::try_from(items.len()).map_err(|_| PickleError::Malformed("list is too long"))?;
        self.write_u32(count)?;

        for item in items {
            self.write(item)?;
        }

        Ok(())
    }

    /// Finish writing, returning the number of bytes written.
    pub fn finish(self) -> usize {
        self.position
    }
}

/// Cursor reading pickled values out of a byte slice.
#[derive(Debug)]
pub struct PickleReader<'a> {
    source: &'a [u8],
    position: usize,
}

impl<'a> PickleReader<'a> {
    /// Create a reader starting at the beginning of `source`.
    pub fn new(source: &'a [u8]) -> Self {
        Self { source, position: 0 }
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8], PickleError> {
        let available = self.source.len() - self.position;

        if available < length {
            return Err(PickleError::Truncated { needed: length, available });
        }

        let start = self.position;
        self.position += length;

        Ok(&self.source[start..start + length])
    }

    /// Read a nested pickled value.
    pub fn read<T: PickleDecode>(&mut self) -> Result<T, PickleError> {
        let (value, consumed) = T::decode(&self.source[self.position..])?;
        self.position += consumed;

        Ok(value)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, PickleError> {
        let bytes = self.read_array::<U32_PICKLE_LENGTH>()?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read a single byte boolean.
    pub fn read_bool(&mut self) -> Result<bool, PickleError> {
        match self.take(BOOL_PICKLE_LENGTH)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(PickleError::Malformed("invalid boolean value")),
        }
    }

    /// Read a fixed number of raw bytes.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);

        Ok(array)
    }

    /// Read a fixed number of secret bytes into a heap allocation.
    ///
    /// Keeps the secret off the stack so it can be reliably zeroized.
    pub fn read_secret<const N: usize>(&mut self) -> Result<Box<[u8; N]>, PickleError> {
        let mut secret = Box::new([0u8; N]);
        secret.copy_from_slice(self.take(N)?);

        Ok(secret)
    }

    /// Read a list that may hold at most `max_len` elements.
    pub fn read_list<T: PickleDecode>(&mut self, max_len: usize) -> Result<Vec<T>, PickleError> {
        let count = self.read_u32()? as usize;

        if count > max_len {
            return Err(PickleError::Malformed("list has more elements than allowed"));
        }

        (0..count).map(|_| self.read()).collect()
    }

    /// The number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.position
    }
}

/// The number of bytes a pickled list of `items` occupies.
pub fn list_pickle_len<'i, T: PickleEncode + 'i>(items: impl Iterator<Item = &'i T>) -> usize {
    U32_PICKLE_LENGTH + items.map(PickleEncode::pickle_len).sum::<usize>()
}

impl PickleEncode for u32 {
    fn pickle_len(&self) -> usize {
        U32_PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_u32(*self)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for u32 {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let value = reader.read_u32()?;

        Ok((value, reader.consumed()))
    }
}

impl PickleEncode for bool {
    fn pickle_len(&self) -> usize {
        BOOL_PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_bool(*self)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for bool {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let value = reader.read_bool()?;

        Ok((value, reader.consumed()))
    }
}

impl PickleEncode for Curve25519PublicKey {
    fn pickle_len(&self) -> usize {
        PUBLIC_KEY_PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_bytes(self.as_bytes())?;

        Ok(writer.finish())
    }
}

impl PickleDecode for Curve25519PublicKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let key = Curve25519PublicKey::from_bytes(reader.read_array()?);

        Ok((key, reader.consumed()))
    }
}

impl PickleEncode for Ed25519PublicKey {
    fn pickle_len(&self) -> usize {
        PUBLIC_KEY_PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;
        writer.write_bytes(self.as_bytes())?;

        Ok(writer.finish())
    }
}

impl PickleDecode for Ed25519PublicKey {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);
        let bytes = reader.read_array::<PUBLIC_KEY_PICKLE_LENGTH>()?;
        let key = Ed25519PublicKey::from_slice(&bytes)
            .map_err(|_| PickleError::Malformed("invalid Ed25519 public key"))?;

        Ok((key, reader.consumed()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use vodozemac::Curve25519SecretKey;

    use super::*;

    #[test]
    fn u32_is_big_endian() {
        assert_eq!(0x0102_0304u32.to_pickle_bytes(), [1, 2, 3, 4]);
    }

    #[test]
    fn too_short_target_is_rejected_up_front() {
        let mut target = [0xAAu8; 3];

        assert_matches!(
            7u32.encode(&mut target),
            Err(PickleError::BufferTooShort { needed: 4, available: 3 })
        );
        assert_eq!(target, [0xAA; 3], "Nothing should be written on failure");
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert_matches!(
            u32::decode(&[0, 1]),
            Err(PickleError::Truncated { needed: 4, available: 2 })
        );
        assert_matches!(bool::decode(&[]), Err(PickleError::Truncated { .. }));
    }

    #[test]
    fn invalid_bool_is_malformed() {
        assert_matches!(bool::decode(&[2]), Err(PickleError::Malformed(_)));
    }

    #[test]
    fn fixed_bytes_of_the_wrong_length_are_zeroed() {
        let mut target = [0xFFu8; 8];
        let mut writer = PickleWriter::new(&mut target, 8).unwrap();
        writer.write_fixed_bytes(&[1, 2, 3], 4).unwrap();
        writer.write_fixed_bytes(&[5, 6, 7, 8], 4).unwrap();
        assert_eq!(writer.finish(), 8);

        assert_eq!(target, [0, 0, 0, 0, 5, 6, 7, 8]);
    }

    #[test]
    fn list_count_above_capacity_is_malformed() {
        let mut pickle = 3u32.to_pickle_bytes();
        pickle.extend([0u8; 12]);

        let mut reader = PickleReader::new(&pickle);
        assert_matches!(reader.read_list::<u32>(2), Err(PickleError::Malformed(_)));
    }

    #[test]
    fn curve_key_pickle_is_the_raw_key() {
        let key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let pickle = key.to_pickle_bytes();

        assert_eq!(pickle, key.as_bytes());
        assert_eq!(Curve25519PublicKey::from_pickle_bytes(&pickle).unwrap(), key);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert_matches!(u32::from_pickle_bytes(&[0, 0, 0, 1, 0]), Err(PickleError::Malformed(_)));
    }

    proptest! {
        #[test]
        fn u32_lists_survive_pickling(values in prop::collection::vec(any::<u32>(), 0..16)) {
            let needed = list_pickle_len(values.iter());
            let mut target = vec![0u8; needed];

            let mut writer = PickleWriter::new(&mut target, needed).unwrap();
            writer.write_list(values.iter()).unwrap();
            prop_assert_eq!(writer.finish(), needed);

            let mut reader = PickleReader::new(&target);
            let decoded: Vec<u32> = reader.read_list(16).unwrap();
            prop_assert_eq!(reader.consumed(), needed);
            prop_assert_eq!(decoded, values);
        }
    }
}
