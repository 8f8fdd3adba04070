//! Message buffers and sequential marshalling
//!
//! A [`Msgbuf`] is a fixed-capacity run of machine words plus a small table
//! of capability slots. Values are appended in order and read back in the
//! same order; there is no self-description in the wire format.
//!
//! ## Encoding
//!
//! - Integers occupy one word each.
//! - Byte strings are a length word followed by the bytes packed
//!   little-endian into whole words, the last one zero-padded.
//! - A capability occupies one word holding the index of its slot, or
//!   [`INVALID_CAP_MARKER`] for the invalid capability. The slot table itself
//!   travels beside the words and is translated by the substrate on delivery.
//!
//! Appending never writes a partial value: if the whole value does not fit,
//! nothing is written and [`MarshalError::BufferFull`] is returned.

use crate::error::MarshalError;
use core_types::{CapRef, ObjectIdentity};
use uuid::Uuid;

/// Unit of message payload
pub type Word = u64;

/// Bytes per [`Word`]
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Upper bound on capability slots per message
pub const MAX_CAPS_PER_MSG: usize = 4;

/// Word written in place of a slot index for the invalid capability
pub const INVALID_CAP_MARKER: Word = Word::MAX;

/// Outcome of copying a message into a receiver's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Words that reached the receiver
    pub words: usize,
    /// Whether trailing words were cut off by the receiver's capacity
    pub truncated: bool,
}

/// A message buffer with a fixed word capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msgbuf {
    words: Vec<Word>,
    caps: Vec<CapRef>,
    capacity: usize,
}

impl Msgbuf {
    /// Creates an empty buffer that holds at most `capacity` words
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
            caps: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Capability slots, in marker order
    pub fn caps(&self) -> &[CapRef] {
        &self.caps
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.caps.clear();
    }

    fn reserve(&self, needed: usize) -> Result<(), MarshalError> {
        let available = self.capacity - self.words.len();
        if needed > available {
            return Err(MarshalError::BufferFull { needed, available });
        }
        Ok(())
    }

    /// Appends one word
    pub fn push_word(&mut self, word: Word) -> Result<(), MarshalError> {
        self.reserve(1)?;
        self.words.push(word);
        Ok(())
    }

    /// Overwrites an already written word
    ///
    /// Used to patch a header word after the body has been marshalled.
    pub fn set_word(&mut self, index: usize, word: Word) -> Result<(), MarshalError> {
        match self.words.get_mut(index) {
            Some(slot) => {
                *slot = word;
                Ok(())
            }
            None => Err(MarshalError::Exhausted { position: index }),
        }
    }

    /// Appends a capability
    ///
    /// Only the local name of `cap` is meaningful to the substrate; the
    /// identity is re-resolved from the sender's capability space.
    pub fn push_cap(&mut self, cap: CapRef) -> Result<(), MarshalError> {
        if !cap.is_valid() {
            return self.push_word(INVALID_CAP_MARKER);
        }
        if self.caps.len() >= MAX_CAPS_PER_MSG {
            return Err(MarshalError::TooManyCaps {
                limit: MAX_CAPS_PER_MSG,
            });
        }
        self.push_word(self.caps.len() as Word)?;
        self.caps.push(cap);
        Ok(())
    }

    /// Appends a length-prefixed byte string
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        let body = bytes.len().div_ceil(WORD_BYTES);
        self.reserve(1 + body)?;
        self.words.push(bytes.len() as Word);
        for chunk in bytes.chunks(WORD_BYTES) {
            let mut raw = [0u8; WORD_BYTES];
            raw[..chunk.len()].copy_from_slice(chunk);
            self.words.push(Word::from_le_bytes(raw));
        }
        Ok(())
    }

    /// Appends any marshallable value
    pub fn push<T: Marshal + ?Sized>(&mut self, value: &T) -> Result<(), MarshalError> {
        value.marshal(self)
    }

    /// Starts reading the buffer from its first word
    pub fn unmarshaller(&self) -> Unmarshaller<'_> {
        Unmarshaller {
            msg: self,
            position: 0,
        }
    }

    /// Copies this message into `dst`, truncating to `dst`'s capacity
    ///
    /// Each capability slot is passed through `translate`, which maps it
    /// into the receiver's capability space.
    pub fn deliver_to<F>(&self, dst: &mut Msgbuf, mut translate: F) -> Delivery
    where
        F: FnMut(&CapRef) -> CapRef,
    {
        let words = self.words.len().min(dst.capacity);
        dst.words.clear();
        dst.words.extend_from_slice(&self.words[..words]);
        dst.caps = self.caps.iter().map(&mut translate).collect();
        Delivery {
            words,
            truncated: words < self.words.len(),
        }
    }
}

/// Sequential reader over a [`Msgbuf`]
#[derive(Debug, Clone)]
pub struct Unmarshaller<'a> {
    msg: &'a Msgbuf,
    position: usize,
}

impl<'a> Unmarshaller<'a> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.msg.words.len() - self.position
    }

    pub fn skip(&mut self, words: usize) -> Result<(), MarshalError> {
        if words > self.remaining() {
            return Err(MarshalError::Exhausted {
                position: self.msg.words.len(),
            });
        }
        self.position += words;
        Ok(())
    }

    pub fn next_word(&mut self) -> Result<Word, MarshalError> {
        let word = self
            .msg
            .words
            .get(self.position)
            .copied()
            .ok_or(MarshalError::Exhausted {
                position: self.position,
            })?;
        self.position += 1;
        Ok(word)
    }

    pub fn next_cap(&mut self) -> Result<CapRef, MarshalError> {
        let marker = self.next_word()?;
        if marker == INVALID_CAP_MARKER {
            return Ok(CapRef::invalid());
        }
        let slot = marker as usize;
        self.msg
            .caps
            .get(slot)
            .copied()
            .ok_or(MarshalError::BadCapSlot { slot })
    }

    pub fn next_bytes(&mut self) -> Result<Vec<u8>, MarshalError> {
        let start = self.position;
        let len = self.next_word()? as usize;
        let body = len.div_ceil(WORD_BYTES);
        if body > self.remaining() {
            self.position = start;
            return Err(MarshalError::Exhausted {
                position: self.msg.words.len(),
            });
        }
        let mut bytes = Vec::with_capacity(body * WORD_BYTES);
        for word in &self.msg.words[self.position..self.position + body] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(len);
        self.position += body;
        Ok(bytes)
    }

    /// Reads the next value of type `T`
    pub fn next<T: Unmarshal>(&mut self) -> Result<T, MarshalError> {
        T::unmarshal(self)
    }
}

/// A value that can be appended to a message
pub trait Marshal {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError>;
}

/// A value that can be read back from a message
pub trait Unmarshal: Sized {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError>;
}

macro_rules! impl_word_int {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
                    msg.push_word(*self as Word)
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
                    let position = reader.position();
                    let word = reader.next_word()?;
                    <$ty>::try_from(word).map_err(|_| MarshalError::WrongKind { position })
                }
            }
        )*
    };
}

impl_word_int!(u8, u16, u32, u64, usize);

impl Marshal for i64 {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_word(*self as Word)
    }
}

impl Unmarshal for i64 {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        Ok(reader.next_word()? as i64)
    }
}

impl Marshal for bool {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_word(Word::from(*self))
    }
}

impl Unmarshal for bool {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        let position = reader.position();
        match reader.next_word()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(MarshalError::WrongKind { position }),
        }
    }
}

impl Marshal for CapRef {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_cap(*self)
    }
}

impl Unmarshal for CapRef {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        reader.next_cap()
    }
}

impl Marshal for ObjectIdentity {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        let (hi, lo) = self.as_uuid().as_u64_pair();
        msg.reserve(2)?;
        msg.words.push(hi);
        msg.words.push(lo);
        Ok(())
    }
}

impl Unmarshal for ObjectIdentity {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        if reader.remaining() < 2 {
            return Err(MarshalError::Exhausted {
                position: reader.position(),
            });
        }
        let hi = reader.next_word()?;
        let lo = reader.next_word()?;
        Ok(ObjectIdentity::from_uuid(Uuid::from_u64_pair(hi, lo)))
    }
}

impl Marshal for [u8] {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_bytes(self)
    }
}

impl Marshal for Vec<u8> {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_bytes(self)
    }
}

impl Unmarshal for Vec<u8> {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        reader.next_bytes()
    }
}

impl Marshal for str {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_bytes(self.as_bytes())
    }
}

impl Marshal for String {
    fn marshal(&self, msg: &mut Msgbuf) -> Result<(), MarshalError> {
        msg.push_bytes(self.as_bytes())
    }
}

impl Unmarshal for String {
    fn unmarshal(reader: &mut Unmarshaller<'_>) -> Result<Self, MarshalError> {
        let position = reader.position();
        let bytes = reader.next_bytes()?;
        String::from_utf8(bytes).map_err(|_| MarshalError::WrongKind { position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::CapSpace;

    #[test]
    fn test_sequential_order() {
        let mut msg = Msgbuf::with_capacity(8);
        msg.push(&7u64).unwrap();
        msg.push(&true).unwrap();
        msg.push(&-3i64).unwrap();

        let mut reader = msg.unmarshaller();
        assert_eq!(reader.next::<u64>().unwrap(), 7);
        assert!(reader.next::<bool>().unwrap());
        assert_eq!(reader.next::<i64>().unwrap(), -3);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_overflow_writes_nothing() {
        let mut msg = Msgbuf::with_capacity(2);
        msg.push_word(1).unwrap();
        let err = msg.push_bytes(b"longer than one word").unwrap_err();
        assert_eq!(
            err,
            MarshalError::BufferFull {
                needed: 4,
                available: 1
            }
        );
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn test_bytes_padding() {
        let mut msg = Msgbuf::with_capacity(8);
        msg.push_bytes(b"hello world").unwrap();
        assert_eq!(msg.len(), 3);

        let mut reader = msg.unmarshaller();
        assert_eq!(reader.next_bytes().unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn test_empty_bytes() {
        let mut msg = Msgbuf::with_capacity(1);
        msg.push_bytes(&[]).unwrap();
        assert_eq!(msg.unmarshaller().next_bytes().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_underflow() {
        let msg = Msgbuf::with_capacity(4);
        let mut reader = msg.unmarshaller();
        assert_eq!(
            reader.next_word(),
            Err(MarshalError::Exhausted { position: 0 })
        );
    }

    #[test]
    fn test_malformed_bool() {
        let mut msg = Msgbuf::with_capacity(1);
        msg.push_word(2).unwrap();
        assert_eq!(
            msg.unmarshaller().next::<bool>(),
            Err(MarshalError::WrongKind { position: 0 })
        );
    }

    #[test]
    fn test_cap_slots_are_bounded() {
        let mut space = CapSpace::new();
        let mut msg = Msgbuf::with_capacity(16);
        for _ in 0..MAX_CAPS_PER_MSG {
            msg.push_cap(space.insert(ObjectIdentity::new())).unwrap();
        }
        let extra = space.insert(ObjectIdentity::new());
        assert_eq!(
            msg.push_cap(extra),
            Err(MarshalError::TooManyCaps {
                limit: MAX_CAPS_PER_MSG
            })
        );
        // The invalid capability takes no slot.
        msg.push_cap(CapRef::invalid()).unwrap();
        assert_eq!(msg.caps().len(), MAX_CAPS_PER_MSG);
    }

    #[test]
    fn test_cap_marker_resolves_slot() {
        let mut space = CapSpace::new();
        let cap = space.insert(ObjectIdentity::new());
        let mut msg = Msgbuf::with_capacity(4);
        msg.push(&1u32).unwrap();
        msg.push_cap(cap).unwrap();
        msg.push_cap(CapRef::invalid()).unwrap();

        let mut reader = msg.unmarshaller();
        reader.skip(1).unwrap();
        assert_eq!(reader.next_cap().unwrap(), cap);
        assert!(!reader.next_cap().unwrap().is_valid());
    }

    #[test]
    fn test_deliver_truncates() {
        let mut msg = Msgbuf::with_capacity(4);
        for word in 0..4 {
            msg.push_word(word).unwrap();
        }
        let mut dst = Msgbuf::with_capacity(2);
        let delivery = msg.deliver_to(&mut dst, |cap| *cap);
        assert_eq!(
            delivery,
            Delivery {
                words: 2,
                truncated: true
            }
        );
        assert_eq!(dst.words(), &[0, 1]);
        assert_eq!(dst.capacity(), 2);
    }

    #[test]
    fn test_deliver_translates_caps() {
        let mut sender = CapSpace::new();
        let mut receiver = CapSpace::new();
        let sender_id = ObjectIdentity::new();
        let object = ObjectIdentity::new();
        let cap = sender.insert(object);

        let mut msg = Msgbuf::with_capacity(2);
        msg.push_cap(cap).unwrap();
        let mut dst = Msgbuf::with_capacity(2);
        msg.deliver_to(&mut dst, |cap| match cap.identity() {
            Some(identity) => receiver.import(sender_id, cap.local_name(), identity),
            None => CapRef::invalid(),
        });

        let received = dst.unmarshaller().next_cap().unwrap();
        assert_eq!(received.identity(), Some(object));
        assert_eq!(receiver.lookup(received.local_name()), Ok(object));
    }

    #[test]
    fn test_string_and_identity() {
        let identity = ObjectIdentity::new();
        let mut msg = Msgbuf::with_capacity(8);
        msg.push("ping").unwrap();
        msg.push(&identity).unwrap();

        let mut reader = msg.unmarshaller();
        assert_eq!(reader.next::<String>().unwrap(), "ping");
        assert_eq!(reader.next::<ObjectIdentity>().unwrap(), identity);
    }

    #[test]
    fn test_set_word() {
        let mut msg = Msgbuf::with_capacity(2);
        msg.push_word(0).unwrap();
        msg.set_word(0, 9).unwrap();
        assert_eq!(msg.words(), &[9]);
        assert!(msg.set_word(1, 0).is_err());
    }
}
