//! Growable append-only byte buffer with the SSH write-side codec.
//!
//! A [`Buffer`] owns its storage and only ever grows; capacity is reserved in
//! quanta of [`GROW_QUANTUM`] bytes so that repeated small writes do not
//! reallocate. All size arithmetic is overflow-checked, and a write that fails
//! to reserve capacity leaves the contents and length untouched.

use crate::error::WireError;
use crate::reader::Reader;

/// Capacity growth quantum in bytes.
pub const GROW_QUANTUM: usize = 256;

/// Checked addition for size arithmetic; refuses any pair whose sum wraps.
pub(crate) fn checked_add(a: usize, b: usize) -> Result<usize, WireError> {
    a.checked_add(b)
        .ok_or(WireError::SizeOverflow { base: a, add: b })
}

/// Growable byte buffer used to assemble packet payloads.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Take ownership of existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Drop the contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// A read cursor over the current contents.
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.data)
    }

    /// Ensure capacity for at least `total` bytes overall.
    pub fn ensure_size(&mut self, total: usize) -> Result<(), WireError> {
        if self.data.capacity() >= total {
            return Ok(());
        }
        self.grow(total - self.data.len())
    }

    /// Reserve room for `add` more bytes, rounding the new capacity up to the
    /// growth quantum. Capacity never shrinks.
    pub fn grow(&mut self, add: usize) -> Result<(), WireError> {
        let needed = checked_add(self.data.len(), add)?;
        if self.data.capacity() >= needed {
            return Ok(());
        }
        let rounded = checked_add(needed, GROW_QUANTUM - 1)? / GROW_QUANTUM * GROW_QUANTUM;
        self.data
            .try_reserve_exact(rounded - self.data.len())
            .map_err(|_| WireError::OutOfMemory { requested: rounded })?;
        Ok(())
    }

    pub fn write_u8(&mut self, val: u8) -> Result<(), WireError> {
        self.grow(1)?;
        self.data.push(val);
        Ok(())
    }

    /// Big-endian.
    pub fn write_u32(&mut self, val: u32) -> Result<(), WireError> {
        self.grow(4)?;
        self.data.extend_from_slice(&val.to_be_bytes());
        Ok(())
    }

    /// One byte, `0` = false.
    pub fn write_bool(&mut self, val: bool) -> Result<(), WireError> {
        self.write_u8(val as u8)
    }

    /// SSH "string" encoding: `u32` big-endian length followed by the bytes.
    pub fn write_data(&mut self, val: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(val.len()).map_err(|_| WireError::StringTooLong { len: val.len() })?;
        // Reserve everything up front so a failure leaves the length unchanged.
        self.grow(checked_add(4, val.len())?)?;
        self.data.extend_from_slice(&len.to_be_bytes());
        self.data.extend_from_slice(val);
        Ok(())
    }

    /// SSH "string" encoding of UTF-8 text (no terminator is sent).
    pub fn write_str(&mut self, val: &str) -> Result<(), WireError> {
        self.write_data(val.as_bytes())
    }

    /// Raw append without a length prefix.
    pub fn append(&mut self, val: &[u8]) -> Result<(), WireError> {
        self.grow(val.len())?;
        self.data.extend_from_slice(val);
        Ok(())
    }

    /// Remove `len` bytes starting at `offset`, shifting the tail left.
    pub fn remove_data(&mut self, offset: usize, len: usize) -> Result<(), WireError> {
        let end = offset.checked_add(len).ok_or(WireError::BadRemove {
            offset,
            len,
            buf_len: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(WireError::BadRemove {
                offset,
                len,
                buf_len: self.data.len(),
            });
        }
        self.data.drain(offset..end);
        Ok(())
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_add_refuses_wrap() {
        assert!(checked_add(usize::MAX, 1).is_err());
        assert!(checked_add(usize::MAX - 1, 2).is_err());
        assert_eq!(checked_add(usize::MAX, 0), Ok(usize::MAX));
        assert_eq!(checked_add(3, 4), Ok(7));
    }

    #[test]
    fn write_u8_appends() {
        let mut buf = Buffer::new();
        buf.write_u8(0xAB).unwrap();
        buf.write_u8(0xCD).unwrap();
        assert_eq!(buf.as_slice(), &[0xAB, 0xCD]);
    }

    #[test]
    fn write_u32_is_big_endian() {
        let mut buf = Buffer::new();
        buf.write_u32(0x0102_0304).unwrap();
        assert_eq!(buf.as_slice(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn write_bool_encodes_one_byte() {
        let mut buf = Buffer::new();
        buf.write_bool(false).unwrap();
        buf.write_bool(true).unwrap();
        assert_eq!(buf.as_slice(), &[0x00, 0x01]);
    }

    #[test]
    fn write_data_prefixes_length() {
        let mut buf = Buffer::new();
        buf.write_data(b"abc").unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn write_str_sends_no_terminator() {
        let mut buf = Buffer::new();
        buf.write_str("hi").unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn write_empty_string() {
        let mut buf = Buffer::new();
        buf.write_data(b"").unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn append_has_no_prefix() {
        let mut buf = Buffer::new();
        buf.append(b"xyz").unwrap();
        assert_eq!(buf.as_slice(), b"xyz");
    }

    #[test]
    fn grow_rounds_capacity_to_quantum() {
        let mut buf = Buffer::new();
        buf.grow(1).unwrap();
        assert_eq!(buf.capacity(), GROW_QUANTUM);
        buf.grow(GROW_QUANTUM + 1).unwrap();
        assert_eq!(buf.capacity(), 2 * GROW_QUANTUM);
    }

    #[test]
    fn grow_then_write_never_reallocates() {
        let mut buf = Buffer::new();
        buf.grow(1000).unwrap();
        let cap = buf.capacity();
        let ptr = buf.as_slice().as_ptr();
        for i in 0..1000u32 {
            buf.write_u8(i as u8).unwrap();
        }
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.as_slice().as_ptr(), ptr);
    }

    #[test]
    fn capacity_is_monotone() {
        let mut buf = Buffer::new();
        let mut last = 0;
        for _ in 0..50 {
            buf.append(&[0u8; 100]).unwrap();
            assert!(buf.capacity() >= last);
            last = buf.capacity();
        }
    }

    #[test]
    fn ensure_size_is_total_not_additional() {
        let mut buf = Buffer::new();
        buf.append(b"1234").unwrap();
        buf.ensure_size(300).unwrap();
        assert_eq!(buf.capacity(), 2 * GROW_QUANTUM);
        // already satisfied: no change
        buf.ensure_size(5).unwrap();
        assert_eq!(buf.capacity(), 2 * GROW_QUANTUM);
        assert_eq!(buf.as_slice(), b"1234");
    }

    #[test]
    fn failed_grow_leaves_length_unchanged() {
        let mut buf = Buffer::new();
        buf.append(b"keep").unwrap();
        assert!(buf.grow(usize::MAX - 1).is_err());
        assert_eq!(buf.as_slice(), b"keep");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn remove_data_shifts_tail_left() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef").unwrap();
        buf.remove_data(1, 3).unwrap();
        assert_eq!(buf.as_slice(), b"aef");
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn remove_data_at_end() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef").unwrap();
        buf.remove_data(4, 2).unwrap();
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn remove_data_whole_buffer() {
        let mut buf = Buffer::new();
        buf.append(b"abc").unwrap();
        buf.remove_data(0, 3).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn remove_data_out_of_range_fails() {
        let mut buf = Buffer::new();
        buf.append(b"abc").unwrap();
        let err = buf.remove_data(1, 3).unwrap_err();
        assert_eq!(
            err,
            WireError::BadRemove {
                offset: 1,
                len: 3,
                buf_len: 3
            }
        );
        // failed remove leaves the buffer untouched
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn remove_data_offset_overflow_fails() {
        let mut buf = Buffer::new();
        buf.append(b"abc").unwrap();
        assert!(buf.remove_data(usize::MAX, 2).is_err());
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = Buffer::new();
        buf.append(&[0u8; 100]).unwrap();
        let cap = buf.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn remove_preserves_bytes_outside_range(
            data in proptest::collection::vec(any::<u8>(), 0..200),
            offset in 0usize..200,
            len in 0usize..200,
        ) {
            let mut buf = Buffer::from_vec(data.clone());
            let result = buf.remove_data(offset, len);
            if offset + len <= data.len() {
                result.unwrap();
                prop_assert_eq!(buf.len(), data.len() - len);
                prop_assert_eq!(&buf.as_slice()[..offset], &data[..offset]);
                prop_assert_eq!(&buf.as_slice()[offset..], &data[offset + len..]);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(buf.as_slice(), &data[..]);
            }
        }

        #[test]
        fn writes_round_trip_through_reader(
            vals in proptest::collection::vec(any::<u32>(), 0..32),
            blob in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut buf = Buffer::new();
            for &v in &vals {
                buf.write_u32(v).unwrap();
            }
            buf.write_data(&blob).unwrap();

            let mut r = buf.reader();
            for &v in &vals {
                prop_assert_eq!(r.read_u32().unwrap(), v);
            }
            prop_assert_eq!(r.read_string().unwrap(), &blob[..]);
            prop_assert_eq!(r.position(), buf.len());
        }
    }
}
