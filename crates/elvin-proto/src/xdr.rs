//! XDR primitives.
//!
//! Integers are big-endian. 16-bit integers are carried in 32-bit slots for
//! compatibility with older peers. Strings and opaques are a 32-bit length,
//! the bytes, and zero padding up to the next 4-byte boundary. Padding is
//! derived from the declared length, so a zero-length string is exactly one
//! 4-byte word.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Size in bytes of one XDR word.
pub const WORD: usize = 4;

/// Number of zero bytes that follow `len` bytes of string or opaque data.
pub const fn padding(len: usize) -> usize {
    (WORD - len % WORD) % WORD
}

/// Encoded size of a string or opaque of `len` bytes, header included.
pub const fn opaque_len(len: usize) -> usize {
    WORD + len + padding(len)
}

/// Types that can write themselves in XDR form.
pub trait Encode {
    /// Append the encoded form to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Types that can be read back from XDR form.
pub trait Decode: Sized {
    /// Read one value from the reader, advancing it.
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self>;
}

/// Decode a single value from the front of `input`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_from<T: Decode>(input: &[u8]) -> Result<(T, usize)> {
    let mut reader = XdrReader::new(input);
    let value = T::decode(&mut reader)?;
    Ok((value, reader.position()))
}

/// Extension methods that write XDR fields into any [`BufMut`].
pub trait XdrBufMut: BufMut {
    /// Write a 16-bit signed integer in a 32-bit slot.
    fn put_xdr_i16(&mut self, value: i16) {
        self.put_i32(i32::from(value));
    }

    /// Write a 16-bit unsigned integer in a 32-bit slot.
    fn put_xdr_u16(&mut self, value: u16) {
        self.put_u32(u32::from(value));
    }

    /// Write a boolean as a 32-bit 0 or 1.
    fn put_xdr_bool(&mut self, value: bool) {
        self.put_i32(i32::from(value));
    }

    /// Write an element count.
    fn put_xdr_count(&mut self, count: usize) {
        self.put_i32(count as i32);
    }

    /// Write a length-prefixed, padded opaque block.
    fn put_xdr_opaque(&mut self, data: &[u8]) {
        self.put_xdr_count(data.len());
        self.put_slice(data);
        self.put_bytes(0, padding(data.len()));
    }

    /// Write a length-prefixed, padded UTF-8 string.
    fn put_xdr_string(&mut self, value: &str) {
        self.put_xdr_opaque(value.as_bytes());
    }

    /// Write a counted array of strings.
    fn put_xdr_string_array<S: AsRef<str>>(&mut self, values: &[S]) {
        self.put_xdr_count(values.len());
        for value in values {
            self.put_xdr_string(value.as_ref());
        }
    }

    /// Write a counted array of 64-bit ids.
    fn put_xdr_u64_array(&mut self, values: &[u64]) {
        self.put_xdr_count(values.len());
        for value in values {
            self.put_u64(*value);
        }
    }

    /// Write an optional boolean as a presence flag followed by the value.
    fn put_xdr_optional_bool(&mut self, value: Option<bool>) {
        self.put_xdr_bool(value.is_some());
        if let Some(value) = value {
            self.put_xdr_bool(value);
        }
    }
}

impl<B: BufMut + ?Sized> XdrBufMut for B {}

/// Bounds-checked cursor over an XDR byte slice.
///
/// Every read checks the remaining input first and fails with
/// [`ProtocolError::Truncated`] rather than reading past the end.
#[derive(Debug, Clone)]
pub struct XdrReader<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> XdrReader<'a> {
    /// Create a reader positioned at the start of `input`.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.position)
    }

    /// True when all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail with [`ProtocolError::TrailingBytes`] if input remains.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.remaining();
        let end = self
            .position
            .checked_add(len)
            .ok_or(ProtocolError::Truncated { needed: len, available })?;
        let bytes = self
            .input
            .get(self.position..end)
            .ok_or(ProtocolError::Truncated { needed: len, available })?;
        self.position = end;
        Ok(bytes)
    }

    fn take_word<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read a signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.take_word::<4>().map(i32::from_be_bytes)
    }

    /// Read an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.take_word::<4>().map(u32::from_be_bytes)
    }

    /// Read a signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.take_word::<8>().map(i64::from_be_bytes)
    }

    /// Read an unsigned 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.take_word::<8>().map(u64::from_be_bytes)
    }

    /// Read a 16-bit signed integer carried in a 32-bit slot.
    pub fn read_i16(&mut self) -> Result<i16> {
        let raw = self.read_i32()?;
        i16::try_from(raw).map_err(|_| ProtocolError::CorruptValue(raw))
    }

    /// Read a 16-bit unsigned integer carried in a 32-bit slot.
    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_u32()?;
        u16::try_from(raw).map_err(|_| ProtocolError::CorruptValue(raw as i32))
    }

    /// Read a 64-bit IEEE-754 double.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.take_word::<8>().map(f64::from_be_bytes)
    }

    /// Read a boolean; anything other than 0 or 1 is corrupt.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_i32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::CorruptValue(other)),
        }
    }

    /// Read an optional boolean written by [`XdrBufMut::put_xdr_optional_bool`].
    pub fn read_optional_bool(&mut self) -> Result<Option<bool>> {
        if self.read_bool()? { self.read_bool().map(Some) } else { Ok(None) }
    }

    /// Read a non-negative length or count.
    pub fn read_length(&mut self) -> Result<usize> {
        let raw = self.read_i32()?;
        usize::try_from(raw).map_err(|_| ProtocolError::NegativeLength(raw))
    }

    /// Read an element count, rejecting counts that could not possibly fit
    /// in the remaining input given each element needs at least
    /// `min_element_len` bytes.
    pub fn read_count(&mut self, min_element_len: usize) -> Result<usize> {
        let count = self.read_length()?;
        let needed = count.saturating_mul(min_element_len.max(1));
        let available = self.remaining();
        if needed > available {
            return Err(ProtocolError::Truncated { needed, available });
        }
        Ok(count)
    }

    /// Read a length-prefixed opaque block, borrowing from the input.
    pub fn read_opaque(&mut self) -> Result<&'a [u8]> {
        let len = self.read_length()?;
        let needed = len.saturating_add(padding(len));
        let available = self.remaining();
        if needed > available {
            return Err(ProtocolError::Truncated { needed, available });
        }
        let data = self.take(len)?;
        self.take(padding(len))?;
        Ok(data)
    }

    /// Read a length-prefixed opaque block into owned bytes.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        self.read_opaque().map(Bytes::copy_from_slice)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let data = self.read_opaque()?;
        std::str::from_utf8(data).map(str::to_owned).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read a counted array of strings.
    pub fn read_string_array(&mut self) -> Result<Vec<String>> {
        let count = self.read_count(WORD)?;
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Read a counted array of 64-bit ids.
    pub fn read_u64_array(&mut self) -> Result<Vec<u64>> {
        let count = self.read_count(8)?;
        (0..count).map(|_| self.read_u64()).collect()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    fn encoded(f: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut buf = BytesMut::new();
        f(&mut buf);
        buf
    }

    #[test]
    fn sixteen_bit_values_use_a_full_word() {
        let buf = encoded(|b| b.put_xdr_i16(-2));
        assert_eq!(&buf[..], &hex!("ff ff ff fe"));

        let mut reader = XdrReader::new(&buf);
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert_eq!(reader.position(), 4);

        let buf = encoded(|b| b.put_xdr_u16(0xbeef));
        let mut reader = XdrReader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 0xbeef);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn sixteen_bit_out_of_range_is_corrupt() {
        let input = hex!("00 01 00 00");
        let mut reader = XdrReader::new(&input);
        assert_eq!(reader.read_i16(), Err(ProtocolError::CorruptValue(0x0001_0000)));
    }

    #[test]
    fn string_padding_follows_declared_length() {
        assert_eq!(&encoded(|b| b.put_xdr_string(""))[..], &hex!("00 00 00 00"));
        assert_eq!(&encoded(|b| b.put_xdr_string("a"))[..], &hex!("00 00 00 01 61 00 00 00"));
        assert_eq!(&encoded(|b| b.put_xdr_string("abcd"))[..], &hex!("00 00 00 04 61 62 63 64"));
        assert_eq!(
            &encoded(|b| b.put_xdr_string("abcde"))[..],
            &hex!("00 00 00 05 61 62 63 64 65 00 00 00")
        );
    }

    #[test]
    fn empty_string_consumes_one_word() {
        let input = hex!("00 00 00 00 00 00 00 07");
        let mut reader = XdrReader::new(&input);
        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.read_i32().unwrap(), 7);
    }

    #[test]
    fn short_string_is_truncated() {
        let input = hex!("00 00 00 05 61 62");
        let mut reader = XdrReader::new(&input);
        assert!(matches!(reader.read_string(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn missing_padding_is_truncated() {
        let input = hex!("00 00 00 01 61");
        let mut reader = XdrReader::new(&input);
        assert!(matches!(reader.read_opaque(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn negative_length_is_rejected() {
        let input = hex!("ff ff ff ff");
        let mut reader = XdrReader::new(&input);
        assert_eq!(reader.read_opaque(), Err(ProtocolError::NegativeLength(-1)));
    }

    #[test]
    fn huge_count_is_rejected_before_allocation() {
        let input = hex!("7f ff ff ff 00 00 00 00");
        let mut reader = XdrReader::new(&input);
        assert!(matches!(reader.read_string_array(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let buf = encoded(|b| b.put_xdr_opaque(&[0xff, 0xfe]));
        let mut reader = XdrReader::new(&buf);
        assert_eq!(reader.read_string(), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn booleans_must_be_zero_or_one() {
        let input = hex!("00 00 00 01 00 00 00 02");
        let mut reader = XdrReader::new(&input);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bool(), Err(ProtocolError::CorruptValue(2)));
    }

    #[test]
    fn reads_never_pass_the_end() {
        let input = hex!("00 00 00");
        let mut reader = XdrReader::new(&input);
        assert_eq!(
            reader.read_i32(),
            Err(ProtocolError::Truncated { needed: 4, available: 3 })
        );
        assert_eq!(reader.position(), 0);
        assert!(reader.read_u64().is_err());
    }

    #[test]
    fn finish_reports_trailing_bytes() {
        let input = hex!("00 00");
        let reader = XdrReader::new(&input);
        assert_eq!(reader.finish(), Err(ProtocolError::TrailingBytes(2)));
    }

    proptest! {
        #[test]
        fn integers_round_trip(a in any::<i32>(), b in any::<u32>(), c in any::<i64>(), d in any::<u64>()) {
            let buf = encoded(|buf| {
                buf.put_i32(a);
                buf.put_u32(b);
                buf.put_i64(c);
                buf.put_u64(d);
            });
            prop_assert_eq!(buf.len(), 24);
            let mut reader = XdrReader::new(&buf);
            prop_assert_eq!(reader.read_i32().unwrap(), a);
            prop_assert_eq!(reader.read_u32().unwrap(), b);
            prop_assert_eq!(reader.read_i64().unwrap(), c);
            prop_assert_eq!(reader.read_u64().unwrap(), d);
            prop_assert_eq!(reader.position(), buf.len());
        }

        #[test]
        fn doubles_round_trip_bitwise(value in any::<f64>()) {
            let buf = encoded(|buf| buf.put_f64(value));
            let mut reader = XdrReader::new(&buf);
            prop_assert_eq!(reader.read_f64().unwrap().to_bits(), value.to_bits());
            prop_assert_eq!(reader.position(), 8);
        }

        #[test]
        fn strings_round_trip(value in ".{0,64}") {
            let buf = encoded(|buf| buf.put_xdr_string(&value));
            prop_assert_eq!(buf.len(), opaque_len(value.len()));
            prop_assert_eq!(buf.len() % WORD, 0);
            let mut reader = XdrReader::new(&buf);
            prop_assert_eq!(reader.read_string().unwrap(), value);
            prop_assert_eq!(reader.position(), buf.len());
        }

        #[test]
        fn opaques_round_trip(value in proptest::collection::vec(any::<u8>(), 0..64)) {
            let buf = encoded(|buf| buf.put_xdr_opaque(&value));
            let mut reader = XdrReader::new(&buf);
            prop_assert_eq!(reader.read_opaque().unwrap(), &value[..]);
            prop_assert_eq!(reader.position(), buf.len());
        }
    }
}
