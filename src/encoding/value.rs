//! # Value Codec
//!
//! A volume stores one element type, fixed at construction. Rather than
//! overloading on the element type, the tree is polymorphic over exactly
//! the capability set it needs: encode into the flush buffer, decode from
//! the load cursor, and report the encoded size. [`Value`] is that set.
//!
//! ## Wire Formats
//!
//! | Type      | Encoding                                  |
//! |-----------|-------------------------------------------|
//! | `u32`     | 4 bytes little-endian                     |
//! | `u64`     | 8 bytes little-endian                     |
//! | `f32`     | IEEE-754 bits, 4 bytes little-endian      |
//! | `f64`     | IEEE-754 bits, 8 bytes little-endian      |
//! | `String`  | `u32` LE byte length, then UTF-8 bytes    |
//! | `Vec<u8>` | `u32` LE byte length, then the bytes      |
//!
//! The length prefix counts bytes, not characters. Decoding a `String`
//! validates UTF-8; a volume directory written with the byte-buffer type
//! and reopened as strings surfaces the mismatch as a decode error.

use eyre::{ensure, Result, WrapErr};

use super::primitive::{put_u32, put_u64, ByteReader};

/// Capability set a volume element type must provide.
pub trait Value: Clone + Send + Sync + 'static {
    /// Exact number of bytes [`encode`](Value::encode) will append.
    fn encoded_len(&self) -> usize;

    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self>;
}

impl Value for u32 {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, *self);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_u32()
    }
}

impl Value for u64 {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, *self);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_u64()
    }
}

impl Value for f32 {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.to_bits());
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_f32()
    }
}

impl Value for f64 {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.to_bits());
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        reader.read_f64()
    }
}

impl Value for String {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.len() as u32);
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let len = reader.read_u32()? as usize;
        let bytes = reader.take(len)?;
        String::from_utf8(bytes.to_vec()).wrap_err("string value is not valid UTF-8")
    }
}

impl Value for Vec<u8> {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        ensure_fits_u32(self.len());
        put_u32(buf, self.len() as u32);
        buf.extend_from_slice(self);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let len = reader.read_u32()? as usize;
        Ok(reader.take(len)?.to_vec())
    }
}

fn ensure_fits_u32(len: usize) {
    debug_assert!(len <= u32::MAX as usize, "value length exceeds u32 prefix");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<V: Value + PartialEq + std::fmt::Debug>(value: V) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        assert_eq!(buf.len(), value.encoded_len());

        let mut reader = ByteReader::new(&buf);
        let decoded = V::decode(&mut reader).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn fixed_width_values_round_trip() {
        round_trip(0u32);
        round_trip(u32::MAX);
        round_trip(u64::MAX - 7);
        round_trip(1.5f32);
        round_trip(-0.25f64);
    }

    #[test]
    fn variable_width_values_round_trip() {
        round_trip(String::new());
        round_trip("ololo".to_string());
        round_trip("ключ".to_string());
        round_trip(Vec::<u8>::new());
        round_trip(vec![0u8, 255, 1, 2, 3]);
    }

    #[test]
    fn string_decode_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xfe]);

        let mut reader = ByteReader::new(&buf);
        assert!(String::decode(&mut reader).is_err());
    }

    #[test]
    fn string_decode_rejects_truncated_payload() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 10);
        buf.extend_from_slice(b"abc");

        let mut reader = ByteReader::new(&buf);
        assert!(String::decode(&mut reader).is_err());
    }
}
