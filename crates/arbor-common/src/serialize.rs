//! Serializer contract and primitive implementations.
//!
//! Keys, values and nodes reach storage only through a [`Serializer`]. Writers
//! append to a `BytesMut`; readers consume from a byte cursor (`&mut &[u8]`),
//! advancing it past the bytes they used.

use crate::error::{ArborError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

/// Converts a typed value to and from bytes.
pub trait Serializer<T>: Send + Sync {
    /// Appends the encoded value to `buf`.
    fn write_to(&self, value: &T, buf: &mut BytesMut);

    /// Decodes one value from the front of `data`, advancing it.
    fn read_from(&self, data: &mut &[u8]) -> Result<T>;
}

impl<T, S: Serializer<T> + ?Sized> Serializer<T> for Arc<S> {
    fn write_to(&self, value: &T, buf: &mut BytesMut) {
        (**self).write_to(value, buf)
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<T> {
        (**self).read_from(data)
    }
}

/// Fails with a serialization error when fewer than `needed` bytes remain.
#[inline]
pub fn ensure_remaining(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(ArborError::Serialization(format!(
            "unexpected end of data: need {} bytes, have {}",
            needed,
            data.len()
        )));
    }
    Ok(())
}

/// Serializer for the primitive types.
///
/// Integers and floats are little-endian, strings are UTF-8 with an i32 length
/// prefix, and byte vectors use the same prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveSerializer;

macro_rules! primitive_serializer {
    ($ty:ty, $size:expr, $put:ident, $get:ident) => {
        impl Serializer<$ty> for PrimitiveSerializer {
            fn write_to(&self, value: &$ty, buf: &mut BytesMut) {
                buf.$put(*value);
            }

            fn read_from(&self, data: &mut &[u8]) -> Result<$ty> {
                ensure_remaining(data, $size)?;
                Ok(data.$get())
            }
        }
    };
}

primitive_serializer!(u8, 1, put_u8, get_u8);
primitive_serializer!(i8, 1, put_i8, get_i8);
primitive_serializer!(u16, 2, put_u16_le, get_u16_le);
primitive_serializer!(i16, 2, put_i16_le, get_i16_le);
primitive_serializer!(u32, 4, put_u32_le, get_u32_le);
primitive_serializer!(i32, 4, put_i32_le, get_i32_le);
primitive_serializer!(u64, 8, put_u64_le, get_u64_le);
primitive_serializer!(i64, 8, put_i64_le, get_i64_le);
primitive_serializer!(f32, 4, put_f32_le, get_f32_le);
primitive_serializer!(f64, 8, put_f64_le, get_f64_le);

impl Serializer<bool> for PrimitiveSerializer {
    fn write_to(&self, value: &bool, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*value));
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<bool> {
        ensure_remaining(data, 1)?;
        Ok(data.get_u8() == 1)
    }
}

impl Serializer<char> for PrimitiveSerializer {
    fn write_to(&self, value: &char, buf: &mut BytesMut) {
        buf.put_u32_le(*value as u32);
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<char> {
        ensure_remaining(data, 4)?;
        let raw = data.get_u32_le();
        char::from_u32(raw)
            .ok_or_else(|| ArborError::Serialization(format!("invalid char: {:#x}", raw)))
    }
}

impl Serializer<Vec<u8>> for PrimitiveSerializer {
    fn write_to(&self, value: &Vec<u8>, buf: &mut BytesMut) {
        buf.put_i32_le(value.len() as i32);
        buf.put_slice(value);
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<Vec<u8>> {
        let len = read_length(data)?;
        ensure_remaining(data, len)?;
        let bytes = data[..len].to_vec();
        data.advance(len);
        Ok(bytes)
    }
}

impl Serializer<String> for PrimitiveSerializer {
    fn write_to(&self, value: &String, buf: &mut BytesMut) {
        buf.put_i32_le(value.len() as i32);
        buf.put_slice(value.as_bytes());
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<String> {
        let len = read_length(data)?;
        ensure_remaining(data, len)?;
        let text = std::str::from_utf8(&data[..len])
            .map_err(|e| ArborError::Serialization(format!("invalid utf-8: {}", e)))?
            .to_string();
        data.advance(len);
        Ok(text)
    }
}

fn read_length(data: &mut &[u8]) -> Result<usize> {
    ensure_remaining(data, 4)?;
    let len = data.get_i32_le();
    if len < 0 {
        return Err(ArborError::Serialization(format!(
            "negative length prefix: {}",
            len
        )));
    }
    Ok(len as usize)
}

/// Serializes `(K, V)` pairs by chaining a key and a value serializer.
pub struct PairSerializer<K, V> {
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> PairSerializer<K, V> {
    /// Creates a pair serializer.
    pub fn new(keys: Arc<dyn Serializer<K>>, values: Arc<dyn Serializer<V>>) -> Self {
        Self { keys, values }
    }
}

impl<K, V> Serializer<(K, V)> for PairSerializer<K, V> {
    fn write_to(&self, value: &(K, V), buf: &mut BytesMut) {
        self.keys.write_to(&value.0, buf);
        self.values.write_to(&value.1, buf);
    }

    fn read_from(&self, data: &mut &[u8]) -> Result<(K, V)> {
        let key = self.keys.read_from(data)?;
        let value = self.values.read_from(data)?;
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T, S: Serializer<T>>(ser: &S, value: T) -> T {
        let mut buf = BytesMut::new();
        ser.write_to(&value, &mut buf);
        let mut data: &[u8] = &buf;
        let out = ser.read_from(&mut data).unwrap();
        assert!(data.is_empty(), "reader left {} bytes", data.len());
        out
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut buf = BytesMut::new();
        Serializer::<u32>::write_to(&PrimitiveSerializer, &0x0102_0304, &mut buf);
        assert_eq!(&buf[..], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(round_trip(&PrimitiveSerializer, -7i64), -7);
        assert_eq!(round_trip(&PrimitiveSerializer, u16::MAX), u16::MAX);
    }

    #[test]
    fn test_string_and_bytes() {
        assert_eq!(round_trip(&PrimitiveSerializer, "héllo".to_string()), "héllo");
        assert_eq!(round_trip(&PrimitiveSerializer, String::new()), "");
        assert_eq!(round_trip(&PrimitiveSerializer, vec![1u8, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_bool_char_float() {
        assert!(round_trip(&PrimitiveSerializer, true));
        assert_eq!(round_trip(&PrimitiveSerializer, 'λ'), 'λ');
        assert_eq!(round_trip(&PrimitiveSerializer, 1.5f64), 1.5);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut data: &[u8] = &[1, 2];
        let result: Result<u32> = PrimitiveSerializer.read_from(&mut data);
        assert!(matches!(result, Err(ArborError::Serialization(_))));

        let mut buf = BytesMut::new();
        buf.put_i32_le(10);
        buf.put_slice(b"abc");
        let mut data: &[u8] = &buf;
        let result: Result<String> = PrimitiveSerializer.read_from(&mut data);
        assert!(result.is_err());
    }

    #[test]
    fn test_pair_serializer() {
        let ser = PairSerializer::<String, i32>::new(
            Arc::new(PrimitiveSerializer),
            Arc::new(PrimitiveSerializer),
        );
        let (k, v) = round_trip(&ser, ("key".to_string(), 42));
        assert_eq!(k, "key");
        assert_eq!(v, 42);
    }
}
