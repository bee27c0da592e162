//! Deterministic binary encoding for persisted rowset metadata.
//!
//! The metadata store owns this wire format, so the bytes written for a
//! rowset never change because of a dependency upgrade.
//!
//! # Wire format
//!
//! | Rust type                  | Encoding                                |
//! |----------------------------|-----------------------------------------|
//! | `u8`                       | 1 byte                                  |
//! | `u32` / `i32`              | 4 bytes, little-endian                  |
//! | `u64` / `i64`              | 8 bytes, little-endian                  |
//! | `u128`                     | 16 bytes, little-endian                 |
//! | `bool`                     | 1 byte (`0x00` = false, `0x01` = true)  |
//! | `struct`                   | fields in declaration order             |
//!
//! No function in this module panics; truncated or malformed input is
//! reported through [`EncodingError`].


use thiserror::Error;

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X} (expected 0x00 or 0x01)")]
    InvalidBool(u8),

    /// A format tag did not match any known layout.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },
}

/// Serialize `self` into a byte buffer.
///
/// Output must be deterministic: equal values always produce equal bytes.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer holding
/// several encoded items.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Copies the first `N` bytes of `buf`, failing with
/// [`EncodingError::UnexpectedEof`] when the buffer is shorter.
#[inline]
fn take<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    buf.get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or(EncodingError::UnexpectedEof {
            needed: N,
            available: buf.len(),
        })
}

macro_rules! impl_le_integer {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                    buf.extend_from_slice(&self.to_le_bytes());
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    Ok((<$ty>::from_le_bytes(take::<WIDTH>(buf)?), WIDTH))
                }
            }
        )*
    };
}

impl_le_integer!(u8, u32, i32, u64, i64, u128);

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        match take::<1>(buf)?[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}
