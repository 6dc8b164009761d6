//! Fixed-width index keys.
//!
//! The B+Tree is generic over its key type. A key must have a fixed on-page
//! encoding and a total order; the order is supplied by the key type's `Ord`
//! implementation. `GenericKey<N>` is the stock implementation: an opaque
//! `N`-byte array compared lexicographically, with an order-preserving
//! embedding of signed integers for the debug loaders and tests.

use std::fmt;

/// A key that can be stored in a B+Tree page.
///
/// `Ord` on the key type is the index's comparator: two keys compare the
/// same way their on-page encodings do.
pub trait IndexKey:
    Copy + Clone + Ord + Eq + Default + fmt::Debug + Send + Sync + 'static
{
    /// Number of bytes the key occupies inside a page.
    const ENCODED_LEN: usize;

    /// Writes the key into `buf` (exactly `ENCODED_LEN` bytes).
    fn write_to(&self, buf: &mut [u8]);

    /// Reads a key back from `buf` (exactly `ENCODED_LEN` bytes).
    fn read_from(buf: &[u8]) -> Self;

    /// Builds a key from a signed integer such that integer order matches
    /// key order. Used by the file-based bulk loaders.
    fn from_int(value: i64) -> Self;

    /// Recovers the integer a key was built from.
    fn to_int(&self) -> i64;
}

/// An `N`-byte key compared as raw bytes.
///
/// Integer embedding stores the value big-endian with the sign bit flipped,
/// so lexicographic byte order equals numeric order. Keys narrower than
/// 8 bytes hold the low `N` bytes of the biased value and preserve order
/// for integers that fit in `N` signed bytes; keys wider than 8 bytes keep
/// the integer in their first 8 bytes and zero the rest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// Creates a key from raw bytes.
    pub fn new(data: [u8; N]) -> Self {
        Self { data }
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self { data: [0; N] }
    }
}

impl<const N: usize> fmt::Debug for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are almost always integer-embedded in practice; print that.
        write!(f, "{}", self.to_int())
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const ENCODED_LEN: usize = N;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.data);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut data = [0u8; N];
        data.copy_from_slice(&buf[..N]);
        Self { data }
    }

    fn from_int(value: i64) -> Self {
        let width = N.min(8);
        let bits = 8 * width as u32;
        // Bias by 2^(bits-1): modular sign flip, monotone on the value range.
        let bias = 1u64 << (bits - 1);
        let mut enc = (value as u64).wrapping_add(bias);
        if bits < 64 {
            enc &= (1u64 << bits) - 1;
        }
        let be = enc.to_be_bytes();
        let mut data = [0u8; N];
        data[..width].copy_from_slice(&be[8 - width..]);
        Self { data }
    }

    fn to_int(&self) -> i64 {
        let width = N.min(8);
        let bits = 8 * width as u32;
        let mut be = [0u8; 8];
        be[8 - width..].copy_from_slice(&self.data[..width]);
        let enc = u64::from_be_bytes(be);
        let bias = 1u64 << (bits - 1);
        let raw = enc.wrapping_sub(bias);
        if bits == 64 {
            raw as i64
        } else {
            // Sign-extend narrow widths.
            ((raw << (64 - bits)) as i64) >> (64 - bits)
        }
    }
}

/// 4-byte key.
pub type Key4 = GenericKey<4>;
/// 8-byte key.
pub type Key8 = GenericKey<8>;
/// 16-byte key.
pub type Key16 = GenericKey<16>;
/// 32-byte key.
pub type Key32 = GenericKey<32>;
/// 64-byte key.
pub type Key64 = GenericKey<64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len() {
        assert_eq!(Key4::ENCODED_LEN, 4);
        assert_eq!(Key8::ENCODED_LEN, 8);
        assert_eq!(Key16::ENCODED_LEN, 16);
        assert_eq!(Key32::ENCODED_LEN, 32);
        assert_eq!(Key64::ENCODED_LEN, 64);
    }

    #[test]
    fn test_int_roundtrip() {
        for v in [0i64, 1, -1, 42, -42, i32::MAX as i64, i32::MIN as i64] {
            assert_eq!(Key8::from_int(v).to_int(), v, "value {}", v);
            assert_eq!(Key16::from_int(v).to_int(), v, "value {}", v);
            assert_eq!(Key4::from_int(v).to_int(), v, "value {}", v);
        }
        assert_eq!(Key8::from_int(i64::MAX).to_int(), i64::MAX);
        assert_eq!(Key8::from_int(i64::MIN).to_int(), i64::MIN);
    }

    #[test]
    fn test_int_order_matches_byte_order() {
        let values = [-1000i64, -3, -1, 0, 1, 2, 7, 512, 100_000];
        for window in values.windows(2) {
            assert!(
                Key8::from_int(window[0]) < Key8::from_int(window[1]),
                "{} should sort before {}",
                window[0],
                window[1]
            );
            assert!(Key16::from_int(window[0]) < Key16::from_int(window[1]));
            assert!(Key64::from_int(window[0]) < Key64::from_int(window[1]));
        }
    }

    #[test]
    fn test_narrow_key_order() {
        // Key4 preserves order for values that fit in i32.
        let values = [-70_000i64, -1, 0, 1, 70_000];
        for window in values.windows(2) {
            assert!(Key4::from_int(window[0]) < Key4::from_int(window[1]));
        }
    }

    #[test]
    fn test_page_codec_roundtrip() {
        let key = Key16::from_int(9_999);
        let mut buf = [0u8; 16];
        key.write_to(&mut buf);
        assert_eq!(Key16::read_from(&buf), key);
    }

    #[test]
    fn test_raw_bytes_constructor() {
        let key = Key4::new([1, 2, 3, 4]);
        assert_eq!(key.as_bytes(), &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        key.write_to(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_default_is_all_zero() {
        assert_eq!(Key8::default().as_bytes(), &[0u8; 8]);
    }

    #[test]
    fn test_debug_prints_integer() {
        let key = Key8::from_int(-7);
        assert_eq!(format!("{:?}", key), "-7");
    }
}
