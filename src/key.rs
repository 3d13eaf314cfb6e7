//! Cache keys and their digests.
//!
//! Every cache entry is addressed by a fixed 32-byte [`Digest`] derived from a
//! caller-defined key. The digest determines the on-disk location of the
//! entry; the key's [`Display`](fmt::Display) representation is only used for
//! diagnostics and for [`CacheFile::name`](crate::CacheFile::name).

use std::fmt;

use sha2::{Digest as _, Sha512_256};

/// The size, in bytes, of a key digest.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte digest addressing one cache entry.
///
/// Two keys whose digests are equal address the same entry; collisions are
/// not detected.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// The lowercase hex file name for this digest, 64 characters.
    pub(crate) fn file_name(&self) -> String {
        use fmt::Write;

        let mut name = String::with_capacity(DIGEST_LEN * 2);
        for b in self.0 {
            write!(name, "{b:02x}").unwrap();
        }
        name
    }

    /// Parses a directory-entry name back into a digest.
    ///
    /// Returns `None` unless the name is exactly 64 hex characters, which is
    /// how the scanners tell cache entries apart from unrelated files.
    pub(crate) fn from_file_name(name: &str) -> Option<Self> {
        fn hex_val(c: u8) -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                b'A'..=b'F' => Some(c - b'A' + 10),
                _ => None,
            }
        }

        let bytes = name.as_bytes();
        if bytes.len() != DIGEST_LEN * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_LEN];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            out[i] = hex_val(pair[0])? << 4 | hex_val(pair[1])?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// The contract between callers and the cache.
///
/// A key produces a deterministic [`Digest`] addressing its entry, and a
/// human-readable label through [`Display`](fmt::Display). The label does not
/// have to be unique or reversible.
pub trait CacheKey: fmt::Display {
    /// Returns the digest addressing this key's cache entry.
    fn digest(&self) -> Digest;
}

impl CacheKey for u32 {
    /// The big-endian value itself, right-aligned in 32 bytes.
    fn digest(&self) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        out[DIGEST_LEN - 4..].copy_from_slice(&self.to_be_bytes());
        Digest(out)
    }
}

impl CacheKey for u64 {
    /// The big-endian value itself, right-aligned in 32 bytes.
    fn digest(&self) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        out[DIGEST_LEN - 8..].copy_from_slice(&self.to_be_bytes());
        Digest(out)
    }
}

impl CacheKey for String {
    /// SHA-512/256 of the text.
    fn digest(&self) -> Digest {
        digest_bytes(self.as_bytes())
    }
}

/// A byte-sequence key. The label is the lowercase hex of the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesKey(pub Vec<u8>);

impl CacheKey for BytesKey {
    /// SHA-512/256 of the bytes.
    fn digest(&self) -> Digest {
        digest_bytes(&self.0)
    }
}

impl fmt::Display for BytesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

fn digest_bytes(bytes: &[u8]) -> Digest {
    let hash = Sha512_256::digest(bytes);
    Digest(<[u8; DIGEST_LEN]>::try_from(hash.as_slice()).expect("sha512/256 outputs 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_digests_are_right_aligned() {
        let d = 0x1234_5678_u32.digest();
        assert_eq!(&d.0[..28], &[0u8; 28]);
        assert_eq!(&d.0[28..], &[0x12, 0x34, 0x56, 0x78]);

        let d = 0x0102_0304_0506_0708_u64.digest();
        assert_eq!(&d.0[..24], &[0u8; 24]);
        assert_eq!(&d.0[24..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn text_digest_is_sha512_256() {
        // NIST test vector for SHA-512/256("abc").
        let d = "abc".to_string().digest();
        assert_eq!(
            d.to_string(),
            "53048e2681941ef99b2e29b76b4c7dabe4c2d0c634fc6d46e0e2f13107e7af23"
        );
        assert_eq!(BytesKey(b"abc".to_vec()).digest(), d);
    }

    #[test]
    fn file_name_round_trip() {
        let d = 42_u64.digest();
        let name = d.file_name();
        assert_eq!(name.len(), 64);
        assert_eq!(Digest::from_file_name(&name), Some(d));
        assert_eq!(Digest::from_file_name(&name.to_uppercase()), Some(d));
    }

    #[test]
    fn file_name_rejects_junk() {
        assert_eq!(Digest::from_file_name(""), None);
        assert_eq!(Digest::from_file_name("deadbeef"), None);
        assert_eq!(Digest::from_file_name(&"g".repeat(64)), None);
        assert_eq!(Digest::from_file_name(&"a".repeat(63)), None);
        assert_eq!(Digest::from_file_name(&"a".repeat(65)), None);
    }

    #[test]
    fn labels() {
        assert_eq!(4711_u32.to_string(), "4711");
        assert_eq!(BytesKey(vec![0xde, 0xad]).to_string(), "dead");
    }
}
