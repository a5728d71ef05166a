//! Boot/root key pair carried inside a TPM-unsealed blob.
//!
//! Wire layout, little-endian:
//!
//! ```text
//! u16 count (= 2)
//! count x { u16 type (1 = boot, 2 = root), u16 size, [u8; size] }
//! ```

use crate::buf::{BufError, Reader, Writer};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Number of entries a valid blob carries
pub const KEY_COUNT: u16 = 2;

const ENTRY_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyKind {
    Boot = 1,
    Root = 2,
}

impl TryFrom<u16> for KeyKind {
    type Error = SealedKeyError;

    fn try_from(tag: u16) -> Result<Self> {
        match tag {
            1 => Ok(KeyKind::Boot),
            2 => Ok(KeyKind::Root),
            _ => Err(SealedKeyError::UnknownKeyType(tag)),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Boot => f.write_str("boot"),
            KeyKind::Root => f.write_str("root"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SealedKeyError {
    #[error("sealed key blob truncated: {0}")]
    Truncated(#[from] BufError),
    #[error("expected {} key entries, blob declares {0}", KEY_COUNT)]
    InvalidCount(u16),
    #[error("unknown key type tag {0}")]
    UnknownKeyType(u16),
    #[error("blob carries two {0} keys")]
    DuplicateKey(KeyKind),
    #[error("{kind} key is {len} bytes, at most {} fit in a blob entry", u16::MAX)]
    KeyTooLarge { kind: KeyKind, len: usize },
}

pub type Result<T, E = SealedKeyError> = core::result::Result<T, E>;

/// Key pair split out of a blob. Both buffers are wiped on drop.
pub struct SealedKeys {
    pub boot: Zeroizing<Vec<u8>>,
    pub root: Zeroizing<Vec<u8>>,
}

impl SealedKeys {
    pub fn get(&self, kind: KeyKind) -> &[u8] {
        match kind {
            KeyKind::Boot => &self.boot,
            KeyKind::Root => &self.root,
        }
    }
}

impl fmt::Debug for SealedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedKeys")
            .field("boot", &format_args!("<{} bytes>", self.boot.len()))
            .field("root", &format_args!("<{} bytes>", self.root.len()))
            .finish()
    }
}

/// Splits an unsealed blob into its boot and root keys.
///
/// Bytes following the second entry are ignored. On error every key
/// already copied out is zeroized before returning.
pub fn split(blob: &[u8]) -> Result<SealedKeys> {
    let mut reader = Reader::new(blob);
    let count = reader.read_u16()?;
    if count != KEY_COUNT {
        return Err(SealedKeyError::InvalidCount(count));
    }

    let mut boot: Option<Zeroizing<Vec<u8>>> = None;
    let mut root: Option<Zeroizing<Vec<u8>>> = None;
    for _ in 0..count {
        let tag = reader.read_u16()?;
        let size = reader.read_u16()?;
        let kind = KeyKind::try_from(tag)?;
        let bytes = Zeroizing::new(reader.take(size.into())?.to_vec());
        let slot = match kind {
            KeyKind::Boot => &mut boot,
            KeyKind::Root => &mut root,
        };
        if slot.is_some() {
            return Err(SealedKeyError::DuplicateKey(kind));
        }
        *slot = Some(bytes);
    }

    // Two entries without a duplicate means both slots are filled
    match (boot, root) {
        (Some(boot), Some(root)) => Ok(SealedKeys { boot, root }),
        (None, _) => Err(SealedKeyError::DuplicateKey(KeyKind::Root)),
        (_, None) => Err(SealedKeyError::DuplicateKey(KeyKind::Boot)),
    }
}

/// Serializes a key pair into the form [`split`] accepts.
pub fn combine(boot: &[u8], root: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut writer =
        Writer::with_capacity(2 + 2 * ENTRY_HEADER_LEN + boot.len() + root.len());
    writer.put_u16(KEY_COUNT);
    for (kind, key) in [(KeyKind::Boot, boot), (KeyKind::Root, root)] {
        let size = u16::try_from(key.len()).map_err(|_| SealedKeyError::KeyTooLarge {
            kind,
            len: key.len(),
        })?;
        writer.put_u16(kind as u16);
        writer.put_u16(size);
        writer.put_bytes(key);
    }
    Ok(Zeroizing::new(writer.into_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn blob(entries: &[(u16, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as u16).to_le_bytes().to_vec();
        for (tag, key) in entries {
            let bytes = key.as_bytes();
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    #[test]
    fn split_boot_then_root() -> Result<()> {
        let keys = split(&blob(&[(1, "abcd"), (2, "xyz")]))?;
        assert_eq!(&keys.boot[..], b"abcd");
        assert_eq!(&keys.root[..], b"xyz");
        Ok(())
    }

    #[test]
    fn split_root_then_boot() -> Result<()> {
        let keys = split(&blob(&[(2, "root"), (1, "boot")]))?;
        assert_eq!(keys.get(KeyKind::Boot), b"boot");
        assert_eq!(keys.get(KeyKind::Root), b"root");
        Ok(())
    }

    #[test]
    fn split_rejects_wrong_count() {
        for count in [0u16, 1, 3, u16::MAX] {
            let mut bytes = blob(&[(1, "abcd"), (2, "xyz")]);
            bytes[..2].copy_from_slice(&count.to_le_bytes());
            assert_eq!(
                split(&bytes).unwrap_err(),
                SealedKeyError::InvalidCount(count)
            );
        }
    }

    #[test]
    fn split_rejects_empty_buffer() {
        assert!(matches!(
            split(&[]).unwrap_err(),
            SealedKeyError::Truncated(_)
        ));
    }

    #[test]
    fn split_rejects_truncated_payload() {
        let mut bytes = blob(&[(1, "abcd"), (2, "xyz")]);
        bytes.pop();
        assert!(matches!(
            split(&bytes).unwrap_err(),
            SealedKeyError::Truncated(BufError::Underflow { needed: 3, .. })
        ));
    }

    #[test]
    fn split_rejects_oversized_declared_size() {
        let mut bytes = blob(&[(1, "abcd"), (2, "xyz")]);
        // boot entry size field claims 0xffff bytes
        bytes[4..6].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            split(&bytes).unwrap_err(),
            SealedKeyError::Truncated(_)
        ));
    }

    #[test]
    fn split_rejects_unknown_tag() {
        let bytes = blob(&[(1, "abcd"), (7, "xyz")]);
        assert_eq!(split(&bytes).unwrap_err(), SealedKeyError::UnknownKeyType(7));
    }

    #[test]
    fn split_rejects_two_boot_keys() {
        let bytes = blob(&[(1, "abcd"), (1, "xyz")]);
        assert_eq!(
            split(&bytes).unwrap_err(),
            SealedKeyError::DuplicateKey(KeyKind::Boot)
        );
    }

    #[test]
    fn split_ignores_trailing_bytes() -> Result<()> {
        let mut bytes = blob(&[(1, "a"), (2, "b")]);
        bytes.extend_from_slice(b"trailer");
        let keys = split(&bytes)?;
        assert_eq!(&keys.boot[..], b"a");
        assert_eq!(&keys.root[..], b"b");
        Ok(())
    }

    #[test]
    fn combine_matches_wire_layout() -> Result<()> {
        let combined = combine(b"abcd", b"xyz")?;
        assert_eq!(&combined[..], &blob(&[(1, "abcd"), (2, "xyz")])[..]);
        Ok(())
    }

    #[test]
    fn combine_then_split_preserves_keys() -> Result<()> {
        let large: Vec<u8> = (0..u16::MAX as usize).map(|i| i as u8).collect();
        for (boot, root) in [(&b""[..], &b""[..]), (&large[..], &b"r"[..])] {
            let keys = split(&combine(boot, root)?)?;
            assert_eq!(&keys.boot[..], boot);
            assert_eq!(&keys.root[..], root);
        }
        Ok(())
    }

    #[test]
    fn combine_rejects_oversized_key() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            combine(b"boot", &big).unwrap_err(),
            SealedKeyError::KeyTooLarge {
                kind: KeyKind::Root,
                len: big.len()
            }
        );
    }

    #[test]
    fn debug_redacts_key_bytes() -> Result<()> {
        let keys = split(&blob(&[(1, "s3cr3t"), (2, "hunter2")]))?;
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<6 bytes>"));
        Ok(())
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Any length a u16 size field can carry, with a seeded byte pattern
        fn key() -> impl Strategy<Value = Vec<u8>> {
            (0..=u16::MAX as usize, any::<u8>()).prop_map(|(len, seed)| {
                (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
            })
        }

        proptest! {
            #[test]
            fn combine_then_split_round_trips(boot in key(), root in key()) {
                let keys = split(&combine(&boot, &root).unwrap()).unwrap();
                prop_assert_eq!(&keys.boot[..], &boot[..]);
                prop_assert_eq!(&keys.root[..], &root[..]);
            }

            #[test]
            fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
                let _ = split(&bytes);
            }

            #[test]
            fn well_formed_prefix_with_random_tail_never_panics(
                tags in prop::collection::vec(0u16..4, 0..4),
                tail in prop::collection::vec(any::<u8>(), 0..64),
            ) {
                let mut bytes = (tags.len() as u16).to_le_bytes().to_vec();
                for tag in &tags {
                    bytes.extend_from_slice(&tag.to_le_bytes());
                    bytes.extend_from_slice(&1u16.to_le_bytes());
                    bytes.push(0x5a);
                }
                bytes.extend_from_slice(&tail);
                let _ = split(&bytes);
            }
        }
    }
}
