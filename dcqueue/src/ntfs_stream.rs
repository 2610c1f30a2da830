//! `.gltth` NTFS alternate data stream (spec.md §6): stores the TTH root,
//! block size, file size, and mtime alongside a finished file so a later
//! rehash can be skipped. Windows-only; a no-op elsewhere.

use crate::tigertree::{Hash192, TigerTree, HASH_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum NtfsStreamError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("truncated .gltth stream")]
    Truncated,
    #[error("bad .gltth magic {0:#010x}")]
    BadMagic(u32),
    #[error(".gltth header checksum mismatch")]
    ChecksumMismatch,
}

pub type Result<T> = std::result::Result<T, NtfsStreamError>;

const MAGIC: u32 = 0x5454_484C;
/// `magic:u32 | checksum:u32 | fileSize:u64 | timeStamp:u64 | root:[24]u8 | blockSize:u64`.
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + HASH_SIZE + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub file_size: u64,
    pub time_stamp: u64,
    pub root: Hash192,
    pub block_size: u64,
}

fn xor_words(bytes: &[u8]) -> u32 {
    bytes.chunks_exact(4).fold(0u32, |acc, chunk| acc ^ u32::from_le_bytes(chunk.try_into().unwrap()))
}

/// Encodes the fixed header (with a self-cancelling checksum: XOR'ing every
/// 32-bit word of the header, checksum included, yields zero) followed by
/// the tree's leaf hashes.
pub fn encode(tree: &TigerTree, time_stamp: u64) -> Vec<u8> {
    use bytes::BufMut;

    let root = tree.root().unwrap_or([0u8; HASH_SIZE]);
    let leaves = tree.leaves();

    let mut header = bytes::BytesMut::with_capacity(HEADER_LEN);
    header.put_u32_le(MAGIC);
    header.put_u32_le(0); // checksum placeholder, patched below
    header.put_u64_le(tree.file_size());
    header.put_u64_le(time_stamp);
    header.put_slice(&root);
    header.put_u64_le(tree.block_size());

    let checksum = xor_words(&header);
    header[4..8].copy_from_slice(&checksum.to_le_bytes());

    let mut buf = bytes::BytesMut::with_capacity(HEADER_LEN + leaves.len() * HASH_SIZE);
    buf.put_slice(&header);
    for leaf in leaves {
        buf.put_slice(leaf);
    }
    buf.to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<(Header, Vec<Hash192>)> {
    if bytes.len() < HEADER_LEN {
        return Err(NtfsStreamError::Truncated);
    }
    if xor_words(&bytes[..HEADER_LEN]) != 0 {
        return Err(NtfsStreamError::ChecksumMismatch);
    }

    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(NtfsStreamError::BadMagic(magic));
    }
    let file_size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let time_stamp = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let mut root = [0u8; HASH_SIZE];
    root.copy_from_slice(&bytes[24..24 + HASH_SIZE]);
    let block_size = u64::from_le_bytes(bytes[24 + HASH_SIZE..HEADER_LEN].try_into().unwrap());

    let rest = &bytes[HEADER_LEN..];
    if rest.len() % HASH_SIZE != 0 {
        return Err(NtfsStreamError::Truncated);
    }
    let leaves = rest.chunks_exact(HASH_SIZE).map(|c| c.try_into().unwrap()).collect();

    Ok((Header { file_size, time_stamp, root, block_size }, leaves))
}

#[cfg(target_os = "windows")]
pub mod stream {
    use super::*;
    use std::path::Path;

    const STREAM_NAME: &str = ":gltth";

    pub fn write(target: &Path, tree: &TigerTree, time_stamp: u64) -> Result<()> {
        let stream_path = format!("{}{}", target.display(), STREAM_NAME);
        std::fs::write(stream_path, encode(tree, time_stamp))?;
        Ok(())
    }

    /// Reads back `.gltth`, validating magic/checksum (in `decode`) and that
    /// the stored size/mtime still match the file on disk (spec.md §6).
    pub fn read(target: &Path, expected_size: u64, expected_mtime: u64) -> Result<Option<(Header, Vec<Hash192>)>> {
        let stream_path = format!("{}{}", target.display(), STREAM_NAME);
        match std::fs::read(stream_path) {
            Ok(bytes) => {
                let (header, leaves) = decode(&bytes)?;
                if header.file_size != expected_size || header.time_stamp != expected_mtime {
                    return Ok(None);
                }
                Ok(Some((header, leaves)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub mod stream {
    use super::*;
    use std::path::Path;

    pub fn write(_target: &Path, _tree: &TigerTree, _time_stamp: u64) -> Result<()> {
        Ok(())
    }

    pub fn read(_target: &Path, _expected_size: u64, _expected_mtime: u64) -> Result<Option<(Header, Vec<Hash192>)>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut tree = TigerTree::new(200 * 1024, 64 * 1024).unwrap();
        tree.update(&vec![7u8; 200 * 1024]);
        tree.finalize();

        let encoded = encode(&tree, 1_700_000_000);
        let (header, leaves) = decode(&encoded).unwrap();
        assert_eq!(header.file_size, tree.file_size());
        assert_eq!(header.block_size, tree.block_size());
        assert_eq!(header.time_stamp, 1_700_000_000);
        assert_eq!(Some(header.root), tree.root());
        assert_eq!(leaves, tree.leaves());
    }

    #[test]
    fn header_checksum_is_self_cancelling() {
        let mut tree = TigerTree::new(64 * 1024, 64 * 1024).unwrap();
        tree.update(&vec![1u8; 64 * 1024]);
        tree.finalize();

        let encoded = encode(&tree, 42);
        assert_eq!(xor_words(&encoded[..HEADER_LEN]), 0);
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(decode(&[0u8; 10]), Err(NtfsStreamError::Truncated)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut tree = TigerTree::new(64 * 1024, 64 * 1024).unwrap();
        tree.update(&vec![1u8; 64 * 1024]);
        tree.finalize();
        let mut encoded = encode(&tree, 1);
        encoded[0] ^= 0xFF;
        assert!(matches!(decode(&encoded), Err(NtfsStreamError::BadMagic(_)) | Err(NtfsStreamError::ChecksumMismatch)));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut tree = TigerTree::new(64 * 1024, 64 * 1024).unwrap();
        tree.update(&vec![1u8; 64 * 1024]);
        tree.finalize();
        let mut encoded = encode(&tree, 1);
        encoded[40] ^= 0xFF; // corrupt a root byte without touching magic
        assert!(matches!(decode(&encoded), Err(NtfsStreamError::ChecksumMismatch)));
    }
}
