//! Incremental Tiger-hash Merkle tree ("TTH") over fixed-size blocks.
//!
//! Leaf hashes are `Tiger(0x00 || block_bytes)`; internal nodes are
//! `Tiger(0x01 || left || right)`. An odd node at the end of a level is
//! carried up unchanged rather than re-hashed, matching the original
//! `TreeOutputStream` reduction this module is grounded on
//! (`examples/original_source/client/QueueManager.cpp`).

use digest::Digest;
use tiger::Tiger;

pub const HASH_SIZE: usize = 24;
pub type Hash192 = [u8; HASH_SIZE];

pub const MAX_LEAVES: u64 = 1024;
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TigerTreeError {
    #[error("tree not finalized")]
    NotFinalized,
    #[error("block_size must be a power of two, got {0}")]
    BadBlockSize(u64),
}

pub type Result<T> = std::result::Result<T, TigerTreeError>;

/// Smallest power of two >= `max(file_size / MAX_LEAVES, MIN_BLOCK_SIZE)`.
pub fn choose_block_size(file_size: u64) -> u64 {
    let lower_bound = (file_size / MAX_LEAVES).max(MIN_BLOCK_SIZE);
    lower_bound.next_power_of_two()
}

#[derive(Debug, Clone)]
pub struct TigerTree {
    file_size: u64,
    block_size: u64,
    leaves: Vec<Hash192>,
    // Bytes accumulated for the block currently being hashed.
    pending: Vec<u8>,
    pending_len: u64,
    total_fed: u64,
    root: Option<Hash192>,
}

impl TigerTree {
    pub fn new(file_size: u64, block_size: u64) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(TigerTreeError::BadBlockSize(block_size));
        }
        Ok(Self {
            file_size,
            block_size,
            leaves: Vec::with_capacity(((file_size + block_size - 1) / block_size.max(1)) as usize),
            pending: Vec::with_capacity(block_size as usize),
            pending_len: 0,
            total_fed: 0,
            root: None,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn leaves(&self) -> &[Hash192] {
        &self.leaves
    }

    pub fn root(&self) -> Option<Hash192> {
        self.root
    }

    /// Feeds a streaming chunk of file bytes, emitting a leaf each time a
    /// block boundary is crossed. Chunking is arbitrary: feeding the same
    /// bytes in any split produces the same leaves and root.
    pub fn update(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = (self.block_size - self.pending_len) as usize;
            let take = room.min(bytes.len());
            self.pending.extend_from_slice(&bytes[..take]);
            self.pending_len += take as u64;
            self.total_fed += take as u64;
            bytes = &bytes[take..];

            if self.pending_len == self.block_size {
                self.emit_leaf();
            }
        }
    }

    fn emit_leaf(&mut self) {
        let mut hasher = Tiger::new();
        hasher.update([0x00]);
        hasher.update(&self.pending);
        let digest = hasher.finalize();
        let mut leaf = [0u8; HASH_SIZE];
        leaf.copy_from_slice(&digest[..HASH_SIZE]);
        self.leaves.push(leaf);
        self.pending.clear();
        self.pending_len = 0;
    }

    /// Flushes any trailing partial block and computes `root` via the
    /// canonical Tiger-tree reduction. Idempotent once finalized.
    pub fn finalize(&mut self) -> Hash192 {
        if let Some(root) = self.root {
            return root;
        }
        if self.pending_len > 0 || self.leaves.is_empty() {
            self.emit_leaf();
        }
        let root = fold(&self.leaves);
        self.root = Some(root);
        root
    }

    pub fn validate_against(&self, expected_root: &Hash192) -> bool {
        self.root.as_ref().map(|r| r == expected_root).unwrap_or(false)
    }

    /// Reconstructs an already-finalized tree from its leaves, as read back
    /// from the catalogue or a `.gltth` sidecar. The root is recomputed by
    /// folding rather than trusted blindly from storage.
    pub fn from_leaves(file_size: u64, block_size: u64, leaves: Vec<Hash192>) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(TigerTreeError::BadBlockSize(block_size));
        }
        let root = fold(&leaves);
        Ok(Self {
            file_size,
            block_size,
            leaves,
            pending: Vec::new(),
            pending_len: 0,
            total_fed: file_size,
            root: Some(root),
        })
    }
}

/// Pairwise-combines a level of hashes into the level above: `Tiger(0x01 ||
/// left || right)` for each pair, carrying an unpaired trailing node up
/// unchanged. A single leaf is its own root.
fn fold(leaves: &[Hash192]) -> Hash192 {
    if leaves.len() == 1 {
        return leaves[0];
    }
    let mut level: Vec<Hash192> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut i = 0;
        while i + 1 < level.len() {
            let mut hasher = Tiger::new();
            hasher.update([0x01]);
            hasher.update(level[i]);
            hasher.update(level[i + 1]);
            let digest = hasher.finalize();
            let mut combined = [0u8; HASH_SIZE];
            combined.copy_from_slice(&digest[..HASH_SIZE]);
            next.push(combined);
            i += 2;
        }
        if i < level.len() {
            next.push(level[i]);
        }
        level = next;
    }
    level[0]
}

/// Hashes a complete byte slice in one call, as if fed through `update` in
/// a single chunk. Convenience wrapper around `TigerTree` for callers (e.g.
/// `.gltth` reconciliation) that already hold the whole file in memory.
pub fn hash_bytes(bytes: &[u8], block_size: u64) -> Hash192 {
    let mut tree = TigerTree::new(bytes.len() as u64, block_size).expect("block_size is power of two");
    tree.update(bytes);
    tree.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_block_size_respects_minimum() {
        assert_eq!(choose_block_size(0), MIN_BLOCK_SIZE);
        assert_eq!(choose_block_size(1024), MIN_BLOCK_SIZE);
    }

    #[test]
    fn single_block_file_has_one_leaf_equal_root() {
        let data = vec![7u8; 1024];
        let mut tree = TigerTree::new(1024, 64 * 1024).unwrap();
        tree.update(&data);
        let root = tree.finalize();
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.leaves()[0], root);
    }

    #[test]
    fn chunking_does_not_affect_root() {
        let data: Vec<u8> = (0..(200 * 1024usize)).map(|i| (i % 251) as u8).collect();
        let block_size = 64 * 1024;

        let mut whole = TigerTree::new(data.len() as u64, block_size).unwrap();
        whole.update(&data);
        let root_whole = whole.finalize();

        let mut chunked = TigerTree::new(data.len() as u64, block_size).unwrap();
        for chunk in data.chunks(1024) {
            chunked.update(chunk);
        }
        let root_chunked = chunked.finalize();

        assert_eq!(root_whole, root_chunked);
        assert_eq!(whole.leaves(), chunked.leaves());
    }

    #[test]
    fn altering_one_byte_changes_root_and_one_leaf() {
        let block_size = 64 * 1024;
        let mut data: Vec<u8> = (0..(200 * 1024usize)).map(|i| (i % 251) as u8).collect();

        let mut original = TigerTree::new(data.len() as u64, block_size).unwrap();
        original.update(&data);
        let root_original = original.finalize();

        data[150_000] ^= 0xFF;
        let mut altered = TigerTree::new(data.len() as u64, block_size).unwrap();
        altered.update(&data);
        let root_altered = altered.finalize();

        assert_ne!(root_original, root_altered);
        let differing_leaves = original
            .leaves()
            .iter()
            .zip(altered.leaves())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(differing_leaves, 1);
    }

    #[test]
    fn four_leaves_matches_manual_fold() {
        let block_size = 64 * 1024;
        let data = vec![0u8; 200 * 1024]; // ceil(200K / 64K) = 4 leaves (last partial).
        let mut tree = TigerTree::new(data.len() as u64, block_size).unwrap();
        tree.update(&data);
        let root = tree.finalize();
        assert_eq!(tree.leaves().len(), 4);

        let l = tree.leaves();
        let mut h01 = Tiger::new();
        h01.update([0x01]);
        h01.update(l[0]);
        h01.update(l[1]);
        let n01: Hash192 = h01.finalize()[..HASH_SIZE].try_into().unwrap();

        let mut h23 = Tiger::new();
        h23.update([0x01]);
        h23.update(l[2]);
        h23.update(l[3]);
        let n23: Hash192 = h23.finalize()[..HASH_SIZE].try_into().unwrap();

        let mut h_root = Tiger::new();
        h_root.update([0x01]);
        h_root.update(n01);
        h_root.update(n23);
        let expected: Hash192 = h_root.finalize()[..HASH_SIZE].try_into().unwrap();

        assert_eq!(root, expected);
    }
}
