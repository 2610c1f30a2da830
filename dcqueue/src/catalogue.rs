//! The on-disk SQLite catalogue, reached only through this narrow
//! key/value-shaped interface (schema ownership is out of scope — the
//! crate treats it purely as an external collaborator, per spec.md §1/§6).

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::queue_item::{Priority, QueueItemSnapshot, SegmentRecord, SourceRecord};
use crate::tigertree::{Hash192, TigerTree};

#[derive(Debug, thiserror::Error)]
pub enum CatalogueError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("tree for root {0} has a mismatched leaf count")]
    CorruptTree(String),
}

pub type Result<T> = std::result::Result<T, CatalogueError>;

/// File hash + queue persistence, as listed in spec.md §6. Structural
/// errors here are logged and never block the in-memory core (§7:
/// "Catalogue errors are logged; the core never blocks on persistence").
pub trait Catalogue: Send + Sync {
    fn get_tree(&self, root: &Hash192) -> Result<Option<(TigerTree, u64)>>;
    fn add_tree(&self, root: &Hash192, tree: &TigerTree) -> Result<()>;
    fn check_tth(&self, path_id: u64, size: u64, mtime: u64) -> Result<Option<Hash192>>;
    fn add_file(&self, path_id: u64, name: &str, mtime: u64, root: &Hash192, size: u64) -> Result<()>;

    fn merge_queue_all_items(&self, items: &[QueueItemSnapshot]) -> Result<()>;
    fn merge_queue_all_segments(&self, target: &str, segments: &[SegmentRecord]) -> Result<()>;
    fn remove_queue_item(&self, target: &str) -> Result<()>;
    fn load_queue(&self) -> Result<Vec<QueueItemSnapshot>>;
}

pub struct SqliteCatalogue {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteCatalogue {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS trees (
                root        BLOB PRIMARY KEY,
                file_size   INTEGER NOT NULL,
                block_size  INTEGER NOT NULL,
                leaves      BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS hashed_files (
                path_id     INTEGER PRIMARY KEY,
                name        TEXT NOT NULL,
                mtime       INTEGER NOT NULL,
                size        INTEGER NOT NULL,
                root        BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS queue_items (
                target        TEXT PRIMARY KEY,
                tmp_target    TEXT NOT NULL,
                size          INTEGER NOT NULL,
                root          BLOB NOT NULL,
                priority      INTEGER NOT NULL,
                auto_priority INTEGER NOT NULL,
                flags         INTEGER NOT NULL,
                added         INTEGER NOT NULL,
                done_ranges   TEXT NOT NULL,
                max_segments  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS queue_sources (
                target  TEXT NOT NULL,
                user_id BLOB NOT NULL,
                bad     INTEGER NOT NULL,
                flags   INTEGER NOT NULL,
                PRIMARY KEY (target, user_id)
            );
            ",
        )?;
        Ok(Self { conn: std::sync::Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }
}

impl Catalogue for SqliteCatalogue {
    fn get_tree(&self, root: &Hash192) -> Result<Option<(TigerTree, u64)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(u64, u64, Vec<u8>)> = conn
            .query_row(
                "SELECT file_size, block_size, leaves FROM trees WHERE root = ?1",
                params![root.as_slice()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((file_size, block_size, leaf_bytes)) = row else { return Ok(None) };
        if leaf_bytes.len() % crate::tigertree::HASH_SIZE != 0 {
            return Err(CatalogueError::CorruptTree(hex::encode(root)));
        }
        let leaves: Vec<Hash192> = leaf_bytes
            .chunks_exact(crate::tigertree::HASH_SIZE)
            .map(|c| c.try_into().unwrap())
            .collect();
        let tree = TigerTree::from_leaves(file_size, block_size, leaves)
            .map_err(|_| CatalogueError::CorruptTree(hex::encode(root)))?;
        Ok(Some((tree, block_size)))
    }

    fn add_tree(&self, root: &Hash192, tree: &TigerTree) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut leaf_bytes = Vec::with_capacity(tree.leaves().len() * crate::tigertree::HASH_SIZE);
        for leaf in tree.leaves() {
            leaf_bytes.extend_from_slice(leaf);
        }
        conn.execute(
            "INSERT OR REPLACE INTO trees (root, file_size, block_size, leaves) VALUES (?1, ?2, ?3, ?4)",
            params![root.as_slice(), tree.file_size(), tree.block_size(), leaf_bytes],
        )?;
        Ok(())
    }

    fn check_tth(&self, path_id: u64, size: u64, mtime: u64) -> Result<Option<Hash192>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT root FROM hashed_files WHERE path_id = ?1 AND size = ?2 AND mtime = ?3",
                params![path_id, size, mtime],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.map(|v| {
            let mut h = [0u8; crate::tigertree::HASH_SIZE];
            h.copy_from_slice(&v);
            h
        }))
    }

    fn add_file(&self, path_id: u64, name: &str, mtime: u64, root: &Hash192, size: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO hashed_files (path_id, name, mtime, size, root) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path_id, name, mtime, size, root.as_slice()],
        )?;
        Ok(())
    }

    fn merge_queue_all_items(&self, items: &[QueueItemSnapshot]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for item in items {
            let done_ranges = encode_ranges(&item.done_ranges);
            conn.execute(
                "INSERT OR REPLACE INTO queue_items
                 (target, tmp_target, size, root, priority, auto_priority, flags, added, done_ranges, max_segments)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                params![
                    item.target,
                    item.tmp_target,
                    item.size,
                    item.root.as_slice(),
                    item.priority as i64,
                    item.auto_priority as i64,
                    item.flags,
                    item.added,
                    done_ranges,
                    item.max_segments,
                ],
            )?;
            for src in &item.sources {
                conn.execute(
                    "INSERT OR REPLACE INTO queue_sources (target, user_id, bad, flags) VALUES (?1,?2,?3,?4)",
                    params![item.target, src.user_id.as_bytes(), src.bad as i64, src.flags],
                )?;
            }
        }
        Ok(())
    }

    fn merge_queue_all_segments(&self, target: &str, segments: &[SegmentRecord]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let done_ranges = encode_ranges(segments);
        conn.execute(
            "UPDATE queue_items SET done_ranges = ?1 WHERE target = ?2",
            params![done_ranges, target],
        )?;
        Ok(())
    }

    fn remove_queue_item(&self, target: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queue_sources WHERE target = ?1", params![target])?;
        conn.execute("DELETE FROM queue_items WHERE target = ?1", params![target])?;
        Ok(())
    }

    fn load_queue(&self) -> Result<Vec<QueueItemSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target, tmp_target, size, root, priority, auto_priority, flags, added, done_ranges, max_segments FROM queue_items",
        )?;
        let mut out = Vec::new();
        let rows = stmt.query_map([], |r| {
            let root_bytes: Vec<u8> = r.get(3)?;
            let priority: i64 = r.get(4)?;
            let done_ranges: String = r.get(8)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u64>(2)?,
                root_bytes,
                priority,
                r.get::<_, i64>(5)? != 0,
                r.get::<_, u16>(6)?,
                r.get::<_, i64>(7)?,
                done_ranges,
                r.get::<_, u8>(9)?,
            ))
        })?;
        for row in rows {
            let (target, tmp_target, size, root_bytes, priority, auto_priority, flags, added, done_ranges, max_segments) =
                row?;
            let mut root = [0u8; crate::tigertree::HASH_SIZE];
            if root_bytes.len() == root.len() {
                root.copy_from_slice(&root_bytes);
            }
            let sources = load_sources(&conn, &target)?;
            out.push(QueueItemSnapshot {
                target,
                tmp_target,
                size,
                root,
                priority: Priority::from_i64(priority),
                auto_priority,
                flags,
                added,
                done_ranges: decode_ranges(&done_ranges),
                max_segments,
                sources,
            });
        }
        Ok(out)
    }
}

fn load_sources(conn: &Connection, target: &str) -> Result<Vec<SourceRecord>> {
    let mut stmt = conn.prepare("SELECT user_id, bad, flags FROM queue_sources WHERE target = ?1")?;
    let rows = stmt.query_map(params![target], |r| {
        let user_id: Vec<u8> = r.get(0)?;
        Ok((user_id, r.get::<_, i64>(1)? != 0, r.get::<_, u8>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (user_id, bad, flags) = row?;
        out.push(SourceRecord { user_id: crate::queue_item::UserId::from_bytes(&user_id), bad, flags });
    }
    Ok(out)
}

fn encode_ranges(ranges: &[SegmentRecord]) -> String {
    ranges.iter().map(|s| format!("{}-{}", s.start, s.end)).collect::<Vec<_>>().join(",")
}

fn decode_ranges(s: &str) -> Vec<SegmentRecord> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',')
        .filter_map(|part| {
            let (a, b) = part.split_once('-')?;
            Some(SegmentRecord { start: a.parse().ok()?, end: b.parse().ok()? })
        })
        .collect()
}

pub fn path_id_for(path: &PathBuf) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_check_tth_round_trip() {
        let cat = SqliteCatalogue::open_in_memory().unwrap();
        let root = [9u8; crate::tigertree::HASH_SIZE];
        cat.add_file(1, "a.bin", 1000, &root, 4096).unwrap();
        let found = cat.check_tth(1, 4096, 1000).unwrap();
        assert_eq!(found, Some(root));
        assert_eq!(cat.check_tth(1, 4096, 999).unwrap(), None);
    }

    #[test]
    fn queue_item_round_trip_through_catalogue() {
        let cat = SqliteCatalogue::open_in_memory().unwrap();
        let item = QueueItemSnapshot {
            target: "T1".into(),
            tmp_target: "T1.dctmp".into(),
            size: 10,
            root: [1u8; crate::tigertree::HASH_SIZE],
            priority: Priority::Normal,
            auto_priority: true,
            flags: 0,
            added: 123,
            done_ranges: vec![SegmentRecord { start: 0, end: 4 }, SegmentRecord { start: 6, end: 10 }],
            max_segments: 3,
            sources: vec![],
        };
        cat.merge_queue_all_items(std::slice::from_ref(&item)).unwrap();
        let loaded = cat.load_queue().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].target, item.target);
        assert_eq!(loaded[0].done_ranges, item.done_ranges);
    }
}
