//! One-shot import of the legacy XML queue format (spec.md §6): read once at
//! startup, feed into the catalogue, then delete the source file. Grounded
//! on `quick-xml`'s serde integration as used by `ikatson-rqbit`.

use std::path::Path;

use serde::Deserialize;

use crate::queue_item::{Priority, QueueItemSnapshot, SegmentRecord, SourceRecord, UserId};

#[derive(Debug, thiserror::Error)]
pub enum LegacyXmlError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed legacy queue XML: {0}")]
    De(#[from] quick_xml::de::DeError),
    #[error("segment {start}-{end} out of range for size {size}")]
    BadSegment { start: u64, end: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, LegacyXmlError>;

#[derive(Debug, Deserialize)]
#[serde(rename = "Downloads")]
struct DownloadsDoc {
    #[serde(rename = "Download", default)]
    downloads: Vec<DownloadElem>,
}

#[derive(Debug, Deserialize)]
struct DownloadElem {
    #[serde(rename = "@Target")]
    target: String,
    #[serde(rename = "@TempTarget", default)]
    temp_target: Option<String>,
    #[serde(rename = "@Size")]
    size: u64,
    #[serde(rename = "@TTH")]
    tth: String,
    #[serde(rename = "@Priority", default)]
    priority: Option<i64>,
    #[serde(rename = "@Added", default)]
    added: Option<u64>,
    #[serde(rename = "@MaxSegments", default)]
    max_segments: Option<u8>,
    #[serde(rename = "Segment", default)]
    segments: Vec<SegmentElem>,
    #[serde(rename = "Source", default)]
    sources: Vec<SourceElem>,
}

#[derive(Debug, Deserialize)]
struct SegmentElem {
    #[serde(rename = "@Start")]
    start: u64,
    #[serde(rename = "@Size")]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SourceElem {
    #[serde(rename = "@CID")]
    cid: String,
    #[serde(rename = "@Nick", default)]
    #[allow(dead_code)]
    nick: Option<String>,
}

/// Parses the legacy queue file and returns snapshots ready to merge into
/// the catalogue. Does not delete the file; the caller deletes it only
/// after a successful catalogue merge (spec.md §6: "deletes source file on
/// success").
pub fn parse(path: &Path) -> Result<Vec<QueueItemSnapshot>> {
    let text = std::fs::read_to_string(path)?;
    let doc: DownloadsDoc = quick_xml::de::from_str(&text)?;

    let mut out = Vec::with_capacity(doc.downloads.len());
    for d in doc.downloads {
        let mut root = [0u8; crate::tigertree::HASH_SIZE];
        if let Some(decoded) = crate::pfs::tth_from_base32(&d.tth) {
            root = decoded;
        }

        let mut done_ranges = Vec::with_capacity(d.segments.len());
        for seg in &d.segments {
            let end = seg.start + seg.size;
            if end > d.size {
                return Err(LegacyXmlError::BadSegment { start: seg.start, end, size: d.size });
            }
            done_ranges.push(SegmentRecord { start: seg.start, end });
        }

        let sources = d
            .sources
            .into_iter()
            .filter_map(|s| {
                let bytes = cid_to_bytes(&s.cid)?;
                Some(SourceRecord { user_id: UserId::from_bytes(&bytes), bad: false, flags: 0 })
            })
            .collect();

        out.push(QueueItemSnapshot {
            tmp_target: d.temp_target.unwrap_or_else(|| format!("{}.dctmp", d.target)),
            target: d.target,
            size: d.size,
            root,
            priority: d.priority.map(Priority::from_i64).unwrap_or(Priority::Normal),
            auto_priority: d.priority.is_none(),
            flags: 0,
            added: d.added.unwrap_or(0),
            done_ranges,
            max_segments: d.max_segments.unwrap_or(0),
            sources,
        });
    }
    Ok(out)
}

fn cid_to_bytes(cid: &str) -> Option<Vec<u8>> {
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, cid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_legacy_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Queue.xml");
        std::fs::write(
            &path,
            r#"<Downloads>
                <Download Target="C:\dl\file.bin" Size="100" TTH="ABCDEFGHIJKLMNOPQRSTUVWXYZ234567" Priority="3" Added="42">
                    <Segment Start="0" Size="50"/>
                    <Source CID="ABCDEFGHIJKLMNOPQRSTUVWXYZ234567"/>
                </Download>
            </Downloads>"#,
        )
        .unwrap();

        let items = parse(&path).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, 100);
        assert_eq!(items[0].done_ranges, vec![SegmentRecord { start: 0, end: 50 }]);
        assert_eq!(items[0].sources.len(), 1);
    }

    #[test]
    fn rejects_a_segment_past_the_end_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Queue.xml");
        std::fs::write(
            &path,
            r#"<Downloads>
                <Download Target="f" Size="10" TTH="ABCDEFGHIJKLMNOPQRSTUVWXYZ234567">
                    <Segment Start="5" Size="10"/>
                </Download>
            </Downloads>"#,
        )
        .unwrap();
        assert!(matches!(parse(&path), Err(LegacyXmlError::BadSegment { .. })));
    }
}
