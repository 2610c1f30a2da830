//! Runtime configuration (spec.md §6), following the teacher's plain
//! struct-plus-`Default` convention rather than a builder.

use crate::queue_item::Priority;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub file_slots: usize,
    pub segments_manual: bool,
    pub number_of_segments: u8,
    pub auto_search_limit: usize,
    pub auto_search_time: std::time::Duration,
    pub max_auto_match_sources: usize,

    /// Bytes/sec the file's overall running speed must exceed before a slow
    /// source is even considered for drop/disconnect; `0` always considers it.
    pub disconnect_file_speed: u64,
    /// Bytes/sec below which a considered source is removed outright rather
    /// than merely disconnected.
    pub remove_speed: u64,
    pub drop_multisource_only: bool,

    pub keep_finished_files: bool,
    pub keep_lists: bool,
    pub save_tth_in_ntfs_filestream: bool,
    pub fast_hash: bool,

    pub preview_server_port: u16,
    /// Bytes/sec pacing cap for the preview stream; `0` disables pacing.
    pub preview_server_speed: u64,
    pub preview_use_video_scroll: bool,

    pub prio_highest_size: u64,
    pub prio_high_size: u64,
    pub prio_normal_size: u64,
    pub prio_low_size: u64,
    pub prio_lowest: Priority,

    pub hash_throughput_cap: Option<u64>,
    pub catalogue_path: std::path::PathBuf,
    pub legacy_queue_xml: Option<std::path::PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_slots: 3,
            segments_manual: false,
            number_of_segments: 3,
            auto_search_limit: 15,
            auto_search_time: std::time::Duration::from_secs(10 * 60),
            max_auto_match_sources: 4,

            disconnect_file_speed: 0,
            remove_speed: 0,
            drop_multisource_only: true,

            keep_finished_files: false,
            keep_lists: false,
            save_tth_in_ntfs_filestream: false,
            fast_hash: false,

            preview_server_port: 0,
            preview_server_speed: 0,
            preview_use_video_scroll: false,

            prio_highest_size: u64::MAX,
            prio_high_size: u64::MAX,
            prio_normal_size: 0,
            prio_low_size: 0,
            prio_lowest: Priority::Low,

            hash_throughput_cap: None,
            catalogue_path: std::path::PathBuf::from("catalogue.db"),
            legacy_queue_xml: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_ranks_everything_normal_or_lower() {
        let config = Config::default();
        assert_eq!(config.prio_normal_size, 0);
        assert!(config.prio_high_size >= config.prio_normal_size);
    }
}
