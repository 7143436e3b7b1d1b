//! File-backed log store
//!
//! Entries are bincode records in fixed-capacity segment files
//! (`segment_<start>.log`); term, vote and commit index live in `meta.json`.
//! The whole log is cached in memory, the files are only read on open.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use crate::raft::log::{check_contiguous, Entry, HardState, LogStore};
use crate::raft::segment::Segment;

const ENTRIES_PER_SEGMENT: u64 = 4096; // Default number of entries per segment file
const META_FILE: &str = "meta.json";

/// First index of the segment that holds `index`.
fn segment_start(index: u64, capacity: u64) -> u64 {
    ((index - 1) / capacity) * capacity + 1
}

fn parse_segment_start(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("segment_")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

pub struct FileLog {
    entries: Vec<Entry>,
    segments: BTreeMap<u64, Segment>,
    hard_state: HardState,
    base_path: PathBuf,
    entries_per_segment: u64,
}

impl FileLog {
    /// Opens the log under `base_path`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        Self::open_with_capacity(base_path, ENTRIES_PER_SEGMENT)
    }

    /// Opens the log with `entries_per_segment` entries per segment file. The
    /// capacity must not change between restarts.
    pub fn open_with_capacity<P: AsRef<Path>>(
        base_path: P,
        entries_per_segment: u64,
    ) -> Result<Self> {
        let entries_per_segment = entries_per_segment.max(1);
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let meta_path = base_path.join(META_FILE);
        let hard_state = if meta_path.exists() {
            serde_json::from_slice(&fs::read(&meta_path)?)?
        } else {
            HardState::default()
        };

        // Find all segment files
        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&base_path)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let start = parse_segment_start(&path)?;
                Some((start, path))
            })
            .collect();
        segment_files.sort_by_key(|(start, _)| *start);

        let mut segments = BTreeMap::new();
        let mut entries: Vec<Entry> = Vec::new();
        let mut broken = false;

        for (start_index, segment_path) in segment_files {
            // Everything after a gap is unreachable and is discarded.
            if broken || start_index != entries.len() as u64 + 1 {
                broken = true;
                fs::remove_file(&segment_path)?;
                continue;
            }

            let mut segment = Segment::new(&segment_path, start_index)?;
            for data in segment.read_all()? {
                let entry: Entry = bincode::deserialize(&data)?;
                if entry.index() != entries.len() as u64 + 1 {
                    return Err(RaftError::Storage(format!(
                        "segment {} holds entry {} out of order",
                        segment_path.display(),
                        entry.index()
                    )));
                }
                entries.push(entry);
            }
            segments.insert(start_index, segment);
        }

        Ok(FileLog {
            entries,
            segments,
            hard_state,
            base_path,
            entries_per_segment,
        })
    }

    fn get_segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    fn get_or_create_segment(&mut self, start_index: u64) -> Result<&mut Segment> {
        if !self.segments.contains_key(&start_index) {
            let path = self.get_segment_path(start_index);
            let segment = Segment::new(path, start_index)?;
            self.segments.insert(start_index, segment);
        }
        self.segments
            .get_mut(&start_index)
            .ok_or_else(|| RaftError::Storage(format!("missing segment {}", start_index)))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl LogStore for FileLog {
    fn append(&mut self, entry: Entry) -> Result<u64> {
        check_contiguous(self.last_index(), &entry)?;
        let index = entry.index();
        let data = bincode::serialize(&entry)?;
        let start = segment_start(index, self.entries_per_segment);
        let segment = self.get_or_create_segment(start)?;
        if segment.next_index() != index {
            return Err(RaftError::Storage(format!(
                "segment {} expects entry {}, got {}",
                start,
                segment.next_index(),
                index
            )));
        }
        segment.append(&[data])?;
        self.entries.push(entry);
        Ok(index)
    }

    fn get(&self, index: u64) -> Result<Option<Entry>> {
        if index == 0 {
            return Ok(None);
        }
        Ok(self.entries.get(index as usize - 1).cloned())
    }

    fn truncate_after(&mut self, index: u64) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }

        let doomed: Vec<u64> = self.segments.range(index + 1..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..=index).next_back() {
            segment.truncate_after(index)?;
        }

        self.entries.truncate(index as usize);
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term()).unwrap_or(0)
    }

    fn hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn save_hard_state(&mut self, state: HardState) -> Result<()> {
        let meta_path = self.base_path.join(META_FILE);
        let temp_path = self.base_path.join("meta.tmp");

        // Write to temporary file first
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&serde_json::to_vec(&state)?)?;
        file.sync_all()?;
        fs::rename(&temp_path, &meta_path)?;

        self.hard_state = state;
        Ok(())
    }
}
