//! In-memory index over the on-disk log directory.

use crate::persist;
use crate::types::{ClusterEntry, ClusterLogId, ClusterVote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use super::segment::{self, ActiveSegment, SEGMENT_CAPACITY};

const VOTE_FILE: &str = "vote.json";
const META_FILE: &str = "meta.json";

/// Persisted log state metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogMeta {
    last_purged_log_id: Option<ClusterLogId>,
    committed: Option<ClusterLogId>,
}

/// Log entries, vote and metadata, mirrored on disk.
pub struct LogFiles {
    dir: PathBuf,
    segments_dir: PathBuf,
    /// Every live entry, keyed by index.
    pub entries: BTreeMap<u64, ClusterEntry>,
    /// Last purged log ID.
    pub last_purged: Option<ClusterLogId>,
    /// Last committed log ID.
    pub committed: Option<ClusterLogId>,
    /// Current vote.
    pub vote: Option<ClusterVote>,
    active: Option<ActiveSegment>,
}

impl LogFiles {
    /// Load everything under `dir`, creating the layout if missing.
    pub fn load(dir: PathBuf) -> io::Result<Self> {
        let segments_dir = dir.join("segments");
        fs::create_dir_all(&segments_dir)?;

        let mut entries = BTreeMap::new();
        for (_, path) in segment::list_segments(&segments_dir)? {
            for entry in segment::read_segment(&path)? {
                entries.insert(entry.log_id.index, entry);
            }
        }

        let meta: LogMeta = persist::read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let vote: Option<ClusterVote> = persist::read_json(&dir.join(VOTE_FILE))?;

        Ok(Self {
            dir,
            segments_dir,
            entries,
            last_purged: meta.last_purged_log_id,
            committed: meta.committed,
            vote,
            active: None,
        })
    }

    /// Last log id present or purged.
    pub fn last_log_id(&self) -> Option<ClusterLogId> {
        self.entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(self.last_purged)
    }

    /// Append entries and fsync the segments they landed in.
    pub fn append(&mut self, entries: Vec<ClusterEntry>) -> io::Result<()> {
        for entry in entries {
            let index = entry.log_id.index;
            let active = match self.active.take() {
                Some(active) if active.covers(index) => active,
                Some(mut previous) => {
                    previous.sync()?;
                    ActiveSegment::open(&self.segments_dir, segment::segment_base(index))?
                }
                None => ActiveSegment::open(&self.segments_dir, segment::segment_base(index))?,
            };
            let active = self.active.insert(active);
            active.write(&entry)?;
            self.entries.insert(index, entry);
        }

        if let Some(active) = self.active.as_mut() {
            active.sync()?;
        }
        Ok(())
    }

    /// Remove entries at and after `index`.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        self.entries.split_off(&index);
        self.active = None;

        for (base, path) in segment::list_segments(&self.segments_dir)? {
            if base >= index {
                fs::remove_file(&path)?;
            } else if base + SEGMENT_CAPACITY > index {
                let kept: Vec<ClusterEntry> =
                    self.entries.range(base..index).map(|(_, e)| e.clone()).collect();
                if kept.is_empty() {
                    fs::remove_file(&path)?;
                } else {
                    segment::rewrite_segment(&self.segments_dir, base, &kept)?;
                }
            }
        }
        Ok(())
    }

    /// Drop entries up to and including `log_id`, deleting whole segments.
    pub fn purge_upto(&mut self, log_id: ClusterLogId) -> io::Result<()> {
        self.last_purged = Some(log_id);
        self.entries = self.entries.split_off(&(log_id.index + 1));

        for (base, path) in segment::list_segments(&self.segments_dir)? {
            if base + SEGMENT_CAPACITY - 1 <= log_id.index {
                if self.active.as_ref().is_some_and(|a| a.base == base) {
                    self.active = None;
                }
                fs::remove_file(&path)?;
            }
        }

        self.save_meta()
    }

    /// Persist the vote.
    pub fn save_vote(&mut self, vote: &ClusterVote) -> io::Result<()> {
        persist::write_json_atomic(&self.dir.join(VOTE_FILE), vote)?;
        self.vote = Some(*vote);
        Ok(())
    }

    /// Persist purge and commit markers.
    pub fn save_meta(&self) -> io::Result<()> {
        let meta = LogMeta {
            last_purged_log_id: self.last_purged,
            committed: self.committed,
        };
        persist::write_json_atomic(&self.dir.join(META_FILE), &meta)
    }
}
