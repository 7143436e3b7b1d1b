//! Replicated log entries and the log store interface.

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::cluster::{MemberId, Membership};

/// What an entry carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command for the state machine.
    #[default]
    User,
    /// A membership change: the payload is the resulting `Membership`.
    Config,
}

/// A single log entry. Indexes are dense and start at 1.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Getters, CopyGetters,
)]
pub struct Entry {
    #[getset(get_copy = "pub")]
    index: u64,
    #[getset(get_copy = "pub")]
    term: u64,
    #[getset(get_copy = "pub")]
    kind: EntryKind,
    #[getset(get = "pub")]
    payload: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Entry {
            index,
            term,
            kind,
            payload,
        }
    }

    pub fn user(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self::new(index, term, EntryKind::User, payload)
    }

    pub fn config(index: u64, term: u64, membership: &Membership) -> Result<Self> {
        Ok(Self::new(
            index,
            term,
            EntryKind::Config,
            serde_json::to_vec(membership)?,
        ))
    }

    /// Decodes the membership carried by a CONFIG entry.
    pub fn membership(&self) -> Result<Membership> {
        if self.kind != EntryKind::Config {
            return Err(RaftError::Codec(format!(
                "entry {} is not a config entry",
                self.index
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// State that must survive restarts besides the entries themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<MemberId>,
    pub commit_index: u64,
}

/// Storage for the replicated log.
///
/// Implementations must be crash-consistent up to the last acknowledged
/// `append`. Index 0 never holds an entry; its term is 0.
pub trait LogStore: Send + 'static {
    /// Appends `entry`, which must carry index `last_index() + 1`.
    fn append(&mut self, entry: Entry) -> Result<u64>;

    fn get(&self, index: u64) -> Result<Option<Entry>>;

    /// Removes every entry with an index greater than `index`.
    fn truncate_after(&mut self, index: u64) -> Result<()>;

    fn last_index(&self) -> u64;

    fn last_term(&self) -> u64;

    fn hard_state(&self) -> Result<HardState>;

    fn save_hard_state(&mut self, state: HardState) -> Result<()>;

    /// Entries in `[from, to)`.
    fn entries(&self, from: u64, to: u64) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for index in from.max(1)..to {
            match self.get(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Term of the entry at `index`, `Some(0)` for index 0.
    fn term(&self, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.get(index)?.map(|e| e.term()))
    }

    fn is_empty(&self) -> bool {
        self.last_index() == 0
    }
}

pub(crate) fn check_contiguous(last_index: u64, entry: &Entry) -> Result<()> {
    if entry.index() != last_index + 1 {
        return Err(RaftError::Storage(format!(
            "non-contiguous append: expected index {}, got {}",
            last_index + 1,
            entry.index()
        )));
    }
    Ok(())
}

/// A volatile log store.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
    hard_state: HardState,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entry: Entry) -> Result<u64> {
        check_contiguous(self.last_index(), &entry)?;
        let index = entry.index();
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
        self.hard_state = state;
        Ok(())
    }
}
