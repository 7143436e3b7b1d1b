//! A replicated key-value store
//!
//! Commands and queries are JSON documents. Every operation answers with the
//! JSON encoding of the affected value (`null` when absent).

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::raft::StateMachine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum KvQuery {
    Get { key: String },
}

#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn encode(value: Option<&String>) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<KvCommand>(command) {
            // Put answers with the previous value.
            Ok(KvCommand::Put { key, value }) => Self::encode(self.data.insert(key, value).as_ref()),
            Ok(KvCommand::Delete { key }) => Self::encode(self.data.remove(&key).as_ref()),
            Err(e) => {
                warn!("Ignoring malformed command at index {}: {}", index, e);
                Self::encode(None)
            }
        }
    }

    fn query(&self, query: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<KvQuery>(query) {
            Ok(KvQuery::Get { key }) => Self::encode(self.data.get(&key)),
            Err(e) => {
                warn!("Ignoring malformed query: {}", e);
                Self::encode(None)
            }
        }
    }
}
