use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;

use crate::raft::{Member, MemberId, RaftConfig};

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: MemberId,
    pub addr: String,
    /// Seeds listed as passive start without voting rights.
    #[serde(default)]
    pub passive: bool,
}

/// Timing knobs, all in milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    pub rpc_timeout: u64,
    pub max_entries_per_append: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_append: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub id: MemberId,
    pub addr: String,
    pub metrics_addr: String,
    pub base_path: String,
    #[serde(default)]
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub raft: TimingConfig,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            base_path: "data".to_string(),
            node_list: Vec::new(),
            raft: TimingConfig::default(),
        }
    }

    /// Loads `path` into the global instance. A missing or malformed file
    /// leaves the defaults in place.
    pub fn from_toml(path: &str) -> RuntimeConfig {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<RuntimeConfig>(&contents) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Something went wrong parsing the runtime config file, {:?}", e);
                    RuntimeConfig::new()
                }
            },
            Err(e) => {
                warn!("Something went wrong reading the runtime config file, {:?}", e);
                RuntimeConfig::new()
            }
        };
        *instance().lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        config
    }

    /// The gRPC endpoint other members dial for `addr`.
    pub fn endpoint(addr: &str) -> String {
        if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        }
    }

    pub fn raft_config(&self) -> RaftConfig {
        let members = self
            .node_list
            .iter()
            .map(|n| {
                let address = Self::endpoint(&n.addr);
                if n.passive {
                    Member::passive(n.id, address)
                } else {
                    Member::active(n.id, address)
                }
            })
            .collect();
        let mut config = RaftConfig::new(self.id, Self::endpoint(&self.addr), members);
        config.election_timeout_min = Duration::from_millis(self.raft.election_timeout_min);
        config.election_timeout_max = Duration::from_millis(self.raft.election_timeout_max);
        config.heartbeat_interval = Duration::from_millis(self.raft.heartbeat_interval);
        config.rpc_timeout = Duration::from_millis(self.raft.rpc_timeout);
        config.max_entries_per_append = self.raft.max_entries_per_append;
        config
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
