//! A Raft replica: leader election with pre-vote, log replication, majority
//! commit and membership changes, behind pluggable transport and log store
//! abstractions.

pub mod config;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod raft;

#[cfg(feature = "grpc")]
pub mod raft_client;
#[cfg(feature = "grpc")]
pub mod raft_service;
#[cfg(feature = "grpc")]
pub mod server;

pub use error::{RaftError, Result};
