//! Shard routing module
//!
//! This module provides:
//! - A multiplexer owning one pool per named shard
//! - Pluggable request-to-shard mapping, replaceable at runtime
//! - Runtime shard commissioning and decommissioning
//! - A periodic poll hook for topology re-evaluation

pub mod multiplexer;

pub use multiplexer::{
    Multiplexer, MuxError, MuxState, PollFuture, ShardId, ShardSpec, ShardStats,
};
