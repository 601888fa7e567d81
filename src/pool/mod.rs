//! Connection pooling module
//!
//! This module provides:
//! - Factory-backed connection pools with soft and hard capacity limits
//! - Age-based retirement of long-lived connections
//! - Periodic liveliness sweeps over idle connections
//! - Checked-out connection handles with release tracking

pub mod connection;

pub use connection::{
    ConnectionId, LivelinessCheck, Pool, PoolConfig, PoolError, PoolState, PoolStats,
    PooledConnection,
};
