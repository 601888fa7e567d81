//! poolmux - Factory-backed connection pooling with shard-routed multiplexing

pub mod config;
pub mod factory;
pub mod mux;
pub mod pool;

pub use config::Config;
pub use factory::ConnectionFactory;
pub use mux::{Multiplexer, MuxError, MuxState, ShardId, ShardSpec, ShardStats};
pub use pool::{
    ConnectionId, LivelinessCheck, Pool, PoolConfig, PoolError, PoolState, PoolStats,
    PooledConnection,
};
