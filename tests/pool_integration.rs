//! Integration tests for the connection pool
//!
//! These tests drive the pool through its public API with a simulated
//! connection factory, covering capacity limits, aging, liveliness
//! sweeps, and shutdown.

use async_trait::async_trait;
use poolmux::{ConnectionFactory, LivelinessCheck, Pool, PoolConfig, PoolError, PoolState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("simulated connect failure")]
struct ConnectError;

struct SimConn {
    serial: u32,
}

#[derive(Default)]
struct SimState {
    opened: AtomicU32,
    closed: AtomicU32,
    fail_opens: AtomicU32,
    dead: Mutex<HashSet<u32>>,
}

/// Factory over an in-memory "backend"; connections are serial numbers
#[derive(Clone, Default)]
struct SimFactory {
    state: Arc<SimState>,
}

impl SimFactory {
    fn mark_dead(&self, serial: u32) {
        self.state.dead.lock().unwrap().insert(serial);
    }

    fn closed_count(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for SimFactory {
    type Connection = SimConn;
    type Error = ConnectError;

    async fn open(&self) -> Result<SimConn, ConnectError> {
        if self.state.fail_opens.load(Ordering::SeqCst) > 0 {
            self.state.fail_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectError);
        }
        Ok(SimConn {
            serial: self.state.opened.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn probe(&self, conn: &mut SimConn) -> Result<(), ConnectError> {
        if self.state.dead.lock().unwrap().contains(&conn.serial) {
            Err(ConnectError)
        } else {
            Ok(())
        }
    }

    async fn close(&self, _conn: SimConn) -> Result<(), ConnectError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FlagState {
    opened: AtomicU32,
    probes: AtomicU32,
    failed: Mutex<HashSet<u32>>,
}

/// Factory whose connections report failure through the cheap flag check
#[derive(Clone, Default)]
struct FlagFactory {
    state: Arc<FlagState>,
}

impl FlagFactory {
    fn mark_failed(&self, serial: u32) {
        self.state.failed.lock().unwrap().insert(serial);
    }

    fn probe_count(&self) -> u32 {
        self.state.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FlagFactory {
    type Connection = SimConn;
    type Error = ConnectError;

    async fn open(&self) -> Result<SimConn, ConnectError> {
        Ok(SimConn {
            serial: self.state.opened.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn probe(&self, _conn: &mut SimConn) -> Result<(), ConnectError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _conn: SimConn) -> Result<(), ConnectError> {
        Ok(())
    }

    fn has_failed(&self, conn: &SimConn) -> bool {
        self.state.failed.lock().unwrap().contains(&conn.serial)
    }
}

fn sim_config(min_available: usize, max_limit: usize) -> PoolConfig {
    PoolConfig {
        min_available,
        max_age: Duration::ZERO,
        check_time: Duration::ZERO,
        max_limit,
        connection_retry_limit: 1,
        liveliness: LivelinessCheck::Probe,
    }
}

#[tokio::test]
async fn test_round_trip_restores_free_list() {
    let pool = Pool::new(sim_config(5, 0), SimFactory::default());
    pool.init().await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.free_connections, 5);
    assert_eq!(stats.total_connections, 5);

    let conn = pool.request_connection().await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.free_connections, 4);
    assert_eq!(stats.in_use_connections, 1);

    pool.release_connection(conn).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.free_connections, 5);
    assert_eq!(stats.in_use_connections, 0);
    assert_eq!(stats.total_created, 5);

    pool.close_pool().await;
}

#[tokio::test]
async fn test_capacity_limits() {
    // min 10, hard cap 12
    let pool = Pool::new(sim_config(10, 12), SimFactory::default());
    pool.init().await.unwrap();
    assert_eq!(pool.stats().await.free_connections, 10);

    let mut held = Vec::new();
    for _ in 0..11 {
        held.push(pool.request_connection().await.unwrap());
    }
    assert_eq!(pool.stats().await.total_connections, 11);

    held.push(pool.request_connection().await.unwrap());
    assert_eq!(pool.stats().await.total_connections, 12);

    // at the hard limit with nothing free: rejected
    let err = pool.request_connection().await.unwrap_err();
    assert!(matches!(err, PoolError::HardLimitReached));
    assert_eq!(err.to_string(), "connection hard limit reached");

    for conn in held {
        pool.release_connection(conn).await.unwrap();
    }
    let stats = pool.stats().await;
    assert_eq!(stats.free_connections, 12);
    assert_eq!(stats.in_use_connections, 0);

    pool.close_pool().await;
}

#[tokio::test]
async fn test_init_stops_populating_at_hard_limit() {
    let pool = Pool::new(sim_config(5, 3), SimFactory::default());
    pool.init().await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.state, PoolState::Running);
    assert_eq!(stats.free_connections, 3);

    // the free connections themselves are still usable
    let a = pool.request_connection().await.unwrap();
    let b = pool.request_connection().await.unwrap();
    let c = pool.request_connection().await.unwrap();
    assert!(matches!(
        pool.request_connection().await,
        Err(PoolError::HardLimitReached)
    ));

    for conn in [a, b, c] {
        pool.release_connection(conn).await.unwrap();
    }
    pool.close_pool().await;
}

#[tokio::test]
async fn test_connection_aged_out_while_held_is_retired_on_release() {
    let factory = SimFactory::default();
    let config = PoolConfig {
        max_age: Duration::from_millis(80),
        ..sim_config(1, 0)
    };
    let pool = Pool::new(config, factory);
    pool.init().await.unwrap();

    let conn = pool.request_connection().await.unwrap();
    let held_serial = conn.serial;

    // let the age timer fire while the connection is checked out
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.in_use_connections, 1);

    pool.release_connection(conn).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.total_retired, 1);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.free_connections, 1);

    // the replacement is a different connection
    let replacement = pool.request_connection().await.unwrap();
    assert_ne!(replacement.serial, held_serial);
    pool.release_connection(replacement).await.unwrap();

    pool.close_pool().await;
}

#[tokio::test]
async fn test_foreign_release_rejected_without_side_effects() {
    let pool_a = Pool::new(sim_config(2, 0), SimFactory::default());
    let pool_b = Pool::new(sim_config(2, 0), SimFactory::default());
    pool_a.init().await.unwrap();
    pool_b.init().await.unwrap();

    let conn = pool_a.request_connection().await.unwrap();
    let before = pool_b.stats().await;

    let err = pool_b.release_connection(conn).await.unwrap_err();
    assert!(matches!(err, PoolError::NotOwned));
    assert_eq!(err.to_string(), "connection is not from this pool");

    let after = pool_b.stats().await;
    assert_eq!(before.total_connections, after.total_connections);
    assert_eq!(before.free_connections, after.free_connections);

    pool_a.close_pool().await;
    pool_b.close_pool().await;
}

#[tokio::test]
async fn test_operations_rejected_after_close() {
    let pool = Pool::new(sim_config(1, 0), SimFactory::default());
    pool.init().await.unwrap();

    let conn = pool.request_connection().await.unwrap();
    pool.close_pool().await;
    assert_eq!(pool.state().await, PoolState::Closed);

    let err = pool.request_connection().await.unwrap_err();
    assert_eq!(err.to_string(), "the pool is closing or closed");

    let err = pool.release_connection(conn).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot release connections to a pool that is not running, current state: closed"
    );
}

#[tokio::test]
async fn test_request_before_init_rejected() {
    let pool = Pool::new(sim_config(1, 0), SimFactory::default());
    let err = pool.request_connection().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "must initialize the pool before requesting a connection"
    );
}

#[tokio::test]
async fn test_sweep_retires_dead_idle_connections() {
    let factory = SimFactory::default();
    let handle = factory.clone();
    let config = PoolConfig {
        check_time: Duration::from_millis(60),
        ..sim_config(3, 0)
    };
    let pool = Pool::new(config, factory);
    pool.init().await.unwrap();

    // serials 0, 1, 2 are idle; 1 goes dead behind the pool's back
    handle.mark_dead(1);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.total_retired, 1);
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.free_connections, 3);
    assert!(handle.closed_count() >= 1);

    // the dead serial never comes back
    let mut held = Vec::new();
    let mut serials = HashSet::new();
    for _ in 0..3 {
        let conn = pool.request_connection().await.unwrap();
        serials.insert(conn.serial);
        held.push(conn);
    }
    assert!(!serials.contains(&1));

    for conn in held {
        pool.release_connection(conn).await.unwrap();
    }
    pool.close_pool().await;
}

#[tokio::test]
async fn test_fast_only_retires_flagged_connections_without_probing() {
    let factory = FlagFactory::default();
    let handle = factory.clone();
    let config = PoolConfig {
        liveliness: LivelinessCheck::FastOnly,
        ..sim_config(2, 0)
    };
    let pool = Pool::new(config, factory);
    pool.init().await.unwrap();

    // a healthy round trip consults only the failure flag
    let conn = pool.request_connection().await.unwrap();
    pool.release_connection(conn).await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.free_connections, 2);
    assert_eq!(stats.total_retired, 0);

    // a flagged connection is retired on release and replaced
    let conn = pool.request_connection().await.unwrap();
    let flagged_serial = conn.serial;
    handle.mark_failed(flagged_serial);
    pool.release_connection(conn).await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.total_retired, 1);
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.free_connections, 2);
    assert_eq!(handle.probe_count(), 0);

    // the flagged serial never comes back
    let a = pool.request_connection().await.unwrap();
    let b = pool.request_connection().await.unwrap();
    assert_ne!(a.serial, flagged_serial);
    assert_ne!(b.serial, flagged_serial);
    pool.release_connection(a).await.unwrap();
    pool.release_connection(b).await.unwrap();

    pool.close_pool().await;
}

#[tokio::test]
async fn test_creation_retry_exhaustion() {
    let factory = SimFactory::default();
    factory.state.fail_opens.store(10, Ordering::SeqCst);
    let config = PoolConfig {
        connection_retry_limit: 3,
        ..sim_config(0, 0)
    };
    let pool = Pool::new(config, factory);
    pool.init().await.unwrap();

    let err = pool.request_connection().await.unwrap_err();
    assert!(matches!(err, PoolError::CreateFailed { attempts: 3, .. }));
    assert_eq!(
        err.to_string(),
        "failed to create a connection after 3 attempts"
    );

    pool.close_pool().await;
}

#[tokio::test]
async fn test_close_closes_idle_connections_and_is_idempotent() {
    let factory = SimFactory::default();
    let handle = factory.clone();
    let pool = Pool::new(sim_config(4, 0), factory);
    pool.init().await.unwrap();

    // one connection stays checked out across the close
    let held = pool.request_connection().await.unwrap();

    pool.close_pool().await;
    assert_eq!(pool.state().await, PoolState::Closed);
    assert_eq!(handle.closed_count(), 3);

    pool.close_pool().await;
    assert_eq!(handle.closed_count(), 3);

    drop(held);
}
