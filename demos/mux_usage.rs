//! Example demonstrating shard-routed multiplexing
//!
//! This example shows how to:
//! 1. Commission multiple shards, each with its own pool
//! 2. Route connection requests through a shard mapper
//! 3. Rewrite the topology at runtime from a poll function
//! 4. Monitor per-shard statistics

use async_trait::async_trait;
use poolmux::{ConnectionFactory, LivelinessCheck, Multiplexer, PoolConfig, ShardSpec};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A session against one shard's backend
struct Session {
    serial: u32,
    endpoint: String,
}

impl Session {
    fn run(&mut self, statement: &str) -> String {
        format!("[{}#{}] ok: {}", self.endpoint, self.serial, statement)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("backend {endpoint} refused the connection")]
struct ConnectError {
    endpoint: String,
}

#[derive(Clone)]
struct DemoFactory {
    endpoint: String,
    serials: Arc<AtomicU32>,
}

impl DemoFactory {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            serials: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for DemoFactory {
    type Connection = Session;
    type Error = ConnectError;

    async fn open(&self) -> Result<Session, ConnectError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Session {
            serial: self.serials.fetch_add(1, Ordering::SeqCst),
            endpoint: self.endpoint.clone(),
        })
    }

    async fn probe(&self, _conn: &mut Session) -> Result<(), ConnectError> {
        Ok(())
    }

    async fn close(&self, _conn: Session) -> Result<(), ConnectError> {
        Ok(())
    }
}

fn shard_config() -> PoolConfig {
    PoolConfig {
        min_available: 3,
        max_age: Duration::ZERO,
        check_time: Duration::ZERO,
        max_limit: 8,
        connection_retry_limit: 3,
        liveliness: LivelinessCheck::Probe,
    }
}

fn shard_spec(shard_id: &str, endpoint: &str) -> ShardSpec<DemoFactory> {
    ShardSpec {
        shard_id: shard_id.to_string(),
        config: shard_config(),
        factory: DemoFactory::new(endpoint),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Tenants whose id ends in an even digit live on us-east, the rest
    // on us-west
    let mux = Multiplexer::new(
        vec![
            shard_spec("us-east", "east.demo:48004"),
            shard_spec("us-west", "west.demo:48004"),
        ],
        |tenant: &String| {
            let last_digit = tenant
                .chars()
                .next_back()
                .and_then(|c| c.to_digit(10))
                .unwrap_or(0);
            if last_digit % 2 == 0 {
                "us-east".to_string()
            } else {
                "us-west".to_string()
            }
        },
    );
    mux.init().await?;
    info!("Multiplexer initialized with shards: {:?}", mux.shard_ids().await);

    // Route some tenant traffic
    for i in 0..8 {
        let tenant = format!("tenant-{}", i);
        let mut conn = mux.request_connection(&tenant).await?;
        let reply = conn.run(&format!("SELECT * FROM orders WHERE tenant = '{}'", tenant));
        info!(
            shard = conn.shard_id().map(String::as_str).unwrap_or("?"),
            "{}",
            reply
        );
        mux.release_connection(conn).await?;
    }

    // A poll function watches the topology and brings a spillover shard
    // online once, then redirects every tenant to it
    mux.set_poll(|mux: Multiplexer<DemoFactory, String>| async move {
        let stats = mux.stats().await;
        for (shard_id, shard) in &stats {
            info!(
                shard = %shard_id,
                free = shard.pool.free_connections,
                outstanding = shard.outstanding_connections,
                "Poll observed shard"
            );
        }
        if !stats.contains_key("eu-central") {
            info!("Commissioning spillover shard eu-central");
            if let Err(e) = mux
                .commission_shard(shard_spec("eu-central", "eu.demo:48004"))
                .await
            {
                warn!("Spillover commission failed: {}", e);
                return;
            }
            mux.set_mapper(|_tenant: &String| "eu-central".to_string())
                .await;
        }
    })
    .await;
    mux.set_poll_interval(Duration::from_millis(500)).await?;

    // Give the poll a couple of cycles to take effect
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut conn = mux.request_connection(&"tenant-0".to_string()).await?;
    let reply = conn.run("SELECT 1");
    info!(
        shard = conn.shard_id().map(String::as_str).unwrap_or("?"),
        "tenant-0 now routes to the spillover shard: {}", reply
    );
    mux.release_connection(conn).await?;

    // Retire a shard that no longer receives traffic
    mux.decommission_shard("us-west").await?;
    info!("Decommissioned us-west; shards: {:?}", mux.shard_ids().await);

    // Print statistics
    println!("\n=== SHARD STATISTICS ===\n");
    for (shard_id, shard) in mux.stats().await {
        println!("  Shard: {}", shard_id);
        println!("    Pool state: {}", shard.pool.state.name());
        println!("    Total connections: {}", shard.pool.total_connections);
        println!("    Free connections: {}", shard.pool.free_connections);
        println!("    Outstanding: {}", shard.outstanding_connections);
        println!();
    }

    mux.close().await;
    info!("Multiplexer closed");

    Ok(())
}
