//! Example demonstrating connection pool usage
//!
//! This example shows how to:
//! 1. Implement a connection factory for a backend
//! 2. Configure and initialize a pool
//! 3. Check connections out and release them
//! 4. Watch aging and replenishment keep the pool populated
//! 5. Monitor pool statistics

use async_trait::async_trait;
use poolmux::{ConnectionFactory, LivelinessCheck, Pool, PoolConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A session against an imaginary backend
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

/// Opens sessions against one endpoint; every ninth open attempt fails
/// so the retry path is visible in the logs
#[derive(Clone)]
struct DemoFactory {
    endpoint: String,
    attempts: Arc<AtomicU32>,
}

impl DemoFactory {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for DemoFactory {
    type Connection = Session;
    type Error = ConnectError;

    async fn open(&self) -> Result<Session, ConnectError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if attempt % 9 == 8 {
            return Err(ConnectError {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(Session {
            serial: attempt,
            endpoint: self.endpoint.clone(),
        })
    }

    async fn probe(&self, _conn: &mut Session) -> Result<(), ConnectError> {
        Ok(())
    }

    async fn close(&self, conn: Session) -> Result<(), ConnectError> {
        info!(serial = conn.serial, "Backend session closed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configure the pool: short ages so retirement shows up in a demo run
    let config = PoolConfig {
        min_available: 5,
        max_age: Duration::from_secs(2),
        check_time: Duration::from_secs(1),
        max_limit: 10,
        connection_retry_limit: 3,
        liveliness: LivelinessCheck::Probe,
    };

    let pool = Pool::new(config, DemoFactory::new("demo-backend:48004"));
    pool.init().await?;
    info!("Pool initialized");

    // Steady-state traffic: check out, run a statement, release
    for i in 0..20 {
        let mut conn = pool.request_connection().await?;
        let reply = conn.run(&format!("SELECT {}", i + 1));
        info!(connection_id = conn.id(), "{}", reply);
        pool.release_connection(conn).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Push the pool to its hard limit
    println!("\n=== HARD LIMIT ===\n");
    let mut held = Vec::new();
    loop {
        match pool.request_connection().await {
            Ok(conn) => held.push(conn),
            Err(e) => {
                warn!("Checkout rejected: {}", e);
                break;
            }
        }
    }
    println!("Held {} connections before hitting the cap", held.len());
    for conn in held {
        pool.release_connection(conn).await?;
    }

    // Let the age timers and the liveliness sweep churn the population
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Print statistics
    println!("\n=== POOL STATISTICS ===\n");
    let stats = pool.stats().await;
    println!("  State: {}", stats.state.name());
    println!("  Total connections: {}", stats.total_connections);
    println!("  Free connections: {}", stats.free_connections);
    println!("  In use: {}", stats.in_use_connections);
    println!("  Created over lifetime: {}", stats.total_created);
    println!("  Retired over lifetime: {}", stats.total_retired);

    pool.close_pool().await;
    info!("Pool closed");

    Ok(())
}
