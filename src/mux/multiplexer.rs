//! Shard-routed connection multiplexing
//!
//! A multiplexer owns a named collection of independent pools ("shards")
//! and routes connection requests to one of them through a caller-supplied
//! mapping function. Topology and routing can change at runtime: shards are
//! commissioned and decommissioned while traffic is in flight, and a
//! periodic poll function may rewrite the mapper, the poll itself, or the
//! shard set.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::factory::ConnectionFactory;
use crate::pool::{ConnectionId, Pool, PoolConfig, PoolError, PoolStats, PooledConnection};

/// Identifies one shard within a multiplexer
pub type ShardId = String;

/// Boxed future produced by a poll function
pub type PollFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type MapperFn<A> = dyn Fn(&A) -> ShardId + Send + Sync;
type PollFn<F, A> = dyn Fn(Multiplexer<F, A>) -> PollFuture + Send + Sync;

/// Error types for multiplexer operations
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("multiplexer must be initialized before requesting a connection")]
    NotInitialized,

    #[error("multiplexer is already initialized")]
    AlreadyInitialized,

    #[error("the multiplexer is closed")]
    Closed,

    #[error("a shard with id {0} is already commissioned")]
    ShardExists(ShardId),

    #[error("no shard commissioned with id {0}")]
    UnknownShard(ShardId),

    #[error("connection was not routed through this multiplexer")]
    NotRouted,

    #[error("poll interval must be a positive duration and a poll function must be set")]
    InvalidPollInterval,

    #[error("failed to commission shard {shard_id}")]
    CommissionFailed {
        shard_id: ShardId,
        #[source]
        source: PoolError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Lifecycle state of a multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxState {
    /// Constructed but initial shards not yet commissioned
    #[default]
    Uninitialized,

    /// Routing requests
    Running,

    /// Terminal
    Closed,
}

impl MuxState {
    /// Human-readable name of the state
    pub fn name(&self) -> &'static str {
        match self {
            MuxState::Uninitialized => "uninitialized",
            MuxState::Running => "running",
            MuxState::Closed => "closed",
        }
    }
}

/// Everything needed to bring one shard online
pub struct ShardSpec<F> {
    /// Application-defined shard identifier
    pub shard_id: ShardId,

    /// Pool configuration for the shard
    pub config: PoolConfig,

    /// Factory the shard's pool opens connections through
    pub factory: F,
}

/// Per-shard statistics
#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    /// Statistics of the shard's pool
    pub pool: PoolStats,

    /// Connections handed out through the multiplexer and not yet returned
    pub outstanding_connections: usize,
}

struct Shard<F: ConnectionFactory> {
    pool: Pool<F>,
    /// Ids handed out through the multiplexer; informational only
    outstanding: Mutex<HashSet<ConnectionId>>,
}

struct MuxInner<F: ConnectionFactory, A: 'static> {
    state: RwLock<MuxState>,
    shards: RwLock<HashMap<ShardId, Shard<F>>>,
    mapper: RwLock<Arc<MapperFn<A>>>,
    poll: RwLock<Option<Arc<PollFn<F, A>>>>,
    poll_interval: RwLock<Option<Duration>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    initial_specs: Mutex<Vec<ShardSpec<F>>>,
}

impl<F: ConnectionFactory, A: 'static> Drop for MuxInner<F, A> {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Routes connection requests across a set of independently pooled shards
///
/// Cheap to clone; clones share the same underlying multiplexer. The `A`
/// parameter is the affinity argument type the shard mapper routes on.
pub struct Multiplexer<F: ConnectionFactory, A: 'static> {
    inner: Arc<MuxInner<F, A>>,
}

impl<F: ConnectionFactory, A: 'static> Clone for Multiplexer<F, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F, A> Multiplexer<F, A>
where
    F: ConnectionFactory,
    A: 'static,
{
    /// Create a multiplexer from its initial shard specs and mapper
    ///
    /// Shards are not commissioned until `init` is called. A poll function
    /// can be attached with `set_poll` and `set_poll_interval` before or
    /// after initialization.
    pub fn new(
        initial_shards: Vec<ShardSpec<F>>,
        mapper: impl Fn(&A) -> ShardId + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                state: RwLock::new(MuxState::Uninitialized),
                shards: RwLock::new(HashMap::new()),
                mapper: RwLock::new(Arc::new(mapper)),
                poll: RwLock::new(None),
                poll_interval: RwLock::new(None),
                poll_task: Mutex::new(None),
                initial_specs: Mutex::new(initial_shards),
            }),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> MuxState {
        *self.inner.state.read().await
    }

    /// Commissioned shard ids, sorted
    pub async fn shard_ids(&self) -> Vec<ShardId> {
        let shards = self.inner.shards.read().await;
        let mut ids: Vec<ShardId> = shards.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Currently configured poll interval, if any
    pub async fn poll_interval(&self) -> Option<Duration> {
        *self.inner.poll_interval.read().await
    }

    /// Commission the initial shards and start routing
    ///
    /// If any initial shard fails to come up, every shard commissioned by
    /// this call is rolled back and the multiplexer stays uninitialized.
    pub async fn init(&self) -> Result<(), MuxError> {
        match *self.inner.state.read().await {
            MuxState::Running => return Err(MuxError::AlreadyInitialized),
            MuxState::Closed => return Err(MuxError::Closed),
            MuxState::Uninitialized => {}
        }

        let specs: Vec<ShardSpec<F>> = {
            let mut initial = self.inner.initial_specs.lock().await;
            initial.drain(..).collect()
        };

        let mut commissioned: Vec<ShardId> = Vec::with_capacity(specs.len());
        for spec in specs {
            let shard_id = spec.shard_id.clone();
            if let Err(e) = self.commission_shard(spec).await {
                self.rollback_commissioned(&commissioned).await;
                return Err(e);
            }
            commissioned.push(shard_id);
        }

        // close() may have landed while the shards were coming up; Closed
        // is terminal, so only an uninitialized multiplexer starts running
        let raced = {
            let mut state = self.inner.state.write().await;
            match *state {
                MuxState::Uninitialized => {
                    *state = MuxState::Running;
                    None
                }
                MuxState::Running => Some(MuxError::AlreadyInitialized),
                MuxState::Closed => Some(MuxError::Closed),
            }
        };
        if let Some(e) = raced {
            self.rollback_commissioned(&commissioned).await;
            return Err(e);
        }

        self.ensure_poll_task().await;
        info!(shards = commissioned.len(), "Multiplexer initialized");
        Ok(())
    }

    /// Bring a new shard online
    ///
    /// The shard becomes routable once its pool has initialized. Fails
    /// without touching the existing shard if the id is already taken.
    pub async fn commission_shard(&self, spec: ShardSpec<F>) -> Result<(), MuxError> {
        if *self.inner.state.read().await == MuxState::Closed {
            return Err(MuxError::Closed);
        }

        let ShardSpec {
            shard_id,
            config,
            factory,
        } = spec;
        let pool = Pool::new(config, factory);

        // register before initializing so a concurrent commission of the
        // same id cannot slip past the duplicate check
        {
            let mut shards = self.inner.shards.write().await;
            // close() drains this map after marking itself closed; checking
            // under the same lock keeps entries from landing after the drain
            if *self.inner.state.read().await == MuxState::Closed {
                return Err(MuxError::Closed);
            }
            if shards.contains_key(&shard_id) {
                return Err(MuxError::ShardExists(shard_id));
            }
            shards.insert(
                shard_id.clone(),
                Shard {
                    pool: pool.clone(),
                    outstanding: Mutex::new(HashSet::new()),
                },
            );
        }

        if let Err(e) = pool.init().await {
            self.inner.shards.write().await.remove(&shard_id);
            pool.close_pool().await;
            return Err(MuxError::CommissionFailed {
                shard_id,
                source: e,
            });
        }

        info!(shard_id = %shard_id, "Commissioned shard");
        Ok(())
    }

    /// Take a shard offline and close its pool
    pub async fn decommission_shard(&self, shard_id: &str) -> Result<(), MuxError> {
        if *self.inner.state.read().await == MuxState::Closed {
            return Err(MuxError::Closed);
        }

        let shard = {
            let mut shards = self.inner.shards.write().await;
            match shards.remove(shard_id) {
                Some(shard) => shard,
                None => return Err(MuxError::UnknownShard(shard_id.to_string())),
            }
        };
        shard.pool.close_pool().await;
        info!(shard_id, "Decommissioned shard");
        Ok(())
    }

    /// Route a connection request to the shard the mapper picks for `args`
    ///
    /// The returned connection is stamped with its shard id so it can be
    /// released without re-invoking the mapper.
    pub async fn request_connection(
        &self,
        args: &A,
    ) -> Result<PooledConnection<F::Connection>, MuxError> {
        match *self.inner.state.read().await {
            MuxState::Uninitialized => return Err(MuxError::NotInitialized),
            MuxState::Closed => return Err(MuxError::Closed),
            MuxState::Running => {}
        }

        let mapper = self.inner.mapper.read().await.clone();
        let shard_id = mapper(args);

        let pool = {
            let shards = self.inner.shards.read().await;
            match shards.get(&shard_id) {
                Some(shard) => shard.pool.clone(),
                None => return Err(MuxError::UnknownShard(shard_id)),
            }
        };

        let mut conn = pool.request_connection().await?;
        conn.set_shard_id(shard_id.clone());
        {
            let shards = self.inner.shards.read().await;
            if let Some(shard) = shards.get(&shard_id) {
                shard.outstanding.lock().await.insert(conn.id());
            }
        }
        debug!(shard_id = %shard_id, connection_id = conn.id(), "Routed connection request");
        Ok(conn)
    }

    /// Return a connection to the shard it was requested from
    ///
    /// Fails with `UnknownShard` if the home shard was decommissioned while
    /// the connection was out; the raw connection is dropped in that case
    /// since the shard's factory went away with its pool.
    pub async fn release_connection(
        &self,
        mut conn: PooledConnection<F::Connection>,
    ) -> Result<(), MuxError> {
        let Some(shard_id) = conn.shard_id().cloned() else {
            return Err(MuxError::NotRouted);
        };
        let id = conn.id();

        let pool = {
            let shards = self.inner.shards.read().await;
            match shards.get(&shard_id) {
                Some(shard) => shard.pool.clone(),
                None => {
                    let _ = conn.take_raw();
                    return Err(MuxError::UnknownShard(shard_id));
                }
            }
        };

        // the id leaves the outstanding set even when the pool refuses the
        // release; the handle is spent either way
        let released = pool.release_connection(conn).await;
        let shards = self.inner.shards.read().await;
        if let Some(shard) = shards.get(&shard_id) {
            shard.outstanding.lock().await.remove(&id);
        }
        released?;
        Ok(())
    }

    /// Replace the shard mapper; takes effect on the next request
    pub async fn set_mapper(&self, mapper: impl Fn(&A) -> ShardId + Send + Sync + 'static) {
        *self.inner.mapper.write().await = Arc::new(mapper);
        debug!("Replaced shard mapper");
    }

    /// Replace the poll function; polling starts once an interval is set
    /// and the multiplexer is running
    pub async fn set_poll<P, Fut>(&self, poll: P)
    where
        P: Fn(Multiplexer<F, A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: Arc<PollFn<F, A>> =
            Arc::new(move |mux| -> PollFuture { Box::pin(poll(mux)) });
        *self.inner.poll.write().await = Some(wrapped);
        self.ensure_poll_task().await;
        debug!("Replaced poll function");
    }

    /// Set the interval between poll invocations
    ///
    /// Requires a poll function to be set first; a replaced interval takes
    /// effect when the timer is next rescheduled.
    pub async fn set_poll_interval(&self, interval: Duration) -> Result<(), MuxError> {
        if interval.is_zero() || self.inner.poll.read().await.is_none() {
            return Err(MuxError::InvalidPollInterval);
        }
        *self.inner.poll_interval.write().await = Some(interval);
        self.ensure_poll_task().await;
        debug!(interval_ms = interval.as_millis() as u64, "Set poll interval");
        Ok(())
    }

    /// Per-shard statistics keyed by shard id
    pub async fn stats(&self) -> HashMap<ShardId, ShardStats> {
        let shards = self.inner.shards.read().await;
        let mut out = HashMap::with_capacity(shards.len());
        for (shard_id, shard) in shards.iter() {
            let pool = shard.pool.stats().await;
            let outstanding = shard.outstanding.lock().await.len();
            out.insert(
                shard_id.clone(),
                ShardStats {
                    pool,
                    outstanding_connections: outstanding,
                },
            );
        }
        out
    }

    /// Stop polling, close every shard's pool, and shut the multiplexer down
    ///
    /// Idempotent; safe to call from any state.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write().await;
            if *state == MuxState::Closed {
                return;
            }
            *state = MuxState::Closed;
        }

        if let Some(task) = self.inner.poll_task.lock().await.take() {
            task.abort();
        }

        let drained: Vec<(ShardId, Shard<F>)> = {
            let mut shards = self.inner.shards.write().await;
            shards.drain().collect()
        };
        let closed = drained.len();
        for (shard_id, shard) in drained {
            shard.pool.close_pool().await;
            debug!(shard_id = %shard_id, "Closed shard pool");
        }
        self.inner.initial_specs.lock().await.clear();
        info!(shards = closed, "Multiplexer closed");
    }

    /// Remove and close every shard a failed or raced `init` brought up
    async fn rollback_commissioned(&self, shard_ids: &[ShardId]) {
        for shard_id in shard_ids {
            let shard = self.inner.shards.write().await.remove(shard_id);
            if let Some(shard) = shard {
                shard.pool.close_pool().await;
                debug!(shard_id = %shard_id, "Rolled back commissioned shard");
            }
        }
    }

    /// Spawn the poll loop if it should be running and is not
    ///
    /// The loop invokes the current poll function, then sleeps for the
    /// current interval, re-reading both each cycle so replacements take
    /// effect at the next tick. It exits when the multiplexer is dropped,
    /// closed, or left without a poll configuration.
    async fn ensure_poll_task(&self) {
        if *self.inner.state.read().await != MuxState::Running {
            return;
        }
        if self.inner.poll.read().await.is_none() {
            return;
        }
        if self.inner.poll_interval.read().await.is_none() {
            return;
        }

        let mut task = self.inner.poll_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            loop {
                let Some((poll, mux)) = Self::current_poll(&weak).await else {
                    break;
                };
                poll(mux).await;
                let Some(interval) = Self::current_interval(&weak).await else {
                    break;
                };
                tokio::time::sleep(interval).await;
            }
        }));
        debug!("Started poll task");
    }

    async fn current_poll(
        weak: &std::sync::Weak<MuxInner<F, A>>,
    ) -> Option<(Arc<PollFn<F, A>>, Multiplexer<F, A>)> {
        let inner = weak.upgrade()?;
        let mux = Multiplexer { inner };
        if *mux.inner.state.read().await != MuxState::Running {
            return None;
        }
        let poll = mux.inner.poll.read().await.clone()?;
        Some((poll, mux))
    }

    async fn current_interval(weak: &std::sync::Weak<MuxInner<F, A>>) -> Option<Duration> {
        let inner = weak.upgrade()?;
        if *inner.state.read().await != MuxState::Running {
            return None;
        }
        let interval = *inner.poll_interval.read().await;
        interval
    }
}
