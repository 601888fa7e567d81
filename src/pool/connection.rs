//! Connection pooling over an abstract factory
//!
//! This module provides self-replenishing connection pools with:
//! - Soft (`min_available`) and hard (`max_limit`) capacity enforcement
//! - Per-connection age-out with deferred retirement while in use
//! - Periodic liveliness sweeps over idle connections
//! - Bounded-retry connection creation

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::factory::ConnectionFactory;
use crate::mux::ShardId;

/// Pool-local identifier for a registered connection
pub type ConnectionId = u64;

/// Distinguishes pool instances so a handle cannot be released elsewhere
static NEXT_POOL_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("must initialize the pool before requesting a connection")]
    NotInitialized,

    #[error("pool is already initialized")]
    AlreadyInitialized,

    #[error("the pool is closing or closed")]
    PoolClosed,

    #[error("cannot release connections to a pool that is not running, current state: {state}")]
    NotRunning { state: &'static str },

    #[error("connection hard limit reached")]
    HardLimitReached,

    #[error("connection is not from this pool")]
    NotOwned,

    #[error("cannot return a connection that has already been returned to the pool")]
    AlreadyReleased,

    #[error("failed to create a connection after {attempts} attempts")]
    CreateFailed {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// How much liveliness checking a release performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LivelinessCheck {
    /// Released connections go straight back to the free list, unchecked
    Off,

    /// Only the factory's cheap failure flag is consulted
    FastOnly,

    /// Failure flag first, then an active probe round-trip
    #[default]
    Probe,
}

impl LivelinessCheck {
    /// Human-readable name of the mode
    pub fn name(&self) -> &'static str {
        match self {
            LivelinessCheck::Off => "off",
            LivelinessCheck::FastOnly => "fast-only",
            LivelinessCheck::Probe => "probe",
        }
    }

    /// Parse a mode from its configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(LivelinessCheck::Off),
            "fast-only" => Some(LivelinessCheck::FastOnly),
            "probe" => Some(LivelinessCheck::Probe),
            _ => None,
        }
    }
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target steady-state number of free connections
    pub min_available: usize,

    /// Age after which a connection is retired; zero disables age-out
    pub max_age: Duration,

    /// Interval between liveliness sweeps; zero disables the sweep
    pub check_time: Duration,

    /// Hard cap on total connections; zero means unbounded
    pub max_limit: usize,

    /// Maximum creation attempts per requested connection
    pub connection_retry_limit: u32,

    /// Liveliness checking performed when a connection is released
    pub liveliness: LivelinessCheck,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_available: 10,
            max_age: Duration::from_millis(300_000),
            check_time: Duration::from_millis(120_000),
            max_limit: 200,
            connection_retry_limit: 5,
            liveliness: LivelinessCheck::Probe,
        }
    }
}

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    /// Constructed but not yet populated
    #[default]
    Initializing,

    /// Serving requests
    Running,

    /// Tearing down; no new checkouts
    Closing,

    /// Terminal
    Closed,
}

impl PoolState {
    /// Human-readable name of the state
    pub fn name(&self) -> &'static str {
        match self {
            PoolState::Initializing => "initializing",
            PoolState::Running => "running",
            PoolState::Closing => "closing",
            PoolState::Closed => "closed",
        }
    }
}

/// Point-in-time snapshot of a pool's bookkeeping
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Lifecycle state at snapshot time
    pub state: PoolState,

    /// Registered connections, in use or not
    pub total_connections: usize,

    /// Connections currently available for checkout
    pub free_connections: usize,

    /// Connections currently checked out
    pub in_use_connections: usize,

    /// Factory opens currently in flight
    pub pending_creates: usize,

    /// Connections created over the pool's lifetime
    pub total_created: u64,

    /// Connections retired over the pool's lifetime
    pub total_retired: u64,
}

/// Allocates pool-local connection ids, reusing the lowest retired id first
#[derive(Debug, Default)]
struct IdAllocator {
    next: ConnectionId,
    freed: BinaryHeap<Reverse<ConnectionId>>,
}

impl IdAllocator {
    fn alloc(&mut self) -> ConnectionId {
        if let Some(Reverse(id)) = self.freed.pop() {
            id
        } else {
            let id = self.next;
            self.next += 1;
            id
        }
    }

    fn release(&mut self, id: ConnectionId) {
        self.freed.push(Reverse(id));
    }
}

/// A connection checked out of a pool
///
/// Dereferences to the raw connection produced by the factory. The handle
/// must be given back through `release_connection`; dropping it instead
/// leaves its registry slot checked out and is logged as a leak.
pub struct PooledConnection<C> {
    pool_token: u64,
    id: ConnectionId,
    epoch: u64,
    shard_id: Option<ShardId>,
    raw: Option<C>,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(pool_token: u64, id: ConnectionId, epoch: u64, raw: C) -> Self {
        Self {
            pool_token,
            id,
            epoch,
            shard_id: None,
            raw: Some(raw),
        }
    }

    /// Pool-local id of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shard this connection was routed through, when one was
    pub fn shard_id(&self) -> Option<&ShardId> {
        self.shard_id.as_ref()
    }

    /// Borrow the raw connection
    pub fn raw(&self) -> &C {
        self.raw.as_ref().expect("connection already released")
    }

    /// Mutably borrow the raw connection
    pub fn raw_mut(&mut self) -> &mut C {
        self.raw.as_mut().expect("connection already released")
    }

    pub(crate) fn set_shard_id(&mut self, shard_id: ShardId) {
        self.shard_id = Some(shard_id);
    }

    pub(crate) fn pool_token(&self) -> u64 {
        self.pool_token
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn take_raw(&mut self) -> Option<C> {
        self.raw.take()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.raw()
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.raw_mut()
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("shard_id", &self.shard_id)
            .finish_non_exhaustive()
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.raw.is_some() {
            warn!(
                connection_id = self.id,
                "Connection handle dropped without release; its pool slot stays checked out"
            );
        }
    }
}

/// Registry entry for one connection the pool owns
struct Slot<C> {
    /// Raw connection while idle; empty while checked out
    raw: Option<C>,
    in_use: bool,
    /// Marked for retirement on the next release
    age_status: bool,
    /// Generation stamp distinguishing reuses of the same id
    epoch: u64,
    age_timer: Option<JoinHandle<()>>,
}

/// Mutable pool state, guarded by one mutex per pool
struct Registry<C> {
    state: PoolState,
    slots: HashMap<ConnectionId, Slot<C>>,
    free: VecDeque<ConnectionId>,
    ids: IdAllocator,
    epoch_seq: u64,
    init_started: bool,
    sweep_running: bool,
    total_created: u64,
    total_retired: u64,
    sweep_task: Option<JoinHandle<()>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            state: PoolState::Initializing,
            slots: HashMap::new(),
            free: VecDeque::new(),
            ids: IdAllocator::default(),
            epoch_seq: 0,
            init_started: false,
            sweep_running: false,
            total_created: 0,
            total_retired: 0,
            sweep_task: None,
        }
    }
}

impl<C> Registry<C> {
    fn next_epoch(&mut self) -> u64 {
        self.epoch_seq += 1;
        self.epoch_seq
    }
}

/// Holds one unit of create capacity while a factory open is in flight.
/// Dropping it (commit, failure, or caller cancellation) returns the unit.
struct CreateReservation<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PoolInner<F: ConnectionFactory> {
    token: u64,
    config: PoolConfig,
    factory: F,
    pending_creates: AtomicUsize,
    registry: Mutex<Registry<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let reg = self.registry.get_mut();
        if let Some(task) = reg.sweep_task.take() {
            task.abort();
        }
        for slot in reg.slots.values() {
            if let Some(timer) = &slot.age_timer {
                timer.abort();
            }
        }
    }
}

/// A bounded, self-replenishing pool of connections over a factory
///
/// Cheap to clone; clones share the same underlying pool.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create an empty pool; call `init` to populate it
    pub fn new(config: PoolConfig, factory: F) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                token: NEXT_POOL_TOKEN.fetch_add(1, Ordering::Relaxed),
                config,
                factory,
                pending_creates: AtomicUsize::new(0),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub async fn state(&self) -> PoolState {
        self.inner.registry.lock().await.state
    }

    /// Snapshot of the pool's bookkeeping
    pub async fn stats(&self) -> PoolStats {
        let reg = self.inner.registry.lock().await;
        let in_use = reg.slots.values().filter(|slot| slot.in_use).count();
        PoolStats {
            state: reg.state,
            total_connections: reg.slots.len(),
            free_connections: reg.free.len(),
            in_use_connections: in_use,
            pending_creates: self.inner.pending_creates.load(Ordering::SeqCst),
            total_created: reg.total_created,
            total_retired: reg.total_retired,
        }
    }

    /// Populate the pool to `min_available` and start serving requests
    pub async fn init(&self) -> Result<(), PoolError> {
        {
            let mut reg = self.inner.registry.lock().await;
            match reg.state {
                PoolState::Initializing if !reg.init_started => reg.init_started = true,
                PoolState::Initializing | PoolState::Running => {
                    return Err(PoolError::AlreadyInitialized)
                }
                PoolState::Closing | PoolState::Closed => return Err(PoolError::PoolClosed),
            }
        }

        for _ in 0..self.inner.config.min_available {
            let reservation = {
                let reg = self.inner.registry.lock().await;
                match self.try_reserve(&reg) {
                    Some(reservation) => reservation,
                    // hard limit below min_available; stop populating
                    None => break,
                }
            };
            self.create_idle(reservation).await?;
        }

        let mut reg = self.inner.registry.lock().await;
        // close_pool may have run while connections were coming up; Closed
        // is terminal, so only an initializing pool starts running
        if reg.state != PoolState::Initializing {
            return Err(PoolError::PoolClosed);
        }
        reg.state = PoolState::Running;
        if !self.inner.config.check_time.is_zero() && reg.sweep_task.is_none() {
            reg.sweep_task = Some(self.spawn_sweep_task());
        }
        info!(available = reg.free.len(), "Pool initialized");
        Ok(())
    }

    /// Check a connection out of the pool
    ///
    /// Reuses an idle connection when one is available, otherwise creates a
    /// new one through the factory, retrying up to the configured limit.
    pub async fn request_connection(&self) -> Result<PooledConnection<F::Connection>, PoolError> {
        let reservation = {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            match reg.state {
                PoolState::Initializing => return Err(PoolError::NotInitialized),
                PoolState::Closing | PoolState::Closed => return Err(PoolError::PoolClosed),
                PoolState::Running => {}
            }

            // reuse an idle connection when one is available
            while let Some(id) = reg.free.pop_front() {
                let Some(slot) = reg.slots.get_mut(&id) else {
                    warn!(connection_id = id, "Free list id missing from registry; skipping");
                    continue;
                };
                let Some(raw) = slot.raw.take() else {
                    warn!(connection_id = id, "Free list entry had no stored connection; skipping");
                    continue;
                };
                slot.in_use = true;
                debug!(connection_id = id, "Checked out idle connection");
                return Ok(PooledConnection::new(self.inner.token, id, slot.epoch, raw));
            }

            // free list exhausted; make a new connection if the cap allows
            match self.try_reserve(reg) {
                Some(reservation) => reservation,
                None => return Err(PoolError::HardLimitReached),
            }
        };
        self.create_checked_out(reservation).await
    }

    /// Return a checked-out connection to the pool
    ///
    /// Runs the configured liveliness check; dead or age-flagged connections
    /// are retired and replaced instead of going back to the free list.
    pub async fn release_connection(
        &self,
        conn: PooledConnection<F::Connection>,
    ) -> Result<(), PoolError> {
        {
            let reg = self.inner.registry.lock().await;
            if reg.state != PoolState::Running {
                return Err(PoolError::NotRunning {
                    state: reg.state.name(),
                });
            }
            if conn.pool_token() != self.inner.token {
                return Err(PoolError::NotOwned);
            }
            match reg.slots.get(&conn.id()) {
                None => return Err(PoolError::NotOwned),
                Some(slot) if slot.epoch != conn.epoch() => return Err(PoolError::NotOwned),
                Some(slot) if !slot.in_use => return Err(PoolError::AlreadyReleased),
                Some(_) => {}
            }
        }
        self.release_inner(conn).await
    }

    /// Sweep idle connections, retiring any that fail the liveliness check
    ///
    /// Runs on the configured `check_time` interval once the pool is
    /// initialized; exposed for embedders that schedule their own sweeps.
    /// At most one sweep runs at a time.
    pub async fn liveliness_check(&self) {
        let batch = {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            if reg.state != PoolState::Running || reg.sweep_running || reg.free.is_empty() {
                return;
            }
            reg.sweep_running = true;

            let mut seen = HashSet::new();
            let mut batch = Vec::with_capacity(reg.free.len());
            while let Some(id) = reg.free.pop_front() {
                if !seen.insert(id) {
                    warn!(connection_id = id, "Duplicate id in free list; skipping");
                    continue;
                }
                let Some(slot) = reg.slots.get_mut(&id) else {
                    warn!(connection_id = id, "Free list id missing from registry; skipping");
                    continue;
                };
                let Some(raw) = slot.raw.take() else {
                    warn!(connection_id = id, "Free list entry had no stored connection; skipping");
                    continue;
                };
                slot.in_use = true;
                batch.push(PooledConnection::new(self.inner.token, id, slot.epoch, raw));
            }
            batch
        };

        // re-enter the release path without the public precondition checks;
        // survivors repopulate the free list, the rest get retired
        let checked = batch.len();
        for handle in batch {
            if let Err(e) = self.release_inner(handle).await {
                debug!(error = %e, "Sweep release error (ignored)");
            }
        }
        debug!(checked, "Liveliness sweep completed");

        self.inner.registry.lock().await.sweep_running = false;
    }

    /// Close every connection and shut the pool down
    ///
    /// Best-effort: close errors are swallowed. Safe to call from any state
    /// and idempotent once closing has begun.
    pub async fn close_pool(&self) {
        let (raws, timers, sweep) = {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            if matches!(reg.state, PoolState::Closing | PoolState::Closed) {
                return;
            }
            reg.state = PoolState::Closing;
            reg.free.clear();

            let mut raws = Vec::new();
            let mut timers = Vec::new();
            for (_, slot) in reg.slots.drain() {
                if let Some(timer) = slot.age_timer {
                    timers.push(timer);
                }
                if let Some(raw) = slot.raw {
                    raws.push(raw);
                }
            }
            (raws, timers, reg.sweep_task.take())
        };

        if let Some(task) = sweep {
            task.abort();
        }
        for timer in timers {
            timer.abort();
        }

        let closed = raws.len();
        let factory = &self.inner.factory;
        join_all(raws.into_iter().map(|raw| async move {
            if let Err(e) = factory.close(raw).await {
                debug!(error = %e, "Error closing connection during pool close (ignored)");
            }
        }))
        .await;

        let mut reg = self.inner.registry.lock().await;
        reg.state = PoolState::Closed;
        info!(closed, "Pool closed");
    }

    /// Reserve one unit of create capacity against the hard limit.
    /// Caller must hold the registry lock so reservations cannot race.
    fn try_reserve(&self, reg: &Registry<F::Connection>) -> Option<CreateReservation<'_>> {
        let max_limit = self.inner.config.max_limit;
        let pending = self.inner.pending_creates.load(Ordering::SeqCst);
        if max_limit > 0 && reg.slots.len() + pending >= max_limit {
            return None;
        }
        self.inner.pending_creates.fetch_add(1, Ordering::SeqCst);
        Some(CreateReservation {
            pending: &self.inner.pending_creates,
        })
    }

    /// Open a connection, retrying up to the configured attempt limit
    async fn open_with_retry(&self) -> Result<F::Connection, PoolError> {
        let limit = self.inner.config.connection_retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.factory.open().await {
                Ok(raw) => return Ok(raw),
                Err(e) if attempt < limit => {
                    debug!(attempt, error = %e, "Connection attempt failed, retrying");
                }
                Err(e) => {
                    return Err(PoolError::CreateFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    /// Create a connection and park it on the free list
    async fn create_idle(&self, reservation: CreateReservation<'_>) -> Result<(), PoolError> {
        let raw = self.open_with_retry().await?;
        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        if matches!(reg.state, PoolState::Closing | PoolState::Closed) {
            drop(reservation);
            drop(guard);
            self.close_raw_unregistered(raw).await;
            return Err(PoolError::PoolClosed);
        }
        let id = reg.ids.alloc();
        let epoch = reg.next_epoch();
        let timer = self.spawn_age_timer(id, epoch);
        reg.slots.insert(
            id,
            Slot {
                raw: Some(raw),
                in_use: false,
                age_status: false,
                epoch,
                age_timer: timer,
            },
        );
        reg.free.push_back(id);
        reg.total_created += 1;
        drop(reservation);
        debug!(connection_id = id, total = reg.slots.len(), "Created idle connection");
        Ok(())
    }

    /// Create a connection already marked in use and hand it out
    async fn create_checked_out(
        &self,
        reservation: CreateReservation<'_>,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        let raw = self.open_with_retry().await?;
        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        if matches!(reg.state, PoolState::Closing | PoolState::Closed) {
            drop(reservation);
            drop(guard);
            self.close_raw_unregistered(raw).await;
            return Err(PoolError::PoolClosed);
        }
        let id = reg.ids.alloc();
        let epoch = reg.next_epoch();
        let timer = self.spawn_age_timer(id, epoch);
        reg.slots.insert(
            id,
            Slot {
                raw: None,
                in_use: true,
                age_status: false,
                epoch,
                age_timer: timer,
            },
        );
        reg.total_created += 1;
        drop(reservation);
        debug!(connection_id = id, total = reg.slots.len(), "Created connection for checkout");
        Ok(PooledConnection::new(self.inner.token, id, epoch, raw))
    }

    /// Release path shared by the public API and the liveliness sweep.
    /// Preconditions (state, ownership, double release) are the caller's
    /// responsibility.
    async fn release_inner(
        &self,
        mut handle: PooledConnection<F::Connection>,
    ) -> Result<(), PoolError> {
        let id = handle.id();
        let epoch = handle.epoch();
        let Some(mut raw) = handle.take_raw() else {
            return Err(PoolError::AlreadyReleased);
        };

        // age-flagged entries retire instead of returning to the free list
        let age_flagged = {
            let reg = self.inner.registry.lock().await;
            match reg.slots.get(&id) {
                Some(slot) if slot.epoch == epoch => Some(slot.age_status),
                _ => None,
            }
        };
        let Some(age_flagged) = age_flagged else {
            // slot vanished while the connection was out (pool closed)
            self.close_raw(id, raw).await;
            return Ok(());
        };

        if age_flagged {
            {
                let mut guard = self.inner.registry.lock().await;
                let reg = &mut *guard;
                if reg.slots.get(&id).map(|slot| slot.epoch) == Some(epoch) {
                    Self::remove_slot(reg, id, true);
                }
            }
            self.close_raw(id, raw).await;
            debug!(connection_id = id, "Retired aged-out connection on release");
            self.replenish_free().await;
            return Ok(());
        }

        if self.check_connection(&mut raw).await {
            {
                let mut guard = self.inner.registry.lock().await;
                let reg = &mut *guard;
                let running = reg.state == PoolState::Running;
                if let Some(slot) = reg.slots.get_mut(&id) {
                    if running && slot.epoch == epoch && slot.in_use && slot.raw.is_none() {
                        slot.raw = Some(raw);
                        slot.in_use = false;
                        reg.free.push_back(id);
                        return Ok(());
                    }
                }
            }
            // slot vanished or went stale while we probed; close instead of reusing
            self.close_raw(id, raw).await;
            return Ok(());
        }

        // a failed connection is never reused
        {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            if !matches!(reg.state, PoolState::Closing | PoolState::Closed)
                && reg.slots.get(&id).map(|slot| slot.epoch) == Some(epoch)
            {
                Self::remove_slot(reg, id, true);
            }
        }
        self.close_raw(id, raw).await;
        debug!(connection_id = id, "Closed dead connection on release");
        self.population_check().await;
        Ok(())
    }

    /// Decide whether a released connection may be reused
    async fn check_connection(&self, raw: &mut F::Connection) -> bool {
        match self.inner.config.liveliness {
            LivelinessCheck::Off => true,
            LivelinessCheck::FastOnly => !self.inner.factory.has_failed(raw),
            LivelinessCheck::Probe => {
                if self.inner.factory.has_failed(raw) {
                    return false;
                }
                match self.inner.factory.probe(raw).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "Liveliness probe failed");
                        false
                    }
                }
            }
        }
    }

    /// Fired by a connection's age timer once `max_age` has elapsed
    async fn age_out(&self, id: ConnectionId, epoch: u64) {
        let raw = {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            if matches!(reg.state, PoolState::Closing | PoolState::Closed) {
                return;
            }
            match reg.slots.get_mut(&id) {
                None => return,
                Some(slot) if slot.epoch != epoch => return,
                Some(slot) if slot.in_use => {
                    // never force-close a connection in active use
                    slot.age_status = true;
                    debug!(
                        connection_id = id,
                        "Connection aged out while in use; retirement deferred"
                    );
                    return;
                }
                Some(_) => {}
            }
            match Self::remove_slot(reg, id, false) {
                Some(slot) => slot.raw,
                None => return,
            }
        };
        if let Some(raw) = raw {
            self.close_raw(id, raw).await;
        }
        debug!(connection_id = id, "Retired idle connection past max age");
        self.population_check().await;
    }

    /// Drop a registry entry, pulling it out of the free list and freeing
    /// its id for reuse
    fn remove_slot(
        reg: &mut Registry<F::Connection>,
        id: ConnectionId,
        abort_timer: bool,
    ) -> Option<Slot<F::Connection>> {
        reg.free.retain(|&free_id| free_id != id);
        let slot = reg.slots.remove(&id)?;
        if abort_timer {
            if let Some(timer) = &slot.age_timer {
                timer.abort();
            }
        }
        reg.ids.release(id);
        reg.total_retired += 1;
        Some(slot)
    }

    /// Create one replacement when the registry has dropped below
    /// `min_available`
    async fn population_check(&self) {
        let reservation = {
            let reg = self.inner.registry.lock().await;
            if reg.state != PoolState::Running {
                return;
            }
            let pending = self.inner.pending_creates.load(Ordering::SeqCst);
            if reg.slots.len() + pending >= self.inner.config.min_available {
                return;
            }
            match self.try_reserve(&reg) {
                Some(reservation) => reservation,
                None => return,
            }
        };
        if let Err(e) = self.create_idle(reservation).await {
            warn!(error = %e, "Failed to replenish pool population");
        }
    }

    /// Create one replacement when the free list has dropped below
    /// `min_available`
    async fn replenish_free(&self) {
        let reservation = {
            let reg = self.inner.registry.lock().await;
            if reg.state != PoolState::Running {
                return;
            }
            if reg.free.len() >= self.inner.config.min_available {
                return;
            }
            match self.try_reserve(&reg) {
                Some(reservation) => reservation,
                None => return,
            }
        };
        if let Err(e) = self.create_idle(reservation).await {
            warn!(error = %e, "Failed to replace retired connection");
        }
    }

    fn spawn_age_timer(&self, id: ConnectionId, epoch: u64) -> Option<JoinHandle<()>> {
        let max_age = self.inner.config.max_age;
        if max_age.is_zero() {
            return None;
        }
        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            tokio::time::sleep(max_age).await;
            if let Some(inner) = weak.upgrade() {
                Pool { inner }.age_out(id, epoch).await;
            }
        }))
    }

    fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let check_time = self.inner.config.check_time;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(check_time).await;
                let Some(inner) = weak.upgrade() else { break };
                Pool { inner }.liveliness_check().await;
            }
        })
    }

    async fn close_raw(&self, id: ConnectionId, raw: F::Connection) {
        if let Err(e) = self.inner.factory.close(raw).await {
            debug!(connection_id = id, error = %e, "Error closing connection (ignored)");
        }
    }

    async fn close_raw_unregistered(&self, raw: F::Connection) {
        if let Err(e) = self.inner.factory.close(raw).await {
            debug!(error = %e, "Error closing unregistered connection (ignored)");
        }
    }
}
