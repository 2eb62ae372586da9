//! Concurrent stock deduction under a distributed lock.
//!
//! Every worker repeatedly takes the lock, reads the stock counter, writes
//! it back decremented if positive and releases the lock. The read and the
//! write are separate store commands, so the counter only stays consistent
//! if the lock really is mutually exclusive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info};
use warden_common::{Result, WardenError};
use warden_lock::{
    LeaseLock, LeaseLockClient, LeaseLockOptions, QueueLock, QueueLockClient, QueueLockOptions,
};
use warden_store::KvStore;

use crate::backend::{Backend, Coordination};
use crate::config::{LockKind, StockOptions};
use crate::metrics::{Timer, record_stock_deduction};

/// Read-check-decrement over a single counter key
pub struct StockService {
    kv: Arc<dyn KvStore>,
    key: String,
}

impl StockService {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    pub async fn init(&self, amount: i64) -> Result<()> {
        self.kv.set(&self.key, &amount.to_string(), None).await
    }

    /// Remaining stock; a missing key counts as sold out
    pub async fn current(&self) -> Result<i64> {
        match self.kv.get(&self.key).await? {
            Some(raw) => raw.parse().map_err(|_| {
                WardenError::IllegalArgument(format!(
                    "stock key '{}' holds a non-integer value '{}'",
                    self.key, raw
                ))
            }),
            None => Ok(0),
        }
    }

    /// Take one unit if any is left. Only safe while holding the stock lock.
    pub async fn deduct(&self) -> Result<bool> {
        let stock = self.current().await?;
        if stock <= 0 {
            return Ok(false);
        }
        self.kv.set(&self.key, &(stock - 1).to_string(), None).await?;
        Ok(true)
    }
}

/// Outcome of one stock run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReport {
    pub lock: LockKind,
    pub started_at: DateTime<Utc>,
    pub workers: usize,
    pub initial: i64,
    pub remaining: i64,
    pub deducted: u64,
    pub elapsed: Duration,
}

impl StockReport {
    /// Whether every successful deduction is reflected in the counter
    pub fn is_consistent(&self) -> bool {
        self.initial - self.remaining == self.deducted as i64
    }
}

enum WorkerLock {
    Lease(LeaseLock),
    Queue(QueueLock),
}

impl WorkerLock {
    async fn lock(&mut self) -> Result<()> {
        match self {
            WorkerLock::Lease(lock) => lock.lock().await,
            WorkerLock::Queue(lock) => lock.lock().await,
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        match self {
            WorkerLock::Lease(lock) => lock.unlock().await,
            WorkerLock::Queue(lock) => lock.unlock().await,
        }
    }
}

/// Run `options.workers` concurrent workers against the stock counter.
///
/// Queue-ordered workers each open their own coordination session.
pub async fn run_stock(
    backend: &Backend,
    coordination: &Coordination,
    options: &StockOptions,
    lease_options: &LeaseLockOptions,
    queue_options: &QueueLockOptions,
) -> anyhow::Result<StockReport> {
    let service = Arc::new(StockService::new(backend.kv.clone(), options.key.clone()));
    service.init(options.initial).await?;

    let mut locks = Vec::with_capacity(options.workers);
    match options.lock {
        LockKind::Lease => {
            let client = LeaseLockClient::new(backend.executor.clone(), lease_options.clone())?;
            for _ in 0..options.workers {
                locks.push(WorkerLock::Lease(client.lease_lock(&options.lock_name)));
            }
        }
        LockKind::Queue => {
            for _ in 0..options.workers {
                let session = coordination.session().await?;
                let client = QueueLockClient::new(session, queue_options.clone()).await?;
                locks.push(WorkerLock::Queue(client.queue_lock(&options.lock_name)));
            }
        }
    }

    info!(
        lock = options.lock.as_str(),
        workers = options.workers,
        rounds = options.rounds,
        initial = options.initial,
        "Starting stock run"
    );
    let started_at = Utc::now();
    let started = Instant::now();

    let tasks = locks.into_iter().enumerate().map(|(worker, lock)| {
        let service = service.clone();
        let rounds = options.rounds;
        tokio::spawn(async move { run_worker(worker, lock, &service, rounds).await })
    });

    let mut deducted = 0u64;
    for joined in join_all(tasks).await {
        deducted += joined.context("stock worker panicked")??;
    }

    let report = StockReport {
        lock: options.lock,
        started_at,
        workers: options.workers,
        initial: options.initial,
        remaining: service.current().await?,
        deducted,
        elapsed: started.elapsed(),
    };
    info!(
        remaining = report.remaining,
        deducted = report.deducted,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Stock run finished"
    );
    Ok(report)
}

async fn run_worker(
    worker: usize,
    mut lock: WorkerLock,
    service: &StockService,
    rounds: usize,
) -> Result<u64> {
    let mut deducted = 0;
    for _ in 0..rounds {
        lock.lock().await?;
        let timer = Timer::new();
        let outcome = service.deduct().await;
        let released = lock.unlock().await;

        let taken = outcome?;
        released?;
        record_stock_deduction(if taken { "deducted" } else { "sold_out" }, timer.elapsed_secs());
        if !taken {
            debug!(worker, "Stock sold out");
            break;
        }
        deducted += 1;
    }
    Ok(deducted)
}
