//! Background lease renewal for lease-based locks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, warn};
use warden_store::{ScriptExecutor, ScriptValue};

use crate::scripts::RENEW;

/// Periodically refreshes the lease of a held lock.
///
/// Renews every third of the lease so at least two refreshes land before
/// the key would expire. Stops on its own once the holder no longer owns
/// the key; otherwise runs until [`RenewalTask::stop`] is called or the
/// task value is dropped.
pub(crate) struct RenewalTask {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    pub fn start(
        executor: Arc<dyn ScriptExecutor>,
        lock: String,
        holder: String,
        lease: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let period = (lease / 3).max(Duration::from_millis(1));
        let handle = tokio::spawn(run(executor, lock, holder, lease, period, stop_rx));
        Self { stop_tx, handle }
    }

    /// Whether the task exited by itself (lock lost or fatal error)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        // A full channel means a stop is already pending
        let _ = self.stop_tx.try_send(());
    }
}

async fn run(
    executor: Arc<dyn ScriptExecutor>,
    lock: String,
    holder: String,
    lease: Duration,
    period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let keys = vec![lock.clone()];
    let args = vec![holder.clone(), lease.as_millis().to_string()];
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match executor.execute(&RENEW, &keys, &args).await {
                    Ok(ScriptValue::Int(1)) => {
                        metrics::counter!("warden_lock_renewal_total", "outcome" => "renewed")
                            .increment(1);
                    }
                    Ok(_) => {
                        metrics::counter!("warden_lock_renewal_total", "outcome" => "lost")
                            .increment(1);
                        debug!(
                            lock = %lock,
                            holder = %holder,
                            "Lock no longer held, renewal stopped"
                        );
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        metrics::counter!("warden_lock_renewal_total", "outcome" => "error")
                            .increment(1);
                        warn!(
                            lock = %lock,
                            holder = %holder,
                            error = %e,
                            "Lock renewal failed, will retry"
                        );
                    }
                    Err(e) => {
                        metrics::counter!("warden_lock_renewal_total", "outcome" => "error")
                            .increment(1);
                        error!(lock = %lock, holder = %holder, error = %e, "Lock renewal error");
                        break;
                    }
                }
            }
            _ = stop_rx.recv() => {
                debug!(lock = %lock, holder = %holder, "Lock renewal stopped");
                break;
            }
        }
    }
}
