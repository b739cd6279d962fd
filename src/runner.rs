use crate::db::KpiDb;
use crate::error::{KpiError, Result};
use crate::recompute::Recompute;
use crate::source::TransactionSource;
use std::{
    fmt::Write,
    future::Future,
    sync::{Arc, Mutex, TryLockError},
};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs recomputes on request, at most one at a time
pub struct Trigger<S, D> {
    engine: Mutex<Recompute<S, D>>,
}

impl<S: TransactionSource, D: KpiDb> Trigger<S, D> {
    pub fn new(engine: Recompute<S, D>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Recompute all buckets now
    ///
    /// Returns [`KpiError::Busy`](../error/enum.KpiError.html#variant.Busy) right away if
    /// another recompute is in progress.
    pub fn run_now(&self) -> Result<()> {
        let mut engine = match self.engine.try_lock() {
            Ok(engine) => engine,
            Err(TryLockError::WouldBlock) => {
                debug!("recompute requested while another one is running");
                return Err(KpiError::Busy);
            }
            // a panic during the last run left nothing half-written behind the rebuild
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("previous recompute panicked");
                poisoned.into_inner()
            }
        };
        engine.recompute().map(|_| ())
    }
}

/// Call [`Trigger::run_now`](struct.Trigger.html#method.run_now) every `every` until
/// `shutdown` completes, returning the number of successful runs
///
/// The first run starts immediately. Failed runs are logged and the schedule continues.
pub async fn run_periodically<S, D>(
    trigger: Arc<Trigger<S, D>>,
    every: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<usize>
where
    S: TransactionSource + Send + 'static,
    D: KpiDb + Send + 'static,
{
    info!("recomputing every {}", print_duration(every));
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut runs = 0;
    let mut failures = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticks.tick() => {
                let trigger = trigger.clone();
                // stores and sources block, keep them off the async workers
                match tokio::task::spawn_blocking(move || trigger.run_now()).await? {
                    Ok(()) => runs += 1,
                    Err(e) => {
                        failures += 1;
                        warn!("scheduled recompute failed ({} so far): {}", failures, e);
                    }
                }
            }
        }
    }
    info!("stopped after {} runs and {} failures", runs, failures);
    Ok(runs)
}

fn print_duration(d: Duration) -> String {
    let mut res = String::new();
    let mut secs = d.as_secs();
    for (unit, len) in [("d", 86400), ("h", 3600), ("m", 60)] {
        if secs >= len || !res.is_empty() {
            let _ = write!(res, "{}{}", secs / len, unit);
            secs %= len;
        }
    }
    if secs > 0 || res.is_empty() {
        let _ = write!(res, "{}s", secs);
    }
    if res == "0s" && d.subsec_millis() > 0 {
        res = format!("{}ms", d.subsec_millis());
    }
    res
}
