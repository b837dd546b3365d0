use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::telemetry::logging::LAG_TARGET;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TickError {
    /// The tick failed but the next one may succeed.
    #[error("transient tick failure: {0}")]
    Transient(String),
    #[error("fatal tick failure: {0}")]
    Fatal(String),
}

/// Waits between ticks. Implementations wake early when the server stops.
pub trait TickSleep: Send + Sync {
    /// Sleeps for at most `duration`; false means the loop must stop.
    fn sleep(&self, duration: Duration) -> bool;
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ticks: u64,
    pub overruns: u64,
}

/// Fixed-rate loop: a tick that overruns its budget is followed immediately
/// by the next one, and missed ticks are never replayed.
#[derive(Debug, Clone, Copy)]
pub struct TickScheduler {
    tick_length: Duration,
}

impl TickScheduler {
    pub fn new(tick_length: Duration) -> Self {
        Self { tick_length }
    }

    pub fn tick_length(&self) -> Duration {
        self.tick_length
    }

    pub fn run<S, F>(&self, sleeper: &S, mut callback: F) -> Result<TickReport, TickError>
    where
        S: TickSleep + ?Sized,
        F: FnMut(u64) -> Result<(), TickError>,
    {
        let mut report = TickReport::default();
        while sleeper.is_running() {
            let started = Instant::now();
            match callback(report.ticks) {
                Ok(()) => {}
                Err(TickError::Transient(reason)) => {
                    log::warn!("tick {} failed: {}", report.ticks, reason);
                }
                Err(err @ TickError::Fatal(_)) => {
                    log::error!("tick {} aborted the tick loop: {}", report.ticks, err);
                    return Err(err);
                }
            }
            report.ticks += 1;

            let elapsed = started.elapsed();
            if elapsed > self.tick_length {
                report.overruns += 1;
                log::warn!(
                    target: LAG_TARGET,
                    "tick {} took {} ms of a {} ms budget",
                    report.ticks - 1,
                    elapsed.as_millis(),
                    self.tick_length.as_millis()
                );
            }
            if !sleeper.sleep(self.tick_length.saturating_sub(elapsed)) {
                break;
            }
        }
        log::info!(
            "tick loop stopped after {} ticks ({} overruns)",
            report.ticks,
            report.overruns
        );
        Ok(report)
    }

    pub fn spawn<S, F>(
        self,
        sleeper: Arc<S>,
        callback: F,
    ) -> std::io::Result<thread::JoinHandle<Result<TickReport, TickError>>>
    where
        S: TickSleep + ?Sized + 'static,
        F: FnMut(u64) -> Result<(), TickError> + Send + 'static,
    {
        thread::Builder::new()
            .name("tick".to_string())
            .spawn(move || self.run(sleeper.as_ref(), callback))
    }
}
