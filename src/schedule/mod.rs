pub mod cron;

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, mpsc},
    thread,
    time::Duration,
};

use cron::CronExpr;
use tracing as log;

pub type Job = Box<dyn Fn() + Send + 'static>;

/// Periodic trigger threads, keyed by volume name.
///
/// Each trigger computes its next cron fire, sleeps cancellably, runs its
/// job, and re-arms. `unschedule` drops the cancel channels, which wakes
/// the threads immediately; it is idempotent. `schedule` always
/// unschedules first so reconfiguration never leaves duplicate timers.
pub struct Scheduler {
    cancels: Mutex<HashMap<String, Vec<mpsc::Sender<()>>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Install one trigger thread per `(label, expr, job)` for `key`,
    /// replacing any existing triggers for the same key.
    pub fn schedule(&self, key: &str, triggers: Vec<(&'static str, CronExpr, Job)>) {
        self.unschedule(key);

        let mut senders = Vec::with_capacity(triggers.len());
        for (label, expr, job) in triggers {
            let (tx, rx) = mpsc::channel::<()>();
            senders.push(tx);
            let key = key.to_string();
            thread::spawn(move || run_trigger(&key, label, &expr, rx, job));
        }
        self.lock_cancels().insert(key.to_string(), senders);
    }

    /// Cancel all triggers for `key`. Safe to call when none exist.
    pub fn unschedule(&self, key: &str) {
        // dropping the senders disconnects the trigger threads
        self.lock_cancels().remove(key);
    }

    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<String, Vec<mpsc::Sender<()>>>> {
        self.cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn trigger_count(&self, key: &str) -> usize {
        self.lock_cancels().get(key).map_or(0, Vec::len)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.lock_cancels().clear();
    }
}

fn run_trigger(key: &str, label: &str, expr: &CronExpr, rx: mpsc::Receiver<()>, job: Job) {
    loop {
        let now = time::OffsetDateTime::now_utc();
        let next = match expr.next_after(now) {
            Ok(next) => next,
            Err(e) => {
                log::error!("{label} trigger for {key} disarmed: {e:#}");
                return;
            }
        };
        let wait = next - now;
        let wait = Duration::try_from(wait).unwrap_or(Duration::ZERO);
        log::debug!("{label} trigger for {key} sleeping until {next}");

        match rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => job(),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::debug!("{label} trigger for {key} cancelled");
                return;
            }
        }
    }
}
