//! Background revalidation with exponential back-off.
//!
//! The executor enqueues a job here when it serves a stale entry under
//! `stale-while-revalidate`. At most one job per storage key is in flight;
//! enqueueing a key that is already queued is a no-op. A key whose last
//! revalidation failed is deferred until its back-off deadline passes.
//!
//! Jobs run detached on the tokio runtime, bounded by a worker-pool
//! semaphore, so cancelling the request that enqueued one never reaches it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::{Notify, Semaphore};

use crate::error::Result;
use crate::CacheConfig;

/// Collapses concurrent revalidations and schedules retries.
#[derive(Debug, Clone)]
pub struct AsyncValidator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    state: Mutex<State>,
    shutting_down: AtomicBool,
    idle: Notify,
    initial_backoff: Duration,
    backoff_rate: u32,
    max_backoff: Duration,
}

#[derive(Debug, Default)]
struct State {
    in_flight: HashSet<String>,
    failures: HashMap<String, Failure>,
    active: usize,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    error_count: u32,
    next_attempt: SystemTime,
}

impl AsyncValidator {
    /// Creates a validator sized and paced by `config`.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(
                    config.async_validator_workers.max(1),
                )),
                state: Mutex::new(State::default()),
                shutting_down: AtomicBool::new(false),
                idle: Notify::new(),
                initial_backoff: config.initial_backoff,
                backoff_rate: config.backoff_rate,
                max_backoff: config.max_backoff,
            }),
        }
    }

    /// Number of jobs queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().expect("validator state poisoned").active
    }

    /// Consecutive failures recorded for a key.
    #[must_use]
    pub fn error_count(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .expect("validator state poisoned")
            .failures
            .get(key)
            .map_or(0, |f| f.error_count)
    }

    /// Enqueues `job` for `key` unless one is already in flight, the key is
    /// still backing off, or the validator is shutting down.
    ///
    /// Returns whether the job was accepted. The job resolves to `Ok(())`
    /// when the revalidation committed; any error defers the key by
    /// `min(max_backoff, initial_backoff * rate^failures)`.
    pub fn enqueue<F>(&self, key: &str, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let now = SystemTime::now();
        {
            let mut state =
                self.inner.state.lock().expect("validator state poisoned");
            if state.in_flight.contains(key) {
                return false;
            }
            if let Some(failure) = state.failures.get(key) {
                if failure.next_attempt > now {
                    return false;
                }
            }
            state.in_flight.insert(key.to_string());
            state.active += 1;
        }

        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let permit = inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("validator semaphore closed");
            let outcome = job.await;
            drop(permit);

            let mut state =
                inner.state.lock().expect("validator state poisoned");
            state.in_flight.remove(&key);
            match outcome {
                Ok(()) => {
                    state.failures.remove(&key);
                }
                Err(err) => {
                    log::warn!(
                        "background revalidation of {key} failed: {err}"
                    );
                    let previous = state
                        .failures
                        .get(&key)
                        .map(|f| f.error_count)
                        .unwrap_or(0);
                    let delay = backoff_delay(
                        inner.initial_backoff,
                        inner.backoff_rate,
                        inner.max_backoff,
                        previous,
                    );
                    state.failures.insert(
                        key.clone(),
                        Failure {
                            error_count: previous + 1,
                            next_attempt: SystemTime::now() + delay,
                        },
                    );
                }
            }
            state.active -= 1;
            let drained = state.active == 0;
            drop(state);
            if drained {
                inner.idle.notify_waiters();
            }
        });
        true
    }

    /// Stops accepting jobs and waits for the in-flight ones to finish.
    ///
    /// Running jobs are never aborted; they hold everything they need and
    /// run to completion.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let notified = self.inner.idle.notified();
            if self
                .inner
                .state
                .lock()
                .expect("validator state poisoned")
                .active
                == 0
            {
                return;
            }
            notified.await;
        }
    }
}

fn backoff_delay(
    initial: Duration,
    rate: u32,
    max: Duration,
    error_count: u32,
) -> Duration {
    let factor = u64::from(rate)
        .checked_pow(error_count)
        .unwrap_or(u64::MAX);
    initial.checked_mul(factor.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(max)
        .min(max)
}
