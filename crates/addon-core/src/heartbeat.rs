//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on lifecycle transaction engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Runs a blocking lifecycle operation while signalling liveness to the caller.
//!
//! The operation executes on tokio's blocking pool and owns everything it
//! touches. Dropping the returned future stops the heartbeats but never the
//! operation, so a transaction always reaches commit or rollback.

use std::convert::Infallible;
use std::fmt::Display;
use std::future::{ready, Future, Ready};
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::metrics::TransactionMetrics;

/// Shortest cadence a heartbeat is delivered at.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Executes blocking operations with a periodic heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatExecutor {
    interval: Duration,
    metrics: Option<TransactionMetrics>,
}

impl HeartbeatExecutor {
    /// Intervals shorter than [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn new(interval: Duration, metrics: Option<TransactionMetrics>) -> Self {
        let interval = if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                minimum_ms = MIN_HEARTBEAT_INTERVAL.as_millis() as u64,
                "heartbeat interval raised to minimum"
            );
            MIN_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        Self { interval, metrics }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `operation` to completion, invoking `heartbeat` every interval until it finishes.
    ///
    /// The first heartbeat fires one interval after start. Heartbeat failures
    /// are logged and otherwise ignored. No heartbeat starts after the
    /// operation has completed, and one in progress is abandoned as soon as
    /// the operation completes.
    pub async fn run<T, E, Op, Hb, Fut, HbErr>(&self, operation: Op, mut heartbeat: Hb) -> Result<T, E>
    where
        Op: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<JoinError> + Send + 'static,
        Hb: FnMut() -> Fut,
        Fut: Future<Output = Result<(), HbErr>>,
        HbErr: Display,
    {
        let mut task = tokio::task::spawn_blocking(operation);
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats: u64 = 0;

        loop {
            tokio::select! {
                biased;
                joined = &mut task => {
                    debug!(beats, "lifecycle operation finished");
                    return joined.unwrap_or_else(|err| Err(E::from(err)));
                }
                _ = ticker.tick() => {
                    beats += 1;
                    tokio::select! {
                        biased;
                        joined = &mut task => {
                            debug!(beats, "lifecycle operation finished during heartbeat");
                            return joined.unwrap_or_else(|err| Err(E::from(err)));
                        }
                        delivered = heartbeat() => self.observe(beats, delivered),
                    }
                }
            }
        }
    }

    fn observe<HbErr: Display>(&self, beat: u64, delivered: Result<(), HbErr>) {
        match delivered {
            Ok(()) => {
                debug!(beat, "heartbeat delivered");
                if let Some(metrics) = &self.metrics {
                    metrics.record_heartbeat(true);
                }
            }
            Err(err) => {
                warn!(beat, error = %err, "heartbeat failed; operation continues");
                if let Some(metrics) = &self.metrics {
                    metrics.record_heartbeat(false);
                }
            }
        }
    }
}

/// Run `operation` with `heartbeat` fired every `interval`. See [`HeartbeatExecutor::run`].
pub async fn apply_operation_with_heartbeat<T, E, Op, Hb, Fut, HbErr>(
    operation: Op,
    heartbeat: Hb,
    interval: Duration,
) -> Result<T, E>
where
    Op: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
    Hb: FnMut() -> Fut,
    Fut: Future<Output = Result<(), HbErr>>,
    HbErr: Display,
{
    HeartbeatExecutor::new(interval, None)
        .run(operation, heartbeat)
        .await
}

/// Heartbeat that does nothing, for callers without a liveness channel.
pub fn silent_heartbeat() -> Ready<Result<(), Infallible>> {
    ready(Ok(()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::LifecycleError;

    const INTERVAL: Duration = Duration::from_millis(40);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeats_fire_while_operation_runs() {
        let beats = Arc::new(Mutex::new(Vec::new()));
        let recorded = beats.clone();
        let started = std::time::Instant::now();

        let result: Result<u32, LifecycleError> = apply_operation_with_heartbeat(
            || {
                std::thread::sleep(INTERVAL * 4);
                Ok(7)
            },
            move || {
                recorded.lock().push(std::time::Instant::now());
                ready(Ok::<(), Infallible>(()))
            },
            INTERVAL,
        )
        .await;
        let finished = std::time::Instant::now();

        assert_eq!(result.unwrap(), 7);
        let beats = beats.lock().clone();
        assert!(beats.len() >= 2, "expected at least two heartbeats, got {}", beats.len());
        assert!(beats.iter().all(|beat| *beat <= finished));
        assert!(beats[0].duration_since(started) >= INTERVAL);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quick_operation_emits_no_heartbeat() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let result: Result<(), LifecycleError> = apply_operation_with_heartbeat(
            || Ok(()),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                silent_heartbeat()
            },
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_failures_do_not_change_the_result() {
        let result: Result<&str, LifecycleError> = apply_operation_with_heartbeat(
            || {
                std::thread::sleep(INTERVAL * 3);
                Ok("done")
            },
            || ready(Err::<(), _>("caller went away")),
            INTERVAL,
        )
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_heartbeat_is_abandoned_when_operation_completes() {
        let result: Result<(), LifecycleError> = tokio::time::timeout(
            Duration::from_secs(2),
            apply_operation_with_heartbeat(
                || {
                    std::thread::sleep(INTERVAL * 2);
                    Ok(())
                },
                || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), Infallible>(())
                },
                INTERVAL,
            ),
        )
        .await
        .expect("operation result should not wait for the heartbeat");
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_interval_is_raised_to_the_minimum() {
        assert_eq!(
            HeartbeatExecutor::new(Duration::ZERO, None).interval(),
            MIN_HEARTBEAT_INTERVAL
        );
        assert_eq!(
            HeartbeatExecutor::new(INTERVAL, None).interval(),
            INTERVAL
        );

        let beats = Arc::new(AtomicUsize::new(0));
        let counted = beats.clone();
        let result: Result<u32, LifecycleError> = apply_operation_with_heartbeat(
            || {
                std::thread::sleep(MIN_HEARTBEAT_INTERVAL * 4);
                Ok(1)
            },
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                silent_heartbeat()
            },
            Duration::ZERO,
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert!(beats.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operation_errors_are_returned() {
        let result: Result<(), LifecycleError> = apply_operation_with_heartbeat(
            || Err(LifecycleError::Interrupted("boom".into())),
            silent_heartbeat,
            INTERVAL,
        )
        .await;
        assert!(matches!(result, Err(LifecycleError::Interrupted(msg)) if msg == "boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_operation_is_reported_as_interrupted() {
        let result: Result<(), LifecycleError> = apply_operation_with_heartbeat(
            || -> Result<(), LifecycleError> { panic!("collaborator exploded") },
            silent_heartbeat,
            INTERVAL,
        )
        .await;
        assert!(matches!(result, Err(LifecycleError::Interrupted(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_caller_does_not_stop_the_operation() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let handle = tokio::spawn(apply_operation_with_heartbeat(
            move || {
                std::thread::sleep(INTERVAL * 3);
                done_tx.send(()).ok();
                Ok::<(), LifecycleError>(())
            },
            silent_heartbeat,
            INTERVAL,
        ));
        tokio::time::sleep(INTERVAL / 2).await;
        handle.abort();

        let finished = tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(finished.is_ok());
    }
}
