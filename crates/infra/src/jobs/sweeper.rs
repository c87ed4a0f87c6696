//! Background retry sweeper.
//!
//! Periodically requeues failed jobs whose backoff has elapsed and offers
//! freed capacity to queued work. Runs on its own named thread; shutdown is
//! signalled over a channel so the loop wakes immediately instead of
//! finishing its sleep.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::service::Sweep;
use crate::config::{DEFAULT_SWEEP_INTERVAL, SchedulerConfig};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct RetrySweeperConfig {
    /// How often to sweep
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for RetrySweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_SWEEP_INTERVAL,
            name: "retry-sweeper".to_string(),
        }
    }
}

impl RetrySweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl From<&SchedulerConfig> for RetrySweeperConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self::default().with_poll_interval(config.sweep_interval)
    }
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub jobs_requeued: u64,
    pub jobs_admitted: u64,
    pub errors: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct RetrySweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl RetrySweeperHandle {
    /// Request graceful shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current sweeper statistics.
    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct RetrySweeper;

impl RetrySweeper {
    /// Spawn the sweep loop in a background thread.
    pub fn spawn<T>(target: Arc<T>, config: RetrySweeperConfig) -> io::Result<RetrySweeperHandle>
    where
        T: Sweep + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = Arc::clone(&stats);

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || sweeper_loop(target.as_ref(), config, shutdown_rx, stats_clone))?;

        Ok(RetrySweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn sweeper_loop<T: Sweep + ?Sized>(
    target: &T,
    config: RetrySweeperConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) {
    info!(sweeper = %config.name, interval_ms = config.poll_interval.as_millis() as u64, "retry sweeper started");
    let start_time = Instant::now();

    loop {
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let result = target.sweep();

        let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
        s.sweeps += 1;
        s.last_sweep_at = Some(Utc::now());
        s.uptime_secs = start_time.elapsed().as_secs();
        match result {
            Ok(report) => {
                s.jobs_requeued += report.requeued as u64;
                s.jobs_admitted += report.admitted as u64;
                if report.requeued > 0 || report.admitted > 0 {
                    debug!(
                        sweeper = %config.name,
                        requeued = report.requeued,
                        admitted = report.admitted,
                        "sweep made progress"
                    );
                }
            }
            Err(e) => {
                s.errors += 1;
                error!(sweeper = %config.name, error = %e, "retry sweep failed");
            }
        }
    }

    info!(sweeper = %config.name, "retry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stowage_core::DomainError;

    use super::*;
    use crate::jobs::service::{JobServiceError, SweepReport};

    #[derive(Default)]
    struct CountingSweep {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Sweep for CountingSweep {
        fn sweep(&self) -> Result<SweepReport, JobServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DomainError::unavailable("store offline").into())
            } else {
                Ok(SweepReport { requeued: 1, admitted: 2 })
            }
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sweeps_until_shutdown() {
        let target = Arc::new(CountingSweep::default());
        let handle = RetrySweeper::spawn(
            Arc::clone(&target),
            RetrySweeperConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        wait_for(|| handle.stats().sweeps >= 3);
        let stats = handle.stats();
        assert!(stats.sweeps >= 3);
        assert_eq!(stats.jobs_requeued * 2, stats.jobs_admitted);
        assert!(stats.last_sweep_at.is_some());

        handle.shutdown();
        let calls = target.calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn errors_are_counted_and_loop_continues() {
        let target = Arc::new(CountingSweep {
            fail: true,
            ..CountingSweep::default()
        });
        let handle = RetrySweeper::spawn(
            Arc::clone(&target),
            RetrySweeperConfig::default()
                .with_name("failing-sweeper")
                .with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        wait_for(|| handle.stats().errors >= 2);
        let stats = handle.stats();
        assert_eq!(stats.jobs_requeued, 0);
        handle.shutdown();
        assert!(target.calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn scheduler_config_sets_the_poll_interval() {
        let slow = SchedulerConfig::default().with_sweep_interval(Duration::from_secs(3600));
        assert_eq!(RetrySweeperConfig::from(&slow).poll_interval, Duration::from_secs(3600));

        let idle = Arc::new(CountingSweep::default());
        let handle = RetrySweeper::spawn(Arc::clone(&idle), RetrySweeperConfig::from(&slow)).unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);

        let fast = SchedulerConfig::default().with_sweep_interval(Duration::from_millis(10));
        let busy = Arc::new(CountingSweep::default());
        let handle = RetrySweeper::spawn(Arc::clone(&busy), RetrySweeperConfig::from(&fast)).unwrap();
        wait_for(|| handle.stats().sweeps >= 2);
        handle.shutdown();
    }

    #[test]
    fn shutdown_wakes_a_long_sleep() {
        let target = Arc::new(CountingSweep::default());
        let handle = RetrySweeper::spawn(
            Arc::clone(&target),
            RetrySweeperConfig::default().with_poll_interval(Duration::from_secs(3600)),
        )
        .unwrap();

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }
}
