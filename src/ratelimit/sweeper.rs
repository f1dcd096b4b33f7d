//! Background eviction of stale counter records.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::clock::Clock;
use super::limiter::RateLimiter;

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Handle to a running sweeper task.
///
/// The task only reclaims memory; decisions never wait on it.
pub struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Sweeper {
    /// Spawn a task that sweeps `limiter` every `interval`.
    ///
    /// The first sweep runs immediately.
    pub fn start<C: Clock + 'static>(limiter: Arc<RateLimiter<C>>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        info!(interval_ms = interval.as_millis() as u64, "Starting sweeper");

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let evicted = limiter.sweep_expired();
                        debug!(
                            evicted = evicted,
                            remaining = limiter.counter_count(),
                            "Swept expired rate limit records"
                        );
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        info!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Policy, PolicyRegistry};

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let clock = ManualClock::new(0);
        let mut policies = PolicyRegistry::new();
        policies.register("OP", Policy::new(5, 1000)).unwrap();
        policies
            .register("LOCKED", Policy::new(1, 1000).with_block(60_000))
            .unwrap();
        let limiter = Arc::new(RateLimiter::with_clock(policies, clock.clone()));

        limiter.check_limit("idle", "OP", None).unwrap();
        limiter.check_limit("bad", "LOCKED", None).unwrap();
        limiter.check_limit("bad", "LOCKED", None).unwrap();
        assert_eq!(limiter.counter_count(), 2);

        clock.set(5_000);
        let sweeper = Sweeper::start(limiter.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(limiter.counter_count(), 1);
        assert!(limiter.is_blocked("bad", "LOCKED"));

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_shutdown_stops_task() {
        let limiter = Arc::new(RateLimiter::with_clock(
            PolicyRegistry::defaults(),
            ManualClock::new(0),
        ));
        let sweeper = Sweeper::start(limiter, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .expect("sweeper did not stop");
    }
}
