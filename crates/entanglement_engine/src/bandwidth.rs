//! Outgoing bandwidth limiting.

use crate::config::BandwidthConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug)]
struct LimiterState {
    used: u64,
    quantum_start: Instant,
    paused: bool,
}

/// Token bucket over bytes written to one connection.
///
/// Writes are credited after they happen; once usage for the current
/// quantum exceeds the budget the limiter pauses until enough quanta have
/// elapsed to bring usage back under it. The transport may pause writing
/// on its own; the connection sends only when neither is paused.
#[derive(Debug)]
pub(crate) struct BandwidthLimiter {
    bw_per_quantum: u64,
    quantum: Duration,
    state: Mutex<LimiterState>,
    transport_paused: watch::Sender<bool>,
}

impl BandwidthLimiter {
    /// Creates a limiter. A zero budget or quantum disables limiting.
    pub fn new(config: &BandwidthConfig) -> Self {
        let (transport_paused, _) = watch::channel(false);
        Self {
            bw_per_quantum: config.per_quantum(),
            quantum: config.quantum,
            state: Mutex::new(LimiterState {
                used: 0,
                quantum_start: Instant::now(),
                paused: false,
            }),
            transport_paused,
        }
    }

    fn enabled(&self) -> bool {
        self.bw_per_quantum > 0 && !self.quantum.is_zero()
    }

    /// Refunds the budget of every quantum that has elapsed.
    fn quantum_passed(&self, state: &mut LimiterState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.quantum_start);
        let quanta = (elapsed.as_secs_f64() / self.quantum.as_secs_f64()).round() as u64;
        if quanta >= 1 {
            state.quantum_start = now;
            state.used = state
                .used
                .saturating_sub(quanta.saturating_mul(self.bw_per_quantum));
        }
        if state.paused && state.used < self.bw_per_quantum {
            state.paused = false;
        }
    }

    /// Credits bytes just written.
    pub fn on_bytes_written(&self, bytes: usize) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.lock();
        self.quantum_passed(&mut state, Instant::now());
        state.used = state.used.saturating_add(bytes as u64);
        if state.used > self.bw_per_quantum {
            state.paused = true;
        }
    }

    /// True if either the budget or the transport holds writes back.
    pub fn should_pause(&self) -> bool {
        self.state.lock().paused || *self.transport_paused.borrow()
    }

    pub fn pause_transport(&self) {
        self.transport_paused.send_replace(true);
    }

    pub fn resume_transport(&self) {
        self.transport_paused.send_replace(false);
    }

    /// Waits until a write may proceed.
    pub async fn ready(&self) {
        loop {
            let wake_at = {
                let mut state = self.state.lock();
                if !state.paused {
                    None
                } else {
                    self.quantum_passed(&mut state, Instant::now());
                    state.paused.then(|| state.quantum_start + self.quantum)
                }
            };
            match wake_at {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => break,
            }
        }
        let mut transport = self.transport_paused.subscribe();
        // The sender lives as long as the limiter, so this cannot fail.
        let _ = transport.wait_for(|paused| !*paused).await;
    }

    #[cfg(test)]
    fn used(&self) -> u64 {
        self.state.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(chars_per_sec: u64) -> BandwidthLimiter {
        BandwidthLimiter::new(&BandwidthConfig::new(chars_per_sec, Duration::from_millis(100)))
    }

    #[tokio::test(start_paused = true)]
    async fn under_budget_never_pauses() {
        let limiter = limiter(10_000);
        limiter.on_bytes_written(500);
        limiter.on_bytes_written(499);
        assert!(!limiter.should_pause());
        limiter.ready().await;
    }

    #[tokio::test(start_paused = true)]
    async fn over_budget_pauses_until_refund() {
        let limiter = limiter(10_000);
        limiter.on_bytes_written(1_500);
        assert!(limiter.should_pause());

        let start = Instant::now();
        limiter.ready().await;
        assert!(Instant::now() - start >= Duration::from_millis(100));
        assert!(!limiter.should_pause());
        assert_eq!(limiter.used(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_quanta_refund_before_credit() {
        let limiter = limiter(10_000);
        limiter.on_bytes_written(900);
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.on_bytes_written(900);
        assert!(!limiter.should_pause());
        assert_eq!(limiter.used(), 900);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_pause_combines() {
        let limiter = std::sync::Arc::new(limiter(10_000));
        limiter.pause_transport();
        assert!(limiter.should_pause());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.ready().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        limiter.resume_transport();
        waiter.await.unwrap();
        assert!(!limiter.should_pause());
    }

    #[test]
    fn zero_budget_disables_limiting() {
        let limiter = BandwidthLimiter::new(&BandwidthConfig::new(0, Duration::from_millis(100)));
        limiter.on_bytes_written(1 << 20);
        assert!(!limiter.should_pause());
    }
}
