use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Politeness pacing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 3_000,
        }
    }
}

/// Unconditional delay applied before every render or navigation call
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    min_delay: Duration,
    max_delay: Duration,
}

impl ThrottlePolicy {
    pub fn new(config: &ThrottleConfig) -> Self {
        let min_delay = Duration::from_millis(config.min_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms.max(config.min_delay_ms));
        Self { min_delay, max_delay }
    }

    /// Draw the next delay uniformly from `[min_delay, max_delay]`
    pub fn next_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_delay == self.max_delay {
            return self.min_delay;
        }
        let millis = rng.gen_range(self.min_delay.as_millis() as u64..=self.max_delay.as_millis() as u64);
        Duration::from_millis(millis)
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Sleep for one pacing interval
    pub async fn wait(&self) {
        let delay = self.next_delay();
        if delay > Duration::ZERO {
            debug!("Throttling for {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    pub fn window(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::new(&ThrottleConfig::default())
    }
}
