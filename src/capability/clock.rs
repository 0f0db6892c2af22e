//! Time as a capability, so socket-readiness backoff and grace-period
//! timers can be driven deterministically in tests instead of racing real
//! wall-clock sleeps.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;

    async fn sleep(&self, duration: Duration);
}

/// The production [`Clock`]: real time, real sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
