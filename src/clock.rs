use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, trace};

use crate::context::FlightContext;
use crate::protocol::ObcTime;

/// Onboard time in seconds.
///
/// Reads, sets and ticks are single atomic operations, so a reader never sees a
/// partially written value and no tick is lost across a set.
#[derive(Debug, Default)]
pub struct OnboardClock {
    seconds: AtomicU64,
    changed: Notify,
}

impl OnboardClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(seconds: ObcTime) -> Self {
        Self {
            seconds: AtomicU64::new(seconds),
            changed: Notify::new(),
        }
    }

    pub fn now(&self) -> ObcTime {
        self.seconds.load(Ordering::SeqCst)
    }

    pub fn set(&self, seconds: ObcTime) {
        self.seconds.store(seconds, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Advances by one second and returns the new time.
    pub fn tick(&self) -> ObcTime {
        let now = self.seconds.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.changed.notify_one();
        now
    }

    /// Resolves once the time has been ticked or set.
    ///
    /// A change with nobody waiting is remembered for the next call. Only one
    /// task (the release timer) waits here.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Advances the onboard clock once per `period` forever.
pub async fn run_ticker(ctx: Arc<FlightContext>, period: Duration) {
    info!(?period, "onboard clock started");
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        interval.tick().await;
        let now = ctx.clock.tick();
        trace!(now, "tick");
    }
}
