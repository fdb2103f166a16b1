use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{EngineError, Result};
use crate::handles::TimerHandle;
use crate::registry::FireCallback;

/// Arm a recurring timer that calls `on_fire` every `period`.
///
/// With `fire_immediately`, `on_fire` runs once before this returns; the
/// first periodic tick still comes one full `period` later.
pub fn arm(period: Duration, on_fire: FireCallback, fire_immediately: bool) -> Result<TimerHandle> {
    if period.is_zero() {
        return Err(EngineError::Config(
            "interval period must be greater than zero".into(),
        ));
    }
    if fire_immediately {
        on_fire();
    }
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            on_fire();
        }
    });
    Ok(TimerHandle::new(task, period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, FireCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period() {
        let (count, on_fire) = counter();
        let timer = arm(Duration::from_millis(1000), on_fire, false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn fire_immediately_runs_before_first_tick() {
        let (count, on_fire) = counter();
        let timer = arm(Duration::from_millis(1000), on_fire, true).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks() {
        let (count, on_fire) = counter();
        let timer = arm(Duration::from_millis(100), on_fire, false).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        timer.cancel();
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(timer.is_finished());
    }

    #[tokio::test]
    async fn zero_period_is_config_error() {
        let (_, on_fire) = counter();
        let err = arm(Duration::ZERO, on_fire, true).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
