use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// A scheduled task that is cancelled when the handle is dropped
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    /// Run `fire` once after `delay`
    pub fn after<F>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(tokio::spawn(async move {
            sleep(delay).await;
            fire();
        }))
    }

    /// Run `tick` every `period`, first after one full period, until it returns false
    pub fn every<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick() {
                    break;
                }
            }
        }))
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Timers owned by one capture segment
#[derive(Debug, Default)]
pub struct Timers {
    pub keepalive: Option<TimerHandle>,
    pub reconnect: Option<TimerHandle>,
    pub grace: Option<TimerHandle>,
}

impl Timers {
    pub fn cancel_all(&mut self) {
        self.keepalive = None;
        self.reconnect = None;
        self.grace = None;
    }
}
