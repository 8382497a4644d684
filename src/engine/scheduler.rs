use super::lock;
use crate::settings::{SettingsEvent, SettingsStore, Subscription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Whatever the scheduler drives on each tick.
#[async_trait]
pub trait RefreshTarget: Send + Sync + 'static {
    async fn refresh_on_tick(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { interval: Duration },
}

struct ArmedTimer {
    interval: Duration,
    task: JoinHandle<()>,
}

/// Owns the single repeating refresh timer.
///
/// Every arm or stop bumps `generation`. A tick compares the generation it
/// was armed under against the current one and does nothing if they differ,
/// so a tick racing a re-arm never refreshes against the old interval.
pub struct Scheduler {
    target: Arc<dyn RefreshTarget>,
    settings: Arc<SettingsStore>,
    runtime: Handle,
    generation: AtomicU64,
    timer: Mutex<Option<ArmedTimer>>,
    subscription: Mutex<Option<Subscription>>,
}

impl Scheduler {
    pub fn new(target: Arc<dyn RefreshTarget>, settings: Arc<SettingsStore>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            target,
            settings,
            runtime,
            generation: AtomicU64::new(0),
            timer: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    /// Re-arm whenever the stored refresh rate changes. Idempotent.
    pub fn watch_settings(self: &Arc<Self>) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *subscription = Some(self.settings.observe(SettingsEvent::RefreshRate, move |_| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.start_timer();
            }
        }));
    }

    pub fn unwatch_settings(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.cancel();
        }
    }

    /// Arm with the current refresh rate, replacing any running timer.
    /// A rate of zero leaves the scheduler idle.
    pub fn start_timer(self: &Arc<Self>) {
        let secs = self.settings.refresh_interval_secs();
        let mut timer = lock(&self.timer);
        if let Some(old) = timer.take() {
            old.task.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if secs == 0 {
            tracing::info!("refresh timer disabled");
            return;
        }

        let interval = Duration::from_secs(secs);
        let weak = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else { break };
                if !scheduler.fire(generation) {
                    break;
                }
            }
        });
        tracing::info!(interval_s = secs, generation, "refresh timer armed");
        *timer = Some(ArmedTimer { interval, task });
    }

    pub fn stop(&self) {
        let mut timer = lock(&self.timer);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = timer.take() {
            old.task.abort();
            tracing::info!("refresh timer stopped");
        }
    }

    pub fn state(&self) -> SchedulerState {
        match lock(&self.timer).as_ref() {
            Some(armed) => SchedulerState::Armed { interval: armed.interval },
            None => SchedulerState::Idle,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Handle one tick armed under `generation`. Returns false if that timer
    /// has been superseded. The refresh itself runs detached.
    pub(crate) fn fire(&self, generation: u64) -> bool {
        // Held across the check and the spawn so a concurrent re-arm cannot
        // slip in between them.
        let _timer = lock(&self.timer);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "discarding stale tick");
            return false;
        }
        let target = self.target.clone();
        self.runtime.spawn(async move {
            target.refresh_on_tick().await;
        });
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(armed) = lock(&self.timer).take() {
            armed.task.abort();
        }
    }
}
