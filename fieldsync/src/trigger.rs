//! Wake-up sources for the scheduler.
//!
//! Every trigger feeds the same entry point, [`crate::scheduler::Scheduler::run_pass`]. The
//! engine spawns one task per trigger; a wake-up arriving while a pass is active is dropped by
//! the scheduler rather than queued.
use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    time::{Interval, MissedTickBehavior},
};

use crate::network::Connectivity;

/// What woke the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Interval,
    BackgroundWake,
    Enqueued,
    ConnectivityRegained,
    Manual,
}

impl TriggerSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::BackgroundWake => "background_wake",
            Self::Enqueued => "enqueued",
            Self::ConnectivityRegained => "connectivity_regained",
            Self::Manual => "manual",
        }
    }
}

impl Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source of scheduler wake-ups.
#[async_trait]
pub trait SchedulerTrigger: Send {
    /// Waits for the next wake-up. Returns `None` once the trigger can never fire again.
    async fn next(&mut self) -> Option<TriggerSource>;
}

/// Fires on a fixed period, starting immediately.
///
/// Ticks missed while the runtime was suspended are skipped rather than replayed.
#[derive(Debug)]
pub struct IntervalTrigger {
    interval: Interval,
}

impl IntervalTrigger {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl SchedulerTrigger for IntervalTrigger {
    async fn next(&mut self) -> Option<TriggerSource> {
        self.interval.tick().await;
        Some(TriggerSource::Interval)
    }
}

/// Creates a connected [`WakeHandle`] and [`WakeTrigger`].
pub fn wake_channel() -> (WakeHandle, WakeTrigger) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (WakeHandle { sender }, WakeTrigger { receiver })
}

/// Signals a [`WakeTrigger`] from OS callbacks, producers or the engine itself.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    sender: mpsc::UnboundedSender<TriggerSource>,
}

impl WakeHandle {
    /// Requests a pass. Returns `false` if the trigger has been dropped.
    pub fn wake(&self, source: TriggerSource) -> bool {
        self.sender.send(source).is_ok()
    }
}

/// Fires whenever its [`WakeHandle`]s are signalled.
///
/// Signals that piled up while nobody was waiting collapse into a single wake-up carrying the
/// earliest source.
#[derive(Debug)]
pub struct WakeTrigger {
    receiver: mpsc::UnboundedReceiver<TriggerSource>,
}

#[async_trait]
impl SchedulerTrigger for WakeTrigger {
    async fn next(&mut self) -> Option<TriggerSource> {
        let source = self.receiver.recv().await?;
        while self.receiver.try_recv().is_ok() {}
        Some(source)
    }
}

/// Fires when connectivity goes from offline to online.
#[derive(Debug)]
pub struct ConnectivityTrigger {
    receiver: watch::Receiver<Connectivity>,
    online: bool,
}

impl ConnectivityTrigger {
    pub fn new(mut receiver: watch::Receiver<Connectivity>) -> Self {
        let online = receiver.borrow_and_update().is_online();
        Self { receiver, online }
    }
}

#[async_trait]
impl SchedulerTrigger for ConnectivityTrigger {
    async fn next(&mut self) -> Option<TriggerSource> {
        loop {
            self.receiver.changed().await.ok()?;
            let online = self.receiver.borrow_and_update().is_online();
            let regained = online && !self.online;
            self.online = online;
            if regained {
                tracing::debug!("Connectivity regained");
                return Some(TriggerSource::ConnectivityRegained);
            }
        }
    }
}
