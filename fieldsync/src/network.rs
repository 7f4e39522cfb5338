//! Connectivity signals for the scheduler.
//!
//! Reading the current [`Connectivity`] never blocks: both monitors cache the latest value in a
//! [`tokio::sync::watch`] channel, which also drives the connectivity-regained trigger.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// What the device currently knows about its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// No network link.
    Offline,
    /// A link is up, but the API has not been confirmed reachable.
    LinkOnly,
    /// The API is reachable.
    Reachable,
}

impl Connectivity {
    /// Whether a sync pass should run.
    pub fn is_online(self) -> bool {
        self == Self::Reachable
    }
}

pub trait NetworkMonitor: Send + Sync {
    /// The cached connectivity. Never blocks.
    fn connectivity(&self) -> Connectivity;

    /// A receiver observing every subsequent connectivity change.
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// A monitor updated by platform callbacks.
///
/// Hosts forward their OS connectivity notifications with [`ManualNetworkMonitor::set`].
#[derive(Debug, Clone)]
pub struct ManualNetworkMonitor {
    state: Arc<watch::Sender<Connectivity>>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            state: Arc::new(watch::Sender::new(initial)),
        }
    }

    pub fn set(&self, connectivity: Connectivity) {
        let previous = self.state.send_replace(connectivity);
        if previous != connectivity {
            tracing::debug!(?previous, current = ?connectivity, "Connectivity changed");
        }
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn connectivity(&self) -> Connectivity {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

/// A monitor combining the host's link flag with a periodic HTTP probe of the API.
///
/// While the link is down the monitor reports [`Connectivity::Offline`] without probing. When
/// the link is up, the probe result decides between [`Connectivity::Reachable`] and
/// [`Connectivity::LinkOnly`]. Any HTTP response counts as reachable; only transport failures
/// and timeouts do not.
#[derive(Clone)]
pub struct ProbingNetworkMonitor {
    inner: Arc<ProbeState>,
}

struct ProbeState {
    state: watch::Sender<Connectivity>,
    link_up: AtomicBool,
    wake: Notify,
    client: reqwest::Client,
    probe_url: String,
    interval: Duration,
}

impl std::fmt::Debug for ProbingNetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbingNetworkMonitor")
            .field("probe_url", &self.inner.probe_url)
            .field("connectivity", &self.connectivity())
            .finish_non_exhaustive()
    }
}

impl ProbingNetworkMonitor {
    pub fn new(
        probe_url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(ProbeState {
                state: watch::Sender::new(Connectivity::Offline),
                link_up: AtomicBool::new(false),
                wake: Notify::new(),
                client,
                probe_url: probe_url.into(),
                interval,
            }),
        })
    }

    /// Records the link state reported by the platform and probes immediately when the link
    /// comes up.
    pub fn set_link_up(&self, link_up: bool) {
        let was_up = self.inner.link_up.swap(link_up, Ordering::AcqRel);
        if !link_up {
            self.inner.state.send_replace(Connectivity::Offline);
        } else if !was_up {
            self.inner.state.send_if_modified(|current| {
                let changed = *current == Connectivity::Offline;
                if changed {
                    *current = Connectivity::LinkOnly;
                }
                changed
            });
            self.inner.wake.notify_one();
        }
    }

    /// Probes the API once and publishes the result. Does nothing while the link is down.
    pub async fn probe(&self) -> Connectivity {
        if !self.inner.link_up.load(Ordering::Acquire) {
            return Connectivity::Offline;
        }
        let connectivity = match self.inner.client.head(&self.inner.probe_url).send().await {
            Ok(_) => Connectivity::Reachable,
            Err(error) => {
                tracing::debug!(?error, url = %self.inner.probe_url, "Reachability probe failed");
                Connectivity::LinkOnly
            }
        };
        // The link may have dropped while the probe was in flight.
        if self.inner.link_up.load(Ordering::Acquire) {
            self.inner.state.send_replace(connectivity);
            connectivity
        } else {
            Connectivity::Offline
        }
    }

    /// Runs the probe loop until `cancellation_token` is cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {},
                _ = self.inner.wake.notified() => {},
            }
            self.probe().await;
        }
        tracing::debug!("Reachability probe stopped");
    }

    /// Spawns [`ProbingNetworkMonitor::run`] on the current runtime.
    pub fn spawn(
        &self,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run(cancellation_token))
    }
}

impl NetworkMonitor for ProbingNetworkMonitor {
    fn connectivity(&self) -> Connectivity {
        *self.inner.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.inner.state.subscribe()
    }
}
