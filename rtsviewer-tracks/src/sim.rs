//! In-memory video track
//!
//! `SimulatedTrack` stands in for a transport track: activity and layer lists
//! are driven by hand, every enable/disable call is recorded, failures can be
//! injected and calls can be given artificial latency. The scenario runner and
//! the tests drive the reconciler through it.

use crate::error::TrackError;
use crate::layer::SimulcastLayer;
use crate::track::{TrackActivity, VideoTrack};
use crate::types::ViewerId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

/// One call made against a simulated track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum TrackCall {
    Enable {
        renderer: ViewerId,
        encoding_id: Option<String>,
    },
    Disable,
}

impl TrackCall {
    #[must_use]
    pub const fn is_disable(&self) -> bool {
        matches!(self, Self::Disable)
    }

    #[must_use]
    pub fn encoding_id(&self) -> Option<&str> {
        match self {
            Self::Enable { encoding_id, .. } => encoding_id.as_deref(),
            Self::Disable => None,
        }
    }
}

struct Channels {
    activity: watch::Sender<TrackActivity>,
    layers: watch::Sender<Option<Vec<SimulcastLayer>>>,
}

/// Hand-driven `VideoTrack`
pub struct SimulatedTrack {
    channels: Mutex<Option<Channels>>,
    activity_rx: watch::Receiver<TrackActivity>,
    layers_rx: watch::Receiver<Option<Vec<SimulcastLayer>>>,
    calls: Mutex<Vec<TrackCall>>,
    failures: Mutex<VecDeque<TrackError>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for SimulatedTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTrack {
    /// An active track with no layers advertised yet
    #[must_use]
    pub fn new() -> Self {
        let (activity, activity_rx) = watch::channel(TrackActivity::Active);
        let (layers, layers_rx) = watch::channel(None);
        Self {
            channels: Mutex::new(Some(Channels { activity, layers })),
            activity_rx,
            layers_rx,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Advertise a new layer list (best-first)
    pub fn set_layers(&self, layers: Vec<SimulcastLayer>) {
        if let Some(channels) = self.channels.lock().as_ref() {
            channels.layers.send_replace(Some(layers));
        }
    }

    /// Layers currently advertised, empty before the first `set_layers`
    #[must_use]
    pub fn current_layers(&self) -> Vec<SimulcastLayer> {
        self.layers_rx.borrow().clone().unwrap_or_default()
    }

    pub fn set_activity(&self, activity: TrackActivity) {
        if let Some(channels) = self.channels.lock().as_ref() {
            channels.activity.send_replace(activity);
        }
    }

    /// End both event streams, as when the transport drops the track
    pub fn finish(&self) {
        self.channels.lock().take();
    }

    /// Fail the next enable or disable with `error`
    pub fn fail_next(&self, error: TrackError) {
        self.failures.lock().push_back(error);
    }

    /// Delay applied to every enable/disable call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Every call made so far, in execution order
    #[must_use]
    pub fn calls(&self) -> Vec<TrackCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn enable_count(&self) -> usize {
        self.calls.lock().iter().filter(|call| !call.is_disable()).count()
    }

    #[must_use]
    pub fn disable_count(&self) -> usize {
        self.calls.lock().iter().filter(|call| call.is_disable()).count()
    }

    /// Highest number of calls that were ever running at the same time
    #[must_use]
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn perform(&self, call: TrackCall) -> Result<(), TrackError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        trace!(call = ?call, "Simulated track call");
        self.calls.lock().push(call);
        let result = self.failures.lock().pop_front().map_or(Ok(()), Err);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl VideoTrack for SimulatedTrack {
    fn is_active(&self) -> bool {
        *self.activity_rx.borrow() == TrackActivity::Active
    }

    fn activity_events(&self) -> BoxStream<'static, TrackActivity> {
        WatchStream::new(self.activity_rx.clone()).boxed()
    }

    fn layer_events(&self) -> BoxStream<'static, Vec<SimulcastLayer>> {
        WatchStream::new(self.layers_rx.clone())
            .filter_map(|layers| async move { layers })
            .boxed()
    }

    async fn enable(
        &self,
        renderer: &ViewerId,
        layer: Option<&SimulcastLayer>,
    ) -> Result<(), TrackError> {
        if !self.is_active() {
            return Err(TrackError::Inactive);
        }
        self.perform(TrackCall::Enable {
            renderer: renderer.clone(),
            encoding_id: layer.map(|layer| layer.encoding_id.clone()),
        })
        .await
    }

    async fn disable(&self) -> Result<(), TrackError> {
        if !self.is_active() {
            return Err(TrackError::Inactive);
        }
        self.perform(TrackCall::Disable).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_failures() {
        let track = SimulatedTrack::new();
        let renderer = ViewerId::from("tile-1");
        let layer = SimulcastLayer::new("h");

        track.fail_next(TrackError::Transport("busy".into()));
        assert!(track.enable(&renderer, Some(&layer)).await.is_err());
        assert!(track.enable(&renderer, None).await.is_ok());
        assert!(track.disable().await.is_ok());

        let calls = track.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].encoding_id(), Some("h"));
        assert_eq!(calls[1].encoding_id(), None);
        assert!(calls[2].is_disable());
        assert_eq!(track.enable_count(), 2);
        assert_eq!(track.disable_count(), 1);
    }

    #[tokio::test]
    async fn test_inactive_track_rejects_calls() {
        let track = SimulatedTrack::new();
        track.set_activity(TrackActivity::Inactive);
        assert!(!track.is_active());
        assert_eq!(track.disable().await, Err(TrackError::Inactive));
        assert!(track.calls().is_empty());
    }

    #[tokio::test]
    async fn test_layer_stream_replays_latest_and_ends() {
        let track = SimulatedTrack::new();
        track.set_layers(vec![SimulcastLayer::new("h"), SimulcastLayer::new("l")]);

        let mut events = track.layer_events();
        let first = events.next().await.unwrap();
        assert_eq!(first.len(), 2);

        track.finish();
        assert!(events.next().await.is_none());
    }
}
