//! Layer reconciler - single owner of "which simulcast layer is active for
//! which source"
//!
//! This module provides:
//! - Per-viewer quality votes folded into one layer selection per source
//! - Serialized enable/disable calls against each source's track
//! - Long-lived observation of track activity and layer-list updates
//! - Published per-source quality, target bitrate and track-state signals

use crate::config::TracksConfig;
use crate::layer::{QualityLayerPair, SimulcastLayer};
use crate::quality::{best_quality, match_layer, VideoQuality};
use crate::serial::{Completion, SerialQueue};
use crate::track::{Source, TrackActivity};
use crate::types::{SourceId, ViewerId};
use futures::StreamExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current effective quality per source
pub type QualityMap = HashMap<SourceId, VideoQuality>;

/// Target bitrate (bps) of the selected layer per source
pub type BitrateMap = HashMap<SourceId, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKind {
    Activity,
    Layers,
}

/// Bookkeeping guarded by the reconciler lock
#[derive(Default)]
struct ReconcilerState {
    /// Every registered vote. A viewer watches one source at a time.
    quality_by_viewer: HashMap<ViewerId, VideoQuality>,
    /// Viewers attached to each source, oldest first
    viewers_by_source: HashMap<SourceId, IndexSet<ViewerId>>,
    /// Last advertised layers, best-first
    layers_by_source: HashMap<SourceId, Vec<SimulcastLayer>>,
    /// Last issued selection
    selection_by_source: HashMap<SourceId, QualityLayerPair>,

    /// Outlive reset so a source never has two track calls in flight
    queues: HashMap<SourceId, SerialQueue>,
    /// Observation loops started since the last reset, ended or not
    observers: HashSet<(SourceId, StreamKind)>,

    /// Parent of every observer token; replaced on reset
    shutdown: CancellationToken,
}

impl ReconcilerState {
    fn is_tracking(&self, source_id: &SourceId) -> bool {
        self.viewers_by_source.contains_key(source_id)
            || self.layers_by_source.contains_key(source_id)
            || self.selection_by_source.contains_key(source_id)
    }

    fn queue(&mut self, source_id: &SourceId) -> &SerialQueue {
        self.queues
            .entry(source_id.clone())
            .or_insert_with(|| SerialQueue::new(source_id.clone()))
    }
}

struct Inner {
    config: TracksConfig,
    state: Mutex<ReconcilerState>,
    quality_tx: watch::Sender<QualityMap>,
    bitrate_tx: watch::Sender<BitrateMap>,
    track_state_tx: broadcast::Sender<()>,
}

/// Reconciles viewer quality requests into one active simulcast layer per source.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LayerReconciler {
    inner: Arc<Inner>,
}

impl Default for LayerReconciler {
    fn default() -> Self {
        Self::new(TracksConfig::default())
    }
}

impl LayerReconciler {
    #[must_use]
    pub fn new(config: TracksConfig) -> Self {
        let (quality_tx, _) = watch::channel(QualityMap::new());
        let (bitrate_tx, _) = watch::channel(BitrateMap::new());
        let (track_state_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        debug!(
            skip_inactive_tracks = config.skip_inactive_tracks,
            await_completion = config.await_completion,
            "Layer reconciler initialized"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ReconcilerState::default()),
                quality_tx,
                bitrate_tx,
                track_state_tx,
            }),
        }
    }

    /// Register `viewer`'s preferred quality for `source` and apply the
    /// resulting selection.
    ///
    /// Repeating an identical request is a no-op. Track failures are logged,
    /// never returned.
    pub async fn request_quality(
        &self,
        source: &Source,
        viewer: impl Into<ViewerId>,
        quality: VideoQuality,
    ) {
        let viewer = viewer.into();
        let source_id = source.id();
        debug!(
            source_id = %source_id,
            viewer_id = %viewer,
            quality = %quality,
            "Request to enable video track"
        );

        self.observe_source(source);

        let completion = {
            let mut state = self.inner.state.lock();

            let attached = state
                .viewers_by_source
                .get(source_id)
                .is_some_and(|viewers| viewers.contains(&viewer));
            if attached && state.quality_by_viewer.get(&viewer) == Some(&quality) {
                debug!(
                    source_id = %source_id,
                    viewer_id = %viewer,
                    quality = %quality,
                    "Viewer already requested this quality"
                );
                return;
            }

            state.quality_by_viewer.insert(viewer.clone(), quality);
            state
                .viewers_by_source
                .entry(source_id.clone())
                .or_default()
                .insert(viewer);

            self.inner.reconcile(&mut state, source)
        };

        self.inner.settle(source_id, "enable", completion).await;
    }

    /// Drop `viewer`'s vote for `source`.
    ///
    /// The last viewer leaving clears all bookkeeping for the source and
    /// disables its track.
    pub async fn release_quality(&self, source: &Source, viewer: impl Into<ViewerId>) {
        let viewer = viewer.into();
        let source_id = source.id();
        debug!(
            source_id = %source_id,
            viewer_id = %viewer,
            "Request to disable video track"
        );

        let (label, completion) = {
            let mut state = self.inner.state.lock();

            let removed = state
                .viewers_by_source
                .get_mut(source_id)
                .is_some_and(|viewers| viewers.shift_remove(&viewer));
            if !removed {
                debug!(
                    source_id = %source_id,
                    viewer_id = %viewer,
                    "Viewer is not attached to source"
                );
                return;
            }
            state.quality_by_viewer.remove(&viewer);

            let remaining = state
                .viewers_by_source
                .get(source_id)
                .map_or(0, IndexSet::len);

            if remaining > 0 {
                ("enable", self.inner.reconcile(&mut state, source))
            } else {
                debug!(
                    source_id = %source_id,
                    "Disabling video track as there are no active viewers"
                );
                self.inner.purge(&mut state, source_id);
                ("disable", self.inner.enqueue_disable(&mut state, source))
            }
        };

        self.inner.settle(source_id, label, completion).await;
    }

    /// Start the activity and layer observation loops for `source`.
    ///
    /// Loops started before (even ones whose stream has ended) are left
    /// alone until `reset`. Must be called from within a Tokio runtime.
    pub fn observe_source(&self, source: &Source) {
        let mut state = self.inner.state.lock();
        for kind in [StreamKind::Activity, StreamKind::Layers] {
            if !state.observers.insert((source.id().clone(), kind)) {
                continue;
            }
            let token = state.shutdown.child_token();

            info!(source_id = %source.id(), kind = ?kind, "Registering for video track events");

            let inner = Arc::downgrade(&self.inner);
            let source = source.clone();
            tokio::spawn(async move {
                match kind {
                    StreamKind::Activity => observe_activity(inner, source, token).await,
                    StreamKind::Layers => observe_layers(inner, source, token).await,
                }
            });
        }
    }

    /// Cancel every observation loop and forget all state.
    ///
    /// Track operations already queued still run, ahead of anything queued
    /// after the reset; their results are discarded.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown.cancel();
        let queues = std::mem::take(&mut state.queues);
        *state = ReconcilerState {
            queues,
            ..ReconcilerState::default()
        };
        self.inner.publish(&state);
        info!("Layer reconciler reset");
    }

    /// Wait until every track operation queued so far for `source_id` has run
    pub async fn flush(&self, source_id: &SourceId) {
        let queue = self.inner.state.lock().queues.get(source_id).cloned();
        if let Some(queue) = queue {
            if let Err(e) = queue.flush().await {
                debug!(source_id = %source_id, error = %e, "Flush interrupted");
            }
        }
    }

    /// Stream of effective quality per source
    #[must_use]
    pub fn subscribe_video_quality(&self) -> watch::Receiver<QualityMap> {
        self.inner.quality_tx.subscribe()
    }

    /// Stream of selected-layer target bitrate per source
    #[must_use]
    pub fn subscribe_target_bitrates(&self) -> watch::Receiver<BitrateMap> {
        self.inner.bitrate_tx.subscribe()
    }

    /// Fires whenever a track becomes active or inactive
    #[must_use]
    pub fn subscribe_track_state(&self) -> broadcast::Receiver<()> {
        self.inner.track_state_tx.subscribe()
    }

    #[must_use]
    pub fn selected_quality(&self, source_id: &SourceId) -> Option<VideoQuality> {
        self.inner
            .state
            .lock()
            .selection_by_source
            .get(source_id)
            .map(|pair| pair.quality)
    }

    #[must_use]
    pub fn selected_pair(&self, source_id: &SourceId) -> Option<QualityLayerPair> {
        self.inner
            .state
            .lock()
            .selection_by_source
            .get(source_id)
            .cloned()
    }

    /// Viewers attached to `source_id`, oldest first
    #[must_use]
    pub fn active_viewers(&self, source_id: &SourceId) -> Vec<ViewerId> {
        self.inner
            .state
            .lock()
            .viewers_by_source
            .get(source_id)
            .map(|viewers| viewers.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn requested_quality(&self, viewer: &ViewerId) -> Option<VideoQuality> {
        self.inner.state.lock().quality_by_viewer.get(viewer).copied()
    }

    #[must_use]
    pub fn simulcast_layers(&self, source_id: &SourceId) -> Vec<SimulcastLayer> {
        self.inner
            .state
            .lock()
            .layers_by_source
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any viewer, layer or selection bookkeeping exists for the source
    #[must_use]
    pub fn is_tracking(&self, source_id: &SourceId) -> bool {
        self.inner.state.lock().is_tracking(source_id)
    }

    /// Sources with at least one running observation loop
    #[must_use]
    pub fn observed_sources(&self) -> Vec<SourceId> {
        let state = self.inner.state.lock();
        let mut sources: Vec<SourceId> = state
            .observers
            .iter()
            .map(|(source_id, _)| source_id.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Track operations queued or running for the source
    #[must_use]
    pub fn pending_operations(&self, source_id: &SourceId) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(source_id)
            .map_or(0, SerialQueue::pending)
    }
}

impl Inner {
    /// Recompute the best selection for `source` and queue an enable if it changed
    fn reconcile(&self, state: &mut ReconcilerState, source: &Source) -> Option<Completion> {
        let source_id = source.id();
        let viewers = state.viewers_by_source.get(source_id)?;
        let renderer = viewers.first()?.clone();

        let best = best_quality(
            viewers
                .iter()
                .filter_map(|viewer| state.quality_by_viewer.get(viewer).copied()),
        );
        let layers = state
            .layers_by_source
            .get(source_id)
            .map_or(&[][..], Vec::as_slice);
        let pair = QualityLayerPair::resolve(best, match_layer(layers, best));

        debug!(
            source_id = %source_id,
            layers = layers.len(),
            best = %best,
            selected = %pair.quality,
            encoding_id = ?pair.encoding_id(),
            "Computed video quality for source"
        );

        if state.selection_by_source.get(source_id) == Some(&pair) {
            debug!(
                source_id = %source_id,
                quality = %pair.quality,
                "Selected video quality already up to date"
            );
            return None;
        }

        let layer = pair.layer.clone();
        state.selection_by_source.insert(source_id.clone(), pair);
        self.publish(state);

        let track = Arc::clone(source.track());
        let skip_inactive = self.config.skip_inactive_tracks;
        let queue_source_id = source_id.clone();
        let job = async move {
            if skip_inactive && !track.is_active() {
                debug!(source_id = %queue_source_id, "Track inactive, skipping enable");
                return Ok(());
            }
            debug!(
                source_id = %queue_source_id,
                renderer = %renderer,
                encoding_id = ?layer.as_ref().map(|l| l.encoding_id.as_str()),
                "Queue: enabling track"
            );
            track.enable(&renderer, layer.as_ref()).await?;
            debug!(source_id = %queue_source_id, "Queue: finished enabling track");
            Ok(())
        };

        match state.queue(source_id).enqueue("enable", job) {
            Ok(completion) => Some(completion),
            Err(e) => {
                warn!(source_id = %source_id, error = %e, "Failed to queue enable");
                None
            }
        }
    }

    fn enqueue_disable(&self, state: &mut ReconcilerState, source: &Source) -> Option<Completion> {
        let track = Arc::clone(source.track());
        let skip_inactive = self.config.skip_inactive_tracks;
        let queue_source_id = source.id().clone();
        let job = async move {
            if skip_inactive && !track.is_active() {
                debug!(source_id = %queue_source_id, "Track inactive, skipping disable");
                return Ok(());
            }
            debug!(source_id = %queue_source_id, "Queue: disabling track");
            track.disable().await?;
            debug!(source_id = %queue_source_id, "Queue: finished disabling track");
            Ok(())
        };

        match state.queue(source.id()).enqueue("disable", job) {
            Ok(completion) => Some(completion),
            Err(e) => {
                warn!(source_id = %source.id(), error = %e, "Failed to queue disable");
                None
            }
        }
    }

    /// Forget viewers, votes, layers and selection for the source
    fn purge(&self, state: &mut ReconcilerState, source_id: &SourceId) {
        if let Some(viewers) = state.viewers_by_source.remove(source_id) {
            for viewer in &viewers {
                state.quality_by_viewer.remove(viewer);
            }
        }
        state.layers_by_source.remove(source_id);
        state.selection_by_source.remove(source_id);
        self.publish(state);
        debug!(source_id = %source_id, "Removed all stored data for source");
    }

    fn publish(&self, state: &ReconcilerState) {
        let qualities: QualityMap = state
            .selection_by_source
            .iter()
            .map(|(source_id, pair)| (source_id.clone(), pair.quality))
            .collect();
        let bitrates: BitrateMap = state
            .selection_by_source
            .iter()
            .filter_map(|(source_id, pair)| {
                pair.target_bitrate()
                    .map(|bitrate| (source_id.clone(), bitrate))
            })
            .collect();

        self.quality_tx.send_if_modified(|current| {
            if *current == qualities {
                false
            } else {
                *current = qualities;
                true
            }
        });
        self.bitrate_tx.send_if_modified(|current| {
            if *current == bitrates {
                false
            } else {
                *current = bitrates;
                true
            }
        });
    }

    /// Wait for (or detach) a queued operation and log its failure
    async fn settle(&self, source_id: &SourceId, label: &'static str, completion: Option<Completion>) {
        let Some(completion) = completion else {
            return;
        };

        if self.config.await_completion {
            if let Err(e) = completion.wait().await {
                warn!(source_id = %source_id, operation = label, error = %e, "Video track operation failed");
            }
        } else {
            let source_id = source_id.clone();
            tokio::spawn(async move {
                if let Err(e) = completion.wait().await {
                    warn!(source_id = %source_id, operation = label, error = %e, "Video track operation failed");
                }
            });
        }
    }

    fn handle_activity(&self, source: &Source, activity: TrackActivity, token: &CancellationToken) {
        match activity {
            TrackActivity::Active => {
                debug!(source_id = %source.id(), "Video track is active");
            }
            TrackActivity::Inactive => {
                debug!(source_id = %source.id(), "Video track is inactive");
                let mut state = self.state.lock();
                // Reset cancels under this lock; a cancelled loop must not touch fresh state
                if token.is_cancelled() {
                    return;
                }
                self.purge(&mut state, source.id());
            }
        }
        // No receivers is fine
        let _ = self.track_state_tx.send(());
    }

    fn handle_layers(
        &self,
        source: &Source,
        layers: Vec<SimulcastLayer>,
        token: &CancellationToken,
    ) -> Option<Completion> {
        debug!(source_id = %source.id(), count = layers.len(), "Received simulcast layers");
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return None;
        }
        state.layers_by_source.insert(source.id().clone(), layers);
        if !state.viewers_by_source.contains_key(source.id()) {
            debug!(source_id = %source.id(), "No active viewers for source");
            return None;
        }
        self.reconcile(&mut state, source)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().shutdown.cancel();
    }
}

async fn observe_activity(inner: Weak<Inner>, source: Source, token: CancellationToken) {
    let mut events = source.track().activity_events();
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            debug!(source_id = %source.id(), "Activity stream ended");
            break;
        };
        let Some(owner) = inner.upgrade() else {
            break;
        };
        owner.handle_activity(&source, event, &token);
    }
}

async fn observe_layers(inner: Weak<Inner>, source: Source, token: CancellationToken) {
    let mut events = source.track().layer_events();
    loop {
        let layers = tokio::select! {
            biased;
            () = token.cancelled() => break,
            layers = events.next() => layers,
        };
        let Some(layers) = layers else {
            debug!(source_id = %source.id(), "Layer stream ended");
            break;
        };
        let Some(owner) = inner.upgrade() else {
            break;
        };
        let completion = owner.handle_layers(&source, layers, &token);
        owner.settle(source.id(), "enable", completion).await;
    }
}
