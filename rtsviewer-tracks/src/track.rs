//! Video track capability consumed by the reconciler
//!
//! The transport owns decoding, rendering and RTP negotiation. The reconciler
//! only needs to know whether a track is live, which simulcast layers it
//! currently offers, and how to enable it on a layer or disable it.

use crate::error::TrackError;
use crate::layer::SimulcastLayer;
use crate::types::{SourceId, ViewerId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Track lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackActivity {
    Active,
    Inactive,
}

/// Remote video track of a single source
#[async_trait]
pub trait VideoTrack: Send + Sync + 'static {
    /// Whether the track currently accepts enable/disable
    fn is_active(&self) -> bool;

    /// Activity changes, until the track goes away
    fn activity_events(&self) -> BoxStream<'static, TrackActivity>;

    /// Full layer list (best-first) each time the advertised set changes
    fn layer_events(&self) -> BoxStream<'static, Vec<SimulcastLayer>>;

    /// Start (or retarget) delivery to `renderer`. `None` lets the transport
    /// pick the layer.
    async fn enable(
        &self,
        renderer: &ViewerId,
        layer: Option<&SimulcastLayer>,
    ) -> Result<(), TrackError>;

    async fn disable(&self) -> Result<(), TrackError>;
}

/// A stream source: its identifier and its video track
#[derive(Clone)]
pub struct Source {
    id: SourceId,
    track: Arc<dyn VideoTrack>,
}

impl Source {
    pub fn new(id: impl Into<SourceId>, track: Arc<dyn VideoTrack>) -> Self {
        Self {
            id: id.into(),
            track,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SourceId {
        &self.id
    }

    #[must_use]
    pub fn track(&self) -> &Arc<dyn VideoTrack> {
        &self.track
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("active", &self.track.is_active())
            .finish()
    }
}
