//! RTS viewer video track management
//!
//! A source's video track can only deliver one simulcast layer at a time, but
//! several viewers (grid tiles, the main view, picture-in-picture renderers)
//! may show the same source with different preferred qualities. This crate
//! reconciles those requests into a single selection per source.
//!
//! ## Architecture
//!
//! - **`LayerReconciler`**: owns all bookkeeping and applies selections
//! - **`VideoTrack`**: capability the transport provides per source
//! - **`SerialQueue`**: per-source FIFO so enable/disable never overlap
//! - **`VideoQuality`**: viewer-facing preference (auto/high/medium/low)
//! - **`SimulatedTrack`**: in-memory track for scenario runs and tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtsviewer_tracks::{LayerReconciler, Source, TracksConfig, VideoQuality};
//!
//! let reconciler = LayerReconciler::new(TracksConfig::default());
//! let source = Source::new("camera-1", track);
//!
//! reconciler.request_quality(&source, "main-view", VideoQuality::High).await;
//! reconciler.request_quality(&source, "grid-tile-3", VideoQuality::Low).await;
//! reconciler.release_quality(&source, "main-view").await;
//! ```

mod config;
mod error;
mod layer;
mod quality;
mod reconciler;
mod serial;
pub mod sim;
mod track;
mod types;

pub use config::TracksConfig;
pub use error::{Error, Result, TrackError};
pub use layer::{QualityLayerPair, SimulcastLayer};
pub use quality::{best_quality, match_layer, VideoQuality};
pub use reconciler::{BitrateMap, LayerReconciler, QualityMap};
pub use serial::{Completion, SerialQueue};
pub use track::{Source, TrackActivity, VideoTrack};
pub use types::{SourceId, ViewerId};
