//! Simulcast layer descriptors and the per-source selection pair

use crate::quality::VideoQuality;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One encoding advertised by a source.
///
/// Sources advertise their layers best-first. Only `encoding_id` takes part
/// in selection equality; the rest are hints carried through to the track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulcastLayer {
    /// Encoding identifier (RID) of the layer
    pub encoding_id: String,

    /// Target bitrate advertised for this layer (bps)
    #[serde(default)]
    pub target_bitrate: Option<u64>,

    /// Frame width hint
    #[serde(default)]
    pub width: Option<u32>,

    /// Frame height hint
    #[serde(default)]
    pub height: Option<u32>,
}

impl SimulcastLayer {
    pub fn new(encoding_id: impl Into<String>) -> Self {
        Self {
            encoding_id: encoding_id.into(),
            target_bitrate: None,
            width: None,
            height: None,
        }
    }

    #[must_use]
    pub fn with_target_bitrate(mut self, bitrate: u64) -> Self {
        self.target_bitrate = Some(bitrate);
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

impl fmt::Display for SimulcastLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoding_id)?;
        if let (Some(width), Some(height)) = (self.width, self.height) {
            write!(f, " {width}x{height}")?;
        }
        if let Some(bitrate) = self.target_bitrate {
            write!(f, " @{bitrate}bps")?;
        }
        Ok(())
    }
}

/// Quality and concrete layer currently selected for a source.
///
/// `(Auto, None)` leaves layer selection to the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityLayerPair {
    pub quality: VideoQuality,
    pub layer: Option<SimulcastLayer>,
}

impl QualityLayerPair {
    #[must_use]
    pub const fn auto() -> Self {
        Self {
            quality: VideoQuality::Auto,
            layer: None,
        }
    }

    /// Build the effective pair: without a matching layer the quality degrades to `Auto`
    #[must_use]
    pub fn resolve(best: VideoQuality, layer: Option<&SimulcastLayer>) -> Self {
        match layer {
            Some(layer) => Self {
                quality: best,
                layer: Some(layer.clone()),
            },
            None => Self::auto(),
        }
    }

    #[must_use]
    pub fn encoding_id(&self) -> Option<&str> {
        self.layer.as_ref().map(|layer| layer.encoding_id.as_str())
    }

    #[must_use]
    pub fn target_bitrate(&self) -> Option<u64> {
        self.layer.as_ref().and_then(|layer| layer.target_bitrate)
    }
}

impl PartialEq for QualityLayerPair {
    fn eq(&self, other: &Self) -> bool {
        self.quality == other.quality && self.encoding_id() == other.encoding_id()
    }
}

impl Eq for QualityLayerPair {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_equality_ignores_layer_hints() {
        let a = QualityLayerPair::resolve(
            VideoQuality::High,
            Some(&SimulcastLayer::new("h").with_target_bitrate(2_500_000)),
        );
        let b = QualityLayerPair::resolve(
            VideoQuality::High,
            Some(&SimulcastLayer::new("h").with_resolution(1280, 720)),
        );
        assert_eq!(a, b);

        let c = QualityLayerPair::resolve(VideoQuality::Medium, Some(&SimulcastLayer::new("h")));
        assert_ne!(a, c);
    }

    #[test]
    fn test_resolve_without_layer_is_auto() {
        let pair = QualityLayerPair::resolve(VideoQuality::High, None);
        assert_eq!(pair, QualityLayerPair::auto());
        assert_eq!(pair.encoding_id(), None);
        assert_eq!(pair.target_bitrate(), None);
    }

    #[test]
    fn test_layer_from_json_hints_optional() {
        let layer: SimulcastLayer =
            serde_json::from_str(r#"{"encoding_id":"l","target_bitrate":150000}"#).unwrap();
        assert_eq!(layer.encoding_id, "l");
        assert_eq!(layer.target_bitrate, Some(150_000));
        assert_eq!(layer.width, None);
    }

    #[test]
    fn test_layer_display() {
        let layer = SimulcastLayer::new("m")
            .with_resolution(640, 360)
            .with_target_bitrate(800_000);
        assert_eq!(layer.to_string(), "m 640x360 @800000bps");
    }
}
