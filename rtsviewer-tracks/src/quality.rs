//! Viewer-facing video quality and the voting rules that turn several
//! requests into one simulcast layer selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Preferred video quality requested by a viewer.
///
/// Variants are declared in voting order: `Auto` loses against any explicit
/// quality and `High` wins against everything.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

impl VideoQuality {
    pub const ALL: [Self; 4] = [Self::Auto, Self::High, Self::Medium, Self::Low];

    /// Label shown next to a source in quality pickers
    #[must_use]
    pub const fn display_text(&self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_text())
    }
}

impl FromStr for VideoQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "high" | "h" => Ok(Self::High),
            "medium" | "m" => Ok(Self::Medium),
            "low" | "l" => Ok(Self::Low),
            other => Err(format!("unknown video quality: {other}")),
        }
    }
}

/// Highest quality among the requests, `Auto` when there is nothing explicit
pub fn best_quality<I>(qualities: I) -> VideoQuality
where
    I: IntoIterator<Item = VideoQuality>,
{
    qualities.into_iter().max().unwrap_or(VideoQuality::Auto)
}

/// Pick the layer for `quality` from layers advertised best-first.
///
/// `Medium` uses index `(n - 1) / 2` for `n > 1` (and `0` for a single layer),
/// which lands left of centre on even-length lists.
pub fn match_layer<T>(layers: &[T], quality: VideoQuality) -> Option<&T> {
    match quality {
        VideoQuality::Auto => None,
        VideoQuality::High => layers.first(),
        VideoQuality::Medium => middle(layers),
        VideoQuality::Low => layers.last(),
    }
}

fn middle<T>(layers: &[T]) -> Option<&T> {
    let count = layers.len();
    if count == 0 {
        return None;
    }
    let index = (if count > 1 { count - 1 } else { count }) / 2;
    layers.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_quality_picks_maximum() {
        let best = best_quality([VideoQuality::Low, VideoQuality::High, VideoQuality::Medium]);
        assert_eq!(best, VideoQuality::High);

        let best = best_quality([VideoQuality::Low, VideoQuality::Auto]);
        assert_eq!(best, VideoQuality::Low);
    }

    #[test]
    fn test_best_quality_defaults_to_auto() {
        assert_eq!(best_quality([]), VideoQuality::Auto);
        assert_eq!(
            best_quality([VideoQuality::Auto, VideoQuality::Auto]),
            VideoQuality::Auto
        );
    }

    #[test]
    fn test_match_layer_extremes() {
        let layers = ["h", "m", "l"];
        assert_eq!(match_layer(&layers, VideoQuality::High), Some(&"h"));
        assert_eq!(match_layer(&layers, VideoQuality::Low), Some(&"l"));
        assert_eq!(match_layer(&layers, VideoQuality::Auto), None);
    }

    #[test]
    fn test_match_layer_medium_index() {
        assert_eq!(match_layer(&["a"], VideoQuality::Medium), Some(&"a"));
        assert_eq!(match_layer(&["a", "b"], VideoQuality::Medium), Some(&"a"));
        assert_eq!(match_layer(&["a", "b", "c"], VideoQuality::Medium), Some(&"b"));
        // Left of centre for even lengths
        assert_eq!(
            match_layer(&["a", "b", "c", "d"], VideoQuality::Medium),
            Some(&"b")
        );
        assert_eq!(
            match_layer(&["a", "b", "c", "d", "e"], VideoQuality::Medium),
            Some(&"c")
        );
    }

    #[test]
    fn test_match_layer_without_layers() {
        let empty: [&str; 0] = [];
        for quality in VideoQuality::ALL {
            assert_eq!(match_layer(&empty, quality), None);
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("HIGH".parse::<VideoQuality>(), Ok(VideoQuality::High));
        assert_eq!("m".parse::<VideoQuality>(), Ok(VideoQuality::Medium));
        assert!("ultra".parse::<VideoQuality>().is_err());
        assert_eq!(VideoQuality::Medium.to_string(), "Medium");
    }
}
