//! Layer reconciler configuration

use serde::{Deserialize, Serialize};

/// Layer reconciler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracksConfig {
    /// Capacity of the track-state-changed broadcast channel
    pub event_channel_capacity: usize,
    /// Skip queued enable/disable when the track is inactive by the time it runs
    pub skip_inactive_tracks: bool,
    /// Request/release wait for their queued track operation to finish
    /// (false: return as soon as the operation is queued)
    pub await_completion: bool,
}

impl Default for TracksConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 64,
            skip_inactive_tracks: true,
            await_completion: true,
        }
    }
}

impl TracksConfig {
    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.event_channel_capacity == 0 {
            errors.push("tracks.event_channel_capacity must be greater than 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TracksConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = TracksConfig {
            event_channel_capacity: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }
}
