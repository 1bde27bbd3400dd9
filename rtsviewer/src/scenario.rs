//! Scenario replay against simulated tracks

use anyhow::{Context, Result};
use rtsviewer_tracks::sim::{SimulatedTrack, TrackCall};
use rtsviewer_tracks::{
    LayerReconciler, QualityLayerPair, SimulcastLayer, Source, SourceId, TrackActivity,
    TrackError, VideoQuality, VideoTrack, ViewerId,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scenario used when no scenario file is configured
pub const DEMO_SCENARIO: &str = r#"
name: shared camera demo
sources:
  - id: camera-1
    layers:
      - { encoding_id: h, target_bitrate: 2500000, width: 1280, height: 720 }
      - { encoding_id: m, target_bitrate: 1200000, width: 640, height: 360 }
      - { encoding_id: l, target_bitrate: 500000, width: 320, height: 180 }
  - id: camera-2
steps:
  - { action: request, source: camera-1, viewer: main-view, quality: high }
  - { action: request, source: camera-1, viewer: grid-tile-1, quality: low }
  - { action: request, source: camera-2, viewer: grid-tile-2, quality: medium }
  - action: layers
    source: camera-2
    layers:
      - { encoding_id: f, target_bitrate: 1000000 }
      - { encoding_id: q, target_bitrate: 250000 }
  - { action: release, source: camera-1, viewer: main-view }
  - { action: fail_next_enable, source: camera-2, reason: transport busy }
  - { action: request, source: camera-2, viewer: grid-tile-2, quality: low }
  - { action: release, source: camera-1, viewer: grid-tile-1 }
  - { action: activity, source: camera-2, state: inactive }
  - { action: reset }
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A simulated source and the layers it advertises from the start
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub id: SourceId,
    #[serde(default)]
    pub layers: Vec<SimulcastLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Request {
        source: SourceId,
        viewer: ViewerId,
        quality: VideoQuality,
    },
    Release {
        source: SourceId,
        viewer: ViewerId,
    },
    Layers {
        source: SourceId,
        layers: Vec<SimulcastLayer>,
    },
    Activity {
        source: SourceId,
        state: TrackActivity,
    },
    FailNextEnable {
        source: SourceId,
        #[serde(default = "default_failure_reason")]
        reason: String,
    },
    SleepMs {
        ms: u64,
    },
    Reset,
}

fn default_failure_reason() -> String {
    "injected failure".to_string()
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                source,
                viewer,
                quality,
            } => write!(f, "request {source} {viewer} {quality}"),
            Self::Release { source, viewer } => write!(f, "release {source} {viewer}"),
            Self::Layers { source, layers } => {
                let ids: Vec<&str> = layers.iter().map(|l| l.encoding_id.as_str()).collect();
                write!(f, "layers {source} [{}]", ids.join(", "))
            }
            Self::Activity { source, state } => write!(f, "activity {source} {state:?}"),
            Self::FailNextEnable { source, reason } => {
                write!(f, "fail_next_enable {source} ({reason})")
            }
            Self::SleepMs { ms } => write!(f, "sleep {ms}ms"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(yaml).context("Invalid scenario")?;
        for step in &scenario.steps {
            if let Some(source) = step.source() {
                if !scenario.sources.iter().any(|spec| &spec.id == source) {
                    anyhow::bail!("Step '{step}' refers to unknown source '{source}'");
                }
            }
        }
        Ok(scenario)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {path}"))?;
        Self::from_yaml(&yaml)
    }

    pub fn demo() -> Result<Self> {
        Self::from_yaml(DEMO_SCENARIO)
    }
}

impl Step {
    fn source(&self) -> Option<&SourceId> {
        match self {
            Self::Request { source, .. }
            | Self::Release { source, .. }
            | Self::Layers { source, .. }
            | Self::Activity { source, .. }
            | Self::FailNextEnable { source, .. } => Some(source),
            Self::SleepMs { .. } | Self::Reset => None,
        }
    }
}

/// Selection of one source after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRow {
    pub selection: Option<QualityLayerPair>,
    pub viewers: Vec<ViewerId>,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: Step,
    pub selections: BTreeMap<SourceId, SelectionRow>,
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepOutcome>,
    pub calls: BTreeMap<SourceId, Vec<TrackCall>>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scenario: {}", self.name)?;
        for (index, outcome) in self.steps.iter().enumerate() {
            writeln!(f, "[{}] {}", index + 1, outcome.step)?;
            for (source_id, row) in &outcome.selections {
                let selection = match &row.selection {
                    Some(pair) => match &pair.layer {
                        Some(layer) => format!("{} -> {layer}", pair.quality),
                        None => pair.quality.to_string(),
                    },
                    None => "-".to_string(),
                };
                let viewers: Vec<&str> = row.viewers.iter().map(ViewerId::as_str).collect();
                writeln!(
                    f,
                    "    {source_id:<12} {selection:<32} viewers: [{}]",
                    viewers.join(", ")
                )?;
            }
        }
        writeln!(f, "Track calls:")?;
        for (source_id, calls) in &self.calls {
            let calls: Vec<String> = calls
                .iter()
                .map(|call| match call {
                    TrackCall::Enable {
                        renderer,
                        encoding_id,
                    } => format!(
                        "enable({renderer}, {})",
                        encoding_id.as_deref().unwrap_or("auto")
                    ),
                    TrackCall::Disable => "disable".to_string(),
                })
                .collect();
            writeln!(f, "    {source_id:<12} {}", calls.join(" "))?;
        }
        Ok(())
    }
}

struct SimSource {
    track: Arc<SimulatedTrack>,
    source: Source,
}

/// Replays scenario steps against a reconciler and simulated tracks
pub struct ScenarioRunner {
    reconciler: LayerReconciler,
    sources: BTreeMap<SourceId, SimSource>,
    settle_timeout: Duration,
}

impl ScenarioRunner {
    pub fn new(
        reconciler: LayerReconciler,
        specs: &[SourceSpec],
        call_latency: Duration,
        settle_timeout: Duration,
    ) -> Self {
        let sources = specs
            .iter()
            .map(|spec| {
                let track = Arc::new(SimulatedTrack::new());
                track.set_latency(call_latency);
                if !spec.layers.is_empty() {
                    track.set_layers(spec.layers.clone());
                }
                let handle: Arc<dyn VideoTrack> = track.clone();
                let source = Source::new(spec.id.clone(), handle);
                (spec.id.clone(), SimSource { track, source })
            })
            .collect();

        Self {
            reconciler,
            sources,
            settle_timeout,
        }
    }

    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioReport> {
        info!(
            scenario = %scenario.name,
            sources = self.sources.len(),
            steps = scenario.steps.len(),
            "Running scenario"
        );

        self.prime().await;

        let mut report = ScenarioReport {
            name: scenario.name.clone(),
            ..ScenarioReport::default()
        };

        for (index, step) in scenario.steps.iter().enumerate() {
            debug!(step = index + 1, action = %step, "Applying scenario step");
            self.apply(step).await?;
            report.steps.push(StepOutcome {
                step: step.clone(),
                selections: self.selection_table(),
            });
        }

        for (source_id, sim) in &self.sources {
            self.reconciler.flush(source_id).await;
            report.calls.insert(source_id.clone(), sim.track.calls());
        }

        info!(scenario = %scenario.name, "Scenario finished");
        Ok(report)
    }

    async fn apply(&self, step: &Step) -> Result<()> {
        match step {
            Step::Request {
                source,
                viewer,
                quality,
            } => {
                let sim = self.lookup(source)?;
                self.reconciler
                    .request_quality(&sim.source, viewer.clone(), *quality)
                    .await;
            }
            Step::Release { source, viewer } => {
                let sim = self.lookup(source)?;
                self.reconciler
                    .release_quality(&sim.source, viewer.clone())
                    .await;
            }
            Step::Layers { source, layers } => {
                let sim = self.lookup(source)?;
                sim.track.set_layers(layers.clone());
                if self.is_observed(source) {
                    self.wait_until("layers stored", || {
                        self.reconciler.simulcast_layers(source) == *layers
                    })
                    .await;
                    self.reconciler.flush(source).await;
                }
            }
            Step::Activity { source, state } => {
                let sim = self.lookup(source)?;
                sim.track.set_activity(*state);
                if *state == TrackActivity::Inactive && self.is_observed(source) {
                    self.wait_until("source purged", || !self.reconciler.is_tracking(source))
                        .await;
                }
            }
            Step::FailNextEnable { source, reason } => {
                let sim = self.lookup(source)?;
                sim.track.fail_next(TrackError::Transport(reason.clone()));
            }
            Step::SleepMs { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            Step::Reset => {
                self.reconciler.reset();
                self.prime().await;
            }
        }
        Ok(())
    }

    /// Observe every source and wait for the layers it already advertises
    async fn prime(&self) {
        for (source_id, sim) in &self.sources {
            self.reconciler.observe_source(&sim.source);
            let layers = sim.track.current_layers();
            if !layers.is_empty() {
                self.wait_until("initial layers stored", || {
                    self.reconciler.simulcast_layers(source_id) == layers
                })
                .await;
            }
        }
    }

    fn lookup(&self, source_id: &SourceId) -> Result<&SimSource> {
        self.sources
            .get(source_id)
            .with_context(|| format!("Unknown source '{source_id}'"))
    }

    fn is_observed(&self, source_id: &SourceId) -> bool {
        self.reconciler.observed_sources().contains(source_id)
    }

    fn selection_table(&self) -> BTreeMap<SourceId, SelectionRow> {
        self.sources
            .keys()
            .map(|source_id| {
                let row = SelectionRow {
                    selection: self.reconciler.selected_pair(source_id),
                    viewers: self.reconciler.active_viewers(source_id),
                };
                (source_id.clone(), row)
            })
            .collect()
    }

    /// Poll `condition` until it holds or the settle timeout passes
    async fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(self.settle_timeout, poll).await.is_err() {
            warn!(condition = what, "Scenario step did not settle in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsviewer_tracks::TracksConfig;

    fn runner(scenario: &Scenario) -> ScenarioRunner {
        ScenarioRunner::new(
            LayerReconciler::new(TracksConfig::default()),
            &scenario.sources,
            Duration::ZERO,
            Duration::from_secs(2),
        )
    }

    fn enable(renderer: &str, encoding_id: Option<&str>) -> TrackCall {
        TrackCall::Enable {
            renderer: ViewerId::from(renderer),
            encoding_id: encoding_id.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_steps() {
        let scenario = Scenario::from_yaml(
            r"
sources:
  - id: cam
steps:
  - { action: request, source: cam, viewer: a, quality: medium }
  - { action: fail_next_enable, source: cam }
  - { action: sleep_ms, ms: 10 }
  - { action: reset }
",
        )
        .unwrap();

        assert_eq!(scenario.steps.len(), 4);
        assert_eq!(
            scenario.steps[0],
            Step::Request {
                source: SourceId::from("cam"),
                viewer: ViewerId::from("a"),
                quality: VideoQuality::Medium,
            }
        );
        assert_eq!(
            scenario.steps[1],
            Step::FailNextEnable {
                source: SourceId::from("cam"),
                reason: "injected failure".to_string(),
            }
        );
        assert_eq!(scenario.steps[3], Step::Reset);
    }

    #[test]
    fn test_unknown_source_rejected() {
        let result = Scenario::from_yaml(
            r"
sources:
  - id: cam
steps:
  - { action: release, source: other, viewer: a }
",
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_demo_scenario() {
        let scenario = Scenario::demo().unwrap();
        let report = runner(&scenario).run(&scenario).await.unwrap();

        assert_eq!(report.steps.len(), scenario.steps.len());
        assert_eq!(
            report.calls[&SourceId::from("camera-1")],
            vec![
                enable("main-view", Some("h")),
                enable("grid-tile-1", Some("l")),
                TrackCall::Disable,
            ]
        );
        assert_eq!(
            report.calls[&SourceId::from("camera-2")],
            vec![
                enable("grid-tile-2", None),
                enable("grid-tile-2", Some("f")),
                enable("grid-tile-2", Some("q")),
            ]
        );

        // Failed enable still leaves the selection in place
        let after_failure = &report.steps[6].selections[&SourceId::from("camera-2")];
        let selection = after_failure.selection.as_ref().unwrap();
        assert_eq!(selection.quality, VideoQuality::Low);
        assert_eq!(selection.encoding_id(), Some("q"));

        let after_inactive = &report.steps[8].selections[&SourceId::from("camera-2")];
        assert_eq!(after_inactive.selection, None);
        assert!(after_inactive.viewers.is_empty());

        let printed = report.to_string();
        assert!(printed.contains("[1] request camera-1 main-view High"));
        assert!(printed.contains("enable(grid-tile-2, auto)"));
    }

    #[tokio::test]
    async fn test_layer_change_before_any_request() {
        let scenario = Scenario::from_yaml(
            r"
sources:
  - id: cam
steps:
  - action: layers
    source: cam
    layers: [ { encoding_id: h }, { encoding_id: l } ]
  - { action: request, source: cam, viewer: tile, quality: low }
",
        )
        .unwrap();
        let report = runner(&scenario).run(&scenario).await.unwrap();

        assert_eq!(
            report.calls[&SourceId::from("cam")],
            vec![enable("tile", Some("l"))]
        );
    }
}
