//! Run diagnostics: which stages executed and how long they took.
//!
//! Every run collects a [`RunDiagnostics`], hands it to the diagnostics
//! listener and keeps it as the coordinator's last diagnostics. The bench
//! binary prints them as a table or JSON.
//!
//! Timestamps are captured with the `web-time` crate. Durations are
//! serialized as fractional seconds (`f64`), since `std::time::Duration`
//! does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::change::ChangeMask;
use crate::stage::Stage;
use crate::types::Dimensions;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// One executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Free-form details, e.g. the demosaic method used.
    pub detail: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// A new result was published.
    Published,
    /// The run finished without publishing (nothing visible changed).
    NotPublished,
    /// A collaborator failed; the previous result is still current.
    Failed(String),
}

/// Diagnostics of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Version of the parameter snapshot the run processed.
    pub version: u64,
    /// The coalesced mask the run started with.
    pub changes: ChangeMask,
    /// Whether the snapshot differed from the previous one in a
    /// panning-related group.
    pub geometry_changed: bool,
    /// Whether raw processing was required at full detail.
    pub high_detail: bool,
    /// Executed stages in execution order.
    pub stages: Vec<StageTiming>,
    /// Number of crop windows refreshed.
    pub crops_updated: usize,
    /// Preview dimensions after the run, if allocated.
    pub preview: Option<Dimensions>,
    pub scale: u32,
    pub outcome: RunOutcome,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl RunDiagnostics {
    /// Empty diagnostics for a run that is about to start.
    #[must_use]
    pub const fn new(version: u64, changes: ChangeMask) -> Self {
        Self {
            version,
            changes,
            geometry_changed: false,
            high_detail: false,
            stages: Vec::new(),
            crops_updated: 0,
            preview: None,
            scale: 0,
            outcome: RunOutcome::NotPublished,
            total_duration: Duration::ZERO,
        }
    }

    pub(crate) fn record(&mut self, stage: Stage, duration: Duration, detail: impl Into<String>) {
        self.stages.push(StageTiming {
            stage,
            duration,
            detail: detail.into(),
        });
    }

    /// Whether `stage` executed during the run.
    #[must_use]
    pub fn executed(&self, stage: Stage) -> bool {
        self.stages.iter().any(|timing| timing.stage == stage)
    }

    /// Executed stages, in order.
    pub fn executed_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().map(|timing| timing.stage)
    }

    /// Format a human-readable table.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Preview Run #{}\n{}", self.version, "=".repeat(60)));
        lines.push(format!("Changes: {:?}", self.changes));
        lines.push(format!(
            "Geometry changed: {}  |  Full detail: {}",
            self.geometry_changed, self.high_detail,
        ));
        match self.preview {
            Some(preview) => lines.push(format!("Preview: {preview} at scale {}", self.scale)),
            None => lines.push("Preview: not allocated".to_owned()),
        }
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<28} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for timing in &self.stages {
            let ms = duration_ms(timing.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let name = timing.stage.label();
            let details = &timing.detail;
            lines.push(format!("{name:<28} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        let outcome = match &self.outcome {
            RunOutcome::Published => "published".to_owned(),
            RunOutcome::NotPublished => "not published".to_owned(),
            RunOutcome::Failed(message) => format!("failed: {message}"),
        };
        lines.push(format!(
            "Crop windows updated: {}  |  Outcome: {outcome}",
            self.crops_updated,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to fractional milliseconds.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> RunDiagnostics {
        let mut diag = RunDiagnostics::new(3, ChangeMask::MONITOR);
        diag.record(Stage::MonitorTransform, Duration::from_millis(2), "");
        diag.record(Stage::Histogram, Duration::from_millis(6), "572x429");
        diag.preview = Some(Dimensions::new(572, 429));
        diag.scale = 7;
        diag.outcome = RunOutcome::Published;
        diag.total_duration = Duration::from_millis(8);
        diag
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        let ms = duration_ms(d);
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn executed_stages_in_order() {
        let diag = sample();
        assert!(diag.executed(Stage::Histogram));
        assert!(!diag.executed(Stage::Demosaic));
        let stages: Vec<Stage> = diag.executed_stages().collect();
        assert_eq!(stages, vec![Stage::MonitorTransform, Stage::Histogram]);
    }

    #[test]
    fn report_lists_every_stage() {
        let report = sample().report();
        assert!(report.contains("Preview Run #3"));
        assert!(report.contains("Monitor transform"));
        assert!(report.contains("RGB conversion & histogram"));
        assert!(report.contains("572x429 at scale 7"));
        assert!(report.contains("Outcome: published"));
    }

    #[test]
    fn report_without_stages_or_duration() {
        let diag = RunDiagnostics::new(1, ChangeMask::NONE);
        let report = diag.report();
        assert!(report.contains("Preview: not allocated"));
        assert!(report.contains("Outcome: not published"));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        let total = json["total_duration"].as_f64().unwrap();
        assert!((total - 0.008).abs() < 1e-9);
        let back: RunDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.stages.len(), 2);
        assert_eq!(back.changes, ChangeMask::MONITOR);
        assert_eq!(back.outcome, RunOutcome::Published);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<RunDiagnostics>(json).is_err());
    }
}
