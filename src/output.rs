//! Result types returned by a pipeline run.

use crate::error::SynthesisWarning;
use crate::run::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Narration text for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrationSegment {
    /// 0-based page index.
    pub page_index: usize,
    /// Markdown-free narration.
    pub text: String,
    /// Generation calls the page took (1 when the first call succeeded).
    pub attempts: u32,
    /// Index into the credential pool of the credential that produced it.
    pub credential: usize,
}

/// Synthesized audio for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegment {
    pub page_index: usize,
    pub path: PathBuf,
    /// Filled in by the composer once the file has been probed.
    pub duration_secs: Option<f64>,
}

/// One encoded segment of the final video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentReport {
    pub page_index: usize,
    pub duration_secs: f64,
    /// True when the page was shown over generated silence.
    pub silent: bool,
}

/// What the composer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionReport {
    pub output_path: PathBuf,
    pub segments: Vec<SegmentReport>,
    pub total_duration_secs: f64,
    /// Staging directory that could not be removed, if any.
    pub leftover: Option<PathBuf>,
}

/// A path cleanup could not remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of post-run cleanup. Failures here never fail the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// Run-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages actually narrated.
    pub processed_pages: usize,
    /// Pages that ended up with an audio file.
    pub pages_with_audio: usize,
    /// Generation calls across all pages, rate-limited ones included.
    pub generation_calls: u32,
    pub stages: Vec<StageTiming>,
    pub total_duration_ms: u64,
}

impl RunStats {
    pub(crate) fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.stages.push(StageTiming {
            stage,
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn stage_duration_ms(&self, stage: Stage) -> Option<u64> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.duration_ms)
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// The composed video.
    pub video_path: PathBuf,
    pub narrations: Vec<NarrationSegment>,
    /// One slot per page; `None` when synthesis produced no audio.
    pub audio: Vec<Option<AudioSegment>>,
    pub warnings: Vec<SynthesisWarning>,
    pub composition: CompositionReport,
    pub cleanup: CleanupReport,
    pub stats: RunStats,
}
