//! Pipeline orchestration: one run from document to video.
//!
//! ```text
//! Init ─▶ Extracting ─┐
//!         Transcribing ┴▶ Generating ─▶ Synthesizing ─▶ Composing ─▶ Cleanup ─▶ Done
//!                        (any stage) ─▶ Failed
//! ```
//!
//! Extraction and transcription are independent and run concurrently.
//! Every later stage needs the previous one's full output, so the rest is
//! sequential. The status marker in `work_dir` tracks the run from the
//! first stage to the last.

use crate::config::{PageCount, PipelineConfig, Resolution, VoiceSelection};
use crate::error::PipelineError;
use crate::output::{CleanupFailure, CleanupReport, RunOutput, RunStats};
use crate::pipeline::compose::VideoComposer;
use crate::pipeline::narrate::NarrationGenerator;
use crate::pipeline::synthesize::{SpeechSynthesizer, SynthesisOutput};
use crate::pipeline::transcribe::{write_transcript, Transcriber};
use crate::status::StatusMarker;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Soundtrack file left behind by the older moviepy-based tool. This
/// pipeline never writes it; cleanup sweeps it for audio directories shared
/// with that tool.
pub const LEGACY_TEMP_AUDIO: &str = "output_videoTEMP_MPY_wvf_snd.mp3";

/// Default file name of the transcript inside `work_dir`.
pub const TRANSCRIPT_FILE_NAME: &str = "text_output.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Extracting,
    Transcribing,
    Generating,
    Synthesizing,
    Composing,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Extracting => "extracting",
            Stage::Transcribing => "transcribing",
            Stage::Generating => "generating",
            Stage::Synthesizing => "synthesizing",
            Stage::Composing => "composing",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-run inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Local path or HTTP(S) URL of the PDF.
    pub document: String,
    /// Optional talk recording used as narration context.
    pub video: Option<PathBuf>,
    pub pages: PageCount,
    pub resolution: Resolution,
    /// Holds the status marker. Must be unique per concurrent run.
    pub work_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub video_dir: PathBuf,
    pub transcript_path: PathBuf,
    /// Overrides [`PipelineConfig::voice`] for this run.
    pub voice: Option<VoiceSelection>,
}

impl RunRequest {
    /// A request with `audio/`, `video/` and the transcript under `work_dir`.
    pub fn new(document: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            document: document.into(),
            video: None,
            pages: PageCount::All,
            resolution: Resolution::default(),
            audio_dir: work_dir.join("audio"),
            video_dir: work_dir.join("video"),
            transcript_path: work_dir.join(TRANSCRIPT_FILE_NAME),
            work_dir,
            voice: None,
        }
    }

    pub fn with_video(mut self, video: impl Into<PathBuf>) -> Self {
        self.video = Some(video.into());
        self
    }

    pub fn with_pages(mut self, pages: PageCount) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_audio_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audio_dir = dir.into();
        self
    }

    pub fn with_video_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.video_dir = dir.into();
        self
    }

    pub fn with_transcript_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_path = path.into();
        self
    }

    pub fn with_voice(mut self, voice: VoiceSelection) -> Self {
        self.voice = Some(voice);
        self
    }

    /// `<video_dir>/output_video_{height}p.mp4`
    pub fn output_video_path(&self) -> PathBuf {
        self.video_dir.join(self.resolution.output_file_name())
    }
}

/// A configured pipeline. Cheap to share: wrap it in an `Arc` and call
/// [`Pipeline::spawn`] once per run.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline on its own tokio task.
    pub fn spawn(self: &Arc<Self>, request: RunRequest) -> JoinHandle<Result<RunOutput, PipelineError>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(&request).await })
    }

    /// Run every stage, keeping the status marker in `work_dir` current.
    pub async fn run(&self, request: &RunRequest) -> Result<RunOutput, PipelineError> {
        let marker = StatusMarker::for_dir(&request.work_dir);
        marker.begin().await.map_err(|source| PipelineError::Io {
            path: marker.path().to_path_buf(),
            source,
        })?;
        info!("Run started in {}", request.work_dir.display());

        let result = self.run_stages(request).await;
        match &result {
            Ok(output) => {
                if let Err(e) = marker.clear().await {
                    warn!("Could not remove status marker {}: {}", marker.path().display(), e);
                }
                info!("Run finished: {}", output.video_path.display());
            }
            Err(e) => {
                error!("Run failed during {}: {}", e.stage(), e);
                if let Some(ref cb) = self.config.progress_callback {
                    cb.on_stage_start(Stage::Failed);
                }
                marker.fail(&format!("{}: {}", e.stage(), e)).await;
            }
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(result.is_ok());
        }
        result
    }

    async fn run_stages(&self, request: &RunRequest) -> Result<RunOutput, PipelineError> {
        let started = Instant::now();
        let mut stats = RunStats::default();

        // ── Init ─────────────────────────────────────────────────────────
        let t = self.stage_start(Stage::Init);
        for dir in [&request.audio_dir, &request.video_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| PipelineError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        self.stage_end(Stage::Init, t, &mut stats);

        // ── Extracting ‖ Transcribing ────────────────────────────────────
        let extract = async {
            let t = self.stage_start(Stage::Extracting);
            let doc = self
                .config
                .extractor
                .extract(&request.document, request.pages, request.resolution)
                .await?;
            self.stage_done(Stage::Extracting, t.elapsed());
            Ok::<_, PipelineError>((doc, t.elapsed()))
        };
        let transcribe = async {
            let t = self.stage_start(Stage::Transcribing);
            let transcriber =
                Transcriber::new(self.config.speech_to_text.clone(), self.config.ffmpeg.clone());
            let transcript = transcriber.transcribe(request.video.as_deref()).await?;
            write_transcript(&request.transcript_path, &transcript).await?;
            self.stage_done(Stage::Transcribing, t.elapsed());
            Ok::<_, PipelineError>((transcript, t.elapsed()))
        };
        let ((doc, extract_time), (transcript, transcribe_time)) =
            tokio::try_join!(extract, transcribe)?;
        stats.record(Stage::Extracting, extract_time);
        stats.record(Stage::Transcribing, transcribe_time);
        stats.total_pages = doc.total_pages;

        // ── Generating ───────────────────────────────────────────────────
        let t = self.stage_start(Stage::Generating);
        let narrations = NarrationGenerator::from_config(&self.config)
            .generate(&doc.texts(), &transcript.text)
            .await?;
        stats.processed_pages = narrations.len();
        stats.generation_calls = narrations.iter().map(|n| n.attempts).sum();
        self.stage_end(Stage::Generating, t, &mut stats);

        // ── Synthesizing ─────────────────────────────────────────────────
        let t = self.stage_start(Stage::Synthesizing);
        let backend = self.config.speech_backend.clone().ok_or_else(|| {
            PipelineError::InvalidConfig("A speech synthesis backend is required".into())
        })?;
        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| self.config.voice.clone());
        let SynthesisOutput {
            slots: mut audio,
            warnings,
        } = SpeechSynthesizer::new(backend, voice, self.config.synthesis_concurrency)
            .with_progress(self.config.progress_callback.clone())
            .synthesize(&narrations, &request.audio_dir)
            .await;
        stats.pages_with_audio = audio.iter().filter(|a| a.is_some()).count();
        self.stage_end(Stage::Synthesizing, t, &mut stats);

        // ── Composing ────────────────────────────────────────────────────
        let t = self.stage_start(Stage::Composing);
        let video_path = request.output_video_path();
        let composition = VideoComposer::from_config(&self.config)
            .compose(&doc.pages, &mut audio, &video_path)
            .await?;
        self.stage_end(Stage::Composing, t, &mut stats);

        // ── Cleanup ──────────────────────────────────────────────────────
        let t = self.stage_start(Stage::Cleanup);
        let mut targets = vec![
            request.audio_dir.join(LEGACY_TEMP_AUDIO),
            request.transcript_path.clone(),
        ];
        targets.extend(composition.leftover.clone());
        if !self.config.keep_audio {
            targets.extend(audio.iter().flatten().map(|a| a.path.clone()));
        }
        let cleanup = cleanup_paths(&targets, self.config.cleanup_delay).await;
        self.stage_end(Stage::Cleanup, t, &mut stats);

        stats.total_duration_ms = started.elapsed().as_millis() as u64;
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(Stage::Done);
        }

        Ok(RunOutput {
            video_path,
            narrations,
            audio,
            warnings,
            composition,
            cleanup,
            stats,
        })
    }

    fn stage_start(&self, stage: Stage) -> Instant {
        info!("Stage: {}", stage);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(stage);
        }
        Instant::now()
    }

    fn stage_done(&self, stage: Stage, elapsed: Duration) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_complete(stage, elapsed);
        }
    }

    fn stage_end(&self, stage: Stage, started: Instant, stats: &mut RunStats) {
        let elapsed = started.elapsed();
        self.stage_done(stage, elapsed);
        stats.record(stage, elapsed);
    }
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

/// Remove `paths` (files or directories). Paths that fail are retried once
/// after `delay`; whatever still fails is reported, never returned as an
/// error.
pub async fn cleanup_paths(paths: &[PathBuf], delay: Duration) -> CleanupReport {
    let mut report = CleanupReport::default();
    let mut retry = Vec::new();

    for path in paths {
        match remove_path(path).await {
            Ok(true) => report.removed.push(path.clone()),
            Ok(false) => {}
            Err(_) => retry.push(path),
        }
    }

    if !retry.is_empty() {
        tokio::time::sleep(delay).await;
        for path in retry {
            match remove_path(path).await {
                Ok(true) => report.removed.push(path.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!("Cleanup could not remove {}: {}", path.display(), e);
                    report.failed.push(CleanupFailure {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    report
}

/// `Ok(false)` when there was nothing to remove.
async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}
