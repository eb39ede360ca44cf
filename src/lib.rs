//! # deck2video
//!
//! Turn a slide deck (PDF) into a narrated video.
//!
//! Every page gets a short spoken narration drafted by a language model,
//! grounded in the page text and, optionally, a transcript of the talk the
//! deck was presented in. The narrations are synthesized to speech and each
//! page image is shown for exactly as long as its audio.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF (+ optional talk video)
//!  │
//!  ├─ 1. Extract     page text + frame-sized image (pdfium, spawn_blocking)
//!  ├─ 2. Transcribe  talk audio → text (ffmpeg + speech-to-text), in parallel with 1
//!  ├─ 3. Narrate     one ≤15 s narration per page, rotating API keys on rate limits
//!  ├─ 4. Synthesize  narration → audio_{i}.mp3, bounded concurrency
//!  ├─ 5. Compose     one still segment per page, concatenated losslessly
//!  └─ 6. Cleanup     transcript + staging files removed, typed report
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deck2video::pipeline::llm::GeminiBackend;
//! use deck2video::pipeline::synthesize::OpenAiSpeech;
//! use deck2video::{Credential, Pipeline, PipelineConfig, Resolution, RunRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .credential(Credential::new("gemini#0", Arc::new(GeminiBackend::new("key-a"))))
//!         .credential(Credential::new("gemini#1", Arc::new(GeminiBackend::new("key-b"))))
//!         .speech_backend(Arc::new(OpenAiSpeech::from_env().ok_or("OPENAI_API_KEY not set")?))
//!         .build()?;
//!
//!     let pipeline = Arc::new(Pipeline::new(config)?);
//!     let request = RunRequest::new("deck.pdf", "runs/42").with_resolution(Resolution::P720);
//!     let output = pipeline.spawn(request).await??;
//!     println!("{}", output.video_path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `deck2video` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## External tools
//!
//! Composition and transcription shell out to `ffmpeg` and `ffprobe`; both
//! must be on `PATH` (or configured through [`PipelineConfigBuilder::ffmpeg`]).

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod status;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    MissingAudioPolicy, PageCount, PipelineConfig, PipelineConfigBuilder, Resolution,
    VoiceSelection,
};
pub use error::{
    CompositionError, ExtractionError, GenerationError, NarrationError, PipelineError,
    SynthesisWarning, TranscriptionError,
};
pub use output::{
    AudioSegment, CleanupReport, CompositionReport, NarrationSegment, RunOutput, RunStats,
};
pub use pipeline::credentials::Credential;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{Pipeline, RunRequest, Stage};
pub use status::{RunStatus, StatusMarker};
