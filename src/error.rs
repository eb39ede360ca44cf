//! Error types for the deck2video library.
//!
//! Two kinds of failure flow through the pipeline:
//!
//! * **Stage-fatal** errors ([`ExtractionError`], [`TranscriptionError`],
//!   [`NarrationError`], [`CompositionError`]) abort the whole run. They are
//!   wrapped in [`PipelineError`] and returned from
//!   [`crate::run::Pipeline::run`]; the orchestrator also rewrites the status
//!   marker to `failed` and persists the message next to it.
//!
//! * **Per-page** problems during speech synthesis ([`SynthesisWarning`]) are
//!   recovered locally: the page gets no audio file and the warning is
//!   collected in [`crate::output::RunOutput::warnings`].

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error returned by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error(transparent)]
    Narration(#[from] NarrationError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    /// Builder or request validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not prepare a working directory or write a run artifact.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error (panicked task, runtime failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short stage label used in the persisted failure reason.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Extraction(_) => "extracting",
            PipelineError::Transcription(_) => "transcribing",
            PipelineError::Narration(_) => "generating",
            PipelineError::Composition(_) => "composing",
            PipelineError::InvalidConfig(_) => "init",
            PipelineError::Io { .. } => "io",
            PipelineError::Internal(_) => "internal",
        }
    }
}

// ── Document extraction ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Document not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    #[error("PDF '{path}' is encrypted and cannot be opened without a password")]
    PasswordRequired { path: PathBuf },

    #[error("Document '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    #[error("Text extraction failed for page {page}: {detail}")]
    TextFailed { page: usize, detail: String },

    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumBindingFailed(String),

    #[error("Extraction task failed: {0}")]
    Internal(String),
}

// ── Transcription ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("Source video not found: '{path}'")]
    VideoNotFound { path: PathBuf },

    /// ffmpeg could not pull an audio track out of the video.
    #[error("Audio extraction from '{path}' failed: {detail}")]
    AudioExtraction { path: PathBuf, detail: String },

    /// The speech-to-text backend returned an error.
    #[error("Speech-to-text failed: {0}")]
    Backend(String),

    #[error("Could not write transcript to '{path}': {source}")]
    TranscriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Narration ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NarrationError {
    /// The credential pool was empty.
    #[error("No narration credentials configured")]
    NoCredentials,

    /// A page hit the rate-limit retry cap.
    #[error("Page {page}: gave up after {retries} rate-limited attempts. Last error: {last_error}")]
    RetriesExhausted {
        page: usize,
        retries: u32,
        last_error: String,
    },

    /// A non rate-limit error from the generation call. Never retried.
    #[error("Page {page}: narration generation failed via '{credential}': {detail}")]
    Generation {
        page: usize,
        credential: String,
        detail: String,
    },
}

/// Outcome of a single failed generation call, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Quota or rate limit hit; the call may succeed on another credential.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Anything else (bad request, auth failure, empty response).
    #[error("{0}")]
    Fatal(String),
}

impl GenerationError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GenerationError::RateLimited(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            GenerationError::RateLimited(d) | GenerationError::Fatal(d) => d,
        }
    }
}

// ── Speech synthesis (non-fatal) ─────────────────────────────────────────

/// A per-page synthesis problem. The page keeps an empty audio slot.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum SynthesisWarning {
    #[error("Page {page}: narration is empty, no audio synthesized")]
    EmptyNarration { page: usize },

    #[error("Page {page}: speech synthesis failed: {detail}")]
    Failed { page: usize, detail: String },
}

impl SynthesisWarning {
    pub fn page(&self) -> usize {
        match self {
            SynthesisWarning::EmptyNarration { page } | SynthesisWarning::Failed { page, .. } => {
                *page
            }
        }
    }
}

// ── Composition ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CompositionError {
    /// ffmpeg or ffprobe is not on PATH.
    #[error("'{tool}' could not be started: {detail}\nInstall ffmpeg and make sure it is on PATH.")]
    ToolUnavailable { tool: String, detail: String },

    #[error("Could not decode audio '{path}': {detail}")]
    AudioDecode { path: PathBuf, detail: String },

    #[error("Page {page} has no audio segment")]
    MissingAudio { page: usize },

    #[error("Image count ({images}) does not match audio count ({audio})")]
    LengthMismatch { images: usize, audio: usize },

    #[error("Nothing to compose: every page was skipped")]
    NoSegments,

    #[error("Encoding segment for page {page} failed: {detail}")]
    SegmentEncode { page: usize, detail: String },

    #[error("Concatenating segments into '{path}' failed: {detail}")]
    Concat { path: PathBuf, detail: String },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
