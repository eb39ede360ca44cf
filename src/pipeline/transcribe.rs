//! Speech transcription of the optional source video.
//!
//! The transcript is context for the narration prompt, nothing more. A run
//! without a video gets a fixed placeholder and never touches ffmpeg or the
//! speech-to-text backend.

use crate::error::TranscriptionError;
use crate::pipeline::media;
use crate::prompts::NO_VIDEO_TRANSCRIPT;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Speech-to-text over an audio file.
pub trait SpeechToText: Send + Sync {
    fn transcribe<'a>(&'a self, audio_path: &'a Path) -> BoxFuture<'a, Result<String, String>>;
}

/// Where a transcript came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscriptSource {
    Placeholder,
    Video(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub source: TranscriptSource,
}

impl Transcript {
    pub fn placeholder() -> Self {
        Self {
            text: NO_VIDEO_TRANSCRIPT.to_string(),
            source: TranscriptSource::Placeholder,
        }
    }
}

/// Turns the optional source video into a [`Transcript`].
pub struct Transcriber {
    backend: Option<Arc<dyn SpeechToText>>,
    ffmpeg: String,
}

impl Transcriber {
    pub fn new(backend: Option<Arc<dyn SpeechToText>>, ffmpeg: impl Into<String>) -> Self {
        Self {
            backend,
            ffmpeg: ffmpeg.into(),
        }
    }

    pub async fn transcribe(&self, video: Option<&Path>) -> Result<Transcript, TranscriptionError> {
        let Some(video) = video else {
            info!("No source video, using placeholder transcript");
            return Ok(Transcript::placeholder());
        };

        if !video.is_file() {
            return Err(TranscriptionError::VideoNotFound {
                path: video.to_path_buf(),
            });
        }
        let backend = self.backend.as_ref().ok_or_else(|| {
            TranscriptionError::Backend("no speech-to-text backend configured".into())
        })?;

        // Dropped on every return path, taking the extracted track with it.
        let scratch = tempfile::Builder::new()
            .prefix("deck2video-stt-")
            .tempdir()
            .map_err(|e| TranscriptionError::AudioExtraction {
                path: video.to_path_buf(),
                detail: format!("could not create temp dir: {e}"),
            })?;
        let audio_path = scratch.path().join("speech.mp3");

        media::extract_speech_audio(&self.ffmpeg, video, &audio_path)
            .await
            .map_err(|e| TranscriptionError::AudioExtraction {
                path: video.to_path_buf(),
                detail: e.to_string(),
            })?;

        let text = backend
            .transcribe(&audio_path)
            .await
            .map_err(TranscriptionError::Backend)?;
        info!("Transcribed {} ({} chars)", video.display(), text.len());

        Ok(Transcript {
            text: text.trim().to_string(),
            source: TranscriptSource::Video(video.to_path_buf()),
        })
    }
}

/// Write the transcript where a human can inspect it during the run.
pub async fn write_transcript(path: &Path, transcript: &Transcript) -> Result<(), TranscriptionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TranscriptionError::TranscriptWrite {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }
    tokio::fs::write(path, &transcript.text)
        .await
        .map_err(|source| TranscriptionError::TranscriptWrite {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Transcript written to {}", path.display());
    Ok(())
}

// ── OpenAI-compatible transcription endpoint ─────────────────────────────────

/// `POST {base}/audio/transcriptions` client (OpenAI Whisper and compatible
/// servers).
#[derive(Clone)]
pub struct WhisperApiTranscriber {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl WhisperApiTranscriber {
    pub const DEFAULT_MODEL: &'static str = "whisper-1";

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())?;
        let base = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Some(Self::new(key, base))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn call(&self, audio_path: &Path) -> Result<String, String> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| format!("reading {}: {e}", audio_path.display()))?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| e.to_string())?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("HTTP {status}: {body}"));
        }
        let parsed: TranscriptionResponse =
            serde_json::from_str(&body).map_err(|e| format!("invalid response JSON: {e}"))?;
        Ok(parsed.text)
    }
}

impl SpeechToText for WhisperApiTranscriber {
    fn transcribe<'a>(&'a self, audio_path: &'a Path) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(self.call(audio_path))
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}
