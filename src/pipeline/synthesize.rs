//! Text-to-speech for every narration.
//!
//! Pages are synthesized concurrently (bounded by `synthesis_concurrency`)
//! and written as `audio_{index}.mp3`. A failure on one page is never fatal:
//! the slot stays empty, a [`SynthesisWarning`] is recorded and the composer
//! decides what to show for that page.

use crate::config::VoiceSelection;
use crate::error::SynthesisWarning;
use crate::output::{AudioSegment, NarrationSegment};
use crate::progress::ProgressCallback;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Text-to-speech call returning encoded MP3 bytes.
pub trait SpeechBackend: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice: &'a VoiceSelection,
    ) -> BoxFuture<'a, Result<Vec<u8>, String>>;
}

/// File name of the audio for page `index`.
pub fn audio_file_name(index: usize) -> String {
    format!("audio_{index}.mp3")
}

/// Result of a synthesis pass: one slot per narration, in page order.
#[derive(Debug, Clone, Default)]
pub struct SynthesisOutput {
    pub slots: Vec<Option<AudioSegment>>,
    pub warnings: Vec<SynthesisWarning>,
}

impl SynthesisOutput {
    pub fn produced(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

pub struct SpeechSynthesizer {
    backend: Arc<dyn SpeechBackend>,
    voice: VoiceSelection,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl SpeechSynthesizer {
    pub fn new(backend: Arc<dyn SpeechBackend>, voice: VoiceSelection, concurrency: usize) -> Self {
        Self {
            backend,
            voice,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, cb: Option<ProgressCallback>) -> Self {
        self.progress = cb;
        self
    }

    /// Synthesize every narration into `output_dir`.
    pub async fn synthesize(
        &self,
        narrations: &[NarrationSegment],
        output_dir: &Path,
    ) -> SynthesisOutput {
        let total = narrations.len();

        // Built eagerly; a lazy `.map` over borrowed narrations is not Send
        // enough for `tokio::spawn`.
        let calls: Vec<_> = narrations
            .iter()
            .enumerate()
            .map(|(slot, narration)| async move {
                let result = self.synthesize_one(narration, output_dir).await;
                if let Some(ref cb) = self.progress {
                    cb.on_audio_complete(narration.page_index, total, result.is_ok());
                }
                (slot, result)
            })
            .collect();

        let mut results: Vec<(usize, Result<AudioSegment, SynthesisWarning>)> = stream::iter(calls)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results.sort_by_key(|(slot, _)| *slot);

        let mut out = SynthesisOutput::default();
        for (_, result) in results {
            match result {
                Ok(segment) => out.slots.push(Some(segment)),
                Err(warning) => {
                    warn!("{}", warning);
                    out.slots.push(None);
                    out.warnings.push(warning);
                }
            }
        }
        out
    }

    async fn synthesize_one(
        &self,
        narration: &NarrationSegment,
        output_dir: &Path,
    ) -> Result<AudioSegment, SynthesisWarning> {
        let page = narration.page_index;
        if narration.text.trim().is_empty() {
            return Err(SynthesisWarning::EmptyNarration { page });
        }

        let bytes = self
            .backend
            .synthesize(&narration.text, &self.voice)
            .await
            .map_err(|detail| SynthesisWarning::Failed { page, detail })?;
        if bytes.is_empty() {
            return Err(SynthesisWarning::Failed {
                page,
                detail: "backend returned no audio".into(),
            });
        }

        let path: PathBuf = output_dir.join(audio_file_name(page));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| SynthesisWarning::Failed {
                page,
                detail: format!("writing {}: {e}", path.display()),
            })?;
        debug!("Page {}: {} bytes of audio → {}", page + 1, bytes.len(), path.display());

        Ok(AudioSegment {
            page_index: page,
            path,
            duration_secs: None,
        })
    }
}

// ── OpenAI-compatible speech endpoint ────────────────────────────────────────

/// `POST {base}/audio/speech` client.
#[derive(Clone)]
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'static str,
}

impl OpenAiSpeech {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
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

    async fn call(&self, text: &str, voice: &VoiceSelection) -> Result<Vec<u8>, String> {
        let body = SpeechRequest {
            model: &voice.model,
            input: text,
            voice: &voice.voice,
            speed: voice.speed,
            response_format: "mp3",
        };
        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {detail}"));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| format!("reading audio failed: {e}"))
    }
}

impl SpeechBackend for OpenAiSpeech {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice: &'a VoiceSelection,
    ) -> BoxFuture<'a, Result<Vec<u8>, String>> {
        Box::pin(self.call(text, voice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the text as "audio", failing on pages whose text contains "fail".
    struct FakeSpeech {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeSpeech {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    impl SpeechBackend for FakeSpeech {
        fn synthesize<'a>(
            &'a self,
            text: &'a str,
            _voice: &'a VoiceSelection,
        ) -> BoxFuture<'a, Result<Vec<u8>, String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                if text.contains("fail") {
                    Err("HTTP 500".to_string())
                } else {
                    Ok(text.as_bytes().to_vec())
                }
            })
        }
    }

    fn narration(page: usize, text: &str) -> NarrationSegment {
        NarrationSegment {
            page_index: page,
            text: text.to_string(),
            attempts: 1,
            credential: 0,
        }
    }

    #[test]
    fn audio_names() {
        assert_eq!(audio_file_name(0), "audio_0.mp3");
        assert_eq!(audio_file_name(12), "audio_12.mp3");
    }

    #[tokio::test]
    async fn slots_follow_page_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeSpeech::new();
        let synth = SpeechSynthesizer::new(backend.clone(), VoiceSelection::default(), 2);
        let narrations: Vec<_> = (0..6).map(|i| narration(i, &format!("page {i}"))).collect();

        let out = synth.synthesize(&narrations, dir.path()).await;
        assert_eq!(out.slots.len(), 6);
        assert!(out.warnings.is_empty());
        for (i, slot) in out.slots.iter().enumerate() {
            let seg = slot.as_ref().unwrap();
            assert_eq!(seg.page_index, i);
            assert_eq!(seg.path, dir.path().join(format!("audio_{i}.mp3")));
            assert_eq!(std::fs::read_to_string(&seg.path).unwrap(), format!("page {i}"));
        }
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn synthesize_runs_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(SpeechSynthesizer::new(
            FakeSpeech::new(),
            VoiceSelection::default(),
            2,
        ));
        let narrations: Vec<_> = (0..3).map(|i| narration(i, "hello")).collect();
        let out_dir = dir.path().to_path_buf();

        let out = tokio::spawn(async move { synth.synthesize(&narrations, &out_dir).await })
            .await
            .unwrap();
        assert_eq!(out.produced(), 3);
    }

    #[tokio::test]
    async fn failures_and_empty_text_leave_empty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeSpeech::new();
        let synth = SpeechSynthesizer::new(backend.clone(), VoiceSelection::default(), 4);
        let narrations = vec![
            narration(0, "fine"),
            narration(1, "   "),
            narration(2, "please fail"),
            narration(3, "also fine"),
        ];

        let out = synth.synthesize(&narrations, dir.path()).await;
        assert_eq!(out.produced(), 2);
        assert!(out.slots[1].is_none());
        assert!(out.slots[2].is_none());
        assert!(!dir.path().join("audio_1.mp3").exists());

        let mut pages: Vec<usize> = out.warnings.iter().map(|w| w.page()).collect();
        pages.sort();
        assert_eq!(pages, vec![1, 2]);
        assert!(out
            .warnings
            .contains(&SynthesisWarning::EmptyNarration { page: 1 }));
        // The empty narration never reaches the backend.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn speech_request_body() {
        let voice = VoiceSelection::default();
        let body = SpeechRequest {
            model: &voice.model,
            input: "hi",
            voice: &voice.voice,
            speed: voice.speed,
            response_format: "mp3",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "tts-1");
        assert_eq!(json["voice"], "alloy");
        assert_eq!(json["response_format"], "mp3");
    }
}
