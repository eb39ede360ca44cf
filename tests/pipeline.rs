//! Integration tests for deck2video.
//!
//! Tests that only touch the filesystem always run. Tests that shell out to
//! ffmpeg skip themselves when it is not on PATH, and the full pipeline run
//! additionally needs pdfium, so it is gated behind `E2E_ENABLED`.
//!
//! Run everything with:
//!   E2E_ENABLED=1 cargo test --test pipeline -- --nocapture
//!
//! All model and speech backends are in-process fakes; no API keys needed.

use deck2video::error::{
    CompositionError, ExtractionError, GenerationError, NarrationError, PipelineError,
};
use deck2video::pipeline::compose::VideoComposer;
use deck2video::pipeline::extract::{DocumentExtractor, ExtractedDocument, Page};
use deck2video::pipeline::llm::NarrationBackend;
use deck2video::pipeline::media;
use deck2video::pipeline::synthesize::SpeechBackend;
use deck2video::status::{read_status, FAILURE_REASON_FILE_NAME, STATUS_FILE_NAME};
use deck2video::{
    AudioSegment, Credential, MissingAudioPolicy, PageCount, Pipeline, PipelineConfig,
    PipelineConfigBuilder, Resolution, RunRequest, RunStatus, VoiceSelection,
};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Skip this test if ffmpeg/ffprobe are not installed.
macro_rules! skip_unless_ffmpeg {
    () => {{
        if !media::is_available("ffmpeg").await || !media::is_available("ffprobe").await {
            println!("SKIP — ffmpeg/ffprobe not found on PATH");
            return;
        }
    }};
}

/// Skip this test if E2E_ENABLED is not set or ffmpeg is missing.
macro_rules! e2e_skip_unless_ready {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        skip_unless_ffmpeg!();
    }};
}

/// Narration backend that answers with the slide number it was asked about.
///
/// The first `rate_limits` calls are rejected as rate limited. When
/// `marker` is set, every call also checks that the run's status marker
/// says `processing`.
struct FakeNarration {
    rate_limits: AtomicUsize,
    calls: AtomicUsize,
    marker: Option<PathBuf>,
    saw_processing: AtomicBool,
}

impl FakeNarration {
    fn new(rate_limits: usize, marker: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            rate_limits: AtomicUsize::new(rate_limits),
            calls: AtomicUsize::new(0),
            marker,
            saw_processing: AtomicBool::new(false),
        })
    }
}

impl NarrationBackend for FakeNarration {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref marker) = self.marker {
                if let Ok(RunStatus::Processing) = read_status(marker).await {
                    self.saw_processing.store(true, Ordering::SeqCst);
                }
            }
            let limited = self
                .rate_limits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if limited {
                return Err(GenerationError::RateLimited("429 RESOURCE_EXHAUSTED".into()));
            }
            let slide = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Here is the content of slide "))
                .and_then(|rest| rest.split(';').next())
                .unwrap_or("?")
                .to_string();
            Ok(format!("## Slide {slide}\n**This** is the narration for slide {slide}."))
        })
    }
}

/// Speech backend returning a pre-rendered MP3 tone for every narration.
struct ToneSpeech {
    mp3: Vec<u8>,
}

impl SpeechBackend for ToneSpeech {
    fn synthesize<'a>(
        &'a self,
        _text: &'a str,
        _voice: &'a VoiceSelection,
    ) -> BoxFuture<'a, Result<Vec<u8>, String>> {
        Box::pin(async move { Ok(self.mp3.clone()) })
    }
}

/// Render a sine tone of `secs` seconds to an MP3 file.
async fn render_tone(path: &Path, secs: f64) {
    let args: Vec<std::ffi::OsString> = vec![
        "-y".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("sine=frequency=440:duration={secs}").into(),
        "-ac".into(),
        "1".into(),
        path.as_os_str().to_owned(),
    ];
    media::run_tool("ffmpeg", &args).await.expect("tone render failed");
}

/// A minimal, valid multi-page PDF with one line of Helvetica text per page.
fn build_pdf(texts: &[&str]) -> Vec<u8> {
    let n = texts.len();
    let font_id = 3 + 2 * n;
    let mut objects: Vec<String> = Vec::new();

    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + 2 * i)).collect();
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        n
    ));
    for (i, text) in texts.iter().enumerate() {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 960 540] \
             /Resources << /Font << /F1 {font_id} 0 R >> >> /Contents {} 0 R >>",
            4 + 2 * i
        ));
        let stream = format!("BT /F1 32 Tf 72 400 Td ({text}) Tj ET");
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            stream.len(),
            stream
        ));
    }
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_at = pdf.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for off in offsets {
        xref.push_str(&format!("{off:010} 00000 n \n"));
    }
    pdf.extend_from_slice(xref.as_bytes());
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        )
        .as_bytes(),
    );
    pdf
}

/// Extractor that skips pdfium: blank frames with "Slide N" as their text.
struct BlankDeck {
    pages: usize,
}

impl DocumentExtractor for BlankDeck {
    fn extract<'a>(
        &'a self,
        _document: &'a str,
        count: PageCount,
        resolution: Resolution,
    ) -> BoxFuture<'a, Result<ExtractedDocument, ExtractionError>> {
        Box::pin(async move {
            let (w, h) = resolution.dimensions();
            let pages = (0..count.resolve(self.pages))
                .map(|i| Page {
                    index: i,
                    text: format!("Slide {}", i + 1),
                    image: image::DynamicImage::new_rgb8(w, h),
                })
                .collect();
            Ok(ExtractedDocument {
                total_pages: self.pages,
                pages,
            })
        })
    }
}

fn builder_with(
    narration: Arc<FakeNarration>,
    speech: Arc<dyn SpeechBackend>,
) -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .credential(Credential::new("fake#0", narration.clone()))
        .credential(Credential::new("fake#1", narration))
        .speech_backend(speech)
        .retry_base(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(100))
        .cleanup_delay(Duration::from_millis(10))
}

fn config_with(narration: Arc<FakeNarration>, speech: Arc<dyn SpeechBackend>) -> PipelineConfig {
    builder_with(narration, speech).build().expect("valid config")
}

fn failure_reason(work_dir: &Path) -> String {
    std::fs::read_to_string(work_dir.join(FAILURE_REASON_FILE_NAME)).unwrap_or_default()
}

// ── Status marker ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_run_marks_status_failed() {
    let work = tempfile::tempdir().unwrap();
    let narration = FakeNarration::new(0, None);
    let config = config_with(narration.clone(), Arc::new(ToneSpeech { mp3: Vec::new() }));
    let pipeline = Pipeline::new(config).unwrap();

    let request = RunRequest::new("/definitely/not/a/deck.pdf", work.path());
    let err = assert_err!(pipeline.run(&request).await);
    assert!(matches!(err, PipelineError::Extraction(_)), "got: {err}");

    let marker = work.path().join(STATUS_FILE_NAME);
    assert_eq!(read_status(&marker).await.unwrap(), RunStatus::Failed);
    let reason = std::fs::read_to_string(work.path().join(FAILURE_REASON_FILE_NAME)).unwrap();
    assert!(reason.starts_with("extracting:"), "reason: {reason}");
    assert!(reason.contains("not found"), "reason: {reason}");

    // Nothing was narrated.
    assert_eq!(narration.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_spawned_run_reports_failure_through_handle() {
    let work = tempfile::tempdir().unwrap();
    let config = config_with(
        FakeNarration::new(0, None),
        Arc::new(ToneSpeech { mp3: Vec::new() }),
    );
    let pipeline = Arc::new(Pipeline::new(config).unwrap());

    let not_pdf = work.path().join("notes.pdf");
    std::fs::write(&not_pdf, b"just some text").unwrap();
    let request = RunRequest::new(not_pdf.to_string_lossy(), work.path().join("run"));

    let result = pipeline.spawn(request).await.expect("task panicked");
    let err = result.unwrap_err();
    assert_eq!(err.stage(), "extracting");
    assert_eq!(
        read_status(&work.path().join("run").join(STATUS_FILE_NAME))
            .await
            .unwrap(),
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_exhausted_narration_marks_status_failed() {
    let work = tempfile::tempdir().unwrap();
    let narration = FakeNarration::new(usize::MAX, None);
    let config = builder_with(narration.clone(), Arc::new(ToneSpeech { mp3: Vec::new() }))
        .extractor(Arc::new(BlankDeck { pages: 2 }))
        .max_retries(2)
        .build()
        .unwrap();
    let pipeline = Pipeline::new(config).unwrap();

    let request = RunRequest::new("deck.pdf", work.path());
    let err = assert_err!(pipeline.run(&request).await);
    assert!(
        matches!(
            err,
            PipelineError::Narration(NarrationError::RetriesExhausted { page: 0, .. })
        ),
        "got: {err}"
    );

    assert_eq!(
        read_status(&work.path().join(STATUS_FILE_NAME)).await.unwrap(),
        RunStatus::Failed
    );
    let reason = failure_reason(work.path());
    assert!(reason.starts_with("generating:"), "reason: {reason}");
    // Two rate-limited calls on the first page, the second page never sent.
    assert_eq!(narration.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_composition_failure_marks_status_failed() {
    let work = tempfile::tempdir().unwrap();
    let speech = Arc::new(ToneSpeech {
        mp3: b"ID3 not really audio".to_vec(),
    });
    let config = builder_with(FakeNarration::new(0, None), speech)
        .extractor(Arc::new(BlankDeck { pages: 2 }))
        .ffmpeg("deck2video-no-such-ffmpeg")
        .ffprobe("deck2video-no-such-ffprobe")
        .build()
        .unwrap();
    let pipeline = Pipeline::new(config).unwrap();

    let request = RunRequest::new("deck.pdf", work.path()).with_resolution(Resolution::P144);
    let err = assert_err!(pipeline.run(&request).await);
    assert!(
        matches!(
            err,
            PipelineError::Composition(CompositionError::ToolUnavailable { .. })
        ),
        "got: {err}"
    );

    assert_eq!(
        read_status(&work.path().join(STATUS_FILE_NAME)).await.unwrap(),
        RunStatus::Failed
    );
    let reason = failure_reason(work.path());
    assert!(reason.starts_with("composing:"), "reason: {reason}");
    assert!(!request.output_video_path().exists());
}

#[tokio::test]
async fn test_successful_run_clears_status_marker() {
    skip_unless_ffmpeg!();

    let work = tempfile::tempdir().unwrap();
    let tone = work.path().join("tone.mp3");
    render_tone(&tone, 0.5).await;
    let speech = Arc::new(ToneSpeech {
        mp3: std::fs::read(&tone).unwrap(),
    });

    let run_dir = work.path().join("run");
    let narration = FakeNarration::new(0, Some(run_dir.join(STATUS_FILE_NAME)));
    let config = builder_with(narration.clone(), speech)
        .extractor(Arc::new(BlankDeck { pages: 2 }))
        .build()
        .unwrap();
    let pipeline = Arc::new(Pipeline::new(config).unwrap());

    // A reason and a moviepy soundtrack left over from an earlier run.
    let request = RunRequest::new("deck.pdf", &run_dir).with_resolution(Resolution::P144);
    std::fs::create_dir_all(&request.audio_dir).unwrap();
    std::fs::write(run_dir.join(FAILURE_REASON_FILE_NAME), "extracting: old").unwrap();
    let legacy = request.audio_dir.join("output_videoTEMP_MPY_wvf_snd.mp3");
    std::fs::write(&legacy, b"stale").unwrap();

    let output = assert_ok!(pipeline.spawn(request.clone()).await.unwrap());

    assert!(output.video_path.exists());
    assert_eq!(output.narrations.len(), 2);
    assert!(narration.saw_processing.load(Ordering::SeqCst));
    assert_eq!(
        read_status(&run_dir.join(STATUS_FILE_NAME)).await.unwrap(),
        RunStatus::Absent
    );
    assert!(!run_dir.join(FAILURE_REASON_FILE_NAME).exists());
    assert!(!legacy.exists());
    assert!(!request.transcript_path.exists());
    assert!(output.cleanup.is_clean());
}

#[test]
fn test_pipeline_rejects_unvalidated_config() {
    let config = PipelineConfig::default();
    let err = Pipeline::new(config).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
}

#[test]
fn test_handles_are_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Pipeline>();
    assert_send_sync::<PipelineConfig>();
    assert_send_sync::<RunRequest>();
}

// ── Composer (needs ffmpeg) ──────────────────────────────────────────────────

#[tokio::test]
async fn test_composed_duration_matches_segments() {
    skip_unless_ffmpeg!();

    let dir = tempfile::tempdir().unwrap();
    let resolution = Resolution::P240;
    let (w, h) = resolution.dimensions();

    let mut pages = Vec::new();
    let mut audio = Vec::new();
    for (i, secs) in [1.0, 1.5].into_iter().enumerate() {
        let path = dir.path().join(format!("audio_{i}.mp3"));
        render_tone(&path, secs).await;
        audio.push(Some(AudioSegment {
            page_index: i,
            path,
            duration_secs: None,
        }));
        pages.push(Page {
            index: i,
            text: String::new(),
            image: image::DynamicImage::new_rgb8(w, h),
        });
    }
    // Third page has no audio and gets two seconds of silence.
    pages.push(Page {
        index: 2,
        text: String::new(),
        image: image::DynamicImage::new_rgb8(w, h),
    });
    audio.push(None);

    let config = PipelineConfig {
        missing_audio: MissingAudioPolicy::Silence(2.0),
        ..PipelineConfig::default()
    };
    let output = dir.path().join("video").join(resolution.output_file_name());
    let report = VideoComposer::from_config(&config)
        .compose(&pages, &mut audio, &output)
        .await
        .expect("composition failed");

    assert!(output.exists());
    assert_eq!(report.segments.len(), 3);
    assert!(report.segments[2].silent);
    assert!(report.leftover.is_none());
    assert!(audio[0].as_ref().unwrap().duration_secs.is_some());

    let expected: f64 = report.segments.iter().map(|s| s.duration_secs).sum();
    assert!((report.total_duration_secs - expected).abs() < 1e-9);

    // Each segment is exact to one frame; allow that much drift per segment.
    let frame = 1.0 / config.fps as f64;
    let actual = media::probe_duration("ffprobe", &output).await.unwrap();
    let tolerance = frame * report.segments.len() as f64;
    assert!(
        (actual - expected).abs() <= tolerance,
        "video is {actual:.3}s, segments sum to {expected:.3}s"
    );

    // Only the video is left in the output directory.
    let entries: Vec<_> = std::fs::read_dir(dir.path().join("video"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("output_video_240p.mp4")]);
}

// ── End to end (needs pdfium + ffmpeg) ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_e2e_three_pages_without_video() {
    e2e_skip_unless_ready!();

    let work = tempfile::tempdir().unwrap();
    let deck = work.path().join("deck.pdf");
    std::fs::write(&deck, build_pdf(&["Intro", "Results", "Outlook"])).unwrap();

    let tone = work.path().join("tone.mp3");
    render_tone(&tone, 1.0).await;
    let speech = Arc::new(ToneSpeech {
        mp3: std::fs::read(&tone).unwrap(),
    });

    let run_dir = work.path().join("run");
    let narration = FakeNarration::new(2, Some(run_dir.join(STATUS_FILE_NAME)));
    let pipeline = Arc::new(Pipeline::new(config_with(narration.clone(), speech)).unwrap());

    let request = RunRequest::new(deck.to_string_lossy(), &run_dir).with_resolution(Resolution::P144);
    let output = assert_ok!(pipeline.spawn(request.clone()).await.unwrap());

    // Video and per-page artifacts.
    assert_eq!(output.video_path, run_dir.join("video/output_video_144p.mp4"));
    assert!(output.video_path.exists());
    assert_eq!(output.narrations.len(), 3);
    for (i, n) in output.narrations.iter().enumerate() {
        assert_eq!(n.page_index, i);
        assert!(!n.text.contains("**") && !n.text.contains('#'), "{}", n.text);
        assert!(n.text.contains(&format!("slide {}", i + 1)), "{}", n.text);
        assert!(run_dir.join(format!("audio/audio_{i}.mp3")).exists());
    }
    assert!(output.warnings.is_empty());
    assert_eq!(output.composition.segments.len(), 3);

    // Two rate limits on the first page, then one call per page.
    assert_eq!(output.narrations[0].attempts, 3);
    assert_eq!(output.stats.generation_calls, 5);
    assert_eq!(narration.calls.load(Ordering::SeqCst), 5);

    // Marker was present while running and is gone now; transcript cleaned up.
    assert!(narration.saw_processing.load(Ordering::SeqCst));
    assert_eq!(
        read_status(&run_dir.join(STATUS_FILE_NAME)).await.unwrap(),
        RunStatus::Absent
    );
    assert!(!request.transcript_path.exists());
    assert!(output.cleanup.is_clean());
    assert_eq!(output.stats.total_pages, 3);
}
