//! CLI binary for deck2video.
//!
//! A thin shim over the library crate that maps CLI flags and environment
//! variables to `PipelineConfig` / `RunRequest` and reports progress.

use anyhow::{Context, Result};
use clap::Parser;
use deck2video::pipeline::credentials::mask_key;
use deck2video::pipeline::llm::{parse_api_keys, resolve_provider, GeminiBackend, ProviderBackend};
use deck2video::pipeline::synthesize::OpenAiSpeech;
use deck2video::pipeline::transcribe::WhisperApiTranscriber;
use deck2video::{
    Credential, MissingAudioPolicy, PageCount, Pipeline, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, Resolution, RunRequest, Stage, VoiceSelection,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar reused across stages: a spinner for the whole-document stages,
/// a page counter for the per-page ones.
struct CliProgressCallback {
    bar: ProgressBar,
    audio_done: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        Self::spinner(&bar);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            audio_done: AtomicUsize::new(0),
        })
    }

    fn spinner(bar: &ProgressBar) {
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
    }

    fn counter(&self, prefix: &'static str, total: usize) {
        if self.bar.length() == Some(total as u64) && self.bar.prefix() == prefix {
            return;
        }
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_prefix(prefix);
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_message("");
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        match stage {
            Stage::Extracting | Stage::Transcribing | Stage::Init | Stage::Cleanup => {
                Self::spinner(&self.bar);
                self.bar.set_prefix("Preparing");
                self.bar.set_message(format!("{stage}…"));
            }
            Stage::Synthesizing => self.audio_done.store(0, Ordering::SeqCst),
            _ => {}
        }
    }

    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        self.bar.println(format!(
            "  {} {:<13} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", elapsed.as_secs_f64()))
        ));
    }

    fn on_narration_start(&self, page: usize, total: usize) {
        self.counter("Narrating", total);
        self.bar.set_message(format!("page {}", page + 1));
    }

    fn on_narration_complete(&self, _page: usize, _total: usize, _chars: usize) {
        self.bar.inc(1);
    }

    fn on_rate_limited(&self, page: usize, credential: &str, retries: u32, delay: Duration) {
        self.bar.println(format!(
            "  {} page {:>3}  {} rate limited, retry {} in {:.0}s",
            yellow("↻"),
            page + 1,
            credential,
            retries,
            delay.as_secs_f64()
        ));
    }

    fn on_audio_complete(&self, page: usize, total: usize, ok: bool) {
        self.counter("Speaking", total);
        if !ok {
            self.bar
                .println(format!("  {} page {:>3}  no audio", red("✗"), page + 1));
        }
        let done = self.audio_done.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_position(done as u64);
    }

    fn on_segment_complete(&self, _page: usize, total: usize) {
        self.counter("Composing", total);
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _success: bool) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Narrate every page of a deck, 480p output under ./run
  deck2video deck.pdf --work-dir run

  # Use the talk recording as context, first 10 slides, 720p
  deck2video deck.pdf --video talk.mp4 --pages 10 --resolution 720

  # Several Gemini keys, rotated on rate limits
  GEMINI_API_KEYS='["key-a","key-b"]' deck2video deck.pdf

  # Any edgequake-llm provider instead of Gemini keys
  deck2video deck.pdf --provider anthropic --model claude-sonnet-4-20250514

OUTPUT:
  <video-dir>/output_video_{res}p.mp4      default video dir: <work-dir>/video
  <audio-dir>/audio_{i}.mp3                default audio dir: <work-dir>/audio
  <work-dir>/processing.txt                present while running; "failed" on error
  <work-dir>/failure_reason.txt            error message of a failed run

ENVIRONMENT VARIABLES:
  GEMINI_API_KEYS         Gemini keys: JSON list or comma separated
  OPENAI_API_KEY          Speech synthesis and transcription (and narration fallback)
  OPENAI_BASE_URL         OpenAI-compatible endpoint for speech/transcription
  EDGEQUAKE_LLM_PROVIDER  Narration provider when no Gemini keys are given
  EDGEQUAKE_MODEL         Narration model for that provider
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  RUST_LOG                Log filter (overrides -v / -q)

REQUIREMENTS:
  ffmpeg and ffprobe on PATH. PDFium (~30 MB) is downloaded on first run.
"#;

/// Turn a PDF slide deck into a narrated video.
#[derive(Parser, Debug)]
#[command(
    name = "deck2video",
    version,
    about = "Turn a PDF slide deck into a narrated video",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF path or HTTP/HTTPS URL.
    document: String,

    /// Recording of the talk; its transcript grounds the narration.
    #[arg(long, env = "DECK2VIDEO_VIDEO")]
    video: Option<PathBuf>,

    /// Pages to narrate: "all" or the first N.
    #[arg(long, env = "DECK2VIDEO_PAGES", default_value = "all")]
    pages: String,

    /// Output height: 144, 240, 360, 480 or 720. Others fall back to 480.
    #[arg(long, env = "DECK2VIDEO_RESOLUTION", default_value_t = 480)]
    resolution: u32,

    /// Working directory; holds the status marker.
    #[arg(long, env = "DECK2VIDEO_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Where audio_{i}.mp3 files go. Default: <work-dir>/audio.
    #[arg(long, env = "DECK2VIDEO_AUDIO_DIR")]
    audio_dir: Option<PathBuf>,

    /// Where the video goes. Default: <work-dir>/video.
    #[arg(long, env = "DECK2VIDEO_VIDEO_DIR")]
    video_dir: Option<PathBuf>,

    /// Transcript file path. Default: <work-dir>/text_output.txt.
    #[arg(long, env = "DECK2VIDEO_TEXT_PATH")]
    text_path: Option<PathBuf>,

    /// Gemini API keys (JSON list or comma separated).
    #[arg(long, env = "GEMINI_API_KEYS", hide_env_values = true)]
    gemini_keys: Option<String>,

    /// Gemini model for narration.
    #[arg(long, env = "DECK2VIDEO_GEMINI_MODEL", default_value = deck2video::pipeline::llm::DEFAULT_GEMINI_MODEL)]
    gemini_model: String,

    /// edgequake-llm provider, used when no Gemini keys are given.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model for --provider.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Speech voice.
    #[arg(long, env = "DECK2VIDEO_VOICE", default_value = "alloy")]
    voice: String,

    /// Speech model.
    #[arg(long, env = "DECK2VIDEO_TTS_MODEL", default_value = "tts-1")]
    tts_model: String,

    /// Speaking rate (1.0 = normal).
    #[arg(long, env = "DECK2VIDEO_SPEED", default_value_t = 1.2)]
    speed: f32,

    /// Transcription model.
    #[arg(long, env = "DECK2VIDEO_STT_MODEL", default_value = "whisper-1")]
    stt_model: String,

    /// Concurrent speech synthesis calls.
    #[arg(short, long, env = "DECK2VIDEO_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Rate-limited attempts per page before giving up.
    #[arg(long, env = "DECK2VIDEO_MAX_RETRIES", default_value_t = 100)]
    max_retries: u32,

    /// Rotate to the next key after every page, not only on rate limits.
    #[arg(long, env = "DECK2VIDEO_ROTATE_PER_PAGE")]
    rotate_per_page: bool,

    /// Output frame rate.
    #[arg(long, env = "DECK2VIDEO_FPS", default_value_t = 24)]
    fps: u32,

    /// Video bitrate.
    #[arg(long, env = "DECK2VIDEO_VIDEO_BITRATE", default_value = "5M")]
    video_bitrate: String,

    /// Audio bitrate.
    #[arg(long, env = "DECK2VIDEO_AUDIO_BITRATE", default_value = "50k")]
    audio_bitrate: String,

    /// Pages without audio: silence, skip or fail.
    #[arg(long, env = "DECK2VIDEO_MISSING_AUDIO", value_enum, default_value = "silence")]
    missing_audio: MissingAudioArg,

    /// Length of the silent segment for pages without audio.
    #[arg(long, env = "DECK2VIDEO_SILENCE_SECS", default_value_t = 2.0)]
    silence_secs: f64,

    /// Delete the audio files once the video is composed.
    #[arg(long, env = "DECK2VIDEO_DISCARD_AUDIO")]
    discard_audio: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DECK2VIDEO_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DECK2VIDEO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DECK2VIDEO_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum MissingAudioArg {
    Silence,
    Skip,
    Fail,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Ensure PDFium engine is available ───────────────────────────────
    if !pdfium_auto::is_pdfium_cached() {
        if show_progress {
            let dl_bar = ProgressBar::new(0);
            dl_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  \
                     [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
            );
            dl_bar.set_prefix("PDF engine");
            dl_bar.enable_steady_tick(Duration::from_millis(80));

            let bar = dl_bar.clone();
            tokio::task::block_in_place(|| {
                pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                    if let Some(t) = total {
                        if bar.length().unwrap_or(0) != t {
                            bar.set_length(t);
                        }
                    }
                    bar.set_position(downloaded);
                }))
            })
            .context("Failed to download PDFium engine")?;
            dl_bar.finish_and_clear();
        } else {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
        }
    }

    // ── Build config and request ─────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    let request = build_request(&cli)?;
    let output_path = request.output_video_path();

    let pipeline = Arc::new(Pipeline::new(config).context("Invalid configuration")?);
    let output = pipeline
        .spawn(request)
        .await
        .context("Pipeline task panicked")?
        .with_context(|| {
            format!(
                "Run failed (see {})",
                cli.work_dir
                    .join(deck2video::status::FAILURE_REASON_FILE_NAME)
                    .display()
            )
        })?;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        for w in &output.warnings {
            eprintln!("  {} {}", yellow("⚠"), w);
        }
        for f in &output.cleanup.failed {
            eprintln!(
                "  {} could not remove {}: {}",
                yellow("⚠"),
                f.path.display(),
                f.error
            );
        }
        eprintln!(
            "{}  {} pages  {:.1}s of video  {}ms  →  {}",
            if output.warnings.is_empty() {
                green("✔")
            } else {
                yellow("⚠")
            },
            output.stats.processed_pages,
            output.composition.total_duration_secs,
            output.stats.total_duration_ms,
            bold(&output_path.display().to_string()),
        );
        eprintln!(
            "   {} narration calls  /  {} pages with audio",
            dim(&output.stats.generation_calls.to_string()),
            dim(&output.stats.pages_with_audio.to_string()),
        );
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .credentials(build_credentials(cli)?)
        .voice(VoiceSelection {
            model: cli.tts_model.clone(),
            voice: cli.voice.clone(),
            speed: cli.speed,
        })
        .max_retries(cli.max_retries)
        .rotate_per_page(cli.rotate_per_page)
        .synthesis_concurrency(cli.concurrency)
        .fps(cli.fps)
        .video_bitrate(cli.video_bitrate.clone())
        .audio_bitrate(cli.audio_bitrate.clone())
        .missing_audio(match cli.missing_audio {
            MissingAudioArg::Silence => MissingAudioPolicy::Silence(cli.silence_secs),
            MissingAudioArg::Skip => MissingAudioPolicy::Skip,
            MissingAudioArg::Fail => MissingAudioPolicy::Fail,
        })
        .keep_audio(!cli.discard_audio);

    let speech = OpenAiSpeech::from_env()
        .context("OPENAI_API_KEY is required for speech synthesis")?;
    builder = builder.speech_backend(Arc::new(speech));

    if cli.video.is_some() {
        let stt = WhisperApiTranscriber::from_env()
            .context("OPENAI_API_KEY is required to transcribe --video")?
            .with_model(cli.stt_model.clone());
        builder = builder.speech_to_text(Arc::new(stt));
    }

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Gemini keys if given, otherwise a single edgequake-llm provider.
fn build_credentials(cli: &Cli) -> Result<Vec<Credential>> {
    let keys = cli
        .gemini_keys
        .as_deref()
        .map(parse_api_keys)
        .unwrap_or_default();

    if !keys.is_empty() {
        return Ok(keys
            .iter()
            .map(|key| {
                let backend = GeminiBackend::new(key.clone()).with_model(cli.gemini_model.clone());
                Credential::new(format!("gemini:{}", mask_key(key)), Arc::new(backend))
            })
            .collect());
    }

    let provider = resolve_provider(cli.provider.as_deref(), cli.model.as_deref())
        .context("No narration credentials: set GEMINI_API_KEYS or an LLM provider")?;
    let label = format!(
        "{}:{}",
        cli.provider.as_deref().unwrap_or("auto"),
        cli.model.as_deref().unwrap_or("default")
    );
    Ok(vec![Credential::new(
        label,
        Arc::new(ProviderBackend::new(provider)),
    )])
}

/// Map CLI args to `RunRequest`.
fn build_request(cli: &Cli) -> Result<RunRequest> {
    let pages: PageCount = cli.pages.parse().context("Invalid --pages")?;
    let mut request = RunRequest::new(cli.document.clone(), cli.work_dir.clone())
        .with_pages(pages)
        .with_resolution(Resolution::from_selector(cli.resolution));
    if let Some(ref video) = cli.video {
        request = request.with_video(video.clone());
    }
    if let Some(ref dir) = cli.audio_dir {
        request = request.with_audio_dir(dir.clone());
    }
    if let Some(ref dir) = cli.video_dir {
        request = request.with_video_dir(dir.clone());
    }
    if let Some(ref path) = cli.text_path {
        request = request.with_transcript_path(path.clone());
    }
    Ok(request)
}
