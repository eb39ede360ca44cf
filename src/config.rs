//! Configuration types for a narration pipeline.
//!
//! Everything that stays constant across runs (credentials, backends, encoder
//! settings, retry policy) lives in [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`] and validated once in
//! [`PipelineConfigBuilder::build`]. Per-run inputs (document, video, output
//! directories, resolution) live in [`crate::run::RunRequest`].
//!
//! Nothing here reads the process environment. The CLI maps flags and env
//! vars onto the builder; library callers pass values explicitly.

use crate::error::PipelineError;
use crate::pipeline::credentials::Credential;
use crate::pipeline::extract::{DocumentExtractor, PdfiumExtractor};
use crate::pipeline::synthesize::SpeechBackend;
use crate::pipeline::transcribe::SpeechToText;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shared configuration for one or many pipeline runs.
///
/// # Example
/// ```rust,no_run
/// use deck2video::pipeline::credentials::Credential;
/// use deck2video::pipeline::llm::GeminiBackend;
/// use deck2video::pipeline::synthesize::OpenAiSpeech;
/// use deck2video::PipelineConfig;
/// use std::sync::Arc;
///
/// let keys = ["key-a", "key-b"];
/// let credentials = keys
///     .iter()
///     .enumerate()
///     .map(|(i, k)| Credential::new(format!("gemini#{i}"), Arc::new(GeminiBackend::new(*k))))
///     .collect();
///
/// let config = PipelineConfig::builder()
///     .credentials(credentials)
///     .speech_backend(Arc::new(OpenAiSpeech::from_env().unwrap()))
///     .synthesis_concurrency(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Turns the request's document into pages. Default: [`PdfiumExtractor`].
    pub extractor: Arc<dyn DocumentExtractor>,

    /// Narration credential pool, rotated round-robin on rate limits.
    pub credentials: Vec<Credential>,

    /// Speech-to-text backend. Only required when a run has a source video.
    pub speech_to_text: Option<Arc<dyn SpeechToText>>,

    /// Text-to-speech backend used for every narration.
    pub speech_backend: Option<Arc<dyn SpeechBackend>>,

    /// Voice, model and speaking rate passed to the speech backend.
    pub voice: VoiceSelection,

    /// Maximum rate-limited attempts per page before the run fails. Default: 100.
    pub max_retries: u32,

    /// Base of the exponential backoff: the wait before retry `n` is
    /// `retry_base * 2^n`. Default: 1 s.
    pub retry_base: Duration,

    /// Upper bound for a single backoff sleep. Default: 10 min.
    ///
    /// Retries past the cap wait `max_backoff` each instead of continuing
    /// to double.
    pub max_backoff: Duration,

    /// How long a rate-limited credential is skipped in favour of the others.
    /// Default: 60 s.
    pub credential_cooldown: Duration,

    /// Move to the next credential after every successful page instead of
    /// staying on the one that worked. Default: false.
    pub rotate_per_page: bool,

    /// Number of speech synthesis calls in flight at once. Default: 4.
    pub synthesis_concurrency: usize,

    /// Output frame rate. Default: 24.
    pub fps: u32,

    /// Video bitrate passed to the encoder. Default: "5M".
    pub video_bitrate: String,

    /// Audio bitrate passed to the encoder. Default: "50k".
    pub audio_bitrate: String,

    /// Encoder thread count; `None` lets ffmpeg decide.
    pub encoder_threads: Option<usize>,

    /// What the composer does with a page that has no audio.
    pub missing_audio: MissingAudioPolicy,

    /// Wait before the final cleanup attempt. Default: 3 s.
    pub cleanup_delay: Duration,

    /// Keep the per-page audio files after composition. Default: true.
    pub keep_audio: bool,

    /// ffmpeg executable. Default: "ffmpeg".
    pub ffmpeg: String,

    /// ffprobe executable. Default: "ffprobe".
    pub ffprobe: String,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extractor: Arc::new(PdfiumExtractor),
            credentials: Vec::new(),
            speech_to_text: None,
            speech_backend: None,
            voice: VoiceSelection::default(),
            max_retries: 100,
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
            credential_cooldown: Duration::from_secs(60),
            rotate_per_page: false,
            synthesis_concurrency: 4,
            fps: 24,
            video_bitrate: "5M".to_string(),
            audio_bitrate: "50k".to_string(),
            encoder_threads: None,
            missing_audio: MissingAudioPolicy::default(),
            cleanup_delay: Duration::from_secs(3),
            keep_audio: true,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.credentials.iter().map(|c| c.label()).collect();
        f.debug_struct("PipelineConfig")
            .field("credentials", &labels)
            .field(
                "speech_to_text",
                &self.speech_to_text.as_ref().map(|_| "<dyn SpeechToText>"),
            )
            .field(
                "speech_backend",
                &self.speech_backend.as_ref().map(|_| "<dyn SpeechBackend>"),
            )
            .field("voice", &self.voice)
            .field("max_retries", &self.max_retries)
            .field("retry_base", &self.retry_base)
            .field("max_backoff", &self.max_backoff)
            .field("credential_cooldown", &self.credential_cooldown)
            .field("rotate_per_page", &self.rotate_per_page)
            .field("synthesis_concurrency", &self.synthesis_concurrency)
            .field("fps", &self.fps)
            .field("video_bitrate", &self.video_bitrate)
            .field("audio_bitrate", &self.audio_bitrate)
            .field("missing_audio", &self.missing_audio)
            .field("keep_audio", &self.keep_audio)
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn credentials(mut self, credentials: Vec<Credential>) -> Self {
        self.config.credentials = credentials;
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.config.credentials.push(credential);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.config.extractor = extractor;
        self
    }

    pub fn speech_to_text(mut self, backend: Arc<dyn SpeechToText>) -> Self {
        self.config.speech_to_text = Some(backend);
        self
    }

    pub fn speech_backend(mut self, backend: Arc<dyn SpeechBackend>) -> Self {
        self.config.speech_backend = Some(backend);
        self
    }

    pub fn voice(mut self, voice: VoiceSelection) -> Self {
        self.config.voice = voice;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_base(mut self, base: Duration) -> Self {
        self.config.retry_base = base;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.config.max_backoff = max;
        self
    }

    pub fn credential_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.credential_cooldown = cooldown;
        self
    }

    pub fn rotate_per_page(mut self, rotate: bool) -> Self {
        self.config.rotate_per_page = rotate;
        self
    }

    pub fn synthesis_concurrency(mut self, n: usize) -> Self {
        self.config.synthesis_concurrency = n;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    pub fn video_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.config.video_bitrate = bitrate.into();
        self
    }

    pub fn audio_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.config.audio_bitrate = bitrate.into();
        self
    }

    pub fn encoder_threads(mut self, n: usize) -> Self {
        self.config.encoder_threads = Some(n.max(1));
        self
    }

    pub fn missing_audio(mut self, policy: MissingAudioPolicy) -> Self {
        self.config.missing_audio = policy;
        self
    }

    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.config.cleanup_delay = delay;
        self
    }

    pub fn keep_audio(mut self, keep: bool) -> Self {
        self.config.keep_audio = keep;
        self
    }

    pub fn ffmpeg(mut self, path: impl Into<String>) -> Self {
        self.config.ffmpeg = path.into();
        self
    }

    pub fn ffprobe(mut self, path: impl Into<String>) -> Self {
        self.config.ffprobe = path.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, rejecting anything that would only fail
    /// halfway through a run.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl PipelineConfig {
    /// Check every setting. Called by the builder and again by
    /// [`crate::run::Pipeline::new`], since the fields are public.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let c = self;
        if c.credentials.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one narration credential is required".into(),
            ));
        }
        if c.speech_backend.is_none() {
            return Err(PipelineError::InvalidConfig(
                "A speech synthesis backend is required".into(),
            ));
        }
        if c.max_retries == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_retries must be ≥ 1".into(),
            ));
        }
        if c.max_backoff < c.retry_base {
            return Err(PipelineError::InvalidConfig(
                "max_backoff must be ≥ retry_base".into(),
            ));
        }
        if c.synthesis_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Synthesis concurrency must be ≥ 1".into(),
            ));
        }
        if c.fps == 0 || c.fps > 120 {
            return Err(PipelineError::InvalidConfig(format!(
                "fps must be 1–120, got {}",
                c.fps
            )));
        }
        if !is_valid_bitrate(&c.video_bitrate) {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid video bitrate '{}' (expected e.g. 5M or 800k)",
                c.video_bitrate
            )));
        }
        if !is_valid_bitrate(&c.audio_bitrate) {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid audio bitrate '{}' (expected e.g. 50k)",
                c.audio_bitrate
            )));
        }
        if let MissingAudioPolicy::Silence(secs) = c.missing_audio {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Silence duration must be a positive number of seconds, got {secs}"
                )));
            }
        }
        if !(c.voice.speed > 0.0 && c.voice.speed <= 4.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Speech speed must be in (0, 4], got {}",
                c.voice.speed
            )));
        }
        Ok(())
    }
}

/// Accepts ffmpeg bitrate strings such as `5M`, `800k` or `128000`.
fn is_valid_bitrate(s: &str) -> bool {
    let digits = s.trim_end_matches(['k', 'K', 'm', 'M']);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Output resolution. Only these five heights are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    P144,
    P240,
    P360,
    #[default]
    P480,
    P720,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::P144,
        Resolution::P240,
        Resolution::P360,
        Resolution::P480,
        Resolution::P720,
    ];

    /// Map a height selector to a resolution, or `None` if unsupported.
    pub fn from_height(height: u32) -> Option<Self> {
        match height {
            144 => Some(Resolution::P144),
            240 => Some(Resolution::P240),
            360 => Some(Resolution::P360),
            480 => Some(Resolution::P480),
            720 => Some(Resolution::P720),
            _ => None,
        }
    }

    /// Like [`Resolution::from_height`], falling back to 480p for unknown values.
    pub fn from_selector(height: u32) -> Self {
        Self::from_height(height).unwrap_or_else(|| {
            warn!("Invalid resolution selected: {height}p. Defaulting to 480p.");
            Resolution::default()
        })
    }

    pub fn height(self) -> u32 {
        match self {
            Resolution::P144 => 144,
            Resolution::P240 => 240,
            Resolution::P360 => 360,
            Resolution::P480 => 480,
            Resolution::P720 => 720,
        }
    }

    /// Target frame size `(width, height)` for page images.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P144 => (256, 144),
            Resolution::P240 => (426, 240),
            Resolution::P360 => (640, 360),
            Resolution::P480 => (854, 480),
            Resolution::P720 => (1280, 720),
        }
    }

    /// Frame size after rounding each side down to an even number, as
    /// required by yuv420p chroma subsampling.
    pub fn encoded_dimensions(self) -> (u32, u32) {
        let (w, h) = self.dimensions();
        (w / 2 * 2, h / 2 * 2)
    }

    /// Output file name: `output_video_{height}p.mp4`.
    pub fn output_file_name(self) -> String {
        format!("output_video_{}p.mp4", self.height())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{}p ({}x{})", self.height(), w, h)
    }
}

/// How many pages of the document to narrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageCount {
    /// Every page in the document.
    #[default]
    All,
    /// The first `n` pages (clamped to the document length).
    Limit(usize),
}

impl PageCount {
    /// Number of pages to process for a document with `total` pages.
    pub fn resolve(self, total: usize) -> usize {
        match self {
            PageCount::All => total,
            PageCount::Limit(n) => n.min(total),
        }
    }
}

impl FromStr for PageCount {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(PageCount::All);
        }
        match s.parse::<usize>() {
            Ok(0) => Err(PipelineError::InvalidConfig(
                "Page count must be ≥ 1 or \"all\"".into(),
            )),
            Ok(n) => Ok(PageCount::Limit(n)),
            Err(_) => Err(PipelineError::InvalidConfig(format!(
                "Invalid page count '{s}': expected \"all\" or a positive integer"
            ))),
        }
    }
}

impl fmt::Display for PageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCount::All => f.write_str("all"),
            PageCount::Limit(n) => write!(f, "{n}"),
        }
    }
}

/// What to do with a page whose narration produced no audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MissingAudioPolicy {
    /// Show the page over a silent track of this many seconds. (default: 2.0)
    Silence(f64),
    /// Leave the page out of the video.
    Skip,
    /// Abort the run with [`crate::error::CompositionError::MissingAudio`].
    Fail,
}

impl Default for MissingAudioPolicy {
    fn default() -> Self {
        MissingAudioPolicy::Silence(2.0)
    }
}

/// Voice parameters forwarded to the speech backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSelection {
    /// Synthesis model, e.g. "tts-1".
    pub model: String,
    /// Voice name, e.g. "alloy".
    pub voice: String,
    /// Speaking rate multiplier. Default: 1.2 (20 % faster than normal).
    pub speed: f32,
}

impl Default for VoiceSelection {
    fn default() -> Self {
        Self {
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_dimensions_table() {
        let expected = [
            (144, (256, 144)),
            (240, (426, 240)),
            (360, (640, 360)),
            (480, (854, 480)),
            (720, (1280, 720)),
        ];
        for (height, dims) in expected {
            let r = Resolution::from_selector(height);
            assert_eq!(r.height(), height);
            assert_eq!(r.dimensions(), dims);
        }
    }

    #[test]
    fn encoded_dimensions_are_even() {
        for r in Resolution::ALL {
            let (w, h) = r.dimensions();
            let (ew, eh) = r.encoded_dimensions();
            assert_eq!(ew % 2, 0);
            assert_eq!(eh % 2, 0);
            assert!(w - ew <= 1 && h - eh <= 1);
        }
    }

    #[test]
    fn unknown_resolution_falls_back_to_480() {
        assert_eq!(Resolution::from_selector(1080), Resolution::P480);
        assert_eq!(Resolution::from_selector(0), Resolution::P480);
        assert_eq!(Resolution::from_height(1080), None);
    }

    #[test]
    fn output_file_name_embeds_height() {
        assert_eq!(Resolution::P720.output_file_name(), "output_video_720p.mp4");
    }

    #[test]
    fn page_count_parse() {
        assert_eq!("all".parse::<PageCount>().unwrap(), PageCount::All);
        assert_eq!(" ALL ".parse::<PageCount>().unwrap(), PageCount::All);
        assert_eq!("3".parse::<PageCount>().unwrap(), PageCount::Limit(3));
        assert!("0".parse::<PageCount>().is_err());
        assert!("three".parse::<PageCount>().is_err());
    }

    #[test]
    fn page_count_clamps_to_document() {
        assert_eq!(PageCount::All.resolve(7), 7);
        assert_eq!(PageCount::Limit(3).resolve(7), 3);
        assert_eq!(PageCount::Limit(30).resolve(7), 7);
    }

    #[test]
    fn bitrate_validation() {
        assert!(is_valid_bitrate("5M"));
        assert!(is_valid_bitrate("50k"));
        assert!(is_valid_bitrate("128000"));
        assert!(!is_valid_bitrate("fast"));
        assert!(!is_valid_bitrate("k"));
    }

    struct Silent;

    impl crate::pipeline::llm::NarrationBackend for Silent {
        fn generate<'a>(
            &'a self,
            _prompt: &'a str,
        ) -> futures::future::BoxFuture<'a, Result<String, crate::error::GenerationError>> {
            Box::pin(async { Ok(String::new()) })
        }
    }

    impl SpeechBackend for Silent {
        fn synthesize<'a>(
            &'a self,
            _text: &'a str,
            _voice: &'a VoiceSelection,
        ) -> futures::future::BoxFuture<'a, Result<Vec<u8>, String>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn ready_builder() -> PipelineConfigBuilder {
        PipelineConfig::builder()
            .credential(Credential::new("fake", Arc::new(Silent)))
            .speech_backend(Arc::new(Silent))
    }

    #[test]
    fn build_with_defaults() {
        let config = ready_builder().build().unwrap();
        assert_eq!(config.max_retries, 100);
        assert_eq!(config.synthesis_concurrency, 4);
        assert_eq!(config.missing_audio, MissingAudioPolicy::Silence(2.0));
        assert!(!config.rotate_per_page);
        assert!(format!("{config:?}").contains("fake"));
    }

    #[test]
    fn build_rejects_bad_values() {
        assert!(ready_builder().synthesis_concurrency(0).build().is_err());
        assert!(ready_builder().fps(0).build().is_err());
        assert!(ready_builder().video_bitrate("fast").build().is_err());
        assert!(ready_builder()
            .missing_audio(MissingAudioPolicy::Silence(0.0))
            .build()
            .is_err());
        assert!(ready_builder()
            .retry_base(Duration::from_secs(10))
            .max_backoff(Duration::from_secs(1))
            .build()
            .is_err());
    }

    #[test]
    fn build_requires_speech_backend() {
        let err = PipelineConfig::builder()
            .credential(Credential::new("fake", Arc::new(Silent)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("speech"), "got: {err}");
    }

    #[test]
    fn build_requires_credentials() {
        let err = PipelineConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("credential"), "got: {err}");
    }
}
