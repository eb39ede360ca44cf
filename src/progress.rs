//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow a run
//! stage by stage and page by page. The CLI drives its progress bars from
//! these events; a web front-end could forward them over a channel instead.
//!
//! # Example
//!
//! ```rust
//! use deck2video::{PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     narrated: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_narration_complete(&self, page: usize, total: usize, _chars: usize) {
//!         self.narrated.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("narrated {}/{}", page + 1, total);
//!     }
//! }
//!
//! let cb: Arc<dyn PipelineProgressCallback> = Arc::new(CountingCallback {
//!     narrated: AtomicUsize::new(0),
//! });
//! cb.on_stage_start(Stage::Generating);
//! ```

use crate::run::Stage;
use std::sync::Arc;
use std::time::Duration;

/// Called by the pipeline as a run advances.
///
/// All methods have default no-op implementations. Page indices are
/// 0-based. `on_audio_complete` is called concurrently from the synthesis
/// workers, so implementations must be `Send + Sync` and synchronise any
/// shared mutable state.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage is about to run.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// A stage finished successfully.
    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        let _ = (stage, elapsed);
    }

    /// The narration request for `page` is about to be sent.
    fn on_narration_start(&self, page: usize, total: usize) {
        let _ = (page, total);
    }

    /// A narration was generated and cleaned; `chars` is its length.
    fn on_narration_complete(&self, page: usize, total: usize, chars: usize) {
        let _ = (page, total, chars);
    }

    /// A narration call was rate limited; the next attempt follows `delay`.
    fn on_rate_limited(&self, page: usize, credential: &str, retries: u32, delay: Duration) {
        let _ = (page, credential, retries, delay);
    }

    /// Speech synthesis for `page` finished. `ok` is false when the page
    /// was left without audio.
    fn on_audio_complete(&self, page: usize, total: usize, ok: bool) {
        let _ = (page, total, ok);
    }

    /// A video segment was encoded.
    fn on_segment_complete(&self, page: usize, total: usize) {
        let _ = (page, total);
    }

    /// The run ended, successfully or not.
    fn on_run_complete(&self, success: bool) {
        let _ = success;
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
