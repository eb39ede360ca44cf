//! Narration generation: one spoken paragraph per page.
//!
//! Pages are processed strictly in order. Each page runs the
//! [`PageState`] machine from [`crate::pipeline::credentials`]; this module
//! supplies the side effects (the backend call, the backoff sleep, logging
//! and progress events).

use crate::config::PipelineConfig;
use crate::error::NarrationError;
use crate::output::NarrationSegment;
use crate::pipeline::credentials::{Credential, CredentialPool, PageState, RetryPolicy};
use crate::pipeline::postprocess::clean_narration;
use crate::progress::ProgressCallback;
use crate::prompts::narration_prompt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Drafts narrations through a pool of credentials.
pub struct NarrationGenerator {
    credentials: Vec<Credential>,
    policy: RetryPolicy,
    cooldown: Duration,
    rotate_per_page: bool,
    progress: Option<ProgressCallback>,
}

impl NarrationGenerator {
    pub fn new(credentials: Vec<Credential>, policy: RetryPolicy, cooldown: Duration) -> Self {
        Self {
            credentials,
            policy,
            cooldown,
            rotate_per_page: false,
            progress: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            base: config.retry_base,
            max_backoff: config.max_backoff,
        };
        let mut generator = Self::new(
            config.credentials.clone(),
            policy,
            config.credential_cooldown,
        )
        .with_rotate_per_page(config.rotate_per_page);
        generator.progress = config.progress_callback.clone();
        generator
    }

    pub fn with_rotate_per_page(mut self, rotate: bool) -> Self {
        self.rotate_per_page = rotate;
        self
    }

    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    /// Generate one narration per entry of `page_texts`, in order.
    ///
    /// The first fatal error stops the loop; pages after it are never sent.
    pub async fn generate(
        &self,
        page_texts: &[String],
        transcript: &str,
    ) -> Result<Vec<NarrationSegment>, NarrationError> {
        let mut pool = CredentialPool::new(self.credentials.len(), self.cooldown)?;
        let total = page_texts.len();
        let mut segments = Vec::with_capacity(total);

        for (page, text) in page_texts.iter().enumerate() {
            if let Some(ref cb) = self.progress {
                cb.on_narration_start(page, total);
            }
            let prompt = narration_prompt(transcript, page + 1, text);
            let segment = self.generate_page(&mut pool, page, &prompt).await?;
            info!(
                "Narration for page {}/{} ready ({} chars, {} attempt(s))",
                page + 1,
                total,
                segment.text.len(),
                segment.attempts
            );
            if let Some(ref cb) = self.progress {
                cb.on_narration_complete(page, total, segment.text.len());
            }
            segments.push(segment);

            if self.rotate_per_page {
                pool.advance();
            }
        }

        Ok(segments)
    }

    async fn generate_page(
        &self,
        pool: &mut CredentialPool,
        page: usize,
        prompt: &str,
    ) -> Result<NarrationSegment, NarrationError> {
        let mut state = PageState::Pending.start();
        loop {
            let index = pool.current();
            let credential = &self.credentials[index];
            debug!("Page {}: calling '{}'", page + 1, credential.label());

            let result = credential.backend().generate(prompt).await;
            state = state.on_result(page, credential.label(), result, &self.policy);

            match state {
                PageState::Done { text, retries } => {
                    return Ok(NarrationSegment {
                        page_index: page,
                        text: clean_narration(&text),
                        attempts: retries + 1,
                        credential: index,
                    });
                }
                PageState::Failed(e) => return Err(e),
                PageState::Backoff { retries, delay } => {
                    let next = pool.rotate_after_rate_limit(Instant::now());
                    warn!(
                        "Page {}: '{}' rate limited (retry {}/{}), waiting {:?} then using '{}'",
                        page + 1,
                        credential.label(),
                        retries,
                        self.policy.max_retries,
                        delay,
                        self.credentials[next].label()
                    );
                    if let Some(ref cb) = self.progress {
                        cb.on_rate_limited(page, credential.label(), retries, delay);
                    }
                    tokio::time::sleep(delay).await;
                    state = PageState::Backoff { retries, delay }.start();
                }
                other => state = other,
            }
        }
    }
}
