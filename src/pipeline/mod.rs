//! Pipeline stages.
//!
//! Each submodule implements one step; [`crate::run`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──┐
//!                     ├──▶ narrate ──▶ synthesize ──▶ compose
//! video ──▶ transcribe┘   (llm, credentials, postprocess)   (media)
//! ```
//!
//! 1. [`input`]      — canonicalise the document path or URL to a local file
//! 2. [`extract`]    — page text and frame-sized images via pdfium
//! 3. [`transcribe`] — optional talk video → transcript
//! 4. [`narrate`]    — one narration per page; retry state lives in
//!    [`credentials`], backends in [`llm`], text cleanup in [`postprocess`]
//! 5. [`synthesize`] — narration → MP3, bounded concurrency
//! 6. [`compose`]    — still segments + lossless concat; ffmpeg calls in [`media`]

pub mod compose;
pub mod credentials;
pub mod extract;
pub mod input;
pub mod llm;
pub mod media;
pub mod narrate;
pub mod postprocess;
pub mod synthesize;
pub mod transcribe;
