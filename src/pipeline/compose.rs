//! Video composition: one still-image segment per page, then a lossless
//! concatenation.
//!
//! Each segment shows the page image for exactly the length of its audio.
//! All segments share the same codec parameters, so the concat demuxer can
//! join them with `-c copy`. Intermediate files live in a staging directory
//! next to the output and are removed when composition ends.

use crate::config::{MissingAudioPolicy, PipelineConfig};
use crate::error::CompositionError;
use crate::output::{AudioSegment, CompositionReport, SegmentReport};
use crate::pipeline::extract::Page;
use crate::pipeline::media::{self, EncodeSettings, MediaError, SegmentAudio};
use crate::progress::ProgressCallback;
use image::ImageFormat;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of the staging directory created beside the output file.
pub const STAGING_PREFIX: &str = ".deck2video-staging-";

/// Soundtrack decided for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAudio {
    File(PathBuf),
    Silence(f64),
}

/// One segment of the final video, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    pub page_index: usize,
    pub audio: PlannedAudio,
}

/// Pair every page with its audio slot according to `policy`.
///
/// Slots are matched by position, so `audio.len()` must equal `pages`.
pub fn plan_segments(
    pages: usize,
    audio: &[Option<AudioSegment>],
    policy: MissingAudioPolicy,
) -> Result<Vec<SegmentPlan>, CompositionError> {
    if audio.len() != pages {
        return Err(CompositionError::LengthMismatch {
            images: pages,
            audio: audio.len(),
        });
    }

    let mut plan = Vec::with_capacity(pages);
    for (page_index, slot) in audio.iter().enumerate() {
        let audio = match (slot, policy) {
            (Some(seg), _) => PlannedAudio::File(seg.path.clone()),
            (None, MissingAudioPolicy::Silence(secs)) => PlannedAudio::Silence(secs),
            (None, MissingAudioPolicy::Skip) => {
                warn!("Page {} has no audio, leaving it out of the video", page_index + 1);
                continue;
            }
            (None, MissingAudioPolicy::Fail) => {
                return Err(CompositionError::MissingAudio { page: page_index });
            }
        };
        plan.push(SegmentPlan { page_index, audio });
    }

    if plan.is_empty() {
        return Err(CompositionError::NoSegments);
    }
    Ok(plan)
}

pub struct VideoComposer {
    ffmpeg: String,
    ffprobe: String,
    settings: EncodeSettings,
    missing_audio: MissingAudioPolicy,
    progress: Option<ProgressCallback>,
}

impl VideoComposer {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            settings: EncodeSettings {
                fps: config.fps,
                video_bitrate: config.video_bitrate.clone(),
                audio_bitrate: config.audio_bitrate.clone(),
                threads: config.encoder_threads,
            },
            missing_audio: config.missing_audio,
            progress: config.progress_callback.clone(),
        }
    }

    /// Compose `pages` and their audio slots into `output_path`.
    ///
    /// Durations found by probing are written back into `audio`.
    pub async fn compose(
        &self,
        pages: &[Page],
        audio: &mut [Option<AudioSegment>],
        output_path: &Path,
    ) -> Result<CompositionReport, CompositionError> {
        let plan = plan_segments(pages.len(), audio, self.missing_audio)?;
        let out_dir = output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let write_err = |path: &Path, source: std::io::Error| CompositionError::Write {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| write_err(out_dir, e))?;

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(out_dir)
            .map_err(|e| write_err(out_dir, e))?;

        let total = plan.len();
        let mut segment_files = Vec::with_capacity(total);
        let mut reports = Vec::with_capacity(total);

        for (n, seg) in plan.iter().enumerate() {
            let page = &pages[seg.page_index];
            let image_path = staging.path().join(format!("page_{}.png", seg.page_index));
            write_png(page, &image_path).await?;

            let (duration, silent) = match &seg.audio {
                PlannedAudio::File(path) => {
                    let d = media::probe_duration(&self.ffprobe, path)
                        .await
                        .map_err(|e| self.tool_error(e, |detail| CompositionError::AudioDecode {
                            path: path.clone(),
                            detail,
                        }))?;
                    if let Some(Some(slot)) = audio.get_mut(seg.page_index) {
                        slot.duration_secs = Some(d);
                    }
                    (d, false)
                }
                PlannedAudio::Silence(secs) => (*secs, true),
            };

            let segment_path = staging.path().join(format!("segment_{n:04}.mp4"));
            let segment_audio = match &seg.audio {
                PlannedAudio::File(path) => SegmentAudio::File(path),
                PlannedAudio::Silence(_) => SegmentAudio::Silence,
            };
            media::encode_still_segment(
                &self.ffmpeg,
                &image_path,
                &segment_audio,
                duration,
                &self.settings,
                &segment_path,
            )
            .await
            .map_err(|e| {
                self.tool_error(e, |detail| CompositionError::SegmentEncode {
                    page: seg.page_index,
                    detail,
                })
            })?;

            debug!(
                "Segment {}/{}: page {} for {:.2}s{}",
                n + 1,
                total,
                seg.page_index + 1,
                duration,
                if silent { " (silent)" } else { "" }
            );
            if let Some(ref cb) = self.progress {
                cb.on_segment_complete(seg.page_index, total);
            }
            segment_files.push(segment_path);
            reports.push(SegmentReport {
                page_index: seg.page_index,
                duration_secs: duration,
                silent,
            });
        }

        let list_path = staging.path().join("segments.txt");
        let refs: Vec<&Path> = segment_files.iter().map(PathBuf::as_path).collect();
        tokio::fs::write(&list_path, media::concat_list(&refs))
            .await
            .map_err(|e| write_err(&list_path, e))?;

        // Write next to the target and rename, so a failed run never leaves
        // a truncated video under the final name.
        let partial = staging.path().join("output.partial.mp4");
        media::concat_segments(&self.ffmpeg, &list_path, &partial)
            .await
            .map_err(|e| {
                self.tool_error(e, |detail| CompositionError::Concat {
                    path: output_path.to_path_buf(),
                    detail,
                })
            })?;
        tokio::fs::rename(&partial, output_path)
            .await
            .map_err(|e| write_err(output_path, e))?;

        let total_duration_secs = reports.iter().map(|r| r.duration_secs).sum();
        info!(
            "Composed {} segments ({:.1}s) → {}",
            reports.len(),
            total_duration_secs,
            output_path.display()
        );

        let staging_path = staging.path().to_path_buf();
        let leftover = match staging.close() {
            Ok(()) => None,
            Err(e) => {
                warn!("Could not remove staging dir {}: {}", staging_path.display(), e);
                Some(staging_path)
            }
        };

        Ok(CompositionReport {
            output_path: output_path.to_path_buf(),
            segments: reports,
            total_duration_secs,
            leftover,
        })
    }

    fn tool_error(
        &self,
        err: MediaError,
        otherwise: impl FnOnce(String) -> CompositionError,
    ) -> CompositionError {
        match err {
            MediaError::Spawn { tool, source } => CompositionError::ToolUnavailable {
                tool,
                detail: source.to_string(),
            },
            other => otherwise(other.to_string()),
        }
    }
}

/// Encode the page as PNG on the blocking pool, then write it.
async fn write_png(page: &Page, path: &Path) -> Result<(), CompositionError> {
    let index = page.index;
    let image = page.image.clone();
    let bytes = tokio::task::spawn_blocking(move || {
        let mut buf = Cursor::new(Vec::new());
        image
            .write_to(&mut buf, ImageFormat::Png)
            .map(|()| buf.into_inner())
    })
    .await
    .map_err(|e| CompositionError::SegmentEncode {
        page: index,
        detail: format!("PNG encode task panicked: {e}"),
    })?
    .map_err(|e| CompositionError::SegmentEncode {
        page: index,
        detail: format!("PNG encode failed: {e}"),
    })?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| CompositionError::Write {
            path: path.to_path_buf(),
            source,
        })
}
