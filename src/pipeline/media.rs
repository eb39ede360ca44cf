//! Thin wrappers around the `ffmpeg` and `ffprobe` executables.
//!
//! Every call goes through [`run_tool`], which captures stderr and reports
//! the last meaningful line on failure; ffmpeg prints its banner and
//! progress there too, so the whole stream is useless in an error message.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum MediaError {
    /// The executable could not be started at all.
    #[error("could not start '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("'{tool}' failed: {detail}")]
    Failed { tool: String, detail: String },

    /// ffprobe output could not be parsed.
    #[error("unexpected ffprobe output: {0}")]
    Parse(String),
}

/// Run `tool` with `args`, returning stdout on success.
pub async fn run_tool(tool: &str, args: &[OsString]) -> Result<Vec<u8>, MediaError> {
    trace!("{} {:?}", tool, args);
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| MediaError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::Failed {
            tool: tool.to_string(),
            detail: last_error_line(&stderr)
                .unwrap_or_else(|| format!("exit status {}", output.status)),
        });
    }
    Ok(output.stdout)
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .map(str::to_string)
}

/// True if `tool -version` runs successfully.
pub async fn is_available(tool: &str) -> bool {
    run_tool(tool, &["-version".into()]).await.is_ok()
}

/// Container duration of a media file in seconds.
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Result<f64, MediaError> {
    let args: Vec<OsString> = vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=noprint_wrappers=1:nokey=1".into(),
        path.as_os_str().to_owned(),
    ];
    let stdout = run_tool(ffprobe, &args).await?;
    parse_duration(&String::from_utf8_lossy(&stdout))
}

fn parse_duration(raw: &str) -> Result<f64, MediaError> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(d) if d.is_finite() && d > 0.0 => Ok(d),
        _ => Err(MediaError::Parse(format!("duration '{trimmed}'"))),
    }
}

/// Pull a mono 16 kHz MP3 track out of a video for speech recognition.
pub async fn extract_speech_audio(
    ffmpeg: &str,
    video: &Path,
    output: &Path,
) -> Result<(), MediaError> {
    let args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video.as_os_str().to_owned(),
        "-vn".into(),
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        "16000".into(),
        "-b:a".into(),
        "32k".into(),
        output.as_os_str().to_owned(),
    ];
    run_tool(ffmpeg, &args).await?;
    debug!("Extracted speech audio → {}", output.display());
    Ok(())
}

/// Soundtrack of a still segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentAudio<'a> {
    File(&'a Path),
    Silence,
}

/// Encoder settings shared by every segment so `-c copy` concatenation
/// produces a seamless stream.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub fps: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub threads: Option<usize>,
}

/// Build the ffmpeg arguments for a still-image segment of `duration` seconds.
pub fn still_segment_args(
    image: &Path,
    audio: &SegmentAudio<'_>,
    duration: f64,
    settings: &EncodeSettings,
    output: &Path,
) -> Vec<OsString> {
    let fps = settings.fps.to_string();
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-loop".into(),
        "1".into(),
        "-framerate".into(),
        fps.clone().into(),
        "-i".into(),
        image.as_os_str().to_owned(),
    ];
    match audio {
        SegmentAudio::File(path) => {
            args.push("-i".into());
            args.push(path.as_os_str().to_owned());
        }
        SegmentAudio::Silence => {
            args.extend(
                ["-f", "lavfi", "-i", "anullsrc=channel_layout=mono:sample_rate=44100"]
                    .map(OsString::from),
            );
        }
    }
    args.extend(
        [
            "-t".to_string(),
            format!("{duration:.3}"),
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "1:a".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "stillimage".into(),
            "-b:v".into(),
            settings.video_bitrate.clone(),
            "-vf".into(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-r".into(),
            fps,
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            settings.audio_bitrate.clone(),
            "-ar".into(),
            "44100".into(),
            "-ac".into(),
            "2".into(),
        ]
        .map(OsString::from),
    );
    if let Some(threads) = settings.threads {
        args.push("-threads".into());
        args.push(threads.to_string().into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Encode a still-image segment.
pub async fn encode_still_segment(
    ffmpeg: &str,
    image: &Path,
    audio: &SegmentAudio<'_>,
    duration: f64,
    settings: &EncodeSettings,
    output: &Path,
) -> Result<(), MediaError> {
    let args = still_segment_args(image, audio, duration, settings, output);
    run_tool(ffmpeg, &args).await?;
    Ok(())
}

/// Contents of a concat-demuxer list file for `segments`.
pub fn concat_list(segments: &[&Path]) -> String {
    let mut list = String::new();
    for seg in segments {
        let escaped = seg.to_string_lossy().replace('\'', r"'\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}

/// Join segments listed in `list_file` into `output` without re-encoding.
pub async fn concat_segments(
    ffmpeg: &str,
    list_file: &Path,
    output: &Path,
) -> Result<(), MediaError> {
    let args: Vec<OsString> = vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_file.as_os_str().to_owned(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        output.as_os_str().to_owned(),
    ];
    run_tool(ffmpeg, &args).await?;
    Ok(())
}
