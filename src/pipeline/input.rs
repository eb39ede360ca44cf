//! Input resolution: turn the document argument into a local PDF path.
//!
//! pdfium needs a file-system path, so URLs are downloaded into a `TempDir`
//! that lives as long as the returned [`ResolvedInput`]. The `%PDF` magic is
//! checked up front so a wrong file fails with a readable error instead of a
//! pdfium load failure.

use crate::error::ExtractionError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// Download timeout for remote documents.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// A local PDF, possibly backed by a temporary download.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is held so the file survives until extraction is done.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or HTTP(S) URL to a readable local PDF.
pub async fn resolve_input(input: &str) -> Result<ResolvedInput, ExtractionError> {
    if is_url(input) {
        download_url(input).await
    } else {
        resolve_local(Path::new(input))
    }
}

fn resolve_local(path: &Path) -> Result<ResolvedInput, ExtractionError> {
    let path = path.to_path_buf();
    if !path.exists() {
        return Err(ExtractionError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && !is_pdf_magic(&magic) {
                return Err(ExtractionError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractionError::PermissionDenied { path });
        }
        Err(_) => return Err(ExtractionError::FileNotFound { path }),
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str) -> Result<ResolvedInput, ExtractionError> {
    info!("Downloading document from: {}", url);
    let failed = |reason: String| ExtractionError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", DOWNLOAD_TIMEOUT.as_secs()))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = tempfile::Builder::new()
        .prefix("deck2video-doc-")
        .tempdir()
        .map_err(|e| ExtractionError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(file_name_from_url(url));

    if bytes.len() >= 4 && !is_pdf_magic(&bytes[..4]) {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(ExtractionError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| ExtractionError::Internal(format!("Failed to write temp file: {e}")))?;

    info!("Downloaded {} bytes to {}", bytes.len(), file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

fn is_pdf_magic(bytes: &[u8]) -> bool {
    bytes == b"%PDF"
}

/// Last path segment of the URL if it looks like a file name.
fn file_name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
