//! Input loading: a user-supplied path or URL → PDF bytes plus a filename.
//!
//! The bytes are validated against the `%PDF` magic before anything is stored,
//! so callers get `InvalidDocument` instead of a pdfium failure later on. The
//! document store then writes them to `original.pdf`, which is the path the
//! renderer opens.

use crate::error::TableError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A PDF held in memory, ready to be stored.
#[derive(Debug, Clone)]
pub struct LoadedInput {
    /// Display name of the upload (`report.pdf`).
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl LoadedInput {
    /// Wrap bytes that are already in memory, validating the magic.
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Result<Self, TableError> {
        let filename = filename.into();
        check_pdf_magic(&filename, &bytes)?;
        Ok(Self { filename, bytes })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a local file or download a URL.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<LoadedInput, TableError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        load_local(Path::new(input)).await
    }
}

/// Reject anything that does not start with `%PDF`.
pub fn check_pdf_magic(name: &str, bytes: &[u8]) -> Result<(), TableError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let head: Vec<u8> = bytes.iter().take(4).copied().collect();
        return Err(TableError::invalid_document(format!(
            "'{name}' is not a PDF (starts with {head:02x?}, expected %PDF)"
        )));
    }
    Ok(())
}

async fn load_local(path: &Path) -> Result<LoadedInput, TableError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TableError::FileNotFound {
            path: PathBuf::from(path),
        },
        _ => TableError::invalid_document(format!("'{}' is unreadable: {e}", path.display())),
    })?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());
    debug!("Loaded local PDF: {} ({} bytes)", path.display(), bytes.len());
    LoadedInput::from_bytes(filename, bytes)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedInput, TableError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| TableError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TableError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());

    LoadedInput::from_bytes(filename_from_url(url), bytes.to_vec())
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
