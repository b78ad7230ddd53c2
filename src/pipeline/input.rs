//! Input resolution: turn a user-supplied path or URL into a local file.
//!
//! Shared receipts arrive either as files on disk or as private chat-platform
//! URLs that need a bearer token. Downloads land in a `TempDir` owned by the
//! returned [`ResolvedInput`], so the file lives exactly as long as the run
//! that uploads it to object storage afterwards.

use crate::error::ReceiptError;
use crate::record::RawUpload;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A receipt file available on the local file system.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is held so the file is not removed before the run ends.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File name used for storage and the record's attachment.
    pub fn file_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "receipt".to_string())
    }

    pub fn was_downloaded(&self) -> bool {
        matches!(self, ResolvedInput::Downloaded { .. })
    }

    /// Read the whole file into a [`RawUpload`].
    pub async fn read_upload(&self) -> Result<RawUpload, ReceiptError> {
        let path = self.path();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReceiptError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => ReceiptError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => ReceiptError::Internal(format!("Failed to read {}: {}", path.display(), e)),
        })?;
        if bytes.is_empty() {
            return Err(ReceiptError::EmptyUpload {
                name: self.file_name(),
            });
        }
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Ok(RawUpload::new(bytes, self.file_name()))
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local file, downloading URLs with the optional
/// bearer token.
pub async fn resolve_input(
    input: &str,
    bearer_token: Option<&str>,
    timeout_secs: u64,
) -> Result<ResolvedInput, ReceiptError> {
    if is_url(input) {
        download_url(input, bearer_token, timeout_secs).await
    } else if input.trim().is_empty() {
        Err(ReceiptError::InvalidInput {
            input: input.to_string(),
        })
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, ReceiptError> {
    let path = PathBuf::from(path_str);

    if !path.is_file() {
        return Err(ReceiptError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ReceiptError::PermissionDenied { path });
        }
        Err(_) => return Err(ReceiptError::FileNotFound { path }),
    }

    debug!("Resolved local receipt: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(
    url: &str,
    bearer_token: Option<&str>,
    timeout_secs: u64,
) -> Result<ResolvedInput, ReceiptError> {
    info!("Downloading receipt from: {}", url);

    let failed = |reason: String| ReceiptError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let mut request = client.get(url);
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ReceiptError::DownloadTimeout {
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

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ReceiptError::EmptyUpload { name: filename });
    }

    let temp_dir = TempDir::new().map_err(|e| ReceiptError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| ReceiptError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL, percent-decoded, or a fixed fallback.
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|last| percent_decode(&last))
        .filter(|last| !last.is_empty() && last.contains('.') && !last.contains('/'))
        .unwrap_or_else(|| "receipt.bin".to_string())
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
