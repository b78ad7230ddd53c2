//! Object storage over plain HTTP `PUT`.
//!
//! Works with any bucket or gateway that accepts `PUT {base}/{key}` and
//! serves the object back from the same URL (S3 presigned prefixes, MinIO,
//! a static file server behind a token).

use super::{describe_send_error, http_client, trim_base, ObjectStore, DEFAULT_HTTP_TIMEOUT};
use crate::error::ReceiptError;
use crate::pipeline::detect;
use crate::record::FileKind;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::fmt;
use std::path::Path;
use tracing::info;

#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ReceiptError> {
        Ok(Self {
            http: http_client(DEFAULT_HTTP_TIMEOUT)?,
            base_url: trim_base(base_url),
            token,
        })
    }

    /// `{base}/{name}` with `name` percent-encoded as a single path segment.
    pub fn object_url(&self, name: &str) -> Result<Url, ReceiptError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ReceiptError::InvalidConfig(format!("storage URL {:?}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ReceiptError::InvalidConfig(format!(
                    "storage URL {:?} cannot take a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }
}

/// Content type from the bytes, never from the file name.
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match detect::classify(bytes) {
        FileKind::Pdf => "application/pdf",
        FileKind::Image => image::guess_format(bytes)
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream"),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, path: &Path, dest_name: &str) -> Result<String, ReceiptError> {
        let failed = |reason: String| ReceiptError::UploadFailed {
            name: dest_name.to_string(),
            reason,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| failed(format!("cannot read {}: {}", path.display(), e)))?;
        let url = self.object_url(dest_name)?;
        let content_type = sniff_content_type(&bytes);
        let size = bytes.len();

        let mut req = self
            .http
            .put(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| failed(describe_send_error(e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        info!("Uploaded {} ({} bytes, {}) to {}", dest_name, size, content_type, url);
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_percent_encoded() {
        let store = HttpObjectStore::new("https://bucket.example.com/receipts/", None).unwrap();
        assert_eq!(
            store.object_url("점심 영수증.jpg").unwrap().as_str(),
            concat!(
                "https://bucket.example.com/receipts/",
                "%EC%A0%90%EC%8B%AC%20%EC%98%81%EC%88%98%EC%A6%9D.jpg"
            )
        );
        assert_eq!(
            store.object_url("a/b.pdf").unwrap().as_str(),
            "https://bucket.example.com/receipts/a%2Fb.pdf"
        );
    }

    #[test]
    fn bad_base_url_is_config_error() {
        let store = HttpObjectStore::new("not a url", None).unwrap();
        assert!(matches!(
            store.object_url("x.jpg"),
            Err(ReceiptError::InvalidConfig(_))
        ));
    }

    #[test]
    fn content_type_is_sniffed() {
        assert_eq!(sniff_content_type(b"%PDF-1.4"), "application/pdf");
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\n\0\0"), "image/png");
        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }

    #[test]
    fn debug_hides_token() {
        let store =
            HttpObjectStore::new("https://bucket.example.com", Some("tok-123".into())).unwrap();
        assert!(!format!("{:?}", store).contains("tok-123"));
    }
}
