//! Image normalisation: turn an upload into one base64 frame.
//!
//! PDFs are rasterised (page 1 only) and re-encoded as JPEG, which keeps the
//! request body small for photo-like receipt scans. Raster uploads are sent
//! as-is: re-encoding a phone photo would only add artefacts. Their header
//! is still decoded so a corrupt upload fails here and not inside the model
//! call.

use crate::error::ReceiptError;
use crate::pipeline::render::{render_first_page, PageRasterizer};
use crate::record::{FileKind, NormalizedImage, RawUpload};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// The Image Normalizer.
#[derive(Clone)]
pub struct ImageNormalizer {
    rasterizer: Arc<dyn PageRasterizer>,
    jpeg_quality: u8,
}

impl ImageNormalizer {
    pub fn new(rasterizer: Arc<dyn PageRasterizer>, jpeg_quality: u8) -> Self {
        Self {
            rasterizer,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Produce exactly one frame for `upload`, or fail with
    /// [`ReceiptError::DecodeFailed`]. Never substitutes a blank frame.
    pub async fn normalize(
        &self,
        upload: &RawUpload,
        kind: FileKind,
    ) -> Result<NormalizedImage, ReceiptError> {
        if upload.bytes.is_empty() {
            return Err(ReceiptError::DecodeFailed {
                kind,
                detail: format!("'{}' contains no data", upload.filename),
            });
        }

        let image = match kind {
            FileKind::Pdf => {
                let page =
                    render_first_page(Arc::clone(&self.rasterizer), Arc::from(&upload.bytes[..]))
                        .await?;
                let jpeg = encode_jpeg(&page, self.jpeg_quality).map_err(|e| {
                    ReceiptError::DecodeFailed {
                        kind,
                        detail: format!("JPEG encoding failed: {}", e),
                    }
                })?;
                NormalizedImage {
                    data: STANDARD.encode(&jpeg),
                    mime_type: "image/jpeg".to_string(),
                    source: FileKind::Pdf,
                }
            }
            FileKind::Image => passthrough(&upload.bytes)?,
        };

        debug!(
            "Normalized '{}' ({}) → {} bytes base64 {}",
            upload.filename,
            kind,
            image.data.len(),
            image.mime_type
        );
        Ok(image)
    }
}

/// Encode a rendered page as JPEG. Alpha is dropped since JPEG has none.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
    Ok(buf)
}

/// Wrap raster bytes without re-encoding, after checking they decode.
fn passthrough(bytes: &[u8]) -> Result<NormalizedImage, ReceiptError> {
    let decode_err = |detail: String| ReceiptError::DecodeFailed {
        kind: FileKind::Image,
        detail,
    };

    let format = image::guess_format(bytes).map_err(|e| decode_err(e.to_string()))?;
    let (w, h) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| decode_err(e.to_string()))?;
    if w == 0 || h == 0 {
        return Err(decode_err(format!("image has zero size ({w}x{h})")));
    }

    Ok(NormalizedImage {
        data: STANDARD.encode(bytes),
        mime_type: format.to_mime_type().to_string(),
        source: FileKind::Image,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    struct FixedPage(DynamicImage);

    impl PageRasterizer for FixedPage {
        fn first_page(&self, _pdf: &[u8]) -> Result<DynamicImage, ReceiptError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl PageRasterizer for Broken {
        fn first_page(&self, _pdf: &[u8]) -> Result<DynamicImage, ReceiptError> {
            Err(ReceiptError::DecodeFailed {
                kind: FileKind::Pdf,
                detail: "bad xref table".into(),
            })
        }
    }

    fn rgba(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([200, 10, 10, 128])))
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        rgba(8, 8)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn normalizer(r: impl PageRasterizer + 'static) -> ImageNormalizer {
        ImageNormalizer::new(Arc::new(r), 85)
    }

    #[test]
    fn jpeg_drops_alpha() {
        let jpeg = encode_jpeg(&rgba(10, 10), 85).unwrap();
        assert_eq!(&jpeg[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[tokio::test]
    async fn pdf_becomes_single_jpeg_frame() {
        let n = normalizer(FixedPage(rgba(20, 30)));
        let upload = RawUpload::new(b"%PDF-1.7 ...".to_vec(), "r.pdf");
        let img = n.normalize(&upload, FileKind::Pdf).await.unwrap();
        assert_eq!(img.mime_type, "image/jpeg");
        assert_eq!(img.source, FileKind::Pdf);
        let decoded = STANDARD.decode(&img.data).unwrap();
        let back = image::load_from_memory(&decoded).unwrap();
        assert_eq!((back.width(), back.height()), (20, 30));
    }

    #[tokio::test]
    async fn image_bytes_are_not_reencoded() {
        let n = normalizer(Broken);
        let png = png_bytes();
        let upload = RawUpload::new(png.clone(), "r.png");
        let img = n.normalize(&upload, FileKind::Image).await.unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&img.data).unwrap(), png);
    }

    #[tokio::test]
    async fn garbage_image_fails_to_decode() {
        let n = normalizer(Broken);
        let upload = RawUpload::new(b"definitely not an image".to_vec(), "r.jpg");
        let err = n.normalize(&upload, FileKind::Image).await.unwrap_err();
        assert!(matches!(
            err,
            ReceiptError::DecodeFailed {
                kind: FileKind::Image,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn render_failure_surfaces() {
        let n = normalizer(Broken);
        let upload = RawUpload::new(b"%PDF-1.7".to_vec(), "r.pdf");
        let err = n.normalize(&upload, FileKind::Pdf).await.unwrap_err();
        assert!(err.to_string().contains("bad xref"), "got: {err}");
    }

    #[tokio::test]
    async fn empty_upload_fails() {
        let n = normalizer(Broken);
        let upload = RawUpload::new(Vec::new(), "empty.png");
        assert!(n.normalize(&upload, FileKind::Image).await.is_err());
    }
}
