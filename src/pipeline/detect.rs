//! File classification by byte signature.
//!
//! The upload's filename is never consulted: chat platforms happily deliver
//! `receipt.jpg` files that are really PDFs and vice versa.

use crate::record::FileKind;

/// Leading bytes of every PDF file.
pub const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Classify an upload from its first four bytes.
///
/// Anything that is not a PDF is treated as an image, including input too
/// short to hold a signature. Whether an "image" actually decodes is decided
/// later by the normalizer, so this function cannot fail.
pub fn classify(bytes: &[u8]) -> FileKind {
    match bytes.get(..PDF_MAGIC.len()) {
        Some(head) if head == PDF_MAGIC => FileKind::Pdf,
        _ => FileKind::Image,
    }
}
