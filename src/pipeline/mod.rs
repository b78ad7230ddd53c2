//! The receipt processing components.
//!
//! Each submodule implements one step and knows nothing about the pipeline
//! context; [`crate::stages`] binds them to context keys and
//! [`crate::orchestrator`] runs them in order.
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ detect ─▶ encode ─▶ extract ─▶ search ─▶ infer ─▶ account
//! (path/URL) (magic)  (render   (VLM +     (web      (LLM     (assistant
//!                      + b64)   recover)   snippets) label)   job + poll)
//! ```
//!
//! 1. [`input`]   resolve the user-supplied path or URL to a local file
//! 2. [`detect`]  PDF or image, from the first four bytes
//! 3. [`encode`]  one base64 frame; PDFs go through [`render`] first, which
//!    runs pdfium on `spawn_blocking`
//! 4. [`extract`] the vision model reads the frame; [`recover`] digs the JSON
//!    object out of whatever text comes back
//! 5. [`search`]  ranked web snippets about the merchant
//! 6. [`infer`]   short business-category label from the snippets
//! 7. [`account`] expense account from an assistant run, with bounded polling
//!
//! [`llm`] is the model seam shared by extract and infer.

pub mod account;
pub mod detect;
pub mod encode;
pub mod extract;
pub mod infer;
pub mod input;
pub mod llm;
pub mod recover;
pub mod render;
pub mod search;
