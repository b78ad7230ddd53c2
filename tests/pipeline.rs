//! Offline end-to-end runs of the standard pipeline with scripted fakes for
//! every external service.

use async_trait::async_trait;
use edgequake_llm::ChatMessage;
use image::{DynamicImage, ImageFormat};
use receipt_ledger::assistant::{AssistantBackend, ChatAssistant};
use receipt_ledger::clients::{Notifier, ObjectStore, RecordStore};
use receipt_ledger::pipeline::llm::{ChatModel, ModelCallError};
use receipt_ledger::pipeline::render::PageRasterizer;
use receipt_ledger::pipeline::search::{SearchEngine, SearchHit};
use receipt_ledger::process::SAVED_MESSAGE;
use receipt_ledger::{
    AccountLabel, ErrorKind, FileKind, Pipeline, PipelineComponents, PipelineConfig,
    PipelineOutput, PollPolicy, RawUpload, ReceiptError, ReceiptProcessor, StageProgressCallback,
    ThreadPolicy,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CAFE_X_JSON: &str = r#"여기 결과입니다:
```json
{"상호명": "Cafe X", "날짜": "2024-01-01", "항목": [{"이름": "Latte", "가격": 4500}], "총액": 4500}
```"#;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Always answers with the same text.
struct Fixed(&'static str);

#[async_trait]
impl ChatModel for Fixed {
    fn model_name(&self) -> &str {
        "fixed"
    }
    async fn chat(&self, _m: &[ChatMessage]) -> Result<String, ModelCallError> {
        Ok(self.0.to_string())
    }
}

/// Classifies everything as a meal and reports how much history it saw.
struct HistoryAware;

#[async_trait]
impl ChatModel for HistoryAware {
    fn model_name(&self) -> &str {
        "history"
    }
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelCallError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(format!(
            r#"{{"판단": "식비", "근거": "seen {}"}}"#,
            messages.len()
        ))
    }
}

/// Fails the first `failures` calls with a transient error.
struct FlakySearch {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl SearchEngine for FlakySearch {
    async fn search(&self, _query: &str, _max: usize) -> Result<Vec<SearchHit>, ReceiptError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ReceiptError::SearchFailed {
                detail: "HTTP 503".into(),
            });
        }
        Ok(vec![
            SearchHit {
                title: "Cafe X".into(),
                snippet: Some("coffee shop".into()),
                link: None,
            },
            SearchHit {
                title: "map".into(),
                snippet: None,
                link: Some("https://maps".into()),
            },
        ])
    }
}

fn search_ok() -> Arc<FlakySearch> {
    Arc::new(FlakySearch {
        failures: 0,
        calls: AtomicUsize::new(0),
    })
}

/// Renders every PDF as a small white page.
struct BlankPage;

impl PageRasterizer for BlankPage {
    fn first_page(&self, _pdf: &[u8]) -> Result<DynamicImage, ReceiptError> {
        Ok(DynamicImage::new_rgb8(32, 48))
    }
}

#[derive(Default)]
struct Recorder {
    uploads: Mutex<Vec<String>>,
    records: Mutex<Vec<(String, PipelineOutput)>>,
    messages: Mutex<Vec<String>>,
    notify_fails: bool,
}

#[async_trait]
impl ObjectStore for Recorder {
    async fn upload(&self, _path: &Path, dest_name: &str) -> Result<String, ReceiptError> {
        self.uploads.lock().unwrap().push(dest_name.to_string());
        Ok(format!("https://bucket.test/{dest_name}"))
    }
}

#[async_trait]
impl RecordStore for Recorder {
    async fn create_record(
        &self,
        output: &PipelineOutput,
        file_url: &str,
    ) -> Result<String, ReceiptError> {
        let mut records = self.records.lock().unwrap();
        records.push((file_url.to_string(), output.clone()));
        Ok(format!("page-{}", records.len()))
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn post(&self, text: &str) -> Result<(), ReceiptError> {
        self.messages.lock().unwrap().push(text.to_string());
        if self.notify_fails {
            return Err(ReceiptError::NotifyFailed {
                reason: "channel_not_found".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct StageLog(Mutex<Vec<String>>);

impl StageProgressCallback for StageLog {
    fn on_stage_complete(&self, _file: &str, stage: &str, _i: usize, _t: usize, _ms: u64) {
        self.0.lock().unwrap().push(stage.to_string());
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn png_bytes() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(8, 8)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn fast_config() -> PipelineConfig {
    PipelineConfig::builder()
        .retry_backoff_ms(1)
        .poll(PollPolicy {
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(10),
            deadline: Duration::from_secs(10),
        })
        .build()
        .unwrap()
}

fn components(vision: &'static str, search: Arc<dyn SearchEngine>) -> PipelineComponents {
    PipelineComponents {
        vision: Arc::new(Fixed(vision)),
        text: Arc::new(Fixed("카페")),
        search,
        assistant: Arc::new(ChatAssistant::new(Arc::new(Fixed(
            r#"{"판단": "식비", "근거": "카페에서 음료를 구매했습니다."}"#,
        )))),
        rasterizer: Arc::new(BlankPage),
    }
}

fn cafe_pipeline() -> Pipeline {
    Pipeline::standard(components(CAFE_X_JSON, search_ok()), &fast_config()).unwrap()
}

fn write_receipt(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

// ── Pipeline runs ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cafe_x_image_receipt() {
    let out = cafe_pipeline()
        .run(RawUpload::new(png_bytes(), "cafe.png"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.file_kind, FileKind::Image);
    assert_eq!(out.receipt.merchant, "Cafe X");
    assert_eq!(out.receipt.date, "2024-01-01");
    assert_eq!(out.receipt.items.len(), 1);
    assert_eq!(out.receipt.items[0].name, "Latte");
    assert_eq!(out.receipt.items[0].price, 4500.0);
    assert_eq!(out.receipt.total, 4500.0);
    assert_eq!(out.snippets.as_slice(), &["coffee shop".to_string()]);
    assert_eq!(out.category.as_str(), "카페");
    assert_eq!(out.account.label, AccountLabel::MealExpense);
    assert!(!out.account.justification.is_empty());
}

#[tokio::test]
async fn pdf_receipt_is_rasterised() {
    let out = cafe_pipeline()
        .run(
            RawUpload::new(b"%PDF-1.7\nnot really a pdf".to_vec(), "scan.pdf"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.file_kind, FileKind::Pdf);
    assert_eq!(out.receipt.merchant, "Cafe X");
}

#[tokio::test]
async fn runs_are_idempotent() {
    let pipeline = cafe_pipeline();
    let cancel = CancellationToken::new();
    let first = pipeline
        .run(RawUpload::new(png_bytes(), "cafe.png"), &cancel)
        .await
        .unwrap();
    let second = pipeline
        .run(RawUpload::new(png_bytes(), "cafe.png"), &cancel)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn stages_complete_in_order() {
    let log = Arc::new(StageLog::default());
    let pipeline = cafe_pipeline().with_progress(log.clone());
    pipeline
        .run(RawUpload::new(png_bytes(), "cafe.png"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        *log.0.lock().unwrap(),
        vec!["classify", "normalize", "extract", "search", "infer", "account"]
    );
}

#[tokio::test]
async fn corrupt_image_fails_at_normalize() {
    let failure = cafe_pipeline()
        .run_detailed(
            RawUpload::new(b"GIF89a but truncated".to_vec(), "bad.gif"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.stage, "normalize");
    assert_eq!(failure.error.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn prose_answer_fails_extraction() {
    let pipeline = Pipeline::standard(
        components("죄송합니다. 영수증을 읽을 수 없습니다.", search_ok()),
        &fast_config(),
    )
    .unwrap();
    let failure = pipeline
        .run_detailed(RawUpload::new(png_bytes(), "blurry.png"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.stage, "extract");
    assert!(matches!(failure.error, ReceiptError::NoJsonObject { .. }));
}

#[tokio::test]
async fn transient_search_failure_is_retried() {
    let search = Arc::new(FlakySearch {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let pipeline =
        Pipeline::standard(components(CAFE_X_JSON, search.clone()), &fast_config()).unwrap();
    let out = pipeline
        .run(RawUpload::new(png_bytes(), "cafe.png"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.category.as_str(), "카페");
    assert_eq!(search.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_search_failure_names_the_stage() {
    let search = Arc::new(FlakySearch {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let pipeline =
        Pipeline::standard(components(CAFE_X_JSON, search.clone()), &fast_config()).unwrap();
    let failure = pipeline
        .run_detailed(RawUpload::new(png_bytes(), "cafe.png"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.stage, "search");
    // one attempt plus the default two retries
    assert_eq!(search.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn shared_thread_serialises_concurrent_runs() {
    let assistant = Arc::new(ChatAssistant::new(Arc::new(HistoryAware)));
    let thread = assistant.create_thread().await.unwrap();

    let mut config = fast_config();
    config.thread_policy = ThreadPolicy::Shared(thread);

    let mut parts = components(CAFE_X_JSON, search_ok());
    parts.assistant = assistant.clone();
    let pipeline = Arc::new(Pipeline::standard(parts, &config).unwrap());

    let runs = (0..4).map(|i| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            pipeline
                .run(
                    RawUpload::new(png_bytes(), format!("r{i}.png")),
                    &CancellationToken::new(),
                )
                .await
        }
    });
    let outputs = futures::future::join_all(runs).await;

    let mut seen: Vec<String> = outputs
        .into_iter()
        .map(|r| r.unwrap().account.justification)
        .collect();
    seen.sort();
    // Each turn sees the system message plus every earlier exchange.
    assert_eq!(seen, vec!["seen 2", "seen 4", "seen 6", "seen 8"]);
    assert_eq!(assistant.thread_count(), 1);
}

#[tokio::test]
async fn per_run_threads_are_cleaned_up() {
    let assistant = Arc::new(ChatAssistant::new(Arc::new(HistoryAware)));
    let mut parts = components(CAFE_X_JSON, search_ok());
    parts.assistant = assistant.clone();
    let pipeline = Pipeline::standard(parts, &fast_config()).unwrap();

    let out = pipeline
        .run(RawUpload::new(png_bytes(), "cafe.png"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.account.justification, "seen 2");
    assert_eq!(assistant.thread_count(), 0);
}

#[tokio::test]
async fn cancelled_run_stops_before_first_stage() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = cafe_pipeline()
        .run_detailed(RawUpload::new(png_bytes(), "cafe.png"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.stage, "classify");
    assert_eq!(failure.error.kind(), ErrorKind::Cancelled);
}

// ── Processing with collaborators ────────────────────────────────────────────

#[tokio::test]
async fn successful_run_is_stored_and_announced() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_receipt(dir.path(), "cafe.png", &png_bytes());
    let rec = Arc::new(Recorder::default());

    let processor = ReceiptProcessor::new(Arc::new(cafe_pipeline()))
        .with_persistence(rec.clone(), rec.clone())
        .with_notifier(rec.clone());
    let outcome = processor
        .process_input(path.to_str().unwrap(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.file_url.as_deref(), Some("https://bucket.test/cafe.png"));
    assert_eq!(outcome.record_id.as_deref(), Some("page-1"));
    assert_eq!(*rec.uploads.lock().unwrap(), vec!["cafe.png"]);

    let records = rec.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, "https://bucket.test/cafe.png");
    assert_eq!(records[0].1.receipt.merchant, "Cafe X");

    let messages = rec.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], SAVED_MESSAGE);
    assert!(messages[1].contains("식비"));
}

#[tokio::test]
async fn failed_run_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_receipt(dir.path(), "blurry.png", &png_bytes());
    let rec = Arc::new(Recorder::default());

    let pipeline =
        Pipeline::standard(components("no receipt here", search_ok()), &fast_config()).unwrap();
    let processor = ReceiptProcessor::new(Arc::new(pipeline))
        .with_persistence(rec.clone(), rec.clone())
        .with_notifier(rec.clone());
    let failure = processor
        .process_input(path.to_str().unwrap(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, "extract");
    assert!(rec.uploads.lock().unwrap().is_empty());
    assert!(rec.records.lock().unwrap().is_empty());

    let messages = rec.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("영수증 정보 추출"));
    assert!(messages[0].contains("blurry.png"));
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_receipt(dir.path(), "cafe.png", &png_bytes());
    let rec = Arc::new(Recorder {
        notify_fails: true,
        ..Recorder::default()
    });

    let processor = ReceiptProcessor::new(Arc::new(cafe_pipeline()))
        .with_persistence(rec.clone(), rec.clone())
        .with_notifier(rec.clone());
    let outcome = processor
        .process_input(path.to_str().unwrap(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.record_id.as_deref(), Some("page-1"));
    assert_eq!(rec.messages.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn dry_run_touches_no_collaborator() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_receipt(dir.path(), "cafe.png", &png_bytes());
    let rec = Arc::new(Recorder::default());

    let processor = ReceiptProcessor::new(Arc::new(cafe_pipeline())).with_notifier(rec.clone());
    assert!(processor.is_dry_run());
    let outcome = processor
        .process_input(path.to_str().unwrap(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.file_url.is_none());
    assert!(outcome.record_id.is_none());
    assert!(rec.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_input_fails_before_the_pipeline() {
    let rec = Arc::new(Recorder::default());
    let processor = ReceiptProcessor::new(Arc::new(cafe_pipeline()))
        .with_persistence(rec.clone(), rec.clone());
    let failure = processor
        .process_input("/no/such/receipt.jpg", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.stage, "input");
    assert_eq!(failure.error.kind(), ErrorKind::Input);
    assert!(rec.records.lock().unwrap().is_empty());
}
