use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use lexguard_core::{
    agent::{ensure_within_limit, AnalysisBackend},
    config::Config,
    db::Db,
    error::{AnalysisError, DocumentError},
    pipeline::DocumentPipeline,
    storage::{storage_key, BlobStore, MemoryBlobStore},
    AnalysisOutcome, AnalysisPayload, Document, DocumentStatus, FailureKind, NewUpload,
    Principal, RiskLevel, MAX_UPLOAD_BYTES, TIMEOUT_MESSAGE,
};

// ── Test doubles ─────────────────────────────────────────────────────────

struct ScriptedBackend {
    delay: Duration,
    result: Result<AnalysisPayload, String>,
}

impl ScriptedBackend {
    fn returning(score: f64) -> Self {
        Self::after(Duration::ZERO, score)
    }

    fn after(delay: Duration, score: f64) -> Self {
        Self {
            delay,
            result: Ok(AnalysisPayload {
                risk_score: score,
                risk_level: RiskLevel::from_score(score),
                summary: "Indemnity clause is uncapped.".into(),
                risk_areas: Vec::new(),
                findings: Vec::new(),
                recommendations: Vec::new(),
            }),
        }
    }

    fn failing(msg: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(msg.into()),
        }
    }

    fn never() -> Self {
        Self::after(Duration::from_secs(600), 0.1)
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn analyze(
        &self,
        content: &[u8],
        _mime_type: &str,
    ) -> Result<AnalysisPayload, AnalysisError> {
        ensure_within_limit(content)?;
        tokio::time::sleep(self.delay).await;
        self.result.clone().map_err(AnalysisError::Provider)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Memory store whose deletes or reads can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryBlobStore,
    fail_delete: bool,
    fail_get: bool,
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn put(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.inner.put(path, data).await
    }

    async fn get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        if self.fail_get {
            bail!("disk unavailable");
        }
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        if self.fail_delete {
            bail!("permission denied");
        }
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        self.inner.exists(path).await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn pipeline(
    analyzer: impl AnalysisBackend + 'static,
    storage: Arc<dyn BlobStore>,
) -> Arc<DocumentPipeline> {
    pipeline_on(open_db(), analyzer, storage)
}

fn pipeline_on(
    db: Arc<Db>,
    analyzer: impl AnalysisBackend + 'static,
    storage: Arc<dyn BlobStore>,
) -> Arc<DocumentPipeline> {
    Arc::new(DocumentPipeline::new(
        db,
        storage,
        Arc::new(analyzer),
        Arc::new(Config::default()),
    ))
}

fn text_upload(name: &str, size: usize) -> NewUpload {
    NewUpload {
        filename: name.into(),
        mime_type: "text/plain".into(),
        bytes: vec![b'a'; size],
    }
}

fn alice() -> Principal {
    Principal::new("alice")
}

async fn wait_for_status(p: &DocumentPipeline, id: &str, status: DocumentStatus) -> Document {
    for _ in 0..500 {
        let doc = p.db.get_document(id).unwrap().unwrap();
        if doc.status == status {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document {id} never reached {status}");
}

// ── Upload validation ────────────────────────────────────────────────────

#[tokio::test]
async fn test_oversized_upload_has_no_side_effects() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::returning(0.1), store.clone());

    let err = p
        .upload(&alice(), text_upload("big.txt", MAX_UPLOAD_BYTES as usize + 1))
        .await
        .unwrap_err();

    assert!(matches!(err, DocumentError::Validation(_)));
    assert!(store.is_empty().await);
    assert!(p.list(&alice()).unwrap().documents.is_empty());
}

#[tokio::test]
async fn test_upload_at_exact_limit_is_accepted() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let doc = p
        .upload(&alice(), text_upload("edge.txt", MAX_UPLOAD_BYTES as usize))
        .await
        .unwrap();
    assert_eq!(doc.size, MAX_UPLOAD_BYTES);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_disallowed_mime_has_no_side_effects() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::returning(0.1), store.clone());

    for mime in ["image/png", "application/msword", ""] {
        let upload = NewUpload {
            filename: "scan.png".into(),
            mime_type: mime.into(),
            bytes: vec![1, 2, 3],
        };
        let err = p.upload(&alice(), upload).await.unwrap_err();
        assert!(matches!(err, DocumentError::Validation(_)), "mime {mime:?}");
    }
    assert!(store.is_empty().await);
    assert!(p.list(&alice()).unwrap().documents.is_empty());
}

#[tokio::test]
async fn test_anonymous_upload_is_rejected() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::returning(0.1), store.clone());
    let err = p
        .upload(&Principal::new(""), text_upload("a.txt", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::Auth(_)));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_record_is_pending_right_after_upload() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::returning(0.8), store.clone());

    let doc = p.upload(&alice(), text_upload("nda.txt", 2048)).await.unwrap();

    let stored = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Pending);
    assert!(stored.risk_level.is_none());
    assert!(stored.risk_score.is_none());
    assert!(stored.analysis.is_none());
    assert!(stored.storage_key.starts_with("alice/"));
    assert!(stored.storage_key.ends_with("-nda.txt"));
    assert!(store.exists(&stored.storage_key).await.unwrap());
}

#[tokio::test]
async fn test_taken_keys_bump_the_timestamp() {
    let store = Arc::new(MemoryBlobStore::new());
    let start = Utc::now().timestamp_millis();
    for ms in start..start + 200 {
        store.put(&storage_key("alice", ms, "nda.txt"), b"old").await.unwrap();
    }
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let doc = p.upload(&alice(), text_upload("nda.txt", 5)).await.unwrap();

    assert_eq!(doc.storage_key, storage_key("alice", start + 200, "nda.txt"));
    assert_eq!(store.get(&doc.storage_key).await.unwrap(), b"aaaaa");
    assert_eq!(store.get(&storage_key("alice", start, "nda.txt")).await.unwrap(), b"old");
}

#[tokio::test]
async fn test_same_millisecond_uploads_get_distinct_keys() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let a = p.upload(&alice(), text_upload("same.txt", 5)).await.unwrap();
    let b = p.upload(&alice(), text_upload("same.txt", 5)).await.unwrap();
    assert_ne!(a.storage_key, b.storage_key);
    assert_eq!(store.len().await, 2);
}

// ── Analysis outcomes ────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_high_risk_analysis() {
    let p = pipeline(ScriptedBackend::returning(0.8), Arc::new(MemoryBlobStore::new()));
    let doc = p.upload(&alice(), text_upload("lease.txt", 2048)).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    let done = wait_for_status(&p, &doc.id, DocumentStatus::Analyzed).await;
    assert_eq!(done.risk_level, Some(RiskLevel::High));
    assert_eq!(done.risk_score, Some(0.8));
    assert_eq!(done.payload().unwrap().summary, "Indemnity clause is uncapped.");
}

#[tokio::test]
async fn test_provider_failure_is_recorded_on_document() {
    let p = pipeline(
        ScriptedBackend::failing("gemini returned 503"),
        Arc::new(MemoryBlobStore::new()),
    );
    let doc = p.upload(&alice(), text_upload("x.txt", 10)).await.unwrap();

    let failed = wait_for_status(&p, &doc.id, DocumentStatus::Error).await;
    assert!(failed.risk_level.is_none() && failed.risk_score.is_none());
    match failed.analysis {
        Some(AnalysisOutcome::Failed { kind, message }) => {
            assert_eq!(kind, FailureKind::Provider);
            assert!(message.contains("503"));
        }
        other => panic!("unexpected analysis {other:?}"),
    }
}

#[tokio::test]
async fn test_unreadable_blob_fails_with_storage_kind() {
    let store = Arc::new(FlakyStore {
        fail_get: true,
        ..Default::default()
    });
    let p = pipeline(ScriptedBackend::returning(0.2), store);
    let doc = p.upload(&alice(), text_upload("x.txt", 10)).await.unwrap();

    let failed = wait_for_status(&p, &doc.id, DocumentStatus::Error).await;
    assert!(matches!(
        failed.analysis,
        Some(AnalysisOutcome::Failed { kind: FailureKind::Storage, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_guard_fails_silent_analysis() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let doc = p.upload(&alice(), text_upload("slow.txt", 2048)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(179)).await;
    let still = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(still.status, DocumentStatus::Analyzing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let timed_out = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(timed_out.status, DocumentStatus::Error);
    match timed_out.analysis {
        Some(AnalysisOutcome::Failed { kind, message }) => {
            assert_eq!(kind, FailureKind::Timeout);
            assert_eq!(message, TIMEOUT_MESSAGE);
        }
        other => panic!("unexpected analysis {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_guard_settles_when_completion_write_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lexguard.db");
    let path = path.to_str().unwrap();
    let mut db = Db::open(path).unwrap();
    db.migrate().unwrap();
    // a second connection makes every write to `analyzed` fail
    rusqlite::Connection::open(path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_analyzed BEFORE UPDATE ON documents
             WHEN NEW.status = 'analyzed'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let p = pipeline_on(
        Arc::new(db),
        ScriptedBackend::returning(0.8),
        Arc::new(MemoryBlobStore::new()),
    );
    let doc = p.upload(&alice(), text_upload("lease.txt", 64)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stuck = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(stuck.status, DocumentStatus::Analyzing);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    let settled = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(settled.status, DocumentStatus::Error);
    assert!(matches!(
        settled.analysis,
        Some(AnalysisOutcome::Failed { kind: FailureKind::Timeout, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_late_result_after_timeout_is_ignored() {
    let p = pipeline(
        ScriptedBackend::after(Duration::from_secs(200), 0.1),
        Arc::new(MemoryBlobStore::new()),
    );
    let doc = p.upload(&alice(), text_upload("slow.txt", 64)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(300)).await;
    let doc = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Error);
    assert!(doc.risk_score.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_result_before_timeout_wins() {
    let p = pipeline(
        ScriptedBackend::after(Duration::from_secs(60), 0.55),
        Arc::new(MemoryBlobStore::new()),
    );
    let doc = p.upload(&alice(), text_upload("ok.txt", 64)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(400)).await;
    let doc = p.db.get_document(&doc.id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Analyzed);
    assert_eq!(doc.risk_level, Some(RiskLevel::Medium));
}

#[tokio::test]
async fn test_recover_interrupted_fails_unfinished_records() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let a = p.upload(&alice(), text_upload("a.txt", 5)).await.unwrap();
    let b = p.upload(&alice(), text_upload("b.txt", 5)).await.unwrap();
    p.db.begin_analysis(&b.id).unwrap();

    assert_eq!(p.recover_interrupted().unwrap(), 2);
    for id in [&a.id, &b.id] {
        let doc = p.db.get_document(id).unwrap().unwrap();
        assert!(matches!(
            doc.analysis,
            Some(AnalysisOutcome::Failed { kind: FailureKind::Interrupted, .. })
        ));
    }
    assert_eq!(p.recover_interrupted().unwrap(), 0);
}

// ── Ownership, delete, export ────────────────────────────────────────────

#[tokio::test]
async fn test_cross_owner_delete_changes_nothing() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let doc = p.upload(&alice(), text_upload("nda.txt", 10)).await.unwrap();

    let err = p.delete(&Principal::new("mallory"), &doc.id).await.unwrap_err();
    assert!(matches!(err, DocumentError::Auth(_)));
    assert!(store.exists(&doc.storage_key).await.unwrap());
    assert!(p.db.get_document(&doc.id).unwrap().is_some());

    let mallory = Principal::new("mallory");
    assert!(matches!(p.get(&mallory, &doc.id), Err(DocumentError::Auth(_))));
    assert!(matches!(p.download(&mallory, &doc.id).await, Err(DocumentError::Auth(_))));
    assert!(p.list(&mallory).unwrap().documents.is_empty());
}

#[tokio::test]
async fn test_delete_removes_blob_then_record() {
    let store = Arc::new(MemoryBlobStore::new());
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let doc = p.upload(&alice(), text_upload("nda.txt", 10)).await.unwrap();

    p.delete(&alice(), &doc.id).await.unwrap();
    assert!(store.is_empty().await);
    assert!(p.db.get_document(&doc.id).unwrap().is_none());
    assert!(matches!(p.delete(&alice(), &doc.id).await, Err(DocumentError::NotFound(_))));
}

#[tokio::test]
async fn test_failed_blob_delete_keeps_record() {
    let store = Arc::new(FlakyStore {
        fail_delete: true,
        ..Default::default()
    });
    let p = pipeline(ScriptedBackend::never(), store.clone());
    let doc = p.upload(&alice(), text_upload("nda.txt", 10)).await.unwrap();

    let err = p.delete(&alice(), &doc.id).await.unwrap_err();
    assert!(matches!(err, DocumentError::Delete(_)));
    assert!(p.db.get_document(&doc.id).unwrap().is_some());
    assert!(store.exists(&doc.storage_key).await.unwrap());
}

#[tokio::test]
async fn test_writes_after_delete_are_noops() {
    let p = pipeline(
        ScriptedBackend::after(Duration::from_millis(50), 0.9),
        Arc::new(MemoryBlobStore::new()),
    );
    let doc = p.upload(&alice(), text_upload("gone.txt", 10)).await.unwrap();
    p.delete(&alice(), &doc.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.db.get_document(&doc.id).unwrap().is_none());
}

#[tokio::test]
async fn test_report_requires_analysis() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let doc = p.upload(&alice(), text_upload("nda.txt", 10)).await.unwrap();

    let err = p.download_report(&alice(), &doc.id).unwrap_err();
    assert!(matches!(err, DocumentError::NotAnalyzed(_)));
    assert!(matches!(
        p.chat(&alice(), &doc.id, "summary"),
        Err(DocumentError::NotAnalyzed(_))
    ));
}

#[tokio::test]
async fn test_report_and_chat_after_analysis() {
    let p = pipeline(ScriptedBackend::returning(0.3), Arc::new(MemoryBlobStore::new()));
    let doc = p.upload(&alice(), text_upload("lease.txt", 10)).await.unwrap();
    wait_for_status(&p, &doc.id, DocumentStatus::Analyzed).await;

    let report = p.download_report(&alice(), &doc.id).unwrap();
    assert_eq!(report.filename, "lease_report.pdf");
    assert_eq!(report.mime_type, "application/pdf");
    assert!(report.bytes.starts_with(b"%PDF"));

    let answer = p.chat(&alice(), &doc.id, "what is the risk?").unwrap();
    assert!(answer.contains("low risk level"));
}

#[tokio::test]
async fn test_download_relabels_extension_but_keeps_bytes() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let doc = p.upload(&alice(), text_upload("contract.txt", 32)).await.unwrap();

    let dl = p.download(&alice(), &doc.id).await.unwrap();
    assert_eq!(dl.filename, "contract.pdf");
    assert_eq!(dl.mime_type, "text/plain");
    assert_eq!(dl.bytes, vec![b'a'; 32]);
}

// ── Live view ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_orders_newest_first() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let first = p.upload(&alice(), text_upload("first.txt", 5)).await.unwrap();
    let second = p.upload(&alice(), text_upload("second.txt", 5)).await.unwrap();

    let list = p.list(&alice()).unwrap();
    assert_eq!(list.current().unwrap().id, second.id);
    assert_eq!(list.recent().len(), 1);
    assert_eq!(list.recent()[0].id, first.id);
}

#[tokio::test]
async fn test_watch_reflects_background_completion() {
    let p = pipeline(
        ScriptedBackend::after(Duration::from_millis(20), 0.75),
        Arc::new(MemoryBlobStore::new()),
    );
    let mut rx = p.watch(&alice()).unwrap();
    assert!(rx.borrow().documents.is_empty());

    let doc = p.upload(&alice(), text_upload("nda.txt", 5)).await.unwrap();

    let list = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.unwrap();
            let list = rx.borrow_and_update().clone();
            if list
                .current()
                .is_some_and(|d| d.status == DocumentStatus::Analyzed)
            {
                return list;
            }
        }
    })
    .await
    .expect("watch never showed the analyzed document");

    let current = list.current().unwrap();
    assert_eq!(current.id, doc.id);
    assert_eq!(current.risk_level, Some(RiskLevel::High));
}

#[tokio::test]
async fn test_watch_ignores_other_owners() {
    let p = pipeline(ScriptedBackend::never(), Arc::new(MemoryBlobStore::new()));
    let mut rx = p.watch(&alice()).unwrap();

    p.upload(&Principal::new("bob"), text_upload("b.txt", 5)).await.unwrap();
    let changed = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    assert!(changed.is_err());
    assert!(rx.borrow().documents.is_empty());
}
