use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{
    broadcast::error::{RecvError, TryRecvError},
    watch,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    agent::AnalysisBackend,
    chat,
    config::Config,
    db::Db,
    error::{AnalysisError, DocumentError},
    report,
    storage::{ensure_owned, storage_key, BlobStore},
    types::{
        Document, DocumentFormat, DocumentList, DocumentStatus, Download, FailureKind,
        NewUpload, Principal, MAX_UPLOAD_BYTES, TIMEOUT_MESSAGE,
    },
};

const INTERRUPTED_MESSAGE: &str =
    "Analysis interrupted by a server restart; upload the document again to retry";

/// Attempts at finding a free storage key before giving up.
const MAX_KEY_ATTEMPTS: i64 = 1000;

/// Coordinates upload, analysis, timeout enforcement and live list views for documents.
///
/// Every operation takes the acting [`Principal`] explicitly. Background analysis and its
/// timeout guard run as two independent tasks; both settle the document through the record
/// store's compare-and-swap transitions, so whichever lands first decides the outcome.
pub struct DocumentPipeline {
    pub db: Arc<Db>,
    pub storage: Arc<dyn BlobStore>,
    pub analyzer: Arc<dyn AnalysisBackend>,
    pub config: Arc<Config>,
}

fn authenticate(principal: &Principal) -> Result<(), DocumentError> {
    if principal.id.trim().is_empty() {
        return Err(DocumentError::Auth("no authenticated principal".into()));
    }
    Ok(())
}

/// Swap the extension of `filename` for `ext`. An empty `ext` keeps the name as is.
pub fn relabel_filename(filename: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() {
        return filename.to_string();
    }
    let stem = match filename.rfind('.') {
        Some(i) if i > 0 => &filename[..i],
        _ => filename,
    };
    format!("{stem}.{ext}")
}

impl DocumentPipeline {
    pub fn new(
        db: Arc<Db>,
        storage: Arc<dyn BlobStore>,
        analyzer: Arc<dyn AnalysisBackend>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            storage,
            analyzer,
            config,
        }
    }

    // ── Upload and analysis ───────────────────────────────────────────────

    /// Store the blob, create a `pending` record and start analysis in the background.
    /// Returns as soon as the record exists.
    pub async fn upload(
        self: &Arc<Self>,
        principal: &Principal,
        upload: NewUpload,
    ) -> Result<Document, DocumentError> {
        authenticate(principal)?;
        let filename = upload.filename.trim().to_string();
        if filename.is_empty() {
            return Err(DocumentError::Validation("filename is empty".into()));
        }
        if DocumentFormat::from_mime(&upload.mime_type).is_none() {
            return Err(DocumentError::Validation(format!(
                "unsupported file type {:?}: upload PDF, DOCX or TXT files only",
                upload.mime_type
            )));
        }
        let size = upload.bytes.len() as u64;
        if size > MAX_UPLOAD_BYTES {
            return Err(DocumentError::Validation(format!(
                "file is {size} bytes, limit is {MAX_UPLOAD_BYTES}"
            )));
        }

        let now = Utc::now();
        let key = self.free_key(&principal.id, now.timestamp_millis(), &filename).await?;
        self.storage
            .put(&key, &upload.bytes)
            .await
            .with_context(|| format!("store upload {key:?}"))?;

        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner: principal.id.clone(),
            filename,
            size,
            mime_type: upload.mime_type.trim().to_string(),
            storage_key: key,
            status: DocumentStatus::Pending,
            risk_level: None,
            risk_score: None,
            analysis: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.db.insert_document(&doc) {
            if let Err(cleanup) = self.storage.delete(&doc.storage_key).await {
                warn!("orphaned blob {} after failed insert: {cleanup}", doc.storage_key);
            }
            return Err(e.context("insert_document").into());
        }
        info!(
            "document {} uploaded by {}: {} ({} bytes)",
            doc.id, doc.owner, doc.filename, doc.size
        );

        self.start_analysis(&doc);
        Ok(doc)
    }

    async fn free_key(
        &self,
        owner: &str,
        timestamp_ms: i64,
        filename: &str,
    ) -> Result<String, DocumentError> {
        for bump in 0..MAX_KEY_ATTEMPTS {
            let key = storage_key(owner, timestamp_ms + bump, filename);
            if !self.storage.exists(&key).await.context("storage exists")? {
                return Ok(key);
            }
        }
        Err(anyhow::anyhow!("no free storage key for {filename:?}").into())
    }

    /// Spawn the analysis task and its timeout guard. Neither blocks the caller.
    fn start_analysis(self: &Arc<Self>, doc: &Document) {
        let timeout = self.config.analysis_timeout();

        let guard = {
            let pipeline = Arc::clone(self);
            let id = doc.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                match pipeline.db.fail_analysis(&id, FailureKind::Timeout, TIMEOUT_MESSAGE) {
                    Ok(true) => warn!("document {id}: analysis timed out after {}s", timeout.as_secs()),
                    Ok(false) => debug!("document {id}: timeout guard fired after settlement"),
                    Err(e) => error!("document {id}: recording timeout: {e}"),
                }
            })
        };

        let pipeline = Arc::clone(self);
        let id = doc.id.clone();
        let key = doc.storage_key.clone();
        let mime = doc.mime_type.clone();
        tokio::spawn(async move {
            if pipeline.run_analysis(&id, &key, &mime).await {
                guard.abort();
            } else {
                warn!("document {id}: analysis ended unsettled, leaving it to the timeout guard");
            }
        });
    }

    /// Returns true once the document is known to be terminal (or gone). A store error on
    /// any transition returns false so the timeout guard still gets to settle it.
    async fn run_analysis(&self, id: &str, key: &str, mime: &str) -> bool {
        match self.db.begin_analysis(id) {
            Ok(true) => {}
            Ok(false) => {
                debug!("document {id}: no longer pending, analysis skipped");
                return true;
            }
            Err(e) => {
                error!("document {id}: begin_analysis: {e}");
                return false;
            }
        }

        let content = match self.storage.get(key).await {
            Ok(c) => c,
            Err(e) => {
                error!("document {id}: reading blob {key}: {e}");
                return self.record_failure(
                    id,
                    FailureKind::Storage,
                    &format!("stored document unreadable: {e}"),
                );
            }
        };

        info!("document {id}: analyzing with {}", self.analyzer.name());
        match self.analyzer.analyze(&content, mime).await {
            Ok(payload) => match self.db.complete_analysis(id, &payload) {
                Ok(true) => {
                    info!(
                        "document {id}: analyzed, risk {} ({:.2})",
                        payload.risk_level, payload.risk_score
                    );
                    true
                }
                Ok(false) => {
                    warn!("document {id}: result arrived after settlement, ignored");
                    true
                }
                Err(e) => {
                    error!("document {id}: complete_analysis: {e}");
                    false
                }
            },
            Err(e @ AnalysisError::TooLarge { .. }) => {
                self.record_failure(id, FailureKind::TooLarge, &e.to_string())
            }
            Err(AnalysisError::Provider(msg)) => {
                warn!("document {id}: provider error: {msg}");
                self.record_failure(id, FailureKind::Provider, &msg)
            }
        }
    }

    fn record_failure(&self, id: &str, kind: FailureKind, message: &str) -> bool {
        match self.db.fail_analysis(id, kind, message) {
            Ok(true) => true,
            Ok(false) => {
                debug!("document {id}: failure {kind:?} after settlement, ignored");
                true
            }
            Err(e) => {
                error!("document {id}: fail_analysis: {e}");
                false
            }
        }
    }

    /// Fail every record a previous process left `pending` or `analyzing`.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut n = 0;
        for doc in self.db.list_unfinished().context("list_unfinished")? {
            if self
                .db
                .fail_analysis(&doc.id, FailureKind::Interrupted, INTERRUPTED_MESSAGE)?
            {
                n += 1;
            }
        }
        if n > 0 {
            info!("marked {n} interrupted analyses as failed");
        }
        Ok(n)
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    fn owned(&self, principal: &Principal, id: &str) -> Result<Document, DocumentError> {
        authenticate(principal)?;
        let doc = self
            .db
            .get_document(id)?
            .ok_or_else(|| DocumentError::NotFound(id.to_string()))?;
        if !doc.is_owned_by(principal) {
            warn!("{} attempted to access document {id} of another owner", principal.id);
            return Err(DocumentError::Auth(format!("document {id} belongs to another user")));
        }
        Ok(doc)
    }

    pub fn get(&self, principal: &Principal, id: &str) -> Result<Document, DocumentError> {
        self.owned(principal, id)
    }

    /// The principal's documents, newest first.
    pub fn list(&self, principal: &Principal) -> Result<DocumentList, DocumentError> {
        authenticate(principal)?;
        Ok(DocumentList::new(self.db.list_documents(&principal.id)?))
    }

    /// Live list view. Every change to the owner's documents triggers a full re-fetch;
    /// bursts of changes collapse into one.
    pub fn watch(
        self: &Arc<Self>,
        principal: &Principal,
    ) -> Result<watch::Receiver<DocumentList>, DocumentError> {
        authenticate(principal)?;
        // subscribe before the first fetch so nothing falls between the two
        let mut changes = self.db.subscribe(&principal.id);
        let (tx, rx) = watch::channel(self.list(principal)?);

        let pipeline = Arc::clone(self);
        let principal = principal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = changes.recv() => {
                        if let Err(RecvError::Closed) = msg {
                            break;
                        }
                        loop {
                            match changes.try_recv() {
                                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        match pipeline.list(&principal) {
                            Ok(list) => {
                                if tx.send(list).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("refreshing documents for {}: {e}", principal.id),
                        }
                    }
                }
            }
            debug!("document watch for {} closed", principal.id);
        });
        Ok(rx)
    }

    // ── Delete and export ─────────────────────────────────────────────────

    /// Remove the blob, then the record. A failed blob removal keeps the record.
    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<(), DocumentError> {
        let doc = self.owned(principal, id)?;
        ensure_owned(&doc.owner, &doc.storage_key)
            .map_err(|e| DocumentError::Auth(e.to_string()))?;

        self.storage.delete(&doc.storage_key).await.map_err(|e| {
            error!("document {id}: blob delete failed, record kept: {e}");
            DocumentError::Delete(format!("could not remove stored file: {e}"))
        })?;

        match self.db.delete_document(id, &principal.id) {
            Ok(true) => {
                info!("document {id} deleted by {}", principal.id);
                Ok(())
            }
            Ok(false) => Err(DocumentError::NotFound(id.to_string())),
            Err(e) => {
                error!("document {id}: blob removed but record delete failed: {e}");
                Err(DocumentError::Delete(format!(
                    "stored file removed but record could not be deleted: {e}"
                )))
            }
        }
    }

    /// Original bytes, relabeled with the configured download extension.
    pub async fn download(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<Download, DocumentError> {
        let doc = self.owned(principal, id)?;
        let bytes = self
            .storage
            .get(&doc.storage_key)
            .await
            .with_context(|| format!("read blob for document {id}"))?;
        Ok(Download {
            filename: relabel_filename(&doc.filename, &self.config.download_extension),
            mime_type: doc.mime_type,
            bytes,
        })
    }

    pub fn download_report(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<Download, DocumentError> {
        let doc = self.owned(principal, id)?;
        if doc.status != DocumentStatus::Analyzed {
            return Err(DocumentError::NotAnalyzed(id.to_string()));
        }
        let bytes = report::render_report(&doc)?;
        Ok(Download {
            filename: report::report_filename(&doc.filename),
            mime_type: "application/pdf".into(),
            bytes,
        })
    }

    pub fn chat(
        &self,
        principal: &Principal,
        id: &str,
        question: &str,
    ) -> Result<String, DocumentError> {
        let doc = self.owned(principal, id)?;
        chat::reply(&doc, question)
    }
}
