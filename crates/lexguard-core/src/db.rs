use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::{
    stream::ChangeFeed,
    types::{
        AnalysisOutcome, AnalysisPayload, ChangeKind, Document, DocumentChange, DocumentStatus,
        FailureKind, RiskLevel,
    },
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

const DOCUMENT_COLUMNS: &str = "id, owner, filename, size, mime_type, storage_key, status, \
     risk_level, risk_score, analysis, created_at, updated_at";

/// SQLite-backed document record store.
///
/// Status writes are compare-and-swap against the transition table: an update only
/// lands if the row still sits in a status that may reach the target. Writes that
/// match nothing (row deleted, race lost) return `false` and notify nobody.
pub struct Db {
    conn: Mutex<Connection>,
    feed: ChangeFeed,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexical order in SQLite equals time order.
fn ts_str(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status_str: String = row.get(6)?;
    let status = DocumentStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown status {status_str:?}").into(),
        )
    })?;
    let risk_level = row
        .get::<_, Option<String>>(7)?
        .and_then(|s| RiskLevel::parse(&s));
    let analysis = match row.get::<_, Option<String>>(9)? {
        Some(json) => Some(
            serde_json::from_str::<AnalysisOutcome>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e))
            })?,
        ),
        None => None,
    };
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(Document {
        id: row.get(0)?,
        owner: row.get(1)?,
        filename: row.get(2)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        mime_type: row.get(4)?,
        storage_key: row.get(5)?,
        status,
        risk_level,
        risk_score: row.get(8)?,
        analysis,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    /// Change notifications for one owner's documents.
    pub fn subscribe(&self, owner: &str) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe(owner)
    }

    fn notify(&self, kind: ChangeKind, document_id: &str, owner: &str) {
        self.feed.publish(DocumentChange {
            kind,
            document_id: document_id.to_string(),
            owner: owner.to_string(),
        });
    }

    // ── Documents ─────────────────────────────────────────────────────────

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        let analysis = doc
            .analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize analysis")?;
        {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                &format!("INSERT INTO documents ({DOCUMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
                params![
                    doc.id,
                    doc.owner,
                    doc.filename,
                    doc.size as i64,
                    doc.mime_type,
                    doc.storage_key,
                    doc.status.as_str(),
                    doc.risk_level.map(|l| l.as_str()),
                    doc.risk_score,
                    analysis,
                    ts_str(&doc.created_at),
                    ts_str(&doc.updated_at),
                ],
            )
            .context("insert_document")?;
        }
        self.notify(ChangeKind::Insert, &doc.id, &doc.owner);
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let doc = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
                row_to_document,
            )
            .optional()
            .context("get_document")?;
        Ok(doc)
    }

    /// All documents of one owner, newest first.
    pub fn list_documents(&self, owner: &str) -> Result<Vec<Document>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE owner = ?1 \
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let docs = stmt
            .query_map(params![owner], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_documents")?;
        Ok(docs)
    }

    /// Documents in a non-terminal status, oldest first.
    pub fn list_unfinished(&self) -> Result<Vec<Document>> {
        let open: Vec<String> = DocumentStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE status IN ({}) \
             ORDER BY created_at ASC",
            open.join(", ")
        ))?;
        let docs = stmt
            .query_map([], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_unfinished")?;
        Ok(docs)
    }

    /// Delete a record, scoped to its owner. Returns false if nothing matched.
    pub fn delete_document(&self, id: &str, owner: &str) -> Result<bool> {
        let n = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "DELETE FROM documents WHERE id = ?1 AND owner = ?2",
                params![id, owner],
            )
            .context("delete_document")?
        };
        if n > 0 {
            self.notify(ChangeKind::Delete, id, owner);
        }
        Ok(n > 0)
    }

    // ── Status transitions ────────────────────────────────────────────────

    /// pending → analyzing.
    pub fn begin_analysis(&self, id: &str) -> Result<bool> {
        self.transition(id, DocumentStatus::Analyzing, None, None, None)
    }

    /// analyzing → analyzed, persisting level, score and payload together.
    pub fn complete_analysis(&self, id: &str, payload: &AnalysisPayload) -> Result<bool> {
        let outcome = AnalysisOutcome::Completed(payload.clone());
        self.transition(
            id,
            DocumentStatus::Analyzed,
            Some(payload.risk_level),
            Some(payload.risk_score),
            Some(&outcome),
        )
    }

    /// pending|analyzing → error with a descriptor payload; risk fields stay unset.
    pub fn fail_analysis(&self, id: &str, kind: FailureKind, message: &str) -> Result<bool> {
        let outcome = AnalysisOutcome::Failed {
            kind,
            message: message.to_string(),
        };
        self.transition(id, DocumentStatus::Error, None, None, Some(&outcome))
    }

    fn transition(
        &self,
        id: &str,
        target: DocumentStatus,
        risk_level: Option<RiskLevel>,
        risk_score: Option<f64>,
        analysis: Option<&AnalysisOutcome>,
    ) -> Result<bool> {
        let sources: Vec<String> = DocumentStatus::sources_of(target)
            .into_iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        if sources.is_empty() {
            return Ok(false);
        }
        let analysis = analysis
            .map(serde_json::to_string)
            .transpose()
            .context("serialize analysis")?;

        let owner = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let owner: Option<String> = conn
                .query_row(
                    "SELECT owner FROM documents WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .context("transition lookup")?;
            let Some(owner) = owner else {
                return Ok(false);
            };
            let n = conn
                .execute(
                    &format!(
                        "UPDATE documents SET status = ?1, risk_level = ?2, risk_score = ?3, \
                         analysis = ?4, updated_at = ?5 \
                         WHERE id = ?6 AND status IN ({})",
                        sources.join(", ")
                    ),
                    params![
                        target.as_str(),
                        risk_level.map(|l| l.as_str()),
                        risk_score,
                        analysis,
                        ts_str(&Utc::now()),
                        id,
                    ],
                )
                .with_context(|| format!("transition to {target}"))?;
            if n == 0 {
                return Ok(false);
            }
            owner
        };
        self.notify(ChangeKind::Update, id, &owner);
        Ok(true)
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(result)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts_str(&Utc::now())],
        )
        .context("set_config")?;
        Ok(())
    }

    /// Insert a config value only if the key is absent.
    pub fn seed_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, ts_str(&Utc::now())],
        )
        .context("seed_config")?;
        Ok(())
    }
}
