use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard ceiling for uploaded documents (10 MiB), enforced at upload and again by every analyzer.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Wall-clock budget for one analysis before the timeout guard fails the document.
pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(180);

pub const TIMEOUT_MESSAGE: &str = "Analysis timeout — document may be too complex or corrupted";

/// Length of the raw-response prefix kept as the summary of a degraded payload.
pub const FALLBACK_SUMMARY_CHARS: usize = 500;

// ── Principal ────────────────────────────────────────────────────────────

/// The authenticated user an operation runs for. Passed explicitly to every
/// pipeline call; there is no ambient session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

// ── Status state machine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Analyzing,
    Analyzed,
    Error,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Pending,
        DocumentStatus::Analyzing,
        DocumentStatus::Analyzed,
        DocumentStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Allowed edges of the analysis state machine. `analyzed` and `error` are terminal;
    /// a retry path would be an `Error => Analyzing` edge here.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Analyzing)
                | (Self::Pending, Self::Error)
                | (Self::Analyzing, Self::Analyzed)
                | (Self::Analyzing, Self::Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        !Self::ALL.into_iter().any(|next| self.can_transition_to(next))
    }

    /// Every status from which `target` may be reached.
    pub fn sources_of(target: DocumentStatus) -> Vec<DocumentStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Risk ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Bucket a 0..1 risk score. Boundaries are inclusive on the high side.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Self::High
        } else if score >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Accepted formats ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
}

impl DocumentFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim() {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "text/plain" => Some(Self::PlainText),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::PlainText => "text/plain",
        }
    }
}

// ── Analysis payload ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskArea {
    pub category: String,
    pub severity: String,
    pub description: String,
    pub impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: String,
    pub section: String,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub priority: String,
    pub action: String,
    pub rationale: String,
}

/// Canonical result of a document risk analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub summary: String,
    #[serde(default)]
    pub risk_areas: Vec<RiskArea>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl AnalysisPayload {
    /// Low-confidence payload used when the provider text holds no usable JSON.
    pub fn fallback(raw: &str) -> Self {
        let prefix: String = raw.chars().take(FALLBACK_SUMMARY_CHARS).collect();
        Self {
            risk_score: 0.5,
            risk_level: RiskLevel::Medium,
            summary: format!("{prefix}..."),
            risk_areas: Vec::new(),
            findings: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The external analysis call failed or returned nothing.
    Provider,
    /// The timeout guard fired before a result arrived.
    Timeout,
    /// The stored blob could not be read back for analysis.
    Storage,
    /// The blob exceeded the analyzer's size limit.
    TooLarge,
    /// A previous process stopped while the analysis was in flight.
    Interrupted,
}

/// What ends up in a document's analysis column: a result or an error descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Completed(AnalysisPayload),
    Failed { kind: FailureKind, message: String },
}

impl AnalysisOutcome {
    pub fn payload(&self) -> Option<&AnalysisPayload> {
        match self {
            Self::Completed(p) => Some(p),
            Self::Failed { .. } => None,
        }
    }
}

// ── Document ─────────────────────────────────────────────────────────────

/// A document row as stored in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub storage_key: String,
    pub status: DocumentStatus,
    pub risk_level: Option<RiskLevel>,
    pub risk_score: Option<f64>,
    pub analysis: Option<AnalysisOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn payload(&self) -> Option<&AnalysisPayload> {
        if self.status != DocumentStatus::Analyzed {
            return None;
        }
        self.analysis.as_ref().and_then(AnalysisOutcome::payload)
    }

    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        self.owner == principal.id
    }
}

/// An owner's documents, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<Document>,
}

impl DocumentList {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// The most recently uploaded document.
    pub fn current(&self) -> Option<&Document> {
        self.documents.first()
    }

    /// Everything except the current document.
    pub fn recent(&self) -> &[Document] {
        self.documents.get(1..).unwrap_or(&[])
    }
}

// ── Upload / download ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

// ── Change notifications ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document_id: String,
    pub owner: String,
}
