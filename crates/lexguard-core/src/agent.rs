use async_trait::async_trait;

use crate::{
    error::AnalysisError,
    types::{AnalysisPayload, MAX_UPLOAD_BYTES},
};

/// Turns a stored document blob into a structured risk analysis.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn analyze(&self, content: &[u8], mime_type: &str)
        -> Result<AnalysisPayload, AnalysisError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Reject blobs over the upload ceiling before they are sent anywhere.
pub fn ensure_within_limit(content: &[u8]) -> Result<(), AnalysisError> {
    let size = content.len() as u64;
    if size > MAX_UPLOAD_BYTES {
        return Err(AnalysisError::TooLarge {
            size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}
