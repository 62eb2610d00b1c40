use crate::{error::DocumentError, types::Document};

/// Canned keyword-match assistant answering questions about an analyzed document.
pub fn reply(doc: &Document, question: &str) -> Result<String, DocumentError> {
    let payload = doc
        .payload()
        .ok_or_else(|| DocumentError::NotAnalyzed(doc.id.clone()))?;
    let question = question.trim();
    if question.is_empty() {
        return Err(DocumentError::Validation("question is empty".into()));
    }
    let q = question.to_lowercase();

    if q.contains("summary") || q.contains("summarize") {
        return Ok(format!("Summary of {}: {}", doc.filename, payload.summary));
    }

    if q.contains("risk") {
        let mut out = format!(
            "{} carries a {} risk level (score {:.2}).",
            doc.filename, payload.risk_level, payload.risk_score
        );
        if payload.risk_areas.is_empty() {
            out.push_str(" No specific risk areas were identified.");
        }
        for area in &payload.risk_areas {
            out.push_str(&format!(
                "\n- {} ({}): {}",
                area.category, area.severity, area.description
            ));
        }
        return Ok(out);
    }

    if q.contains("finding") || q.contains("clause") {
        if payload.findings.is_empty() {
            return Ok(format!("No notable clauses were flagged in {}.", doc.filename));
        }
        let mut out = format!("Flagged clauses in {}:", doc.filename);
        for f in &payload.findings {
            out.push_str(&format!("\n- [{}] {}: {}", f.kind, f.section, f.description));
        }
        return Ok(out);
    }

    if q.contains("recommend") {
        if payload.recommendations.is_empty() {
            return Ok("There are no specific recommendations for this document.".into());
        }
        let mut out = String::from("Recommended next steps:");
        for r in &payload.recommendations {
            out.push_str(&format!("\n- ({}) {}: {}", r.priority, r.action, r.rationale));
        }
        return Ok(out);
    }

    Ok(format!(
        "I understand you're asking about \"{question}\". Based on my analysis of {}, \
         the document shows a {} risk level with specific areas of concern that I can \
         elaborate on. Would you like me to explain any specific findings in more detail?",
        doc.filename, payload.risk_level
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;

    fn doc(status: DocumentStatus) -> Document {
        let payload = AnalysisPayload {
            risk_score: 0.45,
            risk_level: RiskLevel::Medium,
            summary: "NDA with one-sided remedies.".into(),
            risk_areas: vec![RiskArea {
                category: "Remedies".into(),
                severity: "medium".into(),
                description: "Injunctive relief only for discloser".into(),
                impact: "Asymmetric enforcement".into(),
            }],
            findings: Vec::new(),
            recommendations: vec![Recommendation {
                priority: "medium".into(),
                action: "Make remedies mutual".into(),
                rationale: "Balance".into(),
            }],
        };
        Document {
            id: "d1".into(),
            owner: "alice".into(),
            filename: "nda.txt".into(),
            size: 10,
            mime_type: "text/plain".into(),
            storage_key: "alice/1-nda.txt".into(),
            status,
            risk_level: Some(RiskLevel::Medium),
            risk_score: Some(0.45),
            analysis: Some(AnalysisOutcome::Completed(payload)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn keywords_select_sections() {
        let d = doc(DocumentStatus::Analyzed);
        assert!(reply(&d, "Give me a summary").unwrap().contains("one-sided remedies"));
        assert!(reply(&d, "What are the RISKS?").unwrap().contains("Remedies (medium)"));
        assert!(reply(&d, "any bad clauses?").unwrap().contains("No notable clauses"));
        assert!(reply(&d, "what do you recommend").unwrap().contains("Make remedies mutual"));
    }

    #[test]
    fn fallback_mentions_risk_level() {
        let d = doc(DocumentStatus::Analyzed);
        let r = reply(&d, "who signed it?").unwrap();
        assert!(r.contains("who signed it?") && r.contains("medium risk level"));
    }

    #[test]
    fn requires_analysis_and_question() {
        assert!(matches!(
            reply(&doc(DocumentStatus::Analyzing), "summary"),
            Err(DocumentError::NotAnalyzed(_))
        ));
        assert!(matches!(
            reply(&doc(DocumentStatus::Analyzed), "   "),
            Err(DocumentError::Validation(_))
        ));
    }
}
