use lexguard_core::{AnalysisPayload, Finding, Recommendation, RiskArea, RiskLevel};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Score used when the provider omits one or sends something non-numeric.
const DEFAULT_SCORE: f64 = 0.5;

/// Find the first balanced `{...}` in `text` that parses as a JSON object.
///
/// Braces inside string literals are ignored. Candidates that balance but do not parse
/// are skipped and scanning resumes after their opening brace.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        if let Some(end) = balanced_end(&bytes[start..]) {
            let candidate = &text[start..start + end + 1];
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                return Some(map);
            }
        }
        from = start + 1;
    }
    None
}

/// Index of the brace closing the one at `bytes[0]`.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Turn free-form provider text into a payload. Never fails: text without a usable
/// JSON object degrades to [`AnalysisPayload::fallback`].
pub fn parse_analysis(text: &str) -> AnalysisPayload {
    match extract_json_object(text) {
        Some(obj) => normalize(&obj),
        None => {
            warn!(
                raw_len = text.len(),
                "no JSON object in provider response, using fallback payload"
            );
            AnalysisPayload::fallback(text)
        }
    }
}

fn normalize(obj: &Map<String, Value>) -> AnalysisPayload {
    let risk_score = match obj.get("riskScore").and_then(number) {
        Some(s) => s.clamp(0.0, 1.0),
        None => {
            debug!("riskScore missing or not numeric, defaulting to {DEFAULT_SCORE}");
            DEFAULT_SCORE
        }
    };

    let risk_areas = objects(obj, "riskAreas")
        .map(|o| RiskArea {
            category: text_field(o, "category"),
            severity: text_field(o, "severity"),
            description: text_field(o, "description"),
            impact: text_field(o, "impact"),
        })
        .collect();
    let findings = objects(obj, "findings")
        .map(|o| Finding {
            kind: text_field(o, "type"),
            section: text_field(o, "section"),
            description: text_field(o, "description"),
            recommendation: text_field(o, "recommendation"),
        })
        .collect();
    let recommendations = objects(obj, "recommendations")
        .map(|o| Recommendation {
            priority: text_field(o, "priority"),
            action: text_field(o, "action"),
            rationale: text_field(o, "rationale"),
        })
        .collect();

    AnalysisPayload {
        risk_score,
        risk_level: RiskLevel::from_score(risk_score),
        summary: text_field(obj, "summary"),
        risk_areas,
        findings,
        recommendations,
    }
}

fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn objects<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
) -> impl Iterator<Item = &'a Map<String, Value>> + 'a {
    obj.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}
