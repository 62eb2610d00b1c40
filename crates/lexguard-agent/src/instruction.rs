/// Fixed instruction sent with every document. Providers are asked for one JSON object
/// in the shape of [`lexguard_core::AnalysisPayload`].
pub const ANALYSIS_PROMPT: &str = r#"Analyze this legal document for potential risks and compliance issues. Provide:

1. **Risk Assessment** (0-1 scale where 1 is highest risk):
   - Overall risk score
   - Risk level classification (low/medium/high)

2. **Key Risk Areas**:
   - Contractual risks
   - Compliance issues
   - Legal liabilities
   - Financial exposures

3. **Specific Findings**:
   - Problematic clauses or sections
   - Missing standard protections
   - Unusual terms or conditions

4. **Recommendations**:
   - Actions to mitigate risks
   - Suggested modifications
   - Additional reviews needed

Please provide a comprehensive analysis in JSON format with the following structure:
{
  "riskScore": <number between 0 and 1>,
  "riskLevel": "<low|medium|high>",
  "summary": "<brief summary of document and overall assessment>",
  "riskAreas": [
    {
      "category": "<risk category>",
      "severity": "<low|medium|high>",
      "description": "<detailed description>",
      "impact": "<potential impact>"
    }
  ],
  "findings": [
    {
      "type": "<finding type>",
      "section": "<document section if applicable>",
      "description": "<detailed finding>",
      "recommendation": "<suggested action>"
    }
  ],
  "recommendations": [
    {
      "priority": "<high|medium|low>",
      "action": "<recommended action>",
      "rationale": "<reason for recommendation>"
    }
  ]
}
"#;

/// Prompt for text-only providers: the instruction followed by the document text.
pub fn build_text_instruction(document_text: &str) -> String {
    let mut s = String::with_capacity(ANALYSIS_PROMPT.len() + document_text.len() + 64);
    s.push_str(ANALYSIS_PROMPT);
    s.push_str("\n---\n\nDocument:\n\n");
    s.push_str(document_text);
    s
}
