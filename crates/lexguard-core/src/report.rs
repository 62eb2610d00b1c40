use std::io::BufWriter;

use anyhow::anyhow;
use printpdf::*;

use crate::{error::DocumentError, types::Document};

const REPORT_TITLE: &str = "Legal Document Risk Report";

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const LEFT: f32 = 20.0;
const INDENT: f32 = 25.0;
const TOP: f32 = 275.0;
const BOTTOM: f32 = 20.0;
const BODY_WRAP: usize = 95;
const LINE: f32 = 4.5;

/// Export filename: the original stem with `_report.pdf` in place of its extension.
pub fn report_filename(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(i) if i > 0 => &filename[..i],
        _ => filename,
    };
    format!("{stem}_report.pdf")
}

/// Render the analysis of an analyzed document as a paginated A4 PDF.
pub fn render_report(doc: &Document) -> Result<Vec<u8>, DocumentError> {
    let payload = doc
        .payload()
        .ok_or_else(|| DocumentError::NotAnalyzed(doc.id.clone()))?;

    let mut w = ReportWriter::new(&doc.filename)?;

    w.line(REPORT_TITLE, 16.0, LEFT, true, 9.0);
    w.line(&format!("Document: {}", doc.filename), 10.0, LEFT, false, LINE + 0.5);
    w.line(
        &format!("Uploaded: {}", doc.created_at.format("%Y-%m-%d %H:%M UTC")),
        10.0,
        LEFT,
        false,
        LINE + 0.5,
    );
    w.line(&format!("Size: {} bytes", doc.size), 10.0, LEFT, false, LINE + 0.5);
    w.line(
        &format!(
            "Risk level: {}   Risk score: {:.0}%",
            payload.risk_level.as_str().to_uppercase(),
            payload.risk_score * 100.0
        ),
        10.0,
        LEFT,
        true,
        LINE + 0.5,
    );
    w.gap(6.0);

    w.heading("SUMMARY");
    w.paragraph(&payload.summary, INDENT);
    w.gap(4.0);

    if !payload.risk_areas.is_empty() {
        w.heading("RISK AREAS");
        for (i, area) in payload.risk_areas.iter().enumerate() {
            w.paragraph_bold(
                &format!("{}. {} [{}]", i + 1, area.category, area.severity.to_uppercase()),
                INDENT,
            );
            w.paragraph(&area.description, INDENT + 5.0);
            if !area.impact.is_empty() {
                w.paragraph(&format!("Impact: {}", area.impact), INDENT + 5.0);
            }
            w.gap(2.0);
        }
        w.gap(2.0);
    }

    if !payload.findings.is_empty() {
        w.heading("FINDINGS");
        for (i, f) in payload.findings.iter().enumerate() {
            let title = if f.section.is_empty() {
                format!("{}. {}", i + 1, f.kind)
            } else {
                format!("{}. {} ({})", i + 1, f.kind, f.section)
            };
            w.paragraph_bold(&title, INDENT);
            w.paragraph(&f.description, INDENT + 5.0);
            if !f.recommendation.is_empty() {
                w.paragraph(&format!("Recommendation: {}", f.recommendation), INDENT + 5.0);
            }
            w.gap(2.0);
        }
        w.gap(2.0);
    }

    if !payload.recommendations.is_empty() {
        w.heading("RECOMMENDATIONS");
        for (i, r) in payload.recommendations.iter().enumerate() {
            w.paragraph_bold(
                &format!("{}. [{}] {}", i + 1, r.priority.to_uppercase(), r.action),
                INDENT,
            );
            if !r.rationale.is_empty() {
                w.paragraph(&r.rationale, INDENT + 5.0);
            }
            w.gap(2.0);
        }
    }

    w.finish()
}

/// Cursor over a growing PDF. Starts a new page when the cursor reaches the bottom margin.
struct ReportWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    font: IndirectFontRef,
    bold: IndirectFontRef,
    filename: String,
    page_no: usize,
    y: f32,
}

impl ReportWriter {
    fn new(filename: &str) -> Result<Self, DocumentError> {
        let (doc, page1, layer1) =
            PdfDocument::new(REPORT_TITLE, Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        let layer = doc.get_page(page1).get_layer(layer1);
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| anyhow!("PDF font error: {e}"))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| anyhow!("PDF font error: {e}"))?;
        let w = Self {
            doc,
            layer,
            font,
            bold,
            filename: pdf_safe(filename),
            page_no: 1,
            y: TOP,
        };
        w.decorate();
        Ok(w)
    }

    fn decorate(&self) {
        self.layer.use_text(
            format!("{REPORT_TITLE} - {}", self.filename),
            8.0,
            Mm(LEFT),
            Mm(PAGE_H - 12.0),
            &self.font,
        );
        self.layer.use_text(
            format!("Page {}", self.page_no),
            8.0,
            Mm(PAGE_W / 2.0 - 6.0),
            Mm(10.0),
            &self.font,
        );
    }

    fn new_page(&mut self) {
        let (page, layer) = self.doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.page_no += 1;
        self.y = TOP;
        self.decorate();
    }

    fn ensure_space(&mut self, needed: f32) {
        if self.y - needed < BOTTOM {
            self.new_page();
        }
    }

    fn line(&mut self, text: &str, size: f32, x: f32, bold: bool, advance: f32) {
        self.ensure_space(advance);
        let font = if bold { &self.bold } else { &self.font };
        self.layer.use_text(pdf_safe(text), size, Mm(x), Mm(self.y), font);
        self.y -= advance;
    }

    fn gap(&mut self, mm: f32) {
        self.y -= mm;
    }

    fn heading(&mut self, text: &str) {
        // keep a heading together with its first body line
        self.ensure_space(6.0 + LINE * 2.0);
        self.line(text, 11.0, LEFT, true, 6.0);
    }

    fn paragraph(&mut self, text: &str, x: f32) {
        for l in wrap_text(text, BODY_WRAP) {
            self.line(&l, 9.0, x, false, LINE);
        }
    }

    fn paragraph_bold(&mut self, text: &str, x: f32) {
        for l in wrap_text(text, BODY_WRAP) {
            self.line(&l, 9.5, x, true, LINE + 0.5);
        }
    }

    fn finish(self) -> Result<Vec<u8>, DocumentError> {
        let mut buf = BufWriter::new(Vec::new());
        self.doc
            .save(&mut buf)
            .map_err(|e| anyhow!("PDF save error: {e}"))?;
        let bytes = buf
            .into_inner()
            .map_err(|e| anyhow!("PDF buffer error: {e}"))?;
        Ok(bytes)
    }
}

/// Built-in PDF fonts only cover Latin-1; map common punctuation and drop the rest.
fn pdf_safe(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\u{2013}' | '\u{2014}' => Some('-'),
            '\u{2018}' | '\u{2019}' => Some('\''),
            '\u{201C}' | '\u{201D}' => Some('"'),
            '\u{2022}' => Some('*'),
            '\t' | '\n' | '\r' => Some(' '),
            c if (' '..='~').contains(&c) || ('\u{A0}'..='\u{FF}').contains(&c) => Some(c),
            _ => None,
        })
        .collect()
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    let max_chars = max_chars.max(1);
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        // tokens wider than a line (URLs, clause ids) are cut at the margin
        while word.len() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(max_chars);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        let word: String = word.into_iter().collect();
        let width = current.chars().count();
        if width + word.chars().count() + 1 > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}
