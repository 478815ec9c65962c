//! Discharge summary PDF generation.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use serde_json::json;

use super::{AgentTool, FailureKind, ToolOutcome, optional_str, required_str};

pub const DEFAULT_OUTPUT_DIR: &str = "discharge_summaries";

const PAGE_WIDTH: Mm = Mm(210.0);
const PAGE_HEIGHT: Mm = Mm(297.0);
const MARGIN_MM: f32 = 20.0;
const HEADING_SIZE: f32 = 20.0;
const BODY_SIZE: f32 = 12.0;
const LINE_MM: f32 = 6.0;
/// Characters per line at the body size within the margins.
const WRAP_COLUMNS: usize = 85;

/// Content of one summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DischargeSummary {
    pub patient_name: String,
    pub diagnosis: String,
    pub treatment: String,
    pub follow_up_instructions: String,
}

impl DischargeSummary {
    fn sections(&self) -> [(&'static str, &str); 4] {
        let follow_up = if self.follow_up_instructions.trim().is_empty() {
            "N/A"
        } else {
            self.follow_up_instructions.as_str()
        };
        [
            ("Patient Name:", self.patient_name.as_str()),
            ("Diagnosis:", self.diagnosis.as_str()),
            ("Treatment:", self.treatment.as_str()),
            ("Follow-Up Instructions:", follow_up),
        ]
    }
}

/// Output file name for a patient: spaces become underscores, lowercased.
pub fn file_name_for(patient_name: &str) -> String {
    let safe: String = patient_name
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    format!("{}_discharge_summary.pdf", safe.to_lowercase())
}

/// Greedy word wrap; words longer than `width` get a line of their own.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

/// Writes text top-down, starting a new page when the bottom margin is reached.
struct PageCursor<'a> {
    doc: &'a printpdf::PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
}

impl PageCursor<'_> {
    fn line(&mut self, text: &str, size: f32, font: &IndirectFontRef, advance: f32) {
        if self.y < MARGIN_MM {
            let (page, layer) = self.doc.add_page(PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT.0 - MARGIN_MM;
        }
        self.layer.use_text(text, size, Mm(MARGIN_MM), Mm(self.y), font);
        self.y -= advance;
    }
}

/// Render the summary to `path` as an A4 PDF.
pub fn render_pdf(summary: &DischargeSummary, path: &Path) -> Result<(), String> {
    let (doc, page, layer) =
        PdfDocument::new("Discharge Summary", PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| e.to_string())?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| e.to_string())?;

    let mut cursor = PageCursor {
        doc: &doc,
        layer: doc.get_page(page).get_layer(layer),
        y: PAGE_HEIGHT.0 - MARGIN_MM,
    };
    cursor.line("Discharge Summary", HEADING_SIZE, &bold, LINE_MM * 2.5);

    for (label, body) in summary.sections() {
        cursor.line(label, BODY_SIZE, &bold, LINE_MM);
        for text in wrap(body, WRAP_COLUMNS) {
            cursor.line(&text, BODY_SIZE, &regular, LINE_MM);
        }
        cursor.y -= LINE_MM;
    }

    let file = File::create(path).map_err(|e| e.to_string())?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|e| e.to_string())
}

/// `generate_discharge_summary`: writes a PDF and reports where it is.
#[derive(Debug, Clone)]
pub struct DischargeSummaryTool {
    output_dir: PathBuf,
}

impl DischargeSummaryTool {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    async fn generate(&self, summary: DischargeSummary) -> Result<PathBuf, String> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| e.to_string())?;
        let path = self.output_dir.join(file_name_for(&summary.patient_name));

        let target = path.clone();
        tokio::task::spawn_blocking(move || render_pdf(&summary, &target))
            .await
            .map_err(|e| format!("render task failed: {e}"))??;

        Ok(path)
    }
}

#[async_trait]
impl AgentTool for DischargeSummaryTool {
    fn name(&self) -> &str {
        "generate_discharge_summary"
    }

    fn description(&self) -> &str {
        "Generate a discharge summary PDF for a patient and return where it can be downloaded."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "patient_name": { "type": "string", "description": "Name of the patient." },
                "diagnosis": { "type": "string", "description": "Diagnosis information." },
                "treatment": { "type": "string", "description": "Treatment details." },
                "follow_up_instructions": {
                    "type": "string",
                    "description": "Post-treatment instructions. Optional."
                }
            },
            "required": ["patient_name", "diagnosis", "treatment"]
        })
    }

    #[tracing::instrument(name = "generate_discharge_summary", skip(self, args), fields(patient_name = tracing::field::Empty))]
    async fn invoke(&self, args: serde_json::Value) -> ToolOutcome {
        let fields = (
            required_str(&args, "patient_name"),
            required_str(&args, "diagnosis"),
            required_str(&args, "treatment"),
        );
        let (patient_name, diagnosis, treatment) = match fields {
            (Ok(p), Ok(d), Ok(t)) => (p, d, t),
            (Err(f), _, _) | (_, Err(f), _) | (_, _, Err(f)) => return f.into(),
        };
        tracing::Span::current().record("patient_name", patient_name);

        let summary = DischargeSummary {
            patient_name: patient_name.to_string(),
            diagnosis: diagnosis.to_string(),
            treatment: treatment.to_string(),
            follow_up_instructions: optional_str(&args, "follow_up_instructions")
                .unwrap_or_default()
                .to_string(),
        };

        match self.generate(summary).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "Discharge summary written");
                ToolOutcome::success(format!(
                    "Discharge summary generated and available for download. {}",
                    path.display()
                ))
            }
            Err(detail) => ToolOutcome::failure(
                FailureKind::Storage,
                format!("Discharge summary generation failed: {detail}"),
            ),
        }
    }
}
