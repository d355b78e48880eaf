use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::assess::{AssessmentResult, BatchOutcome};

/// Worksheet that carries the control rows in the SSP template.
pub const REPORT_WORKSHEET: &str = "Essential Eight";
/// Delimiter used when rendering an evidence list into one comment cell.
pub const EVIDENCE_DELIMITER: &str = "; ";

// 1-based workbook coordinates: column B holds the control identifier,
// L receives the status, M receives the evidence/comment string.
const CONTROL_COLUMN: u32 = 2;
const STATUS_COLUMN: u32 = 12;
const COMMENT_COLUMN: u32 = 13;
const HEADER_ROWS: u32 = 1;

/// Failures while opening, mutating, or saving the report workbook.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to open report template at {path}: {message}")]
    TemplateRead { path: PathBuf, message: String },
    #[error("worksheet `{worksheet}` not found in the report template")]
    TemplateStructure { worksheet: &'static str },
    #[error("failed to write merged report to {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Merge assessment results into an SSP template.
///
/// Rows whose identifier matches a result get their status and comment cells
/// overwritten; every other row, and the header, is left untouched. The
/// template itself is never modified — the merged workbook is saved to
/// `output`.
#[instrument(name = "merge_report", skip(results), fields(results = results.len()))]
pub fn merge_results(
    results: &[AssessmentResult],
    template: &Path,
    output: &Path,
) -> Result<PathBuf, ReportError> {
    let mut book =
        umya_spreadsheet::reader::xlsx::read(template).map_err(|err| ReportError::TemplateRead {
            path: template.to_path_buf(),
            message: err.to_string(),
        })?;

    let lookup: HashMap<&str, &AssessmentResult> = results
        .iter()
        .map(|result| (result.control_id.as_str(), result))
        .collect();

    let sheet = book
        .get_sheet_by_name_mut(REPORT_WORKSHEET)
        .ok_or(ReportError::TemplateStructure {
            worksheet: REPORT_WORKSHEET,
        })?;

    let mut merged = 0usize;
    let highest_row = sheet.get_highest_row();
    for row in (HEADER_ROWS + 1)..=highest_row {
        let identifier = sheet.get_value((CONTROL_COLUMN, row));
        let identifier = identifier.trim();
        if identifier.is_empty() {
            continue;
        }
        if let Some(result) = lookup.get(identifier) {
            sheet
                .get_cell_mut((STATUS_COLUMN, row))
                .set_value(result.status.label());
            sheet
                .get_cell_mut((COMMENT_COLUMN, row))
                .set_value(result.evidence.join(EVIDENCE_DELIMITER));
            merged += 1;
        }
    }
    debug!(merged, rows = highest_row, "template rows merged");

    umya_spreadsheet::writer::xlsx::write(&book, output).map_err(|err| ReportError::Write {
        path: output.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(output.to_path_buf())
}

/// Format styles supported when rendering a batch outcome.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

/// One row of the outcome as exposed over the API and in JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentRow {
    pub control: String,
    pub result: String,
    pub comment: String,
}

/// Flatten an outcome into API/report rows, evidence joined per row.
pub fn outcome_rows(outcome: &BatchOutcome) -> Vec<AssessmentRow> {
    outcome
        .results
        .iter()
        .map(|result| AssessmentRow {
            control: result.control_id.clone(),
            result: result.status.label().to_string(),
            comment: result.evidence.join(EVIDENCE_DELIMITER),
        })
        .collect()
}

/// Produce a report string from a batch outcome using the desired format.
pub fn render_outcome(outcome: &BatchOutcome, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(outcome),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&outcome_rows(outcome))?),
    }
}

fn render_human(outcome: &BatchOutcome) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "Assessed {} control(s)", outcome.results.len())?;
    writeln!(out)?;
    for result in &outcome.results {
        writeln!(out, "  {} : {}", result.control_id, result.status)?;
        if !result.evidence.is_empty() {
            writeln!(out, "    evidence: {}", result.evidence.join(EVIDENCE_DELIMITER))?;
        }
        if !result.explanation.trim().is_empty() {
            writeln!(out, "    {}", result.explanation)?;
        }
    }
    if !outcome.failures.is_empty() {
        writeln!(out)?;
        writeln!(out, "Degraded to fallback:")?;
        for failure in &outcome.failures {
            writeln!(out, "  {} : {}", failure.control_id, failure.error)?;
        }
    }
    Ok(out)
}
