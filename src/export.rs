//! Export of the global table as a downloadable artifact.
//!
//! Export is a pure function of a completed [`GlobalTable`]: cell values are
//! copied verbatim, row order is the table's order, and nothing in the
//! pipeline is touched.

use crate::error::TableError;
use crate::table::GlobalTable;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the optional trailing column.
pub const CONFIDENCE_COLUMN: &str = "confidence";

/// Supported artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(TableError::Export(format!(
                "unsupported export format '{other}' (expected csv or json)"
            ))),
        }
    }
}

/// What to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportRequest {
    pub format: ExportFormat,
    /// Append a trailing `confidence` column (CSV) / field (JSON).
    pub include_confidence: bool,
}

/// A rendered export, ready to be written or served.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    /// `<document_id>.<ext>`
    pub filename: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    header: &'a [String],
    rows: Vec<JsonRow<'a>>,
}

#[derive(Serialize)]
struct JsonRow<'a> {
    page_number: usize,
    row_index_on_page: usize,
    cells: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
}

/// Render `table` according to `request`.
pub fn export_table(
    document_id: &str,
    table: &GlobalTable,
    request: ExportRequest,
) -> Result<ExportArtifact, TableError> {
    let bytes = match request.format {
        ExportFormat::Csv => to_csv(table, request.include_confidence)?,
        ExportFormat::Json => to_json(table, request.include_confidence)?,
    };
    Ok(ExportArtifact {
        filename: format!("{document_id}.{}", request.format.extension()),
        media_type: request.format.media_type(),
        bytes,
    })
}

/// Column labels; `column_<n>` when no page yielded a header.
fn columns(table: &GlobalTable) -> Vec<String> {
    if !table.header.is_empty() {
        return table.header.clone();
    }
    let width = table.rows.iter().map(|r| r.cells.len()).max().unwrap_or(0);
    (1..=width).map(|i| format!("column_{i}")).collect()
}

fn to_csv(table: &GlobalTable, include_confidence: bool) -> Result<Vec<u8>, TableError> {
    let header = columns(table);
    let width = header.len();
    let mut wtr = WriterBuilder::new().flexible(true).from_writer(Vec::new());

    let csv_err = |e: csv::Error| TableError::Export(format!("CSV encoding failed: {e}"));

    if width > 0 || include_confidence {
        let mut record: Vec<&str> = header.iter().map(String::as_str).collect();
        if include_confidence {
            record.push(CONFIDENCE_COLUMN);
        }
        wtr.write_record(&record).map_err(csv_err)?;
    }

    for row in &table.rows {
        let mut record: Vec<String> = row.cells.clone();
        record.resize(width, String::new());
        if include_confidence {
            record.push(format!("{:.3}", row.confidence));
        }
        wtr.write_record(&record).map_err(csv_err)?;
    }

    wtr.into_inner()
        .map_err(|e| TableError::Export(format!("CSV flush failed: {e}")))
}

fn to_json(table: &GlobalTable, include_confidence: bool) -> Result<Vec<u8>, TableError> {
    let export = JsonExport {
        header: &table.header,
        rows: table
            .rows
            .iter()
            .map(|r| JsonRow {
                page_number: r.page_number,
                row_index_on_page: r.row_index_on_page,
                cells: &r.cells,
                confidence: include_confidence.then_some(r.confidence),
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&export)
        .map_err(|e| TableError::Export(format!("JSON encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::GlobalRow;

    fn table() -> GlobalTable {
        let row = |page: usize, idx: usize, cells: &[&str], confidence: f32| GlobalRow {
            page_number: page,
            row_index_on_page: idx,
            cells: cells.iter().map(|c| c.to_string()).collect(),
            confidence,
            bbox: None,
        };
        GlobalTable {
            header: vec!["Item".into(), "Price".into()],
            rows: vec![
                row(1, 0, &["Widget, large", "1,200.00"], 0.91),
                row(1, 1, &["Quote \"x\"", ""], 0.5),
                row(2, 0, &["Gadget", "3.50"], 1.0),
            ],
            header_mismatch_pages: Vec::new(),
        }
    }

    #[test]
    fn csv_reproduces_cells_and_order() {
        let artifact = export_table("doc1", &table(), ExportRequest::default()).unwrap();
        assert_eq!(artifact.filename, "doc1.csv");
        assert_eq!(artifact.media_type, "text/csv");

        let mut rdr = csv::Reader::from_reader(artifact.bytes.as_slice());
        let header: Vec<String> = rdr.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(header, vec!["Item", "Price"]);
        let rows: Vec<Vec<String>> = rdr
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        let expected: Vec<Vec<String>> = table().rows.into_iter().map(|r| r.cells).collect();
        assert_eq!(rows, expected);
    }

    #[test]
    fn confidence_column_is_appended() {
        let request = ExportRequest {
            format: ExportFormat::Csv,
            include_confidence: true,
        };
        let artifact = export_table("doc1", &table(), request).unwrap();
        let text = String::from_utf8(artifact.bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Item,Price,confidence"));
        assert_eq!(lines.next(), Some("\"Widget, large\",\"1,200.00\",0.910"));
    }

    #[test]
    fn headerless_tables_get_generated_columns() {
        let mut t = table();
        t.header.clear();
        t.rows[2].cells.push("extra".into());
        let artifact = export_table("d", &t, ExportRequest::default()).unwrap();
        let text = String::from_utf8(artifact.bytes).unwrap();
        assert!(text.starts_with("column_1,column_2,column_3\n"), "{text}");
    }

    #[test]
    fn json_export_omits_confidence_unless_asked() {
        let request = ExportRequest {
            format: ExportFormat::Json,
            include_confidence: false,
        };
        let artifact = export_table("doc1", &table(), request).unwrap();
        assert_eq!(artifact.filename, "doc1.json");
        let value: serde_json::Value = serde_json::from_slice(&artifact.bytes).unwrap();
        assert_eq!(value["rows"][0]["cells"][0], "Widget, large");
        assert!(value["rows"][0].get("confidence").is_none());

        let with = export_table(
            "doc1",
            &table(),
            ExportRequest {
                format: ExportFormat::Json,
                include_confidence: true,
            },
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&with.bytes).unwrap();
        assert_eq!(value["rows"][2]["confidence"], 1.0);
    }

    #[test]
    fn format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xlsx".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn export_is_deterministic() {
        let a = export_table("d", &table(), ExportRequest::default()).unwrap();
        let b = export_table("d", &table(), ExportRequest::default()).unwrap();
        assert_eq!(a, b);
    }
}
