//! Chunk parser: raw extraction output → header + rows.
//!
//! Vision models are asked for a JSON object (see [`crate::prompts`]) but do
//! not always comply. The parser normalises the text first (outer code fences,
//! line endings, invisible Unicode), then tries, in order:
//!
//! 1. **JSON**: `{"header": [...], "rows": [...]}` where a row is either an
//!    array of cells or `{"cells": [...], "confidence": f, "bbox": [..4]}`.
//! 2. **Pipe-delimited text**: `| a | b |` lines; a header is recognised when
//!    the first table line is followed by a `| --- |` separator row.
//!
//! Anything else (prose, a truncated JSON object, an empty answer) is a
//! [`ChunkError::ParseFailed`]: the chunk contributes zero rows.
//!
//! Bounding boxes are returned in page coordinates. Rows without a usable bbox
//! get an estimate that splits the chunk height evenly among its rows, flagged
//! with [`Row::bbox_estimated`].

use crate::error::ChunkError;
use crate::pipeline::chunk::ChunkSpan;
use crate::table::{BoundingBox, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::value::RawValue;

/// Confidence cap for rows whose cell count disagrees with the chunk header.
pub const MALFORMED_ROW_CONFIDENCE: f32 = 0.3;

/// Header and rows recovered from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    /// Column labels, when the chunk showed them.
    pub header: Option<Vec<String>>,
    /// Rows in top-to-bottom order, bbox in page coordinates.
    pub rows: Vec<Row>,
}

/// Parse the raw backend answer for the chunk at `span`.
pub fn parse_chunk_output(
    raw: &str,
    span: &ChunkSpan,
    page_width: u32,
) -> Result<ParsedChunk, ChunkError> {
    let text = normalise(raw);
    if text.is_empty() {
        return Err(parse_failed("empty response"));
    }

    let json_error = match parse_json_table(&text) {
        Some(Ok(table)) => return Ok(build_json_chunk(table, span, page_width)),
        Some(Err(e)) => Some(e),
        None => None,
    };

    if let Some((header, rows)) = parse_pipe_table(&text) {
        return Ok(build_pipe_chunk(header, rows, span, page_width));
    }

    Err(match json_error {
        Some(e) => parse_failed(format!("truncated or malformed JSON: {e}")),
        None => parse_failed("no tabular content in response"),
    })
}

fn parse_failed(detail: impl Into<String>) -> ChunkError {
    ChunkError::ParseFailed {
        detail: detail.into(),
    }
}

// ── Normalisation ────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*?)\n?```\s*$").unwrap());

fn normalise(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    );
    let trimmed = s.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => trimmed.to_string(),
    }
}

// ── JSON shape ───────────────────────────────────────────────────────────────

// Cells stay raw so numbers keep their source text ("10.50" is not "10.5").
#[derive(Debug, Deserialize)]
struct WireTable {
    #[serde(default)]
    header: Option<Vec<Box<RawValue>>>,
    rows: Vec<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
struct DetailedRow {
    #[serde(alias = "values")]
    cells: Vec<Box<RawValue>>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
}

#[derive(Debug)]
struct JsonTable {
    header: Option<Vec<String>>,
    rows: Vec<JsonRow>,
}

#[derive(Debug)]
struct JsonRow {
    cells: Vec<String>,
    confidence: Option<f64>,
    bbox: Option<Vec<f64>>,
}

/// `None` when the text holds no JSON object at all.
fn parse_json_table(text: &str) -> Option<Result<JsonTable, serde_json::Error>> {
    let start = text.find('{')?;
    let candidate = match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    };
    Some(decode_table(candidate))
}

fn decode_table(candidate: &str) -> Result<JsonTable, serde_json::Error> {
    let wire: WireTable = serde_json::from_str(candidate)?;
    let header = wire
        .header
        .map(|h| h.iter().map(|c| cell_text(c)).collect::<Vec<String>>());
    let rows = wire
        .rows
        .iter()
        .map(|row| decode_row(row))
        .collect::<Result<Vec<JsonRow>, _>>()?;
    Ok(JsonTable { header, rows })
}

/// A row is either a bare cell array or an object with `cells`.
fn decode_row(raw: &RawValue) -> Result<JsonRow, serde_json::Error> {
    if raw.get().trim_start().starts_with('{') {
        let row: DetailedRow = serde_json::from_str(raw.get())?;
        Ok(JsonRow {
            cells: row.cells.iter().map(|c| cell_text(c)).collect(),
            confidence: row.confidence,
            bbox: row.bbox,
        })
    } else {
        let cells: Vec<Box<RawValue>> = serde_json::from_str(raw.get())?;
        Ok(JsonRow {
            cells: cells.iter().map(|c| cell_text(c)).collect(),
            confidence: None,
            bbox: None,
        })
    }
}

/// Strings are unescaped and trimmed, `null` is empty, anything else is kept
/// exactly as written.
fn cell_text(raw: &RawValue) -> String {
    let text = raw.get().trim();
    if text.starts_with('"') {
        serde_json::from_str::<String>(text)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| text.to_string())
    } else if text == "null" {
        String::new()
    } else {
        text.to_string()
    }
}

fn build_json_chunk(table: JsonTable, span: &ChunkSpan, page_width: u32) -> ParsedChunk {
    let header = table
        .header
        .filter(|h| h.iter().any(|c| !c.is_empty()));

    let wire_rows: Vec<JsonRow> = table
        .rows
        .into_iter()
        .filter(|row| row.cells.iter().any(|c| !c.is_empty()))
        .collect();

    let n = wire_rows.len();
    let width = header.as_ref().map(Vec::len);
    let rows = wire_rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let confidence = row
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0) as f32)
                .unwrap_or_else(|| fallback_confidence(&row.cells, width));
            match row.bbox.and_then(|b| wire_bbox(&b, span, page_width)) {
                Some(bbox) => make_row(row.cells, confidence, bbox, false, span),
                None => {
                    let bbox = estimated_bbox(i, n, span, page_width);
                    make_row(row.cells, confidence, bbox, true, span)
                }
            }
        })
        .collect();

    ParsedChunk { header, rows }
}

/// Convert a `[x0, y0, x1, y1]` bbox to page coordinates.
///
/// Values all within `[0, 1]` are fractions of the chunk image; anything else
/// is chunk pixels.
fn wire_bbox(b: &[f64], span: &ChunkSpan, page_width: u32) -> Option<BoundingBox> {
    if b.len() != 4 || b.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return None;
    }
    let (sx, sy) = if b.iter().all(|v| *v <= 1.0) {
        (page_width as f64, span.height() as f64)
    } else {
        (1.0, 1.0)
    };
    let local = BoundingBox::new(
        (b[0] * sx) as f32,
        (b[1] * sy) as f32,
        (b[2] * sx) as f32,
        (b[3] * sy) as f32,
    );
    if local.y1 < local.y0 {
        return None;
    }
    Some(local.translate_y(span.y0 as f32))
}

// ── Pipe-delimited shape ─────────────────────────────────────────────────────

type PipeTable = (Option<Vec<String>>, Vec<Vec<String>>);

fn parse_pipe_table(text: &str) -> Option<PipeTable> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && (l.contains('|') || is_rule_line(l)))
        .collect();
    if !lines.iter().any(|l| l.contains('|') && !is_separator_row(l)) {
        return None;
    }

    let mut header = None;
    let mut rows = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if is_separator_row(line) || is_rule_line(line) {
            continue;
        }
        let cells = split_pipe_row(line);
        if cells.is_empty() || cells.iter().all(String::is_empty) {
            continue;
        }
        let followed_by_separator = lines.get(i + 1).is_some_and(|n| is_separator_row(n));
        if header.is_none() && rows.is_empty() && followed_by_separator {
            header = Some(cells);
        } else {
            rows.push(cells);
        }
    }
    Some((header, rows))
}

/// Split `| a | b |` into `["a", "b"]`, dropping the empty outer cells.
fn split_pipe_row(line: &str) -> Vec<String> {
    let mut parts: Vec<String> = line.split('|').map(|p| p.trim().to_string()).collect();
    if parts.first().is_some_and(String::is_empty) {
        parts.remove(0);
    }
    if parts.last().is_some_and(String::is_empty) {
        parts.pop();
    }
    parts
}

fn is_separator_row(line: &str) -> bool {
    line.contains('|')
        && line.contains('-')
        && line
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c == ' ')
}

fn is_rule_line(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| c == '-')
}

fn build_pipe_chunk(
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
    span: &ChunkSpan,
    page_width: u32,
) -> ParsedChunk {
    let n = rows.len();
    let width = header.as_ref().map(Vec::len);
    let rows = rows
        .into_iter()
        .enumerate()
        .map(|(i, cells)| {
            let confidence = fallback_confidence(&cells, width);
            let bbox = estimated_bbox(i, n, span, page_width);
            make_row(cells, confidence, bbox, true, span)
        })
        .collect();
    ParsedChunk { header, rows }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn make_row(
    cells: Vec<String>,
    confidence: f32,
    bbox: BoundingBox,
    bbox_estimated: bool,
    span: &ChunkSpan,
) -> Row {
    Row {
        cells,
        confidence,
        bbox: Some(bbox),
        bbox_estimated,
        page_number: span.page_number,
        chunk_index: span.chunk_index,
    }
}

/// Fraction of non-empty cells; capped low when the row width is wrong.
fn fallback_confidence(cells: &[String], header_width: Option<usize>) -> f32 {
    if cells.is_empty() {
        return 0.0;
    }
    let filled = cells.iter().filter(|c| !c.trim().is_empty()).count();
    let completeness = filled as f32 / cells.len() as f32;
    match header_width {
        Some(w) if w != cells.len() => completeness.min(MALFORMED_ROW_CONFIDENCE),
        _ => completeness,
    }
}

/// Row `i` of `n` gets the `i`-th of `n` equal horizontal bands of the chunk.
fn estimated_bbox(i: usize, n: usize, span: &ChunkSpan, page_width: u32) -> BoundingBox {
    let h = span.height() as f32 / n.max(1) as f32;
    let y0 = i as f32 * h;
    let y1 = (y0 + h).min(span.height() as f32);
    BoundingBox::new(0.0, y0, page_width as f32, y1).translate_y(span.y0 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(y0: u32, y1: u32) -> ChunkSpan {
        ChunkSpan {
            page_number: 2,
            chunk_index: 1,
            y0,
            y1,
        }
    }

    #[test]
    fn parses_json_with_confidence_and_normalised_bbox() {
        let raw = r#"{"header": ["Name", "Amount"], "rows": [
            {"cells": ["Alice", "10.00"], "confidence": 0.9, "bbox": [0.0, 0.0, 1.0, 0.5]},
            {"cells": ["Bob", "20.00"], "confidence": 0.8, "bbox": [0.0, 0.5, 1.0, 1.0]}
        ]}"#;
        let parsed = parse_chunk_output(raw, &span(450, 950), 800).unwrap();
        assert_eq!(parsed.header, Some(vec!["Name".into(), "Amount".into()]));
        assert_eq!(parsed.rows.len(), 2);
        let first = &parsed.rows[0];
        assert_eq!(first.cells, vec!["Alice", "10.00"]);
        assert_eq!(first.confidence, 0.9);
        assert_eq!(first.bbox, Some(BoundingBox::new(0.0, 450.0, 800.0, 700.0)));
        assert_eq!(first.page_number, 2);
        assert_eq!(first.chunk_index, 1);
    }

    #[test]
    fn pixel_bbox_is_translated_by_chunk_offset() {
        let raw = r#"{"rows": [{"cells": ["x"], "bbox": [10, 20, 300, 60]}]}"#;
        let parsed = parse_chunk_output(raw, &span(900, 1400), 800).unwrap();
        assert_eq!(
            parsed.rows[0].bbox,
            Some(BoundingBox::new(10.0, 920.0, 300.0, 960.0))
        );
        assert_eq!(parsed.header, None);
    }

    #[test]
    fn fenced_json_with_plain_cell_arrays() {
        let raw = "```json\n{\"header\": [], \"rows\": [[\"a\", 1.5, null], [\"b\", 2, true]]}\n```";
        let parsed = parse_chunk_output(raw, &span(0, 100), 100).unwrap();
        assert_eq!(parsed.header, None);
        assert_eq!(parsed.rows[0].cells, vec!["a", "1.5", ""]);
        assert_eq!(parsed.rows[1].cells, vec!["b", "2", "true"]);
        // no confidence given: completeness fallback
        assert!((parsed.rows[0].confidence - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(parsed.rows[1].confidence, 1.0);
        // estimated bands split the chunk evenly
        assert_eq!(parsed.rows[0].bbox, Some(BoundingBox::new(0.0, 0.0, 100.0, 50.0)));
        assert_eq!(parsed.rows[1].bbox, Some(BoundingBox::new(0.0, 50.0, 100.0, 100.0)));
        assert!(parsed.rows.iter().all(|r| r.bbox_estimated));
        assert_eq!(parsed.rows[0].measured_bbox(), None);
    }

    #[test]
    fn numeric_cells_keep_their_source_text() {
        let raw = r#"{"header": ["Item", 2024], "rows": [["Total", 10.50, 1e3, -0.0]]}"#;
        let parsed = parse_chunk_output(raw, &span(0, 100), 100).unwrap();
        assert_eq!(parsed.header, Some(vec!["Item".into(), "2024".into()]));
        assert_eq!(parsed.rows[0].cells, vec!["Total", "10.50", "1e3", "-0.0"]);
    }

    #[test]
    fn reported_bbox_is_not_marked_estimated() {
        let raw = r#"{"rows": [{"values": ["a", 1.10], "bbox": [0, 0, 1, 1]}, ["b", "2"]]}"#;
        let parsed = parse_chunk_output(raw, &span(0, 100), 100).unwrap();
        assert_eq!(parsed.rows[0].cells, vec!["a", "1.10"]);
        assert!(!parsed.rows[0].bbox_estimated);
        assert!(parsed.rows[0].measured_bbox().is_some());
        assert!(parsed.rows[1].bbox_estimated);
    }

    #[test]
    fn malformed_rows_get_low_confidence() {
        let raw = r#"{"header": ["A", "B", "C"], "rows": [["1", "2", "3"], ["1", "2"]]}"#;
        let parsed = parse_chunk_output(raw, &span(0, 100), 100).unwrap();
        assert_eq!(parsed.rows[0].confidence, 1.0);
        assert_eq!(parsed.rows[1].confidence, MALFORMED_ROW_CONFIDENCE);
    }

    #[test]
    fn pipe_table_with_header_separator() {
        let raw = "Here is the table:\n| Name | Amount |\n| --- | ---: |\n| Alice | 10 |\n| Bob | |\n";
        let parsed = parse_chunk_output(raw, &span(0, 200), 400).unwrap();
        assert_eq!(parsed.header, Some(vec!["Name".into(), "Amount".into()]));
        let cells: Vec<_> = parsed.rows.iter().map(|r| r.cells.clone()).collect();
        assert_eq!(cells, vec![vec!["Alice", "10"], vec!["Bob", ""]]);
        assert_eq!(parsed.rows[1].confidence, 0.5);
        assert!(parsed.rows.iter().all(|r| r.bbox_estimated));
    }

    #[test]
    fn pipe_table_without_separator_has_no_header() {
        let raw = "a | b\n-----\nc | d";
        let parsed = parse_chunk_output(raw, &span(0, 200), 400).unwrap();
        assert_eq!(parsed.header, None);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].cells, vec!["a", "b"]);
    }

    #[test]
    fn crlf_and_invisible_chars_are_normalised() {
        let raw = "| A\u{200B} | B |\r\n|---|---|\r\n| 1 | 2 |\r\n";
        let parsed = parse_chunk_output(raw, &span(0, 100), 100).unwrap();
        assert_eq!(parsed.header, Some(vec!["A".into(), "B".into()]));
        assert_eq!(parsed.rows[0].cells, vec!["1", "2"]);
    }

    #[test]
    fn prose_is_parse_failure() {
        let err = parse_chunk_output("I cannot see a table here.", &span(0, 100), 100).unwrap_err();
        assert!(matches!(err, ChunkError::ParseFailed { .. }));
    }

    #[test]
    fn truncated_json_is_parse_failure() {
        let err =
            parse_chunk_output(r#"{"header": ["A"], "rows": [["1"], ["2"#, &span(0, 100), 100)
                .unwrap_err();
        match err {
            ChunkError::ParseFailed { detail } => assert!(detail.contains("JSON"), "{detail}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_answer_is_parse_failure() {
        assert!(parse_chunk_output("  \n ", &span(0, 100), 100).is_err());
    }

    #[test]
    fn empty_json_table_is_zero_rows_not_failure() {
        let parsed = parse_chunk_output(r#"{"header": [], "rows": []}"#, &span(0, 100), 100).unwrap();
        assert!(parsed.rows.is_empty());
        assert_eq!(parsed.header, None);
    }
}
