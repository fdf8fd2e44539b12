//! Two-level table assembly: chunk results → [`PageTable`] → [`GlobalTable`].
//!
//! Both steps are pure functions over already-resolved data, so they run once
//! every chunk slot of a page (or every page of a document) is filled and the
//! result does not depend on the order in which extraction calls completed.

use crate::error::ChunkError;
use crate::pipeline::chunk::ChunkSpan;
use crate::pipeline::parse::ParsedChunk;
use crate::table::{DroppedChunk, GlobalRow, GlobalTable, PageTable, Row};
use tracing::debug;

/// What became of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Parsed(ParsedChunk),
    Failed(ChunkError),
}

/// A resolved chunk slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub span: ChunkSpan,
    pub outcome: ChunkOutcome,
}

impl ChunkResult {
    pub fn parsed(span: ChunkSpan, chunk: ParsedChunk) -> Self {
        Self {
            span,
            outcome: ChunkOutcome::Parsed(chunk),
        }
    }

    pub fn failed(span: ChunkSpan, error: ChunkError) -> Self {
        Self {
            span,
            outcome: ChunkOutcome::Failed(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Failed(_))
    }
}

/// Merge the resolved chunks of one page into its table.
///
/// `results` may arrive in any order; they are processed by chunk index.
/// Rows in the overlap band of two adjacent successful chunks that carry the
/// same cells are emitted once, keeping the higher-confidence copy (the
/// earlier one on ties). When either chunk has only estimated boxes, the
/// tail of the first chunk is matched against the head of the second
/// instead.
pub fn assemble_page(page_number: usize, results: &[ChunkResult]) -> PageTable {
    let mut ordered: Vec<&ChunkResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.span.chunk_index);

    let mut table = PageTable::empty(page_number, results.len());

    let header = ordered
        .iter()
        .filter_map(|r| match &r.outcome {
            ChunkOutcome::Parsed(p) => p.header.as_ref(),
            ChunkOutcome::Failed(_) => None,
        })
        .find(|h| !h.is_empty())
        .cloned()
        .unwrap_or_default();

    // (span, rows) for successful chunks; failures are recorded and skipped.
    let mut slots: Vec<(ChunkSpan, Vec<Row>)> = Vec::with_capacity(ordered.len());
    for result in &ordered {
        match &result.outcome {
            ChunkOutcome::Parsed(parsed) => {
                let mut rows = parsed.rows.clone();
                if !header.is_empty() {
                    for row in rows.iter_mut() {
                        row.align_to(header.len());
                    }
                    if rows.first().is_some_and(|r| r.cells == header) {
                        rows.remove(0);
                    }
                }
                slots.push((result.span, rows));
            }
            ChunkOutcome::Failed(error) => table.dropped_chunks.push(DroppedChunk {
                chunk_index: result.span.chunk_index,
                error: error.clone(),
            }),
        }
    }

    let mut dropped: Vec<Vec<bool>> = slots.iter().map(|(_, rows)| vec![false; rows.len()]).collect();
    for i in 1..slots.len() {
        let (prev_span, prev_rows) = &slots[i - 1];
        let (next_span, next_rows) = &slots[i];
        if next_span.chunk_index != prev_span.chunk_index + 1 || next_span.y0 >= prev_span.y1 {
            continue;
        }
        let (head, tail) = dropped.split_at_mut(i);
        if is_measured(prev_rows) && is_measured(next_rows) {
            let band = (next_span.y0 as f32, prev_span.y1 as f32);
            dedup_overlap(band, prev_rows, &mut head[i - 1], next_rows, &mut tail[0]);
        } else {
            dedup_boundary(prev_rows, &mut head[i - 1], next_rows, &mut tail[0]);
        }
    }

    table.header = header;
    table.rows = slots
        .into_iter()
        .zip(dropped)
        .flat_map(|((_, rows), flags)| {
            rows.into_iter()
                .zip(flags)
                .filter(|(_, drop)| !drop)
                .map(|(row, _)| row)
        })
        .collect();

    debug!(
        "Page {} assembled: {} rows from {} chunks ({} dropped)",
        page_number,
        table.rows.len(),
        table.chunk_count,
        table.dropped_chunks.len()
    );
    table
}

fn is_measured(rows: &[Row]) -> bool {
    rows.iter().all(|r| r.measured_bbox().is_some())
}

fn in_band(row: &Row, (lo, hi): (f32, f32)) -> bool {
    row.measured_bbox().is_some_and(|b| {
        let c = b.center_y();
        c >= lo && c < hi
    })
}

/// Pair head rows of the next chunk with tail rows of the previous chunk.
fn dedup_overlap(
    band: (f32, f32),
    prev: &[Row],
    prev_dropped: &mut [bool],
    next: &[Row],
    next_dropped: &mut [bool],
) {
    let mut matched = vec![false; prev.len()];
    for (j, candidate) in next.iter().enumerate() {
        if next_dropped[j] || !in_band(candidate, band) {
            continue;
        }
        let hit = prev.iter().enumerate().position(|(k, earlier)| {
            !matched[k] && !prev_dropped[k] && in_band(earlier, band) && earlier.cells == candidate.cells
        });
        if let Some(k) = hit {
            matched[k] = true;
            if candidate.confidence > prev[k].confidence {
                prev_dropped[k] = true;
            } else {
                next_dropped[j] = true;
            }
        }
    }
}

/// Without geometry: the longest run of tail rows of `prev` that equals the
/// head rows of `next`, compared cell by cell.
fn dedup_boundary(
    prev: &[Row],
    prev_dropped: &mut [bool],
    next: &[Row],
    next_dropped: &mut [bool],
) {
    let tail: Vec<usize> = (0..prev.len()).filter(|&k| !prev_dropped[k]).collect();
    let head: Vec<usize> = (0..next.len()).filter(|&j| !next_dropped[j]).collect();
    let longest = (1..=tail.len().min(head.len())).rev().find(|&run| {
        tail[tail.len() - run..]
            .iter()
            .zip(&head[..run])
            .all(|(&k, &j)| prev[k].cells == next[j].cells)
    });
    let Some(run) = longest else {
        return;
    };
    for (&k, &j) in tail[tail.len() - run..].iter().zip(&head[..run]) {
        if next[j].confidence > prev[k].confidence {
            prev_dropped[k] = true;
        } else {
            next_dropped[j] = true;
        }
    }
}

/// Merge page tables into the document-wide table.
///
/// The first non-empty page header becomes the global header; every row is
/// repositioned by column index to it.
pub fn assemble_document(pages: &[PageTable]) -> GlobalTable {
    let mut ordered: Vec<&PageTable> = pages.iter().collect();
    ordered.sort_by_key(|p| p.page_number);

    let header = ordered
        .iter()
        .map(|p| &p.header)
        .find(|h| !h.is_empty())
        .cloned()
        .unwrap_or_default();

    let mut header_mismatch_pages = Vec::new();
    let mut rows = Vec::new();
    for page in ordered {
        if !page.header.is_empty() && page.header != header {
            header_mismatch_pages.push(page.page_number);
        }
        for (index, row) in page.rows.iter().enumerate() {
            let mut cells = row.cells.clone();
            if !header.is_empty() {
                cells.resize(header.len(), String::new());
            }
            rows.push(GlobalRow {
                page_number: page.page_number,
                row_index_on_page: index,
                cells,
                confidence: row.confidence,
                bbox: row.bbox,
            });
        }
    }

    GlobalTable {
        header,
        rows,
        header_mismatch_pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::BoundingBox;

    fn span(chunk_index: usize, y0: u32, y1: u32) -> ChunkSpan {
        ChunkSpan {
            page_number: 1,
            chunk_index,
            y0,
            y1,
        }
    }

    fn row(chunk_index: usize, cells: &[&str], confidence: f32, y0: f32, y1: f32) -> Row {
        Row {
            cells: cells.iter().map(|c| c.to_string()).collect(),
            confidence,
            bbox: Some(BoundingBox::new(0.0, y0, 100.0, y1)),
            bbox_estimated: false,
            page_number: 1,
            chunk_index,
        }
    }

    fn parsed(header: Option<&[&str]>, rows: Vec<Row>) -> ParsedChunk {
        ParsedChunk {
            header: header.map(|h| h.iter().map(|c| c.to_string()).collect()),
            rows,
        }
    }

    fn cells(table: &PageTable) -> Vec<Vec<String>> {
        table.rows.iter().map(|r| r.cells.clone()).collect()
    }

    /// Two chunks overlapping on [450, 500); "b" is seen by both.
    fn overlapping(prev_conf: f32, next_conf: f32) -> Vec<ChunkResult> {
        vec![
            ChunkResult::parsed(
                span(0, 0, 500),
                parsed(
                    Some(&["k", "v"]),
                    vec![
                        row(0, &["a", "1"], 0.9, 400.0, 440.0),
                        row(0, &["b", "2"], prev_conf, 455.0, 495.0),
                    ],
                ),
            ),
            ChunkResult::parsed(
                span(1, 450, 900),
                parsed(
                    None,
                    vec![
                        row(1, &["b", "2"], next_conf, 456.0, 494.0),
                        row(1, &["c", "3"], 0.9, 500.0, 540.0),
                    ],
                ),
            ),
        ]
    }

    #[test]
    fn overlap_duplicates_are_emitted_once() {
        let table = assemble_page(1, &overlapping(0.6, 0.8));
        assert_eq!(
            cells(&table),
            vec![vec!["a", "1"], vec!["b", "2"], vec!["c", "3"]]
        );
        let kept = &table.rows[1];
        assert_eq!(kept.confidence, 0.8);
        assert_eq!(kept.chunk_index, 1);
        assert_eq!(table.header, vec!["k", "v"]);
        assert!(!table.is_degraded());
    }

    #[test]
    fn confidence_tie_keeps_earlier_copy() {
        let table = assemble_page(1, &overlapping(0.7, 0.7));
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[1].chunk_index, 0);
    }

    #[test]
    fn identical_rows_outside_the_band_are_kept() {
        let results = vec![
            ChunkResult::parsed(
                span(0, 0, 500),
                parsed(None, vec![row(0, &["x"], 1.0, 10.0, 40.0)]),
            ),
            ChunkResult::parsed(
                span(1, 450, 900),
                parsed(None, vec![row(1, &["x"], 1.0, 600.0, 640.0)]),
            ),
        ];
        assert_eq!(assemble_page(1, &results).rows.len(), 2);
    }

    fn estimated(chunk_index: usize, cells: &[&str], confidence: f32) -> Row {
        Row {
            bbox_estimated: true,
            ..row(chunk_index, cells, confidence, 0.0, 0.0)
        }
    }

    #[test]
    fn boundary_rows_without_geometry_are_emitted_once() {
        let results = vec![
            ChunkResult::parsed(
                span(0, 0, 1000),
                parsed(
                    None,
                    ["a", "b", "c", "d"]
                        .iter()
                        .map(|c| estimated(0, &[*c, "1"], 1.0))
                        .collect(),
                ),
            ),
            ChunkResult::parsed(
                span(1, 900, 1900),
                parsed(
                    None,
                    ["d", "e", "f"]
                        .iter()
                        .map(|c| estimated(1, &[*c, "1"], 1.0))
                        .collect(),
                ),
            ),
        ];
        let table = assemble_page(1, &results);
        let firsts: Vec<&str> = table.rows.iter().map(|r| r.cells[0].as_str()).collect();
        assert_eq!(firsts, vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(table.rows[3].chunk_index, 0);
    }

    #[test]
    fn boundary_match_keeps_the_more_confident_copy() {
        let results = vec![
            ChunkResult::parsed(
                span(0, 0, 500),
                parsed(
                    None,
                    vec![
                        estimated(0, &["x"], 0.9),
                        estimated(0, &["y"], 0.4),
                        estimated(0, &["z"], 0.4),
                    ],
                ),
            ),
            ChunkResult::parsed(
                span(1, 450, 900),
                parsed(
                    None,
                    vec![
                        estimated(1, &["y"], 0.8),
                        estimated(1, &["z"], 0.5),
                        estimated(1, &["w"], 0.9),
                    ],
                ),
            ),
        ];
        let table = assemble_page(1, &results);
        let kept: Vec<(String, usize)> = table
            .rows
            .iter()
            .map(|r| (r.cells[0].clone(), r.chunk_index))
            .collect();
        assert_eq!(
            kept,
            vec![
                ("x".to_string(), 0),
                ("y".to_string(), 1),
                ("z".to_string(), 1),
                ("w".to_string(), 1),
            ]
        );
    }

    #[test]
    fn distinct_boundary_rows_without_geometry_are_kept() {
        let results = vec![
            ChunkResult::parsed(span(0, 0, 500), parsed(None, vec![estimated(0, &["a"], 1.0)])),
            ChunkResult::parsed(span(1, 450, 900), parsed(None, vec![estimated(1, &["b"], 1.0)])),
        ];
        assert_eq!(assemble_page(1, &results).rows.len(), 2);
    }

    #[test]
    fn no_dedup_across_a_failed_chunk() {
        let results = vec![
            ChunkResult::parsed(
                span(0, 0, 500),
                parsed(None, vec![row(0, &["x"], 1.0, 460.0, 490.0)]),
            ),
            ChunkResult::failed(
                span(1, 450, 950),
                ChunkError::ExtractionFailed {
                    attempts: 3,
                    detail: "429".into(),
                },
            ),
            ChunkResult::parsed(
                span(2, 900, 1200),
                parsed(None, vec![row(2, &["x"], 1.0, 910.0, 940.0)]),
            ),
        ];
        let table = assemble_page(1, &results);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.dropped_chunks.len(), 1);
        assert_eq!(table.dropped_chunks[0].chunk_index, 1);
        assert_eq!(table.message().as_deref(), Some("Page 1: 1 of 3 chunks dropped"));
    }

    #[test]
    fn restated_header_row_is_dropped_and_rows_aligned() {
        let results = vec![
            ChunkResult::parsed(
                span(0, 0, 500),
                parsed(Some(&["A", "B"]), vec![row(0, &["1", "2", "extra"], 0.9, 0.0, 50.0)]),
            ),
            ChunkResult::parsed(
                span(1, 450, 900),
                parsed(
                    Some(&["A", "B"]),
                    vec![
                        row(1, &["A", "B"], 0.9, 500.0, 540.0),
                        row(1, &["3"], 0.9, 600.0, 640.0),
                    ],
                ),
            ),
        ];
        let table = assemble_page(1, &results);
        assert_eq!(cells(&table), vec![vec!["1", "2"], vec!["3", ""]]);
    }

    #[test]
    fn all_failed_is_explicitly_empty() {
        let results = vec![
            ChunkResult::failed(span(0, 0, 500), ChunkError::Cancelled),
            ChunkResult::failed(
                span(1, 450, 900),
                ChunkError::ParseFailed {
                    detail: "prose".into(),
                },
            ),
        ];
        let table = assemble_page(3, &results);
        assert!(table.rows.is_empty());
        assert!(table.header.is_empty());
        assert_eq!(table.page_number, 3);
        assert_eq!(table.dropped_chunks.len(), 2);
    }

    #[test]
    fn assembly_is_idempotent_and_order_independent() {
        let results = overlapping(0.6, 0.8);
        let first = assemble_page(1, &results);
        assert_eq!(first, assemble_page(1, &results));

        let mut reversed = results.clone();
        reversed.reverse();
        assert_eq!(first, assemble_page(1, &reversed));
    }

    fn page(page_number: usize, header: &[&str], rows: &[&[&str]]) -> PageTable {
        PageTable {
            page_number,
            header: header.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|cells| Row {
                    cells: cells.iter().map(|c| c.to_string()).collect(),
                    confidence: 1.0,
                    bbox: None,
                    bbox_estimated: false,
                    page_number,
                    chunk_index: 0,
                })
                .collect(),
            chunk_count: 1,
            dropped_chunks: Vec::new(),
        }
    }

    #[test]
    fn headerless_pages_align_to_first_header() {
        let pages = vec![
            page(2, &[], &[&["c", "3", "x"], &["d"]]),
            page(1, &["Name", "Qty"], &[&["a", "1"], &["b", "2"]]),
        ];
        let global = assemble_document(&pages);
        assert_eq!(global.header, vec!["Name", "Qty"]);
        let flat: Vec<(usize, usize, Vec<String>)> = global
            .rows
            .iter()
            .map(|r| (r.page_number, r.row_index_on_page, r.cells.clone()))
            .collect();
        assert_eq!(
            flat,
            vec![
                (1, 0, vec!["a".to_string(), "1".to_string()]),
                (1, 1, vec!["b".to_string(), "2".to_string()]),
                (2, 0, vec!["c".to_string(), "3".to_string()]),
                (2, 1, vec!["d".to_string(), String::new()]),
            ]
        );
        assert!(global.header_mismatch_pages.is_empty());
    }

    #[test]
    fn differing_headers_are_recorded() {
        let pages = vec![
            page(1, &[], &[]),
            page(2, &["A", "B"], &[&["1", "2"]]),
            page(3, &["X", "Y", "Z"], &[&["7", "8", "9"]]),
        ];
        let global = assemble_document(&pages);
        assert_eq!(global.header, vec!["A", "B"]);
        assert_eq!(global.header_mismatch_pages, vec![3]);
        assert_eq!(global.rows[1].cells, vec!["7", "8"]);
    }
}
