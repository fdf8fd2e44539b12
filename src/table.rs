//! Table data model: rows, page tables and the document-wide table.
//!
//! All coordinates are pixels in the rendered page image, top-left origin.
//! Every type here is plain data (`Clone + Serialize`) so page tables can be
//! persisted as JSON and handed to pollers behind an `Arc`.

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in page-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Vertical centre of the box.
    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) / 2.0
    }

    /// Shift the box down by `dy` pixels (chunk-local → page-local).
    pub fn translate_y(self, dy: f32) -> Self {
        Self {
            y0: self.y0 + dy,
            y1: self.y1 + dy,
            ..self
        }
    }
}

/// One extracted table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Cell values, copied verbatim from the extraction output.
    pub cells: Vec<String>,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Location on the page, when known.
    pub bbox: Option<BoundingBox>,
    /// `bbox` was spread evenly over the chunk rather than reported.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bbox_estimated: bool,
    /// 1-indexed source page.
    pub page_number: usize,
    /// 0-indexed source chunk within the page.
    pub chunk_index: usize,
}

impl Row {
    /// Pad with empty strings or truncate so the row has exactly `width` cells.
    pub fn align_to(&mut self, width: usize) {
        self.cells.resize(width, String::new());
    }

    /// The reported location, ignoring estimates.
    pub fn measured_bbox(&self) -> Option<BoundingBox> {
        self.bbox.filter(|_| !self.bbox_estimated)
    }
}

/// A chunk that contributed no rows to its page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedChunk {
    pub chunk_index: usize,
    pub error: ChunkError,
}

/// The assembled table of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTable {
    /// 1-indexed page number.
    pub page_number: usize,
    /// Column labels; empty when no chunk yielded a header.
    pub header: Vec<String>,
    /// Rows in top-to-bottom order.
    pub rows: Vec<Row>,
    /// Number of chunks the page was split into.
    pub chunk_count: usize,
    /// Chunks that failed extraction or parsing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_chunks: Vec<DroppedChunk>,
}

impl PageTable {
    /// An explicitly empty table (no header, no rows).
    pub fn empty(page_number: usize, chunk_count: usize) -> Self {
        Self {
            page_number,
            header: Vec::new(),
            rows: Vec::new(),
            chunk_count,
            dropped_chunks: Vec::new(),
        }
    }

    /// `true` when at least one chunk of the page was dropped.
    pub fn is_degraded(&self) -> bool {
        !self.dropped_chunks.is_empty()
    }

    /// Human-readable degradation note, `None` when nothing was dropped.
    pub fn message(&self) -> Option<String> {
        match self.dropped_chunks.len() {
            0 => None,
            n => Some(format!(
                "Page {}: {} of {} chunk{} dropped",
                self.page_number,
                n,
                self.chunk_count,
                if self.chunk_count == 1 { "" } else { "s" }
            )),
        }
    }
}

/// A row of the document-wide table with its source attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRow {
    /// 1-indexed page the row came from.
    pub page_number: usize,
    /// 0-indexed position of the row within its page table.
    pub row_index_on_page: usize,
    pub cells: Vec<String>,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

/// The reconciled table spanning the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTable {
    pub header: Vec<String>,
    pub rows: Vec<GlobalRow>,
    /// Pages whose own non-empty header differs from `header`; their rows were
    /// repositioned by column index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_mismatch_pages: Vec<usize>,
}
