//! Vertical chunking of rendered pages.
//!
//! A page is cut into bands of `chunk_height` pixels whose starts advance by
//! `chunk_height - chunk_overlap`. Consecutive bands therefore share exactly
//! `chunk_overlap` pixels, and the last band is clipped to the page bottom.
//!
//! ```text
//!  0 ┬──────────┐
//!    │ chunk 0  │
//!    │      ┌───┼── y0(1)
//!    │      │ overlap band
//!    └──────┼───┘── y1(0)
//!           │ chunk 1
//!           └──── page_height (clipped)
//! ```

use crate::error::TableError;
use crate::pipeline::render::RenderedPage;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Vertical pixel range `[y0, y1)` of one chunk on its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// 1-indexed page number.
    pub page_number: usize,
    /// 0-indexed position within the page.
    pub chunk_index: usize,
    pub y0: u32,
    pub y1: u32,
}

impl ChunkSpan {
    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// A chunk span together with its image slice.
#[derive(Debug, Clone)]
pub struct ChunkImage {
    pub span: ChunkSpan,
    pub image: DynamicImage,
}

/// Compute the chunk spans for a page of `page_height` pixels.
///
/// # Errors
/// [`TableError::Config`] when `chunk_overlap >= chunk_height`.
pub fn plan_chunks(
    page_number: usize,
    page_height: u32,
    chunk_height: u32,
    chunk_overlap: u32,
) -> Result<Vec<ChunkSpan>, TableError> {
    if chunk_overlap >= chunk_height {
        return Err(TableError::Config(format!(
            "chunk overlap ({chunk_overlap}) must be smaller than chunk height ({chunk_height})"
        )));
    }

    let stride = chunk_height - chunk_overlap;
    let mut spans = Vec::new();
    if page_height == 0 {
        return Ok(spans);
    }

    let mut y0 = 0u32;
    loop {
        let y1 = y0.saturating_add(chunk_height).min(page_height);
        spans.push(ChunkSpan {
            page_number,
            chunk_index: spans.len(),
            y0,
            y1,
        });
        if y1 == page_height {
            break;
        }
        y0 += stride;
    }

    Ok(spans)
}

/// Slice a rendered page into chunk images.
pub fn slice_page(
    page: &RenderedPage,
    chunk_height: u32,
    chunk_overlap: u32,
) -> Result<Vec<ChunkImage>, TableError> {
    let width = page.width();
    let spans = plan_chunks(page.page_number, page.height(), chunk_height, chunk_overlap)?;
    Ok(spans
        .into_iter()
        .map(|span| ChunkImage {
            image: page.image.crop_imm(0, span.y0, width, span.height()),
            span,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(spans: &[ChunkSpan], page_height: u32, height: u32, overlap: u32) {
        assert!(!spans.is_empty());
        assert_eq!(spans[0].y0, 0);
        assert_eq!(spans.last().unwrap().y1, page_height);
        for (i, s) in spans.iter().enumerate() {
            assert_eq!(s.chunk_index, i);
            assert!(s.y0 < s.y1);
            assert!(s.height() <= height);
        }
        for pair in spans.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(b.y0 > a.y0, "ascending");
            assert_eq!(a.height(), height, "only the last chunk may be short");
            assert_eq!(a.y1 - b.y0, overlap, "consecutive chunks share the overlap");
        }
    }

    #[test]
    fn short_page_is_one_chunk() {
        let spans = plan_chunks(1, 300, 500, 50).unwrap();
        assert_eq!(
            spans,
            vec![ChunkSpan {
                page_number: 1,
                chunk_index: 0,
                y0: 0,
                y1: 300
            }]
        );
    }

    #[test]
    fn exact_height_is_one_chunk() {
        let spans = plan_chunks(1, 500, 500, 50).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].y1, 500);
    }

    #[test]
    fn tall_page_overlaps_and_clips() {
        let spans = plan_chunks(4, 1200, 500, 50).unwrap();
        let ranges: Vec<(u32, u32)> = spans.iter().map(|s| (s.y0, s.y1)).collect();
        assert_eq!(ranges, vec![(0, 500), (450, 950), (900, 1200)]);
        assert!(spans.iter().all(|s| s.page_number == 4));
        assert_invariants(&spans, 1200, 500, 50);
    }

    #[test]
    fn invariants_hold_across_page_heights() {
        for page_height in (1..4000).step_by(37) {
            for (height, overlap) in [(500, 50), (100, 0), (300, 299), (1000, 100)] {
                let spans = plan_chunks(1, page_height, height, overlap).unwrap();
                assert_invariants(&spans, page_height, height, overlap);
            }
        }
    }

    #[test]
    fn overlap_not_smaller_than_height_is_config_error() {
        assert!(matches!(
            plan_chunks(1, 1000, 100, 100),
            Err(TableError::Config(_))
        ));
        assert!(matches!(plan_chunks(1, 1000, 0, 0), Err(TableError::Config(_))));
    }

    #[test]
    fn slices_match_spans() {
        let page = RenderedPage::new(1, DynamicImage::new_rgb8(40, 1200));
        let chunks = slice_page(&page, 500, 50).unwrap();
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert_eq!(c.image.width(), 40);
            assert_eq!(c.image.height(), c.span.height());
        }
    }
}
