//! Prompts for VLM-based table extraction.
//!
//! Every prompt lives here so the extraction contract the parser relies on
//! (JSON shape, normalised bbox coordinates, pipe-text fallback) is written
//! down in exactly one place.
//!
//! Callers can override the default via
//! [`crate::config::ExtractionConfig::system_prompt`]; the parser still
//! accepts both the JSON and the pipe-delimited shapes regardless.

/// Default system prompt for extracting the table rows visible in one chunk.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert table transcriber. The image is a horizontal band cut from a scanned or rendered PDF page. Extract every table row visible in the band.

Follow these rules precisely:

1. CONTENT
   - Transcribe cell text exactly as printed; never reformat numbers, dates or currency
   - Keep empty cells as empty strings so every row keeps its column positions
   - Include a row even if it is cut at the top or bottom edge of the image

2. HEADER
   - If column headings are visible in the band, return them as "header"
   - If no headings are visible, return "header": []

3. GEOMETRY
   - For every row give "bbox": [x0, y0, x1, y1] as fractions (0.0–1.0) of the image width and height
   - y0 is the top of the row, y1 the bottom

4. CONFIDENCE
   - Give "confidence" between 0.0 and 1.0 for how sure you are the row is transcribed correctly

5. OUTPUT FORMAT
   - Output ONLY one JSON object, no commentary, no Markdown fences:
     {"header": ["..."], "rows": [{"cells": ["..."], "bbox": [0.0, 0.1, 1.0, 0.2], "confidence": 0.95}]}
   - If the band contains no table at all, output {"header": [], "rows": []}"#;

/// User-turn text sent alongside the chunk image.
///
/// Tells the model where the band sits on the page so it can tell a restated
/// header from a data row.
pub fn chunk_instruction(page_number: usize, chunk_index: usize, chunk_count: usize) -> String {
    format!(
        "Page {page_number}, band {} of {chunk_count}. Return the JSON object only.",
        chunk_index + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_documents_the_json_contract() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"header\""));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"bbox\""));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"confidence\""));
    }

    #[test]
    fn chunk_instruction_is_one_based() {
        assert_eq!(
            chunk_instruction(3, 0, 2),
            "Page 3, band 1 of 2. Return the JSON object only."
        );
    }
}
