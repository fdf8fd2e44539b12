//! On-disk layout of one document.
//!
//! ```text
//! <storage_dir>/<document_id>/
//!   original.pdf
//!   pages/<n>.png
//!   chunks/page_<n>/chunk_<i>.png     (save_chunk_images)
//!   raw/page_<n>/chunk_<i>.txt        (save_raw_output)
//!   raw/error.txt                     (on Failed)
//!   tables/page_<n>.json
//!   tables/global.json
//!   exports/<document_id>.<ext>
//! ```
//!
//! All writes go through `tokio::fs`; PNG encoding runs on the blocking pool.

use crate::error::TableError;
use image::DynamicImage;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Root directory under which every document gets its own folder.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths for `document_id`; nothing is created on disk.
    pub fn document(&self, document_id: &str) -> DocumentPaths {
        DocumentPaths {
            dir: self.root.join(document_id),
        }
    }
}

/// Every artifact path of one document.
#[derive(Debug, Clone)]
pub struct DocumentPaths {
    dir: PathBuf,
}

impl DocumentPaths {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn original_pdf(&self) -> PathBuf {
        self.dir.join("original.pdf")
    }

    pub fn page_image(&self, page_number: usize) -> PathBuf {
        self.dir.join("pages").join(format!("{page_number}.png"))
    }

    pub fn chunk_image(&self, page_number: usize, chunk_index: usize) -> PathBuf {
        self.dir
            .join("chunks")
            .join(format!("page_{page_number}"))
            .join(format!("chunk_{chunk_index}.png"))
    }

    pub fn raw_output(&self, page_number: usize, chunk_index: usize) -> PathBuf {
        self.dir
            .join("raw")
            .join(format!("page_{page_number}"))
            .join(format!("chunk_{chunk_index}.txt"))
    }

    pub fn error_file(&self) -> PathBuf {
        self.dir.join("raw").join("error.txt")
    }

    pub fn page_table(&self, page_number: usize) -> PathBuf {
        self.dir.join("tables").join(format!("page_{page_number}.json"))
    }

    pub fn global_table(&self) -> PathBuf {
        self.dir.join("tables").join("global.json")
    }

    pub fn export_file(&self, filename: &str) -> PathBuf {
        self.dir.join("exports").join(filename)
    }
}

fn storage_error(path: &Path, source: io::Error) -> TableError {
    TableError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path`, creating parent directories.
pub async fn write_bytes(path: &Path, bytes: impl AsRef<[u8]>) -> Result<(), TableError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_error(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| storage_error(path, e))
}

/// Serialise `value` as pretty JSON to `path`.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TableError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| TableError::Internal(format!("JSON encoding failed: {e}")))?;
    write_bytes(path, json).await
}

pub async fn read_bytes(path: &Path) -> Result<Vec<u8>, TableError> {
    tokio::fs::read(path).await.map_err(|e| storage_error(path, e))
}

/// Encode `image` as PNG on the blocking pool and write it to `path`.
pub async fn write_png(path: &Path, image: DynamicImage) -> Result<(), TableError> {
    let png = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        image
            .write_to(&mut io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .map(|_| buf)
    })
    .await
    .map_err(|e| TableError::Internal(format!("PNG encode task panicked: {e}")))?
    .map_err(|e| storage_error(path, io::Error::other(e.to_string())))?;
    write_bytes(path, png).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_documented_tree() {
        let store = DocumentStore::new("/data");
        let doc = store.document("abc");
        assert_eq!(doc.dir(), Path::new("/data/abc"));
        assert_eq!(doc.original_pdf(), Path::new("/data/abc/original.pdf"));
        assert_eq!(doc.page_image(3), Path::new("/data/abc/pages/3.png"));
        assert_eq!(
            doc.chunk_image(2, 1),
            Path::new("/data/abc/chunks/page_2/chunk_1.png")
        );
        assert_eq!(doc.raw_output(2, 0), Path::new("/data/abc/raw/page_2/chunk_0.txt"));
        assert_eq!(doc.error_file(), Path::new("/data/abc/raw/error.txt"));
        assert_eq!(doc.page_table(1), Path::new("/data/abc/tables/page_1.json"));
        assert_eq!(doc.global_table(), Path::new("/data/abc/tables/global.json"));
        assert_eq!(
            doc.export_file("abc.csv"),
            Path::new("/data/abc/exports/abc.csv")
        );
    }

    #[tokio::test]
    async fn writes_create_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let doc = DocumentStore::new(dir.path()).document("d1");

        write_json(&doc.page_table(1), &serde_json::json!({"rows": []}))
            .await
            .unwrap();
        let back = read_bytes(&doc.page_table(1)).await.unwrap();
        assert!(String::from_utf8(back).unwrap().contains("rows"));

        write_png(&doc.page_image(1), DynamicImage::new_rgb8(3, 3))
            .await
            .unwrap();
        let png = read_bytes(&doc.page_image(1)).await.unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[tokio::test]
    async fn missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_bytes(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, TableError::Storage { .. }));
    }
}
