use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::SourceError;
use crate::model::WorkItem;

/// Load the ordered item list from a snapshot. Order is kept as-is.
pub fn load(path: &Path) -> Result<Vec<WorkItem>, SourceError> {
    let items: Vec<WorkItem> = load_json(path)?;
    info!("Loaded {} items from {}", items.len(), path.display());
    Ok(items)
}

/// Read any JSON snapshot file with the same error mapping as [`load`].
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let raw = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => SourceError::NotFound(path.to_path_buf()),
        _ => SourceError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Sub-range of `items`, bounds clamped to `[0, len]`. An inverted or empty
/// range gives an empty slice.
pub fn slice<T>(items: &[T], start: usize, end: Option<usize>) -> &[T] {
    let (start, end) = bounds(items.len(), start, end);
    &items[start..end]
}

/// Clamped `[start, end)` for a list of `len` items, with `start <= end`.
pub fn bounds(len: usize, start: usize, end: Option<usize>) -> (usize, usize) {
    let start = start.min(len);
    let end = end.unwrap_or(len).min(len);
    (start, end.max(start))
}
