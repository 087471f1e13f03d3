//! Offline passes over snapshots: folding batch results back into the
//! notes list, dropping boilerplate notes, rebuilding bodies from image
//! text, and coverage statistics.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::SourceError;
use crate::filter::{is_content_image, ContentFilter, SpamFilter};
use crate::model::{ImageText, WorkItem};
use crate::source;

const OCR_SEPARATOR: &str = "\n\n---\n\n### Text in images\n\n";

/// `batch-<start>-<end>.json` files in `dir`, ordered by start index.
pub fn batch_files(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let entries = fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SourceError::NotFound(dir.to_path_buf()),
        _ => SourceError::Io {
            path: dir.to_path_buf(),
            source: e,
        },
    })?;

    let mut files: Vec<(usize, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?;
            let range = name.strip_prefix("batch-")?.strip_suffix(".json")?;
            let start = range.split('-').next()?.parse().ok()?;
            Some((start, p))
        })
        .collect();
    files.sort();
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Every batch file in `dir`, read as plain records. Run bookkeeping such
/// as `status` is optional, so hand-made batch files load too.
pub fn load_batches(dir: &Path) -> Result<Vec<Vec<WorkItem>>, SourceError> {
    batch_files(dir)?
        .iter()
        .map(|path| {
            let batch: Vec<WorkItem> = source::load_json(path)?;
            info!("Loaded {} ({} notes)", path.display(), batch.len());
            Ok(batch)
        })
        .collect()
}

/// Attach recognized image text to each note, matched by URL without query.
/// Later batches win. Notes without a result get an empty list and
/// `ocrProcessed: false`.
pub fn merge_batches(notes: Vec<WorkItem>, batches: &[Vec<WorkItem>]) -> Vec<WorkItem> {
    let mut by_url: HashMap<&str, Vec<ImageText>> = HashMap::new();
    for record in batches.iter().flatten() {
        let texts = image_texts_of(record);
        if !texts.is_empty() {
            by_url.insert(record.base_url(), texts);
        }
    }

    notes
        .into_iter()
        .map(|mut note| {
            let texts = by_url.get(note.base_url());
            let value = texts
                .and_then(|t| serde_json::to_value(t).ok())
                .unwrap_or(Value::Array(Vec::new()));
            set_extra(&mut note, "imageTexts", value);
            set_extra(&mut note, "ocrProcessed", Value::Bool(texts.is_some()));
            note
        })
        .collect()
}

/// Fold per-range batch results into one list in snapshot order. A later
/// batch replaces an earlier record with the same id; records whose id is
/// not in `notes` are kept at the end.
pub fn combine_batches(notes: &[WorkItem], batches: Vec<Vec<WorkItem>>) -> Vec<WorkItem> {
    let mut latest: HashMap<String, WorkItem> = HashMap::new();
    let mut first_seen = Vec::new();
    for record in batches.into_iter().flatten() {
        if !latest.contains_key(&record.id) {
            first_seen.push(record.id.clone());
        }
        latest.insert(record.id.clone(), record);
    }

    let mut out = Vec::with_capacity(latest.len());
    for id in notes.iter().map(|n| &n.id).chain(first_seen.iter()) {
        if let Some(record) = latest.remove(id) {
            out.push(record);
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub notes: Vec<WorkItem>,
    pub removed: usize,
    pub images_before: usize,
    pub images_after: usize,
}

/// Drop notes whose body fails `filter`; strip avatars and other
/// non-content pictures from the rest.
pub fn clean(notes: Vec<WorkItem>, filter: &dyn ContentFilter) -> CleanReport {
    let mut report = CleanReport::default();
    for mut note in notes {
        if !filter.is_valid(note.content().unwrap_or_default()) {
            info!("Removed {} ({})", note.display_name(), note.id);
            report.removed += 1;
            continue;
        }
        if let Some(images) = note.take_images() {
            report.images_before += images.len();
            let kept: Vec<String> = images.into_iter().filter(|u| is_content_image(u)).collect();
            report.images_after += kept.len();
            set_extra(&mut note, "imageCount", Value::from(kept.len()));
            note.set_images(kept);
        }
        report.notes.push(note);
    }
    report
}

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub notes: Vec<WorkItem>,
    pub spam: usize,
    pub from_images_only: usize,
    pub dropped: usize,
}

/// Replace boilerplate bodies with the text recognized in the note's
/// images, or append that text to a real body. Notes left without a
/// usable body are dropped.
pub fn rebuild(notes: Vec<WorkItem>, filter: &SpamFilter, min_chars: usize) -> RebuildReport {
    let mut report = RebuildReport::default();
    for mut note in notes {
        let original = note.content().unwrap_or_default().to_string();
        let ocr = joined_text(&image_texts_of(&note));
        let was_spam = filter.has_spam_keyword(&original);

        let content = if was_spam {
            report.spam += 1;
            if !ocr.is_empty() {
                report.from_images_only += 1;
                ocr
            } else if !note.images().is_empty() {
                format!("[{} images, open the note to view]", note.images().len())
            } else {
                "[no content]".to_string()
            }
        } else if ocr.is_empty() {
            original
        } else {
            format!("{}{}{}", original, OCR_SEPARATOR, ocr)
        };

        let valid = content.chars().count() > min_chars;
        note.set_content(content);
        set_extra(&mut note, "originalContentWasSpam", Value::Bool(was_spam));
        set_extra(&mut note, "hasValidContent", Value::Bool(valid));
        if valid {
            report.notes.push(note);
        } else {
            report.dropped += 1;
        }
    }
    report
}

#[derive(Debug, Default, PartialEq)]
pub struct SnapshotStats {
    pub notes: usize,
    pub with_images: usize,
    pub images: usize,
    pub ocr_processed: usize,
    pub image_texts: usize,
    pub recognized_chars: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl SnapshotStats {
    pub fn collect(notes: &[WorkItem]) -> Self {
        let mut s = SnapshotStats {
            notes: notes.len(),
            ..Default::default()
        };
        for note in notes {
            if !note.images().is_empty() {
                s.with_images += 1;
            }
            s.images += note.images().len();
            let texts = image_texts_of(note);
            if note.extra.get("ocrProcessed") == Some(&Value::Bool(true)) || !texts.is_empty() {
                s.ocr_processed += 1;
            }
            s.image_texts += texts.iter().filter(|t| t.has_text()).count();
            s.recognized_chars += texts.iter().map(|t| t.text.chars().count()).sum::<usize>();
            match note.extra.get("status").and_then(Value::as_str) {
                Some("succeeded") => s.succeeded += 1,
                Some("failed") => s.failed += 1,
                _ => {}
            }
        }
        s
    }

    pub fn print(&self) {
        let pct = |n: usize| {
            if self.notes == 0 {
                0
            } else {
                n * 100 / self.notes
            }
        };
        println!("Notes:            {}", self.notes);
        println!("With images:      {} ({}%)", self.with_images, pct(self.with_images));
        println!("Images:           {}", self.images);
        println!("OCR processed:    {} ({}%)", self.ocr_processed, pct(self.ocr_processed));
        println!("Images with text: {}", self.image_texts);
        println!("Recognized chars: {}", self.recognized_chars);
        if self.succeeded + self.failed > 0 {
            println!("Last pass:        {} ok, {} failed", self.succeeded, self.failed);
        }
    }
}

fn image_texts_of(note: &WorkItem) -> Vec<ImageText> {
    match note.extra.get("imageTexts") {
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            warn!("Unreadable imageTexts on {}: {}", note.id, e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}

fn joined_text(texts: &[ImageText]) -> String {
    texts
        .iter()
        .filter(|t| t.has_text())
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Set a pass-through field, moving it to the end like a fresh key.
fn set_extra(note: &mut WorkItem, key: &str, value: Value) {
    note.extra.shift_remove(key);
    note.extra.insert(key.to_string(), value);
}
