pub mod ocr;
pub mod page;

use async_trait::async_trait;

use crate::model::{ProcessedItem, WorkItem};

pub use ocr::{CommandRecognizer, OcrProcessor};
pub use page::PageProcessor;

/// One step of a batch pass.
///
/// Ordinary failures (timeouts, HTTP errors, nothing recognized) come back
/// as a [`ProcessedItem`] marked failed; `process` never drops an item.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, item: WorkItem) -> ProcessedItem;
}
