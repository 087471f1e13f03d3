use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ItemProcessor;
use crate::extract::extract_page;
use crate::fetch::Fetcher;
use crate::filter::ContentFilter;
use crate::model::{ProcessedItem, WorkItem};

/// Fetches a note page and replaces the item's title, body, images and tags
/// with what the page shows.
pub struct PageProcessor {
    fetcher: Arc<dyn Fetcher>,
    filter: Arc<dyn ContentFilter>,
}

impl PageProcessor {
    pub fn new(fetcher: Arc<dyn Fetcher>, filter: Arc<dyn ContentFilter>) -> Self {
        PageProcessor { fetcher, filter }
    }
}

#[async_trait]
impl ItemProcessor for PageProcessor {
    fn name(&self) -> &str {
        "extract"
    }

    async fn process(&self, mut item: WorkItem) -> ProcessedItem {
        let html = match self.fetcher.fetch_text(&item.url).await {
            Ok(html) => html,
            Err(e) => {
                warn!("Fetch failed for {}: {}", item.id, e);
                item.set_images(Vec::new());
                return ProcessedItem::failed(item, e);
            }
        };

        let page = extract_page(&html);
        let valid = self.filter.is_valid(&page.content);
        debug!(
            "{}: {} chars, {} images, {} tags, valid={}",
            item.id,
            page.content.chars().count(),
            page.images.len(),
            page.tags.len(),
            valid
        );

        item.set_images(page.images);
        if !valid {
            // Keep whatever title and body the snapshot already had.
            return ProcessedItem::failed(item, "no valid content").with_valid_content(false);
        }

        if let Some(title) = page.title {
            item.set_title(title);
        }
        item.set_content(page.content);
        ProcessedItem::succeeded(item)
            .with_tags(page.tags)
            .with_valid_content(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::filter::SpamFilter;
    use crate::model::ItemStatus;
    use crate::settings::Settings;
    use std::collections::HashMap;

    struct StaticFetcher(HashMap<String, String>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.0.get(url).cloned().ok_or(FetchError::Status {
                status: 404,
                url: url.to_string(),
            })
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.fetch_text(url).await.map(String::into_bytes)
        }
    }

    fn processor() -> PageProcessor {
        let pages = HashMap::from([
            (
                "https://example.com/note".to_string(),
                std::fs::read_to_string("tests/fixtures/note_page.html").unwrap(),
            ),
            (
                "https://example.com/wall".to_string(),
                std::fs::read_to_string("tests/fixtures/login_wall.html").unwrap(),
            ),
        ]);
        PageProcessor::new(
            Arc::new(StaticFetcher(pages)),
            Arc::new(SpamFilter::from_settings(&Settings::default())),
        )
    }

    #[tokio::test]
    async fn extracts_note_page() {
        let mut item = WorkItem::new("n1", "https://example.com/note");
        item.extra.insert("likes".into(), "128".into());
        let p = processor().process(item).await;

        assert_eq!(p.status, ItemStatus::Succeeded);
        assert_eq!(p.item.title(), Some("周末去海边露营的装备清单"));
        assert_eq!(p.item.images().len(), 3);
        assert_eq!(p.tags.as_deref(), Some(&["露营".to_string(), "装备清单".to_string()][..]));
        assert_eq!(p.has_valid_content, Some(true));
        assert_eq!(p.item.extra["likes"], "128");
    }

    #[tokio::test]
    async fn login_wall_marks_failed_but_keeps_item() {
        let mut item = WorkItem::new("n2", "https://example.com/wall");
        item.set_title("原标题");
        let p = processor().process(item).await;

        assert_eq!(p.status, ItemStatus::Failed);
        assert_eq!(p.error.as_deref(), Some("no valid content"));
        assert_eq!(p.has_valid_content, Some(false));
        assert_eq!(p.item.title(), Some("原标题"));
        assert!(p.item.content().is_none());
        assert!(p.tags.is_none());
    }

    #[tokio::test]
    async fn fetch_error_keeps_original_fields() {
        let mut item = WorkItem::new("n3", "https://example.com/gone");
        item.set_title("原标题");
        item.set_content("旧内容");
        let p = processor().process(item).await;

        assert_eq!(p.status, ItemStatus::Failed);
        assert_eq!(p.error.as_deref(), Some("HTTP 404 from https://example.com/gone"));
        assert_eq!(p.item.title(), Some("原标题"));
        assert_eq!(p.item.content(), Some("旧内容"));
        assert!(p.item.images().is_empty());
        assert!(p.tags.is_none());
    }
}
