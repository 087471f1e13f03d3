use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Keys owned by [`ProcessedItem`]. A snapshot that was produced by an
/// earlier pass carries them in the pass-through map; they are dropped
/// there so a reprocessed item never serializes a key twice.
const STATUS_KEYS: &[&str] = &["status", "error", "processedAt"];

/// One note record from a snapshot.
///
/// Only the fields the pipeline reads are typed; everything else rides
/// along in `extra` in its original key order. Typed optional fields keep
/// the difference between a missing key and an explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub url: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    title: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    content: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    images: Option<Option<Vec<String>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outer `Some` whenever the key is there, `null` included.
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl WorkItem {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        WorkItem {
            id: id.into(),
            url: url.into(),
            title: None,
            content: None,
            images: None,
            extra: Map::new(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_ref()?.as_deref()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(Some(title.into()));
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_ref()?.as_deref()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(Some(content.into()));
    }

    pub fn images(&self) -> &[String] {
        self.images.as_ref().and_then(|i| i.as_deref()).unwrap_or_default()
    }

    pub fn set_images(&mut self, images: Vec<String>) {
        self.images = Some(Some(images));
    }

    /// Move the image list out, if there is one. A missing or `null`
    /// list is left as it was.
    pub fn take_images(&mut self) -> Option<Vec<String>> {
        match self.images.take() {
            Some(Some(images)) => Some(images),
            other => {
                self.images = other;
                None
            }
        }
    }

    /// Title for progress output, falling back to the id.
    pub fn display_name(&self) -> &str {
        match self.title().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => &self.id,
        }
    }

    /// URL without its query string. Note links carry per-session
    /// tracking parameters, so this is the key used to match records
    /// across snapshots.
    pub fn base_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Succeeded,
    Failed,
}

/// Text recognized from one image of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageText {
    pub index: usize,
    pub url: String,
    pub text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageText {
    pub fn failed(index: usize, url: &str, error: impl ToString) -> Self {
        ImageText {
            index,
            url: url.to_string(),
            text: String::new(),
            confidence: 0.0,
            error: Some(error.to_string()),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// A [`WorkItem`] after one processor call, serialized flat so a list of
/// them is itself a valid snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedItem {
    #[serde(flatten)]
    pub item: WorkItem,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_texts: Option<Vec<ImageText>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_valid_content: Option<bool>,
}

impl ProcessedItem {
    pub fn succeeded(item: WorkItem) -> Self {
        Self::with_status(item, ItemStatus::Succeeded, None)
    }

    pub fn failed(item: WorkItem, error: impl ToString) -> Self {
        Self::with_status(item, ItemStatus::Failed, Some(error.to_string()))
    }

    fn with_status(mut item: WorkItem, status: ItemStatus, error: Option<String>) -> Self {
        for key in STATUS_KEYS {
            item.extra.shift_remove(*key);
        }
        ProcessedItem {
            item,
            status,
            error,
            processed_at: Utc::now(),
            image_texts: None,
            tags: None,
            has_valid_content: None,
        }
    }

    pub fn with_image_texts(mut self, texts: Vec<ImageText>) -> Self {
        self.item.extra.shift_remove("imageTexts");
        self.image_texts = Some(texts);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.item.extra.shift_remove("tags");
        self.tags = Some(tags);
        self
    }

    pub fn with_valid_content(mut self, valid: bool) -> Self {
        self.item.extra.shift_remove("hasValidContent");
        self.has_valid_content = Some(valid);
        self
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Succeeded
    }

    /// Recognized text of all images, blank entries skipped.
    pub fn joined_image_text(&self) -> String {
        self.image_texts
            .iter()
            .flatten()
            .filter(|t| t.has_text())
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_round_trip_in_order() {
        let raw = r#"{"id":"n1","url":"https://example.com/n1?x=1","title":"T","author":"me","likes":"12","tags":["a"]}"#;
        let item: WorkItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.extra.keys().collect::<Vec<_>>(), vec!["author", "likes", "tags"]);
        assert_eq!(serde_json::to_string(&item).unwrap(), raw);
    }

    #[test]
    fn explicit_nulls_round_trip() {
        let raw = r#"{"id":"n1","url":"u1","title":null,"content":null,"images":null,"author":"me"}"#;
        let item: WorkItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.title(), None);
        assert!(item.images().is_empty());
        assert_eq!(serde_json::to_string(&item).unwrap(), raw);

        let p = ProcessedItem::succeeded(item).with_image_texts(vec![]);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["title"], Value::Null);
        assert_eq!(v["content"], Value::Null);
        assert_eq!(v["images"], Value::Null);
        assert!(v.get("tags").is_none());

        let back: ProcessedItem = serde_json::from_value(v).unwrap();
        assert_eq!(back.item, p.item);
    }

    #[test]
    fn take_images_leaves_null_in_place() {
        let mut item: WorkItem = serde_json::from_str(r#"{"id":"n1","url":"u1","images":null}"#).unwrap();
        assert_eq!(item.take_images(), None);
        assert_eq!(serde_json::to_string(&item).unwrap(), r#"{"id":"n1","url":"u1","images":null}"#);

        item.set_images(vec!["a".into()]);
        assert_eq!(item.take_images(), Some(vec!["a".to_string()]));
        assert_eq!(serde_json::to_string(&item).unwrap(), r#"{"id":"n1","url":"u1"}"#);
    }

    #[test]
    fn processed_item_serializes_flat() {
        let mut item = WorkItem::new("n1", "u1");
        item.extra.insert("author".into(), Value::from("me"));
        let p = ProcessedItem::failed(item, "timeout");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["id"], "n1");
        assert_eq!(v["author"], "me");
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"], "timeout");
        assert!(v.get("imageTexts").is_none());

        let back: ProcessedItem = serde_json::from_value(v).unwrap();
        assert_eq!(back.status, ItemStatus::Failed);
        assert!(!back.item.extra.contains_key("status"));
    }

    #[test]
    fn reprocessing_replaces_previous_status_fields() {
        let raw = r#"{"id":"n1","url":"u1","status":"failed","error":"old","processedAt":"2024-01-01T00:00:00Z","imageTexts":[]}"#;
        let item: WorkItem = serde_json::from_str(raw).unwrap();
        let p = ProcessedItem::succeeded(item).with_image_texts(vec![]);
        let v = serde_json::to_value(&p).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj["status"], "succeeded");
        assert!(!obj.contains_key("error"));
        assert!(p.item.extra.is_empty());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut item = WorkItem::new("n1", "u1");
        assert_eq!(item.display_name(), "n1");
        item.set_title("  ");
        assert_eq!(item.display_name(), "n1");
        item.set_title("Trip notes");
        assert_eq!(item.display_name(), "Trip notes");
    }

    #[test]
    fn base_url_drops_query() {
        let item = WorkItem::new("n1", "https://example.com/explore/abc?xsec_token=zz");
        assert_eq!(item.base_url(), "https://example.com/explore/abc");
    }
}
