use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ItemProcessor;
use crate::error::{ConfigError, FetchError, RecognizeError};
use crate::fetch::Fetcher;
use crate::model::{ImageText, ProcessedItem, WorkItem};

const STDERR_PREVIEW_CHARS: usize = 300;

/// Text found in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f64,
}

/// External text recognition over a local image file.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &Path) -> Result<Recognition, RecognizeError>;
}

/// Runs `program args... <image>` and reads a JSON object from stdout:
/// `{"text": "...", "confidence": 0.93}` (`full_text` is accepted for
/// `text`). A non-empty `error` field counts as a failure.
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct RecognizerOutput {
    #[serde(default, alias = "full_text")]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        CommandRecognizer {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn recognize(&self, image: &Path) -> Result<Recognition, RecognizeError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RecognizeError::Spawn)?;

        // On timeout the future is dropped, which kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RecognizeError::Timeout(self.timeout))?
            .map_err(RecognizeError::Spawn)?;

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(STDERR_PREVIEW_CHARS)
                .collect();
            return Err(RecognizeError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: RecognizerOutput = serde_json::from_str(stdout.trim())?;
        if let Some(err) = parsed.error.filter(|e| !e.trim().is_empty()) {
            return Err(RecognizeError::Reported(err));
        }
        Ok(Recognition {
            text: parsed.text.unwrap_or_default().trim().to_string(),
            confidence: parsed.confidence.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Error)]
enum ImageError {
    #[error("download failed: {0}")]
    Download(#[from] FetchError),
    #[error(transparent)]
    Recognize(#[from] RecognizeError),
}

/// Downloads every image of a note and attaches the recognized text.
pub struct OcrProcessor {
    fetcher: Arc<dyn Fetcher>,
    recognizer: Arc<dyn Recognizer>,
    temp_dir: PathBuf,
    image_delay: Duration,
}

impl OcrProcessor {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        recognizer: Arc<dyn Recognizer>,
        temp_dir: PathBuf,
        image_delay: Duration,
    ) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&temp_dir).map_err(|e| {
            ConfigError::Invalid(format!("temp dir {}: {}", temp_dir.display(), e))
        })?;
        Ok(OcrProcessor {
            fetcher,
            recognizer,
            temp_dir,
            image_delay,
        })
    }

    async fn recognize_image(
        &self,
        item_id: &str,
        index: usize,
        url: &str,
    ) -> Result<Recognition, ImageError> {
        let bytes = self.fetcher.fetch_bytes(url).await?;
        let path = self.temp_dir.join(format!(
            "{}_{}_{}.img",
            file_stem(item_id),
            index,
            uuid::Uuid::new_v4().simple()
        ));

        let written = tokio::fs::write(&path, &bytes).await;
        let result = match written {
            Ok(()) => self.recognizer.recognize(&path).await.map_err(ImageError::from),
            Err(e) => Err(ImageError::Download(FetchError::Io(e))),
        };
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        result
    }
}

#[async_trait]
impl ItemProcessor for OcrProcessor {
    fn name(&self) -> &str {
        "ocr"
    }

    async fn process(&self, item: WorkItem) -> ProcessedItem {
        let urls = item.images().to_vec();
        if urls.is_empty() {
            debug!("{}: no images", item.id);
            return ProcessedItem::succeeded(item).with_image_texts(Vec::new());
        }

        let mut texts = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            if index > 0 && !self.image_delay.is_zero() {
                tokio::time::sleep(self.image_delay).await;
            }
            match self.recognize_image(&item.id, index, url).await {
                Ok(r) => {
                    info!(
                        "  [{}/{}] {} chars (confidence {:.2})",
                        index + 1,
                        urls.len(),
                        r.text.chars().count(),
                        r.confidence
                    );
                    texts.push(ImageText {
                        index,
                        url: url.clone(),
                        text: r.text,
                        confidence: r.confidence,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("  [{}/{}] {}: {}", index + 1, urls.len(), item.id, e);
                    texts.push(ImageText::failed(index, url, e));
                }
            }
        }

        if texts.iter().any(ImageText::has_text) {
            return ProcessedItem::succeeded(item).with_image_texts(texts);
        }
        let reason = texts
            .iter()
            .find_map(|t| t.error.clone())
            .unwrap_or_else(|| "no text recognized".to_string());
        ProcessedItem::failed(item, reason).with_image_texts(texts)
    }
}

/// Item id reduced to characters safe in a file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemStatus;
    use crate::testutil::scratch_dir;
    use std::collections::HashMap;

    struct BytesFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl Fetcher for BytesFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            Err(FetchError::Status {
                status: 405,
                url: url.to_string(),
            })
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0.get(url).cloned().ok_or(FetchError::Timeout(Duration::from_secs(30)))
        }
    }

    /// Treats the image bytes as the text in the picture.
    struct EchoRecognizer;

    #[async_trait]
    impl Recognizer for EchoRecognizer {
        async fn recognize(&self, image: &Path) -> Result<Recognition, RecognizeError> {
            let text = tokio::fs::read_to_string(image).await.unwrap();
            if text == "corrupt" {
                return Err(RecognizeError::Reported("cannot identify image".into()));
            }
            Ok(Recognition {
                text,
                confidence: 0.9,
            })
        }
    }

    fn processor(temp: &Path) -> OcrProcessor {
        let images = HashMap::from([
            ("https://img/1".to_string(), b"first page".to_vec()),
            ("https://img/2".to_string(), b"corrupt".to_vec()),
            ("https://img/3".to_string(), b"".to_vec()),
        ]);
        OcrProcessor::new(
            Arc::new(BytesFetcher(images)),
            Arc::new(EchoRecognizer),
            temp.to_path_buf(),
            Duration::ZERO,
        )
        .unwrap()
    }

    fn note(images: &[&str]) -> WorkItem {
        let mut item = WorkItem::new("note/1", "https://example.com/n1");
        item.set_images(images.iter().map(|s| s.to_string()).collect());
        item
    }

    #[tokio::test]
    async fn per_image_failures_are_isolated() {
        let temp = scratch_dir("ocr-isolated");
        let p = processor(&temp)
            .process(note(&["https://img/2", "https://img/missing", "https://img/1"]))
            .await;

        assert_eq!(p.status, ItemStatus::Succeeded);
        let texts = p.image_texts.as_ref().unwrap();
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[0].error.as_deref(), Some("recognizer reported: cannot identify image"));
        assert_eq!(texts[1].error.as_deref(), Some("download failed: timed out after 30s"));
        assert_eq!(texts[2].text, "first page");
        assert_eq!(texts[2].index, 2);
        assert_eq!(p.joined_image_text(), "first page");
    }

    #[tokio::test]
    async fn temp_files_are_removed() {
        let temp = scratch_dir("ocr-cleanup");
        processor(&temp)
            .process(note(&["https://img/1", "https://img/2"]))
            .await;
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn no_images_succeeds_empty() {
        let temp = scratch_dir("ocr-empty");
        let p = processor(&temp).process(note(&[])).await;
        assert!(p.is_success());
        assert_eq!(p.image_texts, Some(vec![]));
    }

    #[tokio::test]
    async fn nothing_recognized_fails_with_first_error() {
        let temp = scratch_dir("ocr-fail");
        let p = processor(&temp)
            .process(note(&["https://img/3", "https://img/2"]))
            .await;
        assert_eq!(p.status, ItemStatus::Failed);
        assert_eq!(p.error.as_deref(), Some("recognizer reported: cannot identify image"));

        let p = processor(&temp).process(note(&["https://img/3"])).await;
        assert_eq!(p.error.as_deref(), Some("no text recognized"));
    }

    #[test]
    fn file_stem_is_path_safe() {
        assert_eq!(file_stem("note/1 a"), "note_1_a");
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout: Duration) -> CommandRecognizer {
        CommandRecognizer::new("sh", vec!["-c".into(), script.into(), "sh".into()], timeout)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_is_parsed() {
        let r = sh(
            r#"echo "{\"full_text\": \"hello $1\", \"confidence\": 0.5}""#,
            Duration::from_secs(10),
        )
        .recognize(Path::new("a.jpg"))
        .await
        .unwrap();
        assert_eq!(r.text, "hello a.jpg");
        assert_eq!(r.confidence, 0.5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failures_are_errors() {
        let timeout = Duration::from_secs(10);
        let img = Path::new("a.jpg");

        let err = sh("echo boom >&2; exit 3", timeout).recognize(img).await.unwrap_err();
        assert!(matches!(err, RecognizeError::Exit { code: Some(3), ref stderr } if stderr == "boom"));

        let err = sh(r#"echo '{"text": "", "error": "no model"}'"#, timeout)
            .recognize(img)
            .await
            .unwrap_err();
        assert!(matches!(err, RecognizeError::Reported(ref m) if m == "no model"));

        let err = sh("echo not json", timeout).recognize(img).await.unwrap_err();
        assert!(matches!(err, RecognizeError::Output(_)));

        let err = CommandRecognizer::new("/nonexistent/recognizer", vec![], timeout)
            .recognize(img)
            .await
            .unwrap_err();
        assert!(matches!(err, RecognizeError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout() {
        let err = sh("sleep 5", Duration::from_millis(100))
            .recognize(Path::new("a.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecognizeError::Timeout(_)));
    }
}
