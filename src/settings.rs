use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

const CONFIG_FILE: &str = "notes_harvest";
const ENV_PREFIX: &str = "NOTES";

/// Phrases that only show up in the site footer or the login wall. A body
/// containing any of them was not the note itself.
const DEFAULT_SPAM_KEYWORDS: &[&str] = &[
    "《用户协议》",
    "《隐私政策》",
    "《儿童/青少年个人信息保护规则》",
    "沪ICP备13030189号",
    "营业执照",
    "沪公网安备",
    "增值电信业务经营许可证",
    "医疗器械网络交易服务第三方平台备案",
    "互联网药品信息服务资格证书",
    "违法不良信息举报电话",
    "上海市互联网举报中心",
    "网上有害信息举报专区",
    "自营经营者信息",
    "网络文化经营许可证",
    "个性化推荐算法",
    "网信算备",
    "广告屏蔽插件",
    "发现发布通知登录",
    "马上登录即可",
];

const DEFAULT_FOOTER_MARKERS: &[&str] = &["ICP", "营业执照", "许可证", "备案"];

/// Runtime settings: defaults, then `notes_harvest.toml` if present, then
/// `NOTES_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub checkpoint_interval: usize,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub image_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    pub ocr_timeout_secs: u64,
    pub ocr_program: String,
    pub ocr_args: Vec<String>,
    pub cookies_file: Option<PathBuf>,
    pub user_agent: String,
    pub referer: Option<String>,
    pub min_content_chars: usize,
    pub spam_keywords: Vec<String>,
    pub footer_markers: Vec<String>,
    pub footer_marker_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            checkpoint_interval: 5,
            delay_ms: 1500,
            jitter_ms: 500,
            image_delay_ms: 500,
            fetch_timeout_secs: 30,
            ocr_timeout_secs: 60,
            ocr_program: "python".into(),
            ocr_args: vec!["scripts/ocr_image.py".into()],
            cookies_file: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .into(),
            referer: Some("https://www.xiaohongshu.com/".into()),
            min_content_chars: 50,
            spam_keywords: DEFAULT_SPAM_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            footer_markers: DEFAULT_FOOTER_MARKERS.iter().map(|s| s.to_string()).collect(),
            footer_marker_limit: 2,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid("checkpoint_interval must be at least 1".into()));
        }
        if self.fetch_timeout_secs == 0 || self.ocr_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.ocr_program.trim().is_empty() {
            return Err(ConfigError::Invalid("ocr_program is empty".into()));
        }
        Ok(())
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn notes_path(&self) -> PathBuf {
        self.path("notes.json")
    }

    pub fn ocr_dir(&self) -> PathBuf {
        self.path("ocr-results")
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.path("extract-results")
    }

    pub fn cookies_path(&self) -> PathBuf {
        self.cookies_file
            .clone()
            .unwrap_or_else(|| self.path("cookies.json"))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn image_delay(&self) -> Duration {
        Duration::from_millis(self.image_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}
