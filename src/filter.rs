use crate::settings::Settings;

/// Decides whether extracted text is the note itself or something the site
/// served instead (login wall, footer, empty shell).
pub trait ContentFilter: Send + Sync {
    fn is_valid(&self, content: &str) -> bool;
}

impl<F> ContentFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, content: &str) -> bool {
        self(content)
    }
}

/// Keyword and footer-density filter.
#[derive(Debug, Clone)]
pub struct SpamFilter {
    min_chars: usize,
    keywords: Vec<String>,
    footer_markers: Vec<String>,
    footer_limit: usize,
}

impl SpamFilter {
    pub fn new(
        min_chars: usize,
        keywords: Vec<String>,
        footer_markers: Vec<String>,
        footer_limit: usize,
    ) -> Self {
        SpamFilter {
            min_chars,
            keywords,
            footer_markers,
            footer_limit,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        SpamFilter::new(
            settings.min_content_chars,
            settings.spam_keywords.clone(),
            settings.footer_markers.clone(),
            settings.footer_marker_limit,
        )
    }

    pub fn has_spam_keyword(&self, content: &str) -> bool {
        self.keywords.iter().any(|k| content.contains(k.as_str()))
    }

    fn footer_hits(&self, content: &str) -> usize {
        self.footer_markers
            .iter()
            .map(|m| content.matches(m.as_str()).count())
            .sum()
    }
}

impl ContentFilter for SpamFilter {
    fn is_valid(&self, content: &str) -> bool {
        if content.chars().count() < self.min_chars {
            return false;
        }
        if self.has_spam_keyword(content) {
            return false;
        }
        self.footer_limit == 0 || self.footer_hits(content) < self.footer_limit
    }
}

/// Whether an image URL is a note picture rather than an avatar or icon.
pub fn is_content_image(url: &str) -> bool {
    if url.contains("/avatar/") || url.contains("sns-avatar") {
        return false;
    }
    url.contains("notes_pre_post") || url.contains("!nd_dft_wlteh") || url.contains("!nc_n_webp")
}
