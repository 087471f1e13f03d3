use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

static META: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta[content]").unwrap());
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("head > title").unwrap());
static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

static HASHTAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#([^\s#\[\]]+)").unwrap());
static SITE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*[-|]\s*(小红书|Xiaohongshu)[^-|]*$").unwrap());

/// Subtrees that never hold note text.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "nav", "header", "footer",
];

/// Elements that end a line of visible text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "br", "h1", "h2", "h3", "h4", "h5", "h6", "section", "article", "tr",
];

/// Interface chrome that shows up as standalone lines in page text.
const UI_WORDS: &[&str] = &["点赞", "收藏", "评论", "分享", "关注", "登录"];

const MIN_LINE_CHARS: usize = 10;

/// What a note page yields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub title: Option<String>,
    pub content: String,
    pub images: Vec<String>,
    pub tags: Vec<String>,
}

/// Pull the note out of a rendered page: Open Graph metadata first, the
/// visible body text as fallback.
pub fn extract_page(html: &str) -> PageContent {
    let document = Html::parse_document(html);
    let metas = meta_tags(&document);
    let meta = |key: &str| -> Option<String> {
        metas
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let title = meta("og:title")
        .or_else(|| {
            document
                .select(&TITLE)
                .next()
                .map(|t| t.text().collect::<String>().trim().to_string())
        })
        .map(|t| SITE_SUFFIX_RE.replace(&t, "").to_string())
        .filter(|t| !t.is_empty());

    let content = meta("og:description")
        .or_else(|| meta("description"))
        .unwrap_or_else(|| body_text(&document));

    let mut seen = HashSet::new();
    let images: Vec<String> = metas
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("og:image"))
        .map(|(_, v)| v.trim())
        .chain(document.select(&IMG).filter_map(|img| img.value().attr("src")))
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .map(str::to_string)
        .filter(|url| seen.insert(url.clone()))
        .collect();

    let tags = hashtags(&content);

    PageContent {
        title,
        content,
        images,
        tags,
    }
}

/// `(property or name, content)` of every `<meta>` carrying both.
fn meta_tags(document: &Html) -> Vec<(String, String)> {
    document
        .select(&META)
        .filter_map(|el| {
            let attrs = el.value();
            let key = attrs.attr("property").or_else(|| attrs.attr("name"))?;
            let value = attrs.attr("content")?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Body text with markup, scripts and interface chrome removed.
pub fn visible_text(html: &str) -> String {
    body_text(&Html::parse_document(html))
}

fn body_text(document: &Html) -> String {
    let root = document
        .select(&BODY)
        .next()
        .unwrap_or_else(|| document.root_element());
    let mut raw = String::new();
    push_text(root, &mut raw);

    raw.lines()
        .map(str::trim)
        .filter(|line| line.chars().count() > MIN_LINE_CHARS)
        .filter(|line| !UI_WORDS.iter().any(|w| line.contains(w)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return;
    }
    for child in element.children() {
        if let Some(child) = ElementRef::wrap(child) {
            push_text(child, out);
        } else if let Node::Text(text) = child.value() {
            out.push_str(text);
        }
    }
    if BLOCK_TAGS.contains(&name) {
        out.push('\n');
    }
}

/// Hashtags in order of first appearance, without the `#`.
pub fn hashtags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HASHTAG_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
