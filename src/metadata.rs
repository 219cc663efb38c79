//! Article metadata extracted from captured HTML.
//!
//! A [MetadataDocument] is schema-less JSON of the form
//! `{"<field>": {"best": {"value": ...}}}`. Only a handful of fields matter to the
//! ingester; the accessors below return `None` for any field that is missing or has
//! an unexpected shape, which is how non-article pages are recognised.
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::{json, Map, Value};

static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static HTML_ROOT: Lazy<Selector> = Lazy::new(|| selector("html"));
static ARTICLE: Lazy<Selector> = Lazy::new(|| selector("article, main, [role='main']"));
static BODY: Lazy<Selector> = Lazy::new(|| selector("body"));
static PUBLISHED: Lazy<Selector> = Lazy::new(|| {
    selector(
        "meta[property='article:published_time'], meta[itemprop='datePublished'], \
         meta[name='date'], meta[name='pubdate'], time[datetime]",
    )
});

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataDocument(Value);

impl MetadataDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }

    pub fn best_value(&self, field: &str) -> Option<&Value> {
        self.0.get(field)?.get("best")?.get("value")
    }

    pub fn best_string(&self, field: &str) -> Option<&str> {
        self.best_value(field)?.as_str()
    }

    /// Lower bound of the `timestamp.published` range.
    pub fn best_timestamp_lo(&self) -> Option<DateTime<Utc>> {
        let lo = self.best_value("timestamp.published")?.get("lo")?.as_str()?;
        parse_timestamp(lo)
    }

    pub fn best_content_html(&self) -> Option<&str> {
        self.best_value("content")?.get("html")?.as_str()
    }

    pub fn best_content_text(&self) -> Option<&str> {
        self.best_value("content")?.get("text")?.as_str()
    }

    pub fn is_exception(&self) -> bool {
        self.0.get("exception").is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("document is empty")]
    Empty,
    #[error("extractor panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::Empty => "Empty",
            ExtractionError::Panicked(_) => "Panicked",
            ExtractionError::Other(_) => "Other",
        }
    }
}

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, html: &[u8], url: &str) -> Result<MetadataDocument, ExtractionError>;
}

/// The in-band document stored in place of metadata when extraction fails.
pub fn exception_document(error: &ExtractionError) -> MetadataDocument {
    MetadataDocument(json!({
        "exception": {
            "message": error.to_string(),
            "type": error.kind(),
            "location": "extractor",
            "traceback": format!("{error:?}"),
        }
    }))
}

/// Runs the extractor, turning errors and panics into an exception document.
pub fn extract_or_exception(
    extractor: &dyn MetadataExtractor,
    html: &[u8],
    url: &str,
) -> MetadataDocument {
    let result = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(html, url)))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ExtractionError::Panicked(message))
        });
    match result {
        Ok(document) => document,
        Err(e) => {
            tracing::error!(url, error = %e, "metadata extraction failed");
            exception_document(&e)
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = value.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

fn best(value: Value) -> Value {
    json!({ "best": { "value": value } })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

const INVISIBLE: &[&str] = &["script", "style", "noscript", "template"];

/// Text of `element` that a reader would see: no script, style or noscript bodies.
fn visible_text(element: ElementRef) -> String {
    let texts: Vec<&str> = element
        .descendants()
        .filter(|node| {
            !node
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|el| INVISIBLE.contains(&el.value().name()))
        })
        .filter_map(|node| node.value().as_text())
        .map(|text| &**text)
        .collect();
    collapse_whitespace(&texts.join(" "))
}

/// Extracts title, description, language, publication time and main content with
/// `scraper`. Content is reported for pages with an `<article>` or `<main>` element;
/// with `max_recall` the whole `<body>` stands in when neither exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlMetadataExtractor {
    max_recall: bool,
}

impl HtmlMetadataExtractor {
    pub fn new(max_recall: bool) -> Self {
        Self { max_recall }
    }

    fn meta_content(document: &Html, attr: &str, value: &str) -> Option<String> {
        let selector = Selector::parse(&format!("meta[{attr}='{value}']")).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn title(document: &Html) -> Option<String> {
        document
            .select(&TITLE)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|s| !s.is_empty())
            .or_else(|| Self::meta_content(document, "property", "og:title"))
    }

    fn description(document: &Html) -> Option<String> {
        Self::meta_content(document, "name", "description")
            .or_else(|| Self::meta_content(document, "property", "og:description"))
    }

    fn language(document: &Html) -> Option<String> {
        document
            .select(&HTML_ROOT)
            .next()
            .and_then(|el| el.value().attr("lang"))
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .or_else(|| Self::meta_content(document, "http-equiv", "content-language"))
            .or_else(|| Self::meta_content(document, "property", "og:locale"))
    }

    fn published(document: &Html) -> Option<DateTime<Utc>> {
        document.select(&PUBLISHED).find_map(|el| {
            let value = el.value();
            let raw = value.attr("content").or_else(|| value.attr("datetime"))?;
            parse_timestamp(raw.trim())
        })
    }

    fn content(&self, document: &Html) -> Option<(String, String)> {
        let main: ElementRef = document
            .select(&ARTICLE)
            .next()
            .or_else(|| self.max_recall.then(|| document.select(&BODY).next()).flatten())?;
        let text = visible_text(main);
        if text.is_empty() {
            return None;
        }
        Some((main.inner_html(), text))
    }
}

impl MetadataExtractor for HtmlMetadataExtractor {
    fn extract(&self, html: &[u8], url: &str) -> Result<MetadataDocument, ExtractionError> {
        let source = String::from_utf8_lossy(html);
        if source.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }
        let document = Html::parse_document(&source);

        let mut fields = Map::new();
        fields.insert("url".to_string(), best(json!(url)));
        if let Some(title) = Self::title(&document) {
            fields.insert("title".to_string(), best(json!(title)));
        }
        if let Some(description) = Self::description(&document) {
            fields.insert("description".to_string(), best(json!(description)));
        }
        if let Some(language) = Self::language(&document) {
            fields.insert("language".to_string(), best(json!(language)));
        }
        if let Some(published) = Self::published(&document) {
            let ts = published.to_rfc3339();
            fields.insert(
                "timestamp.published".to_string(),
                best(json!({ "lo": ts, "hi": ts })),
            );
        }
        if let Some((html, text)) = self.content(&document) {
            fields.insert(
                "content".to_string(),
                best(json!({ "html": html, "text": text })),
            );
        }
        Ok(MetadataDocument(Value::Object(fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE_HTML: &str = r#"<!doctype html>
<html lang="EN-us">
<head>
  <title> North   Korea news </title>
  <meta name="description" content="Analysis of the week">
  <meta property="article:published_time" content="2021-03-04T05:06:07Z">
</head>
<body><nav>menu</nav><article><h1>Headline</h1><p>Trouble in  Pyongyang.</p></article></body>
</html>"#;

    #[test]
    fn extracts_article_fields() {
        let doc = HtmlMetadataExtractor::default()
            .extract(ARTICLE_HTML.as_bytes(), "https://example.com/a")
            .unwrap();
        assert_eq!(doc.best_string("title"), Some("North Korea news"));
        assert_eq!(doc.best_string("description"), Some("Analysis of the week"));
        assert_eq!(doc.best_string("language"), Some("en-us"));
        assert_eq!(
            doc.best_timestamp_lo().unwrap().to_rfc3339(),
            "2021-03-04T05:06:07+00:00"
        );
        assert_eq!(doc.best_content_text(), Some("Headline Trouble in Pyongyang."));
        assert!(doc.best_content_html().unwrap().contains("<h1>Headline</h1>"));
        assert!(!doc.is_exception());
    }

    #[test]
    fn non_article_pages_have_no_content() {
        let html = b"<html><head><title>Home</title></head><body>links</body></html>";
        let doc = HtmlMetadataExtractor::default()
            .extract(html, "https://example.com/")
            .unwrap();
        assert_eq!(doc.best_string("title"), Some("Home"));
        assert_eq!(doc.best_content_text(), None);
        assert_eq!(doc.best_timestamp_lo(), None);
    }

    #[test]
    fn max_recall_falls_back_to_the_body() {
        let html = b"<html><head><title>Home</title></head><body><p>Latest  links</p></body></html>";
        let doc = HtmlMetadataExtractor::new(true)
            .extract(html, "https://example.com/")
            .unwrap();
        assert_eq!(doc.best_content_text(), Some("Latest links"));
        assert!(doc.best_content_html().unwrap().contains("<p>Latest  links</p>"));

        // an article still wins over the body
        let doc = HtmlMetadataExtractor::new(true)
            .extract(ARTICLE_HTML.as_bytes(), "https://example.com/a")
            .unwrap();
        assert_eq!(doc.best_content_text(), Some("Headline Trouble in Pyongyang."));
    }

    #[test]
    fn scripts_and_styles_are_not_content() {
        let html = br#"<html><body><article>
<style>p { color: red }</style>
<p>Trouble in Pyongyang.</p>
<script>window.track("view");</script>
<noscript>Enable JavaScript</noscript>
</article></body></html>"#;
        let doc = HtmlMetadataExtractor::default()
            .extract(html, "https://example.com/a")
            .unwrap();
        assert_eq!(doc.best_content_text(), Some("Trouble in Pyongyang."));
    }

    #[test]
    fn accessors_tolerate_wrong_shapes() {
        let doc = MetadataDocument::new(json!({
            "title": {"best": {"value": 7}},
            "content": {"best": null},
            "timestamp.published": {"best": {"value": {"lo": "yesterday"}}},
        }));
        assert_eq!(doc.best_string("title"), None);
        assert_eq!(doc.best_content_html(), None);
        assert_eq!(doc.best_timestamp_lo(), None);
        assert_eq!(doc.best_string("missing"), None);
    }

    struct Panicking;

    impl MetadataExtractor for Panicking {
        fn extract(&self, _: &[u8], _: &str) -> Result<MetadataDocument, ExtractionError> {
            panic!("boom")
        }
    }

    #[test]
    fn failures_become_exception_documents() {
        let doc = extract_or_exception(&HtmlMetadataExtractor::default(), b"   ", "https://example.com/");
        assert!(doc.is_exception());
        assert_eq!(doc.as_json()["exception"]["type"], "Empty");
        assert_eq!(doc.as_json()["exception"]["location"], "extractor");

        let doc = extract_or_exception(&Panicking, b"<html></html>", "https://example.com/");
        assert_eq!(doc.as_json()["exception"]["message"], "extractor panicked: boom");
    }
}
