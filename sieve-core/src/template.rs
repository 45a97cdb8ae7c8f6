//! Template-driven extraction
//!
//! A crawl template is an ordered list of entries. Each entry turns one page
//! into one named result, either by regex, by XPath, or from a static value.
//! Results named `ip_port`, `ip`, `port` and `page` are routed by the crawler.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::sync::LazyLock;
use sxd_xpath::Value;
use thiserror::Error;

/// Separator joining multiple values of one result
pub const SEPARATOR: char = ',';

static LOCATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\d+)#").expect("valid placeholder regex"));

/// Extraction failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid rule {entry:?}: {reason}")]
    InvalidRule { entry: String, reason: String },

    #[error("no match for {entry:?} with {pattern:?}")]
    NoMatch { entry: String, pattern: String },
}

impl ExtractError {
    fn invalid(entry: &CrawlEntry, reason: impl Into<String>) -> Self {
        ExtractError::InvalidRule {
            entry: entry.name.clone(),
            reason: reason.into(),
        }
    }
}

/// How an entry extracts its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "content-regex", alias = "content:regex")]
    ContentRegex,
    #[serde(rename = "content-xpath", alias = "content:xpath")]
    ContentXpath,
    #[serde(rename = "content-static", alias = "content:static")]
    ContentStatic,
    #[serde(rename = "page-regex", alias = "page:regex")]
    PageRegex,
    #[serde(rename = "page-xpath", alias = "page:xpath")]
    PageXpath,
    #[serde(rename = "page-static", alias = "page:static")]
    PageStatic,
}

impl EntryKind {
    /// Kind of result this entry produces on success
    pub fn result_kind(&self) -> ResultKind {
        match self {
            EntryKind::ContentRegex | EntryKind::ContentXpath | EntryKind::ContentStatic => {
                ResultKind::Content
            }
            EntryKind::PageRegex | EntryKind::PageXpath | EntryKind::PageStatic => ResultKind::Url,
        }
    }
}

/// One declarative extraction rule
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlEntry {
    #[serde(deserialize_with = "trimmed")]
    pub name: String,
    pub kind: EntryKind,
    /// Regex or XPath expression; unused by static entries
    #[serde(default, deserialize_with = "trimmed")]
    pub pattern: String,
    /// Value template with `#N#`, `#$#` or `#page#` placeholders
    #[serde(default, deserialize_with = "trimmed")]
    pub value: String,
    #[serde(default)]
    pub max_pages: u32,
}

/// Multi-line TOML strings carry their surrounding whitespace
fn trimmed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(raw.trim().to_string())
}

impl CrawlEntry {
    pub fn new(name: &str, kind: EntryKind, pattern: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            pattern: pattern.trim().to_string(),
            value: value.trim().to_string(),
            max_pages: 0,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Named, ordered list of entries shared by crawl tasks
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlTemplate {
    pub name: String,
    #[serde(rename = "entry", default)]
    pub entries: Vec<CrawlEntry>,
}

impl CrawlTemplate {
    pub fn new(name: &str, entries: Vec<CrawlEntry>) -> Self {
        Self {
            name: name.to_string(),
            entries,
        }
    }

    /// Evaluate every entry in order; any failure fails the whole template
    pub fn extract(&self, html: &str) -> Result<Vec<ExtractionResult>, ExtractError> {
        self.entries
            .iter()
            .map(|entry| extract_entry(html, entry))
            .collect()
    }
}

/// Kind of an extraction result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Content,
    Url,
    Empty,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Content => write!(f, "content"),
            ResultKind::Url => write!(f, "url"),
            ResultKind::Empty => write!(f, "empty"),
        }
    }
}

/// Value produced by one entry against one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub name: String,
    pub kind: ResultKind,
    pub value: String,
}

impl ExtractionResult {
    fn new(entry: &CrawlEntry, kind: ResultKind, value: String) -> Self {
        Self {
            name: entry.name.clone(),
            kind,
            value,
        }
    }

    /// Separator-split values, blanks dropped
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.value
            .split(SEPARATOR)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Evaluate a single entry against a page
pub fn extract_entry(html: &str, entry: &CrawlEntry) -> Result<ExtractionResult, ExtractError> {
    match entry.kind {
        EntryKind::ContentRegex | EntryKind::PageRegex => extract_regex(html, entry),
        EntryKind::ContentXpath | EntryKind::PageXpath => extract_xpath(html, entry),
        EntryKind::ContentStatic | EntryKind::PageStatic => extract_static(entry),
    }
}

/// Capture-group indices referenced by `#N#` placeholders; `[0]` when none
fn placeholder_groups(template: &str) -> Vec<usize> {
    let groups: Vec<usize> = LOCATE_REGEX
        .captures_iter(template)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();

    if groups.is_empty() {
        vec![0]
    } else {
        groups
    }
}

fn extract_regex(html: &str, entry: &CrawlEntry) -> Result<ExtractionResult, ExtractError> {
    if entry.pattern.is_empty() {
        return Err(ExtractError::invalid(entry, "empty regex"));
    }
    let regex = Regex::new(&entry.pattern)
        .map_err(|e| ExtractError::invalid(entry, format!("bad regex: {}", e)))?;

    let has_placeholders = LOCATE_REGEX.is_match(&entry.value);
    let groups = placeholder_groups(&entry.value);

    let mut values = Vec::new();
    for caps in regex.captures_iter(html) {
        if !has_placeholders {
            values.push(caps[0].to_string());
            continue;
        }

        let mut value = entry.value.clone();
        for &group in &groups {
            if group >= caps.len() {
                continue;
            }
            let text = caps.get(group).map_or("", |m| m.as_str());
            value = value.replace(&format!("#{}#", group), text);
        }
        values.push(value);
    }

    if values.is_empty() {
        return Ok(ExtractionResult::new(entry, ResultKind::Empty, String::new()));
    }

    Ok(ExtractionResult::new(
        entry,
        entry.kind.result_kind(),
        values.join(&SEPARATOR.to_string()),
    ))
}

fn extract_xpath(html: &str, entry: &CrawlEntry) -> Result<ExtractionResult, ExtractError> {
    if entry.pattern.is_empty() {
        return Err(ExtractError::invalid(entry, "empty xpath"));
    }

    let package = sxd_html::parse_html(html);
    let document = package.as_document();

    let value = sxd_xpath::evaluate_xpath(&document, &entry.pattern)
        .map_err(|e| ExtractError::invalid(entry, format!("bad xpath: {}", e)))?;

    let text = match value {
        Value::Nodeset(nodes) => nodes.document_order_first().map(|node| node.string_value()),
        other => Some(other.string()).filter(|text| !text.is_empty()),
    };

    let text = text.ok_or_else(|| ExtractError::NoMatch {
        entry: entry.name.clone(),
        pattern: entry.pattern.clone(),
    })?;

    let value = if entry.value.is_empty() {
        text
    } else {
        entry.value.replace("#$#", &text)
    };

    Ok(ExtractionResult::new(entry, entry.kind.result_kind(), value))
}

fn extract_static(entry: &CrawlEntry) -> Result<ExtractionResult, ExtractError> {
    if entry.value.is_empty() {
        return Err(ExtractError::invalid(entry, "empty static value"));
    }

    if entry.kind != EntryKind::PageStatic {
        return Ok(ExtractionResult::new(
            entry,
            ResultKind::Content,
            entry.value.clone(),
        ));
    }

    if entry.max_pages == 0 {
        return Err(ExtractError::invalid(entry, "static page entry needs max_pages > 0"));
    }

    let urls: Vec<String> = (1..=entry.max_pages)
        .map(|page| entry.value.replace("#page#", &page.to_string()))
        .collect();

    Ok(ExtractionResult::new(
        entry,
        ResultKind::Url,
        urls.join(&SEPARATOR.to_string()),
    ))
}
