//! Ordered extraction strategies over scraped HTML and JSON payloads.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

static SELECTORS: LazyLock<Mutex<HashMap<&'static str, Option<Selector>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Text(&'static str),
    Attr(&'static str, &'static str),
    /// Last URL candidate of a `srcset` attribute.
    SrcsetLast(&'static str),
    OwnAttr(&'static str),
}

impl Strategy {
    fn selector(self) -> Option<&'static str> {
        match self {
            Strategy::Text(sel) | Strategy::Attr(sel, _) | Strategy::SrcsetLast(sel) => Some(sel),
            Strategy::OwnAttr(_) => None,
        }
    }

    fn read(self, element: ElementRef<'_>) -> Option<String> {
        match self {
            Strategy::Text(_) => text_or_none(element.text().collect::<String>()),
            Strategy::Attr(_, attr) | Strategy::OwnAttr(attr) => {
                element.value().attr(attr).and_then(|v| text_or_none(v.to_string()))
            }
            Strategy::SrcsetLast(_) => element
                .value()
                .attr("srcset")
                .and_then(|set| set.split(',').last())
                .and_then(|candidate| candidate.split_whitespace().next())
                .and_then(|url| text_or_none(url.to_string())),
        }
    }
}

pub fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn selector(css: &'static str) -> Option<Selector> {
    let mut cache = SELECTORS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(css)
        .or_insert_with(|| Selector::parse(css).ok())
        .clone()
}

pub fn try_extract(container: ElementRef<'_>, strategies: &[Strategy]) -> Option<String> {
    try_extract_where(container, strategies, |_| true)
}

/// Every element matched by a strategy is tried in document order before
/// falling through to the next strategy.
pub fn try_extract_where(
    container: ElementRef<'_>,
    strategies: &[Strategy],
    accept: impl Fn(&str) -> bool,
) -> Option<String> {
    for strategy in strategies {
        let Some(css) = strategy.selector() else {
            if let Some(value) = strategy.read(container).filter(|v| accept(v)) {
                return Some(value);
            }
            continue;
        };
        let Some(sel) = selector(css) else {
            continue;
        };
        for element in container.select(&sel) {
            if let Some(value) = strategy.read(element).filter(|v| accept(v)) {
                return Some(value);
            }
        }
    }
    None
}

pub fn select_containers<'a>(document: &'a Html, candidates: &[&'static str]) -> Vec<ElementRef<'a>> {
    for css in candidates.iter().copied() {
        let Some(sel) = selector(css) else {
            continue;
        };
        let found: Vec<_> = document.select(&sel).collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

pub fn first_matching_selector(html: &str, candidates: &[&'static str]) -> Option<&'static str> {
    let document = Html::parse_document(html);
    candidates.iter().copied().find(|css| {
        selector(css).is_some_and(|sel| document.select(&sel).next().is_some())
    })
}

pub fn page_has_any(html: &str, candidates: &[&'static str]) -> bool {
    first_matching_selector(html, candidates).is_some()
}

/// Visible body text with whitespace collapsed; script and style content excluded.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let Some(body) = selector("body").and_then(|sel| document.select(&sel).next()) else {
        return String::new();
    };
    let mut words = Vec::new();
    for node in body.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript"));
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

/// Walks `path` through nested objects; array segments are entered at their first element.
pub fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        if let Some(first) = cur.as_array().and_then(|a| a.first()) {
            cur = first;
        }
        cur = cur.get(*segment)?;
    }
    match cur.as_array() {
        Some(items) => items.first(),
        None => Some(cur),
    }
}

pub fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_path(value, path)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn json_first_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| json_text(value, &[*key]))
}
