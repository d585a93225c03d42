//! Splicing critical CSS into HTML and rewriting stylesheet links.
//!
//! The document is edited as text so everything outside the touched tags
//! is returned byte for byte.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

/// How stylesheet links are loaded once critical CSS is inlined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InlineStrategy {
    /// `rel="preload"` switched to `stylesheet` on load.
    #[default]
    Swap,
    /// `media="print"` switched to the original media on load.
    Media,
    /// Links moved to the end of `<body>`.
    Body,
}

/// What happens to the document's stylesheet links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Keep every link, loaded without blocking render.
    Keep,
    /// Remove every stylesheet link.
    Remove,
    /// Remove every stylesheet link and load these hrefs instead.
    Replace(Vec<String>),
}

/// A `<link rel="stylesheet">` tag and its byte range in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylesheetLink {
    pub start: usize,
    pub end: usize,
    pub href: String,
    pub media: Option<String>,
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<link\b[^>]*>").expect("link regex is valid"))
}

/// `<link>` attributes read when scanning for stylesheets.
#[derive(Debug, Clone, Copy)]
enum LinkAttr {
    Rel,
    Href,
    Media,
}

impl LinkAttr {
    fn regex(self) -> &'static Regex {
        static REL: OnceLock<Regex> = OnceLock::new();
        static HREF: OnceLock<Regex> = OnceLock::new();
        static MEDIA: OnceLock<Regex> = OnceLock::new();
        let (cell, name) = match self {
            LinkAttr::Rel => (&REL, "rel"),
            LinkAttr::Href => (&HREF, "href"),
            LinkAttr::Media => (&MEDIA, "media"),
        };
        cell.get_or_init(|| {
            Regex::new(&format!(
                r#"(?is)\s{name}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#
            ))
            .expect("attribute regex is valid")
        })
    }
}

fn attr(tag: &str, name: LinkAttr) -> Option<String> {
    let caps = name.regex().captures(tag)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim().to_string())
}

/// Stylesheet links in document order.
pub fn stylesheet_links(html: &str) -> Vec<StylesheetLink> {
    link_re()
        .find_iter(html)
        .filter_map(|m| {
            let tag = m.as_str();
            let is_stylesheet = attr(tag, LinkAttr::Rel).is_some_and(|rel| {
                rel.split_ascii_whitespace()
                    .any(|t| t.eq_ignore_ascii_case("stylesheet"))
            });
            let href = attr(tag, LinkAttr::Href)?;
            is_stylesheet.then(|| StylesheetLink {
                start: m.start(),
                end: m.end(),
                href,
                media: attr(tag, LinkAttr::Media),
            })
        })
        .collect()
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn deferred_link(href: &str, media: Option<&str>, strategy: InlineStrategy) -> String {
    let href = escape_attr(href);
    let media_attr = media
        .map(|m| format!(" media=\"{}\"", escape_attr(m)))
        .unwrap_or_default();
    let fallback = format!("<noscript><link rel=\"stylesheet\" href=\"{href}\"{media_attr}></noscript>");
    match strategy {
        InlineStrategy::Swap => format!(
            "<link rel=\"preload\" href=\"{href}\" as=\"style\"{media_attr} \
             onload=\"this.onload=null;this.rel='stylesheet'\">{fallback}"
        ),
        InlineStrategy::Media => {
            let target = escape_attr(media.unwrap_or("all")).replace('\'', "\\'");
            format!(
                "<link rel=\"stylesheet\" href=\"{href}\" media=\"print\" \
                 onload=\"this.media='{target}'\">{fallback}"
            )
        }
        InlineStrategy::Body => format!("<link rel=\"stylesheet\" href=\"{href}\"{media_attr}>"),
    }
}

fn find_head_end(html: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</head\s*>").expect("head regex is valid"))
        .find(html)
        .map(|m| m.start())
}

fn find_body_start(html: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<body\b").expect("body regex is valid"))
        .find(html)
        .map(|m| m.start())
}

fn find_body_end(html: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</body\s*>").expect("body regex is valid"))
        .find_iter(html)
        .last()
        .map(|m| m.start())
}

fn insert_at(html: &str, at: usize, fragment: &str) -> String {
    let mut result = String::with_capacity(html.len() + fragment.len());
    result.push_str(&html[..at]);
    result.push_str(fragment);
    result.push_str(&html[at..]);
    result
}

/// Insert `fragment` before `</head>`, else before `<body>`, else at the
/// very start.
fn insert_in_head(html: &str, fragment: &str) -> String {
    match find_head_end(html).or_else(|| find_body_start(html)) {
        Some(at) => insert_at(html, at, fragment),
        None => format!("{fragment}{html}"),
    }
}

/// Splice `css` into a `<style>` tag ahead of the first stylesheet link
/// and apply `action` to the links.
pub fn inline_critical(html: &str, css: &str, action: &LinkAction, strategy: InlineStrategy) -> String {
    let style = if css.is_empty() {
        String::new()
    } else {
        format!("<style>{}</style>", css.replace("</style", "<\\/style"))
    };
    let links = stylesheet_links(html);

    let replacements: Vec<String> = match action {
        LinkAction::Replace(hrefs) => hrefs
            .iter()
            .map(|href| deferred_link(href, None, strategy))
            .collect(),
        _ => Vec::new(),
    };

    if links.is_empty() {
        let fragment = if strategy == InlineStrategy::Body {
            style
        } else {
            format!("{style}{}", replacements.concat())
        };
        let out = insert_in_head(html, &fragment);
        return if strategy == InlineStrategy::Body {
            append_to_body(&out, &replacements.concat())
        } else {
            out
        };
    }

    let mut out = String::with_capacity(html.len() + css.len());
    let mut tail = String::new();
    let mut cursor = 0;
    for (index, link) in links.iter().enumerate() {
        out.push_str(&html[cursor..link.start]);
        if index == 0 {
            out.push_str(&style);
        }
        match action {
            LinkAction::Keep => {
                let deferred = deferred_link(&link.href, link.media.as_deref(), strategy);
                if strategy == InlineStrategy::Body {
                    tail.push_str(&deferred);
                } else {
                    out.push_str(&deferred);
                }
            }
            LinkAction::Remove => {}
            LinkAction::Replace(_) if index == 0 => {
                if strategy == InlineStrategy::Body {
                    tail.push_str(&replacements.concat());
                } else {
                    out.push_str(&replacements.concat());
                }
            }
            LinkAction::Replace(_) => {}
        }
        cursor = link.end;
    }
    out.push_str(&html[cursor..]);

    if tail.is_empty() {
        out
    } else {
        append_to_body(&out, &tail)
    }
}

fn append_to_body(html: &str, fragment: &str) -> String {
    if fragment.is_empty() {
        return html.to_string();
    }
    match find_body_end(html) {
        Some(at) => insert_at(html, at, fragment),
        None => format!("{html}{fragment}"),
    }
}
