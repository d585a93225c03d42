//! CSS merging, filtering, differencing and printing on top of lightningcss.
//!
//! Stylesheets are parsed once into an owned rule tree (`Node`). Style
//! rules keep their selectors and declarations as printed strings, `@media`
//! blocks keep their children, and every other rule is kept as opaque text.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use lightningcss::printer::PrinterOptions;
use lightningcss::rules::CssRule;
use lightningcss::stylesheet::{ParserOptions, StyleSheet};
use lightningcss::traits::ToCss;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::types::{CriticalError, Result};

/// At-rule type markers usable in ignore lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtRuleKind {
    FontFace,
    Media,
    Keyframes,
    Import,
    Supports,
    Page,
}

impl AtRuleKind {
    fn matches(self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            AtRuleKind::FontFace => name == "font-face",
            AtRuleKind::Media => name == "media",
            AtRuleKind::Keyframes => name.ends_with("keyframes"),
            AtRuleKind::Import => name == "import",
            AtRuleKind::Supports => name == "supports",
            AtRuleKind::Page => name == "page",
        }
    }
}

impl FromStr for AtRuleKind {
    type Err = CriticalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('@').to_ascii_lowercase().as_str() {
            "font-face" => Ok(AtRuleKind::FontFace),
            "media" => Ok(AtRuleKind::Media),
            "keyframes" => Ok(AtRuleKind::Keyframes),
            "import" => Ok(AtRuleKind::Import),
            "supports" => Ok(AtRuleKind::Supports),
            "page" => Ok(AtRuleKind::Page),
            other => Err(CriticalError::Config(format!("unknown at-rule type: {other}"))),
        }
    }
}

/// A regular expression written as `/source/flags`.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
    regex: Regex,
}

impl Pattern {
    /// `None` when `text` is not in `/source/flags` form.
    pub fn parse(text: &str) -> Option<Result<Self>> {
        let rest = text.strip_prefix('/')?;
        let end = rest.rfind('/')?;
        let (source, flags) = (&rest[..end], &rest[end + 1..]);
        if !flags.chars().all(|c| "gimsuy".contains(c)) {
            return None;
        }
        if source.is_empty() {
            // An empty expression matches everything.
            return Some(Err(CriticalError::Config(format!("empty pattern {text}"))));
        }
        let inline: String = flags.chars().filter(|c| "ims".contains(*c)).collect();
        let expr = if inline.is_empty() {
            source.to_string()
        } else {
            format!("(?{inline}){source}")
        };
        Some(
            Regex::new(&expr)
                .map(|regex| Pattern {
                    source: source.to_string(),
                    flags: flags.to_string(),
                    regex,
                })
                .map_err(|e| CriticalError::Config(format!("invalid pattern {text}: {e}"))),
        )
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.flags == other.flags
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

/// One ignore (or force-include) matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Literal(String),
    Pattern(Pattern),
    Kind(AtRuleKind),
}

impl Matcher {
    /// Strings in `/source/flags` form become patterns, everything else a
    /// literal.
    pub fn parse(text: &str) -> Result<Self> {
        match Pattern::parse(text) {
            Some(pattern) => Ok(Matcher::Pattern(pattern?)),
            None => Ok(Matcher::Literal(text.to_string())),
        }
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            Matcher::Literal(literal) => literal == text,
            Matcher::Pattern(pattern) => pattern.is_match(text),
            Matcher::Kind(_) => false,
        }
    }

    fn matches_at_rule(&self, name: &str, prelude: &str) -> bool {
        match self {
            Matcher::Kind(kind) => kind.matches(name),
            Matcher::Literal(literal) => {
                literal == prelude || literal.trim_start_matches('@') == name
            }
            Matcher::Pattern(pattern) => pattern.is_match(prelude),
        }
    }

    fn matches_declaration(&self, declaration: &Declaration) -> bool {
        let spaced = declaration.spaced();
        match self {
            Matcher::Literal(literal) => {
                *literal == declaration.property || *literal == declaration.text || *literal == spaced
            }
            Matcher::Pattern(pattern) => pattern.is_match(&spaced),
            Matcher::Kind(_) => false,
        }
    }
}

impl<'de> Deserialize<'de> for Matcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Kind {
                #[serde(rename = "type")]
                kind: String,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Matcher::parse(&text).map_err(serde::de::Error::custom),
            Raw::Kind { kind } => kind
                .parse()
                .map(Matcher::Kind)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Ignore lists per target kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoreRules {
    pub atrule: Vec<Matcher>,
    pub rule: Vec<Matcher>,
    pub decl: Vec<Matcher>,
}

impl IgnoreRules {
    /// The array form: every matcher applies to at-rules, rules and
    /// declarations alike.
    pub fn everywhere(matchers: Vec<Matcher>) -> Self {
        Self {
            atrule: matchers.clone(),
            rule: matchers.clone(),
            decl: matchers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.atrule.is_empty() && self.rule.is_empty() && self.decl.is_empty()
    }
}

impl<'de> Deserialize<'de> for IgnoreRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(Vec<Matcher>),
            Split {
                #[serde(default)]
                atrule: Vec<Matcher>,
                #[serde(default)]
                rule: Vec<Matcher>,
                #[serde(default)]
                decl: Vec<Matcher>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::List(matchers) => IgnoreRules::everywhere(matchers),
            Raw::Split { atrule, rule, decl } => IgnoreRules { atrule, rule, decl },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Declaration {
    property: String,
    /// Minified `property:value[!important]`.
    text: String,
}

impl Declaration {
    fn new(text: String) -> Self {
        let property = text.split(':').next().unwrap_or("").trim().to_string();
        Self { property, text }
    }

    fn spaced(&self) -> String {
        match self.text.split_once(':') {
            Some((property, value)) => format!("{property}: {value}"),
            None => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Style {
        selectors: Vec<String>,
        declarations: Vec<Declaration>,
    },
    Media {
        query: String,
        children: Vec<Node>,
    },
    Other {
        name: String,
        text: String,
    },
}

impl Node {
    fn write(&self, out: &mut String) {
        match self {
            Node::Style {
                selectors,
                declarations,
            } => {
                out.push_str(&selectors.join(","));
                out.push('{');
                let body: Vec<&str> = declarations.iter().map(|d| d.text.as_str()).collect();
                out.push_str(&body.join(";"));
                out.push('}');
            }
            Node::Media { query, children } => {
                out.push_str("@media ");
                out.push_str(query);
                out.push('{');
                for child in children {
                    child.write(out);
                }
                out.push('}');
            }
            Node::Other { text, .. } => out.push_str(text),
        }
    }
}

fn printer() -> PrinterOptions<'static> {
    PrinterOptions {
        minify: true,
        ..PrinterOptions::default()
    }
}

fn css_error(e: impl fmt::Display) -> CriticalError {
    CriticalError::Css(e.to_string())
}

fn parse(css: &str) -> Result<Vec<Node>> {
    let options = ParserOptions {
        error_recovery: true,
        ..ParserOptions::default()
    };
    let sheet = StyleSheet::parse(css, options).map_err(css_error)?;
    own_rules(&sheet.rules.0)
}

fn own_rules(rules: &[CssRule<'_>]) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(rules.len());
    for rule in rules {
        match rule {
            CssRule::Style(style) if style.rules.0.is_empty() => {
                let mut selectors = Vec::new();
                for selector in &style.selectors.0 {
                    selectors.push(selector.to_css_string(printer()).map_err(css_error)?);
                }
                let block = &style.declarations;
                let mut declarations = Vec::new();
                for property in &block.declarations {
                    declarations.push(Declaration::new(
                        property.to_css_string(false, printer()).map_err(css_error)?,
                    ));
                }
                for property in &block.important_declarations {
                    declarations.push(Declaration::new(
                        property.to_css_string(true, printer()).map_err(css_error)?,
                    ));
                }
                if !selectors.is_empty() && !declarations.is_empty() {
                    nodes.push(Node::Style {
                        selectors,
                        declarations,
                    });
                }
            }
            CssRule::Media(media) => {
                let children = own_rules(&media.rules.0)?;
                if !children.is_empty() {
                    nodes.push(Node::Media {
                        query: media.query.to_css_string(printer()).map_err(css_error)?,
                        children,
                    });
                }
            }
            CssRule::Ignored => {}
            other => {
                let text = other.to_css_string(printer()).map_err(css_error)?;
                if text.is_empty() {
                    continue;
                }
                nodes.push(Node::Other {
                    name: at_rule_name(&text),
                    text,
                });
            }
        }
    }
    Ok(nodes)
}

fn at_rule_name(text: &str) -> String {
    text.strip_prefix('@')
        .map(|rest| {
            rest.chars()
                .take_while(|c| !c.is_whitespace() && !"{(;\"'".contains(*c))
                .collect()
        })
        .unwrap_or_default()
}

fn at_rule_prelude(text: &str) -> &str {
    let end = text.find(|c: char| c == '{' || c == ';').unwrap_or(text.len());
    text[..end].trim()
}

fn print(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        node.write(&mut out);
    }
    out
}

fn dedupe(nodes: Vec<Node>) -> Vec<Node> {
    let nodes = nodes.into_iter().map(|node| match node {
        Node::Media { query, children } => Node::Media {
            query,
            children: dedupe(children),
        },
        other => other,
    });
    let mut seen = HashSet::new();
    let mut kept: Vec<Node> = nodes
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .filter(|node| seen.insert(node.clone()))
        .collect();
    kept.reverse();
    kept
}

fn fold_media(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Node::Media { query, children } = &node {
            if let Some(Node::Media {
                query: previous,
                children: previous_children,
            }) = out.last_mut()
            {
                if previous == query {
                    previous_children.extend(children.iter().cloned());
                    continue;
                }
            }
        }
        out.push(node);
    }
    out.into_iter()
        .map(|node| match node {
            Node::Media { query, children } => Node::Media {
                query,
                children: dedupe(children),
            },
            other => other,
        })
        .collect()
}

/// Remove duplicate rules (the last occurrence wins), duplicate `@media`
/// blocks and `@font-face` rules, then fold adjacent `@media` blocks with
/// the same query.
pub fn merge(css: &str) -> Result<String> {
    Ok(print(&fold_media(dedupe(parse(css)?))))
}

fn discard_nodes(nodes: Vec<Node>, rules: &IgnoreRules) -> Vec<Node> {
    nodes
        .into_iter()
        .filter_map(|node| match node {
            Node::Style {
                selectors,
                declarations,
            } => {
                let joined = selectors.join(",");
                let ignored = rules.rule.iter().any(|m| {
                    m.matches_text(&joined) || selectors.iter().any(|s| m.matches_text(s))
                });
                if ignored {
                    return None;
                }
                let declarations: Vec<Declaration> = declarations
                    .into_iter()
                    .filter(|d| !rules.decl.iter().any(|m| m.matches_declaration(d)))
                    .collect();
                (!declarations.is_empty()).then_some(Node::Style {
                    selectors,
                    declarations,
                })
            }
            Node::Media { query, children } => {
                let prelude = format!("@media {query}");
                if rules.atrule.iter().any(|m| m.matches_at_rule("media", &prelude)) {
                    return None;
                }
                let children = discard_nodes(children, rules);
                (!children.is_empty()).then_some(Node::Media { query, children })
            }
            Node::Other { name, text } => {
                let ignored = rules
                    .atrule
                    .iter()
                    .any(|m| m.matches_at_rule(&name, at_rule_prelude(&text)));
                (!ignored).then_some(Node::Other { name, text })
            }
        })
        .collect()
}

/// Drop at-rules, rules and declarations hit by the ignore matchers.
pub fn discard(css: &str, rules: &IgnoreRules) -> Result<String> {
    if rules.is_empty() {
        return Ok(css.to_string());
    }
    Ok(print(&discard_nodes(parse(css)?, rules)))
}

fn subtract(full: Vec<Node>, critical: &[Node]) -> Vec<Node> {
    full.into_iter()
        .filter_map(|node| match node {
            Node::Style {
                selectors,
                declarations,
            } => {
                let covered: HashSet<&Declaration> = critical
                    .iter()
                    .filter_map(|c| match c {
                        Node::Style {
                            selectors: s,
                            declarations: d,
                        } if *s == selectors => Some(d.iter()),
                        _ => None,
                    })
                    .flatten()
                    .collect();
                let remaining: Vec<Declaration> = declarations
                    .into_iter()
                    .filter(|d| !covered.contains(d))
                    .collect();
                (!remaining.is_empty()).then_some(Node::Style {
                    selectors,
                    declarations: remaining,
                })
            }
            Node::Media { query, children } => {
                let critical_children: Vec<Node> = critical
                    .iter()
                    .filter_map(|c| match c {
                        Node::Media {
                            query: q,
                            children: ch,
                        } if *q == query => Some(ch.iter().cloned()),
                        _ => None,
                    })
                    .flatten()
                    .collect();
                let children = subtract(children, &critical_children);
                (!children.is_empty()).then_some(Node::Media { query, children })
            }
            other => (!critical.contains(&other)).then_some(other),
        })
        .collect()
}

/// Everything in `full` not covered by `critical`, per rule and per
/// declaration. Unparseable input yields `full` unchanged.
pub fn difference(full: &str, critical: &str) -> String {
    match (parse(full), parse(critical)) {
        (Ok(full_nodes), Ok(critical_nodes)) => print(&subtract(full_nodes, &critical_nodes)),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("cannot compute uncritical CSS: {e}");
            full.to_string()
        }
    }
}

fn reprint(css: &str, minify: bool) -> Result<String> {
    let options = ParserOptions {
        error_recovery: true,
        ..ParserOptions::default()
    };
    let sheet = StyleSheet::parse(css, options).map_err(css_error)?;
    let printed = sheet
        .to_css(PrinterOptions {
            minify,
            ..PrinterOptions::default()
        })
        .map_err(css_error)?;
    Ok(printed.code)
}

/// Minified form of `css`. Idempotent.
pub fn minify(css: &str) -> Result<String> {
    reprint(css, true)
}

/// Pretty-printed form of `css`.
pub fn normalize(css: &str) -> Result<String> {
    reprint(css, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_last_duplicate() {
        let css = ".a{color:red}.b{color:blue}.a{color:red}";
        assert_eq!(merge(css).unwrap(), ".b{color:#00f}.a{color:red}");
    }

    #[test]
    fn test_merge_folds_adjacent_media() {
        let css = "@media (min-width:800px){.a{color:red}}@media (min-width:800px){.b{color:red}.a{color:red}}";
        let merged = merge(css).unwrap();
        assert_eq!(merged.matches("@media").count(), 1);
        assert!(merged.contains(".b{color:red}.a{color:red}"));
    }

    #[test]
    fn test_merge_dedupes_font_face() {
        let css = "@font-face{font-family:X;src:url(x.woff)}@font-face{font-family:X;src:url(x.woff)}";
        assert_eq!(merge(css).unwrap().matches("@font-face").count(), 1);
    }

    #[test]
    fn test_discard_array_form() {
        let rules = IgnoreRules::everywhere(vec![
            Matcher::Kind(AtRuleKind::FontFace),
            Matcher::parse("/^\\.ad/").unwrap(),
        ]);
        let css = "@font-face{font-family:X;src:url(x.woff)}.ad-banner{color:red}.keep{color:red}";
        assert_eq!(discard(css, &rules).unwrap(), ".keep{color:red}");
    }

    #[test]
    fn test_discard_declarations() {
        let rules = IgnoreRules {
            decl: vec![Matcher::Literal("cursor".into())],
            ..IgnoreRules::default()
        };
        let out = discard(".a{color:red;cursor:pointer}.b{cursor:pointer}", &rules).unwrap();
        assert_eq!(out, ".a{color:red}");
    }

    #[test]
    fn test_discard_media_by_prelude_pattern() {
        let rules = IgnoreRules {
            atrule: vec![Matcher::parse("/print/").unwrap()],
            ..IgnoreRules::default()
        };
        let out = discard("@media print{.a{color:red}}.b{color:red}", &rules).unwrap();
        assert_eq!(out, ".b{color:red}");
    }

    #[test]
    fn test_ignore_rules_from_json() {
        let rules: IgnoreRules =
            serde_json::from_value(serde_json::json!(["@font-face", "/url\\(/i", {"type": "@media"}]))
                .unwrap();
        assert_eq!(rules.atrule.len(), 3);
        assert_eq!(rules.decl, rules.rule);
        assert!(matches!(rules.rule[1], Matcher::Pattern(_)));
        assert_eq!(rules.rule[2], Matcher::Kind(AtRuleKind::Media));

        let split: IgnoreRules =
            serde_json::from_value(serde_json::json!({"rule": [".x"]})).unwrap();
        assert!(split.atrule.is_empty());
        assert_eq!(split.rule, vec![Matcher::Literal(".x".into())]);
    }

    #[test]
    fn test_pattern_flags() {
        let pattern = Pattern::parse("/HEADER/i").unwrap().unwrap();
        assert!(pattern.is_match(".header"));
        assert_eq!(pattern.to_string(), "/HEADER/i");
        assert!(Pattern::parse("a/b").is_none());
    }

    #[test]
    fn test_empty_pattern_is_rejected() {
        assert!(matches!(Pattern::parse("//"), Some(Err(CriticalError::Config(_)))));
        assert!(matches!(Pattern::parse("//gi"), Some(Err(CriticalError::Config(_)))));
        assert!(Matcher::parse("//").is_err());
    }

    #[test]
    fn test_difference_per_declaration() {
        let full = ".a{color:red;margin:0}.b{color:blue}@media print{.c{color:red}}";
        let critical = ".a{color:red}";
        assert_eq!(
            difference(full, critical),
            ".a{margin:0}.b{color:#00f}@media print{.c{color:red}}"
        );
    }

    #[test]
    fn test_difference_of_identical_is_empty() {
        let css = ".a{color:red}@media (min-width:100px){.b{color:red}}";
        assert_eq!(difference(css, css), "");
    }

    #[test]
    fn test_minify_is_idempotent() {
        let once = minify(".header {\n  color: #333333;\n}\n").unwrap();
        assert_eq!(once, ".header{color:#333}");
        assert_eq!(minify(&once).unwrap(), once);
    }

    #[test]
    fn test_normalize_pretty_prints() {
        let out = normalize(".a{color:red}").unwrap();
        assert!(out.contains(".a {"));
    }
}
