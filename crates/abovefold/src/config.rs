//! Options, their validation and the string coercion table.
//!
//! `Options` deserializes from camelCase JSON. Values arriving as strings
//! (command-line flags) are converted through [`FIELD_COERCIONS`], which
//! names the parsing rule for every accepted field.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::css_engine::{IgnoreRules, Matcher};
use crate::fetch::RequestOptions;
use crate::html::InlineStrategy;
use crate::rebase::RebasePolicy;
use crate::types::{CriticalError, Dimension, Result};

pub const DEFAULT_WIDTH: u32 = 1300;
pub const DEFAULT_HEIGHT: u32 = 900;
pub const DEFAULT_MAX_IMAGE_FILE_SIZE: u64 = 10_240;
pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_EMBEDDED_BASE64_LENGTH: usize = 1000;

/// Caller-supplied choice of replacement stylesheet hrefs, given the
/// document's original ones.
pub type ReplaceFn = Arc<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

#[derive(Clone)]
pub enum ReplaceStylesheets {
    List(Vec<String>),
    Custom(ReplaceFn),
}

impl ReplaceStylesheets {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    {
        ReplaceStylesheets::Custom(Arc::new(f))
    }

    pub fn hrefs(&self, original: &[String]) -> Vec<String> {
        match self {
            ReplaceStylesheets::List(list) => list.clone(),
            ReplaceStylesheets::Custom(f) => f(original),
        }
    }
}

impl fmt::Debug for ReplaceStylesheets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceStylesheets::List(list) => f.debug_tuple("List").field(list).finish(),
            ReplaceStylesheets::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl<'de> Deserialize<'de> for ReplaceStylesheets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            One(String),
            Many(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(ReplaceStylesheets::List(Vec::new())),
            Raw::Flag(true) => Err(serde::de::Error::custom(
                "replaceStylesheets must be false, a string or a list",
            )),
            Raw::One(href) => Ok(ReplaceStylesheets::List(vec![href])),
            Raw::Many(hrefs) => Ok(ReplaceStylesheets::List(hrefs)),
        }
    }
}

/// Settings for splicing critical CSS into the document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct InlineOptions {
    pub strategy: InlineStrategy,
    pub replace_stylesheets: Option<ReplaceStylesheets>,
    /// Prefix for the synthesized uncritical stylesheet href.
    pub base_path: Option<String>,
}

fn inline_setting<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<InlineOptions>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Options(InlineOptions),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None | Some(Raw::Flag(false)) => None,
        Some(Raw::Flag(true)) => Some(InlineOptions::default()),
        Some(Raw::Options(options)) => Some(options),
    })
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(value)) => vec![value],
        Some(Raw::Many(values)) => values,
    })
}

/// Options handed to the render collaborator. `url`, `css`, `width` and
/// `height` are set per viewport and rejected here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RendererOptions {
    pub timeout: u64,
    pub force_include: Vec<Matcher>,
    pub max_embedded_base64_length: usize,
    url: Option<Value>,
    css: Option<Value>,
    width: Option<Value>,
    height: Option<Value>,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RENDER_TIMEOUT_MS,
            force_include: Vec::new(),
            max_embedded_base64_length: DEFAULT_MAX_EMBEDDED_BASE64_LENGTH,
            url: None,
            css: None,
            width: None,
            height: None,
        }
    }
}

impl RendererOptions {
    fn forbidden_keys(&self) -> Vec<&'static str> {
        [
            ("url", self.url.is_some()),
            ("css", self.css.is_some()),
            ("width", self.width.is_some()),
            ("height", self.height.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, set)| set.then_some(key))
        .collect()
    }
}

/// Output files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    pub css: Option<PathBuf>,
    pub html: Option<PathBuf>,
    pub uncritical: Option<PathBuf>,
}

impl Targets {
    /// A bare path is HTML when it ends in `.html`/`.htm`, otherwise CSS.
    /// In a list the first CSS path is the critical CSS and the second the
    /// uncritical CSS.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut targets = Targets::default();
        for path in paths {
            let path = path.as_ref();
            let lower = path.to_ascii_lowercase();
            if lower.ends_with(".html") || lower.ends_with(".htm") {
                targets.html = Some(PathBuf::from(path));
            } else if targets.css.is_none() {
                targets.css = Some(PathBuf::from(path));
            } else {
                targets.uncritical = Some(PathBuf::from(path));
            }
        }
        targets
    }

    pub fn is_empty(&self) -> bool {
        self.css.is_none() && self.html.is_none() && self.uncritical.is_none()
    }
}

impl<'de> Deserialize<'de> for Targets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
            Split {
                css: Option<PathBuf>,
                html: Option<PathBuf>,
                uncritical: Option<PathBuf>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(path) => Targets::from_paths([path]),
            Raw::Many(paths) => Targets::from_paths(paths),
            Raw::Split {
                css,
                html,
                uncritical,
            } => Targets {
                css,
                html,
                uncritical,
            },
        })
    }
}

/// Everything a `generate` call accepts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Options {
    /// Raw HTML. Exclusive with `src`.
    pub html: Option<String>,
    /// Path or URL of the document. Exclusive with `html`.
    pub src: Option<String>,
    /// Explicit stylesheets; skips discovery when non-empty.
    #[serde(deserialize_with = "one_or_many")]
    pub css: Vec<String>,
    /// Virtual root directory.
    pub base: Option<String>,
    /// Virtual directory of raw HTML below the root.
    pub folder: Option<String>,
    pub strict: bool,
    pub ignore_inlined_styles: bool,
    pub extract: bool,
    pub inline_images: bool,
    pub ignore: IgnoreRules,
    pub width: u32,
    pub height: u32,
    pub dimensions: Vec<Dimension>,
    pub minify: bool,
    #[serde(deserialize_with = "inline_setting")]
    pub inline: Option<InlineOptions>,
    pub max_image_file_size: u64,
    /// Force-included selectors.
    pub include: Vec<Matcher>,
    pub concurrency: Option<usize>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub request: RequestOptions,
    #[serde(alias = "penthouse")]
    pub renderer: RendererOptions,
    pub rebase: RebasePolicy,
    pub target: Targets,
    #[serde(deserialize_with = "one_or_many")]
    pub asset_paths: Vec<String>,
    pub user_agent: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            html: None,
            src: None,
            css: Vec::new(),
            base: None,
            folder: None,
            strict: false,
            ignore_inlined_styles: false,
            extract: false,
            inline_images: false,
            ignore: IgnoreRules::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            dimensions: Vec::new(),
            minify: true,
            inline: None,
            max_image_file_size: DEFAULT_MAX_IMAGE_FILE_SIZE,
            include: Vec::new(),
            concurrency: None,
            user: None,
            pass: None,
            request: RequestOptions::default(),
            renderer: RendererOptions::default(),
            rebase: RebasePolicy::default(),
            target: Targets::default(),
            asset_paths: Vec::new(),
            user_agent: None,
        }
    }
}

impl Options {
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CriticalError::Config(e.to_string()))
    }

    /// Check every rule and report the first violation.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(CriticalError::Config(message));

        match (&self.html, &self.src) {
            (Some(_), Some(_)) => return fail("html and src are mutually exclusive".into()),
            (None, None) => return fail("one of html or src is required".into()),
            _ => {}
        }
        if self.width == 0 || self.height == 0 {
            return fail(format!("width and height must be positive, got {}x{}", self.width, self.height));
        }
        if let Some(bad) = self.dimensions.iter().find(|d| d.width == 0 || d.height == 0) {
            return fail(format!("dimension {bad} must be positive"));
        }
        if self.concurrency == Some(0) {
            return fail("concurrency must be at least 1".into());
        }
        let forbidden = self.renderer.forbidden_keys();
        if !forbidden.is_empty() {
            return fail(format!(
                "renderer options may not set {}; they are set per viewport",
                forbidden.join(", ")
            ));
        }
        if self.pass.is_some() && self.user.is_none() {
            return fail("pass requires user".into());
        }
        if self.max_image_file_size == 0 {
            return fail("maxImageFileSize must be positive".into());
        }
        Ok(())
    }

    /// Requested viewports; `width`/`height` when no list is given.
    pub fn dimensions(&self) -> Vec<Dimension> {
        if self.dimensions.is_empty() {
            vec![Dimension::new(self.width, self.height)]
        } else {
            self.dimensions.clone()
        }
    }

    /// Force-included selectors from both `include` and the renderer
    /// options.
    pub fn force_include(&self) -> Vec<Matcher> {
        let mut all = self.include.clone();
        all.extend(self.renderer.force_include.iter().cloned());
        all
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base.as_deref().map(Path::new)
    }
}

/// How a string value becomes a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Last occurrence, as a string.
    Text,
    /// Last occurrence, as a boolean (`true`/`false`/`1`/`0`/`yes`/`no`).
    Flag,
    /// Last occurrence, as an unsigned integer.
    Integer,
    /// Every occurrence, split on commas.
    List,
    /// Every occurrence, verbatim.
    Items,
    /// Every occurrence, split on commas, each `WIDTHxHEIGHT`.
    Dimensions,
    /// Last occurrence, parsed as JSON.
    Json,
}

/// Parsing rule for every field accepted as a string. Dotted names address
/// nested options.
pub const FIELD_COERCIONS: &[(&str, Coercion)] = &[
    ("html", Coercion::Text),
    ("src", Coercion::Text),
    ("css", Coercion::List),
    ("base", Coercion::Text),
    ("folder", Coercion::Text),
    ("strict", Coercion::Flag),
    ("ignoreInlinedStyles", Coercion::Flag),
    ("extract", Coercion::Flag),
    ("inlineImages", Coercion::Flag),
    ("ignore", Coercion::Items),
    ("width", Coercion::Integer),
    ("height", Coercion::Integer),
    ("dimensions", Coercion::Dimensions),
    ("minify", Coercion::Flag),
    ("inline", Coercion::Flag),
    ("inline.basePath", Coercion::Text),
    ("inline.strategy", Coercion::Text),
    ("maxImageFileSize", Coercion::Integer),
    ("include", Coercion::Items),
    ("concurrency", Coercion::Integer),
    ("user", Coercion::Text),
    ("pass", Coercion::Text),
    ("userAgent", Coercion::Text),
    ("request", Coercion::Json),
    ("renderer", Coercion::Json),
    ("renderer.timeout", Coercion::Integer),
    ("rebase", Coercion::Json),
    ("target", Coercion::Items),
    ("assetPaths", Coercion::List),
];

pub fn coercion_for(field: &str) -> Option<Coercion> {
    FIELD_COERCIONS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, rule)| *rule)
}

fn parse_flag(field: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(CriticalError::Config(format!("{field}: expected a boolean, got {other:?}"))),
    }
}

fn parse_dimension(field: &str, raw: &str) -> Result<Value> {
    let parsed = raw
        .trim()
        .split_once(|c: char| c == 'x' || c == 'X')
        .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)));
    match parsed {
        Some((width, height)) => Ok(serde_json::json!({ "width": width, "height": height })),
        None => Err(CriticalError::Config(format!("{field}: expected WIDTHxHEIGHT, got {raw:?}"))),
    }
}

fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Convert the string occurrences of `field` into a JSON value by its
/// declared rule.
pub fn coerce(field: &str, values: &[String]) -> Result<Value> {
    let rule = coercion_for(field)
        .ok_or_else(|| CriticalError::Config(format!("unknown option: {field}")))?;
    let last = values.last().map(String::as_str).unwrap_or("");

    Ok(match rule {
        Coercion::Text => Value::String(last.to_string()),
        Coercion::Flag => Value::Bool(parse_flag(field, last)?),
        Coercion::Integer => {
            let n: u64 = last.trim().parse().map_err(|_| {
                CriticalError::Config(format!("{field}: expected an integer, got {last:?}"))
            })?;
            Value::from(n)
        }
        Coercion::List => Value::from(split_list(values)),
        Coercion::Items => Value::from(values.to_vec()),
        Coercion::Dimensions => Value::Array(
            split_list(values)
                .iter()
                .map(|raw| parse_dimension(field, raw))
                .collect::<Result<Vec<_>>>()?,
        ),
        Coercion::Json => serde_json::from_str(last)
            .map_err(|e| CriticalError::Config(format!("{field}: invalid JSON: {e}")))?,
    })
}

/// Coerce `values` and store them under the (possibly dotted) `field`.
/// A non-object value standing where a nested field goes is replaced by an
/// object, so `inline=true` followed by `inline.basePath` yields
/// `{"inline": {"basePath": ...}}`.
pub fn coerce_into(map: &mut Map<String, Value>, field: &str, values: &[String]) -> Result<()> {
    let value = coerce(field, values)?;
    let mut segments: Vec<&str> = field.split('.').collect();
    let leaf = segments.pop().unwrap_or(field);

    let mut current = map;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(inner) => inner,
            _ => unreachable!("slot was just made an object"),
        };
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> Options {
        Options::from_json(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let opts = options(json!({"src": "index.html"}));
        assert_eq!(opts.dimensions(), vec![Dimension::new(1300, 900)]);
        assert!(opts.minify);
        assert_eq!(opts.max_image_file_size, 10_240);
        assert_eq!(opts.renderer.timeout, 30_000);
        assert_eq!(opts.renderer.max_embedded_base64_length, 1000);
        assert!(opts.concurrency.is_none());
        assert!(opts.inline.is_none());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            Options::from_json(json!({"src": "a.html", "bogus": 1})),
            Err(CriticalError::Config(_))
        ));
    }

    #[test]
    fn test_validation_reports_first_failure() {
        let err = options(json!({"html": "<p>", "src": "a.html", "width": 0}))
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid options: html and src are mutually exclusive");

        let err = options(json!({"src": "a.html", "penthouse": {"url": "x", "width": 3}}))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("url, width"));

        let err = options(json!({"src": "a.html", "pass": "x"})).validate().unwrap_err();
        assert!(err.to_string().contains("pass requires user"));

        let err = options(json!({"src": "a.html", "concurrency": 0})).validate().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_inline_forms() {
        assert!(options(json!({"src": "a", "inline": false})).inline.is_none());
        let inline = options(json!({"src": "a", "inline": true})).inline.unwrap();
        assert_eq!(inline.strategy, InlineStrategy::Swap);

        let inline = options(json!({
            "src": "a",
            "inline": {"strategy": "media", "replaceStylesheets": ["/rest.css"], "basePath": "/static"}
        }))
        .inline
        .unwrap();
        assert_eq!(inline.strategy, InlineStrategy::Media);
        assert_eq!(inline.base_path.as_deref(), Some("/static"));
        assert_eq!(
            inline.replace_stylesheets.unwrap().hrefs(&[]),
            vec!["/rest.css".to_string()]
        );
    }

    #[test]
    fn test_targets() {
        let opts = options(json!({"src": "a", "target": "out/index.html"}));
        assert_eq!(opts.target.html, Some(PathBuf::from("out/index.html")));
        let opts = options(json!({"src": "a", "target": ["critical.css", "rest.css"]}));
        assert_eq!(opts.target.css, Some(PathBuf::from("critical.css")));
        assert_eq!(opts.target.uncritical, Some(PathBuf::from("rest.css")));
        let opts = options(json!({"src": "a", "target": {"uncritical": "u.css"}}));
        assert_eq!(opts.target.uncritical, Some(PathBuf::from("u.css")));
    }

    #[test]
    fn test_rebase_forms() {
        assert!(matches!(
            options(json!({"src": "a", "rebase": false})).rebase,
            RebasePolicy::Disabled
        ));
        assert!(matches!(
            options(json!({"src": "a", "rebase": {"from": "/css/a.css", "to": "/out/"}})).rebase,
            RebasePolicy::Remap { .. }
        ));
    }

    #[test]
    fn test_every_table_field_is_an_option() {
        for (field, _) in FIELD_COERCIONS {
            let top = field.split('.').next().unwrap();
            assert!(
                !matches!(
                    Options::from_json(json!({ top: Value::Null })),
                    Err(CriticalError::Config(ref m)) if m.contains("unknown field")
                ),
                "{field} is not an option"
            );
        }
    }

    #[test]
    fn test_coerce_rules() {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(coerce("width", &s(&["1024"])).unwrap(), json!(1024));
        assert_eq!(coerce("minify", &s(&["false"])).unwrap(), json!(false));
        assert_eq!(coerce("css", &s(&["a.css,b.css", "c.css"])).unwrap(), json!(["a.css", "b.css", "c.css"]));
        assert_eq!(coerce("ignore", &s(&["/a,b/"])).unwrap(), json!(["/a,b/"]));
        assert_eq!(
            coerce("dimensions", &s(&["1300x900,320X480"])).unwrap(),
            json!([{"width": 1300, "height": 900}, {"width": 320, "height": 480}])
        );
        assert_eq!(coerce("request", &s(&[r#"{"method":"GET"}"#])).unwrap(), json!({"method": "GET"}));
        assert!(coerce("width", &s(&["wide"])).is_err());
        assert!(coerce("nope", &s(&["1"])).is_err());
    }

    #[test]
    fn test_coerce_into_nested() {
        let mut map = Map::new();
        coerce_into(&mut map, "src", &["index.html".into()]).unwrap();
        coerce_into(&mut map, "inline", &["true".into()]).unwrap();
        coerce_into(&mut map, "inline.basePath", &["/static".into()]).unwrap();
        coerce_into(&mut map, "renderer.timeout", &["5".into()]).unwrap();
        let opts = Options::from_json(Value::Object(map)).unwrap();
        assert_eq!(opts.inline.unwrap().base_path.as_deref(), Some("/static"));
        assert_eq!(opts.renderer.timeout, 5);
    }
}
