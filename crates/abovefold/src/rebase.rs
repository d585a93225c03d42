//! Rewriting of `url()` and `@import` references when a stylesheet's text
//! is relocated.
//!
//! A reference is first resolved against the stylesheet's own directory,
//! then re-expressed relative to the target directory (normally the
//! document's). `{from, to}` overrides either end of that computation, a
//! custom function replaces it entirely, and `Disabled` leaves text as is.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};

use crate::path::{
    is_remote, join_path, names_directory, path_part, relative_reference, same_origin, virtual_path,
};
use crate::types::{Asset, Location, Result};

/// Caller-supplied rebase function. Returning `None` keeps the original.
pub type RebaseFn = Arc<dyn Fn(&Asset) -> Option<String> + Send + Sync>;

/// How references inside relocated stylesheets are rewritten.
#[derive(Clone, Default)]
pub enum RebasePolicy {
    /// Recompute relative references for the target directory.
    #[default]
    Relative,
    /// Treat the stylesheet as living at `from` and the output at `to`.
    Remap {
        from: Option<String>,
        to: Option<String>,
    },
    Custom(RebaseFn),
    Disabled,
}

impl RebasePolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Asset) -> Option<String> + Send + Sync + 'static,
    {
        RebasePolicy::Custom(Arc::new(f))
    }
}

impl fmt::Debug for RebasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebasePolicy::Relative => f.write_str("Relative"),
            RebasePolicy::Remap { from, to } => f
                .debug_struct("Remap")
                .field("from", from)
                .field("to", to)
                .finish(),
            RebasePolicy::Custom(_) => f.write_str("Custom(..)"),
            RebasePolicy::Disabled => f.write_str("Disabled"),
        }
    }
}

impl<'de> Deserialize<'de> for RebasePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Remap {
                from: Option<String>,
                to: Option<String>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => RebasePolicy::Relative,
            Raw::Flag(false) => RebasePolicy::Disabled,
            Raw::Remap { from, to } => RebasePolicy::Remap { from, to },
        })
    }
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^'"\s)]*))\s*\)"#)
            .expect("url regex is valid")
    })
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("import regex is valid")
    })
}

/// Every `url()` reference in `css`, in source order.
pub fn url_references(css: &str) -> Vec<String> {
    url_re()
        .captures_iter(css)
        .filter_map(|caps| reference_of(&caps).map(str::to_string))
        .collect()
}

/// `@import` targets in `css`, both `url()` and string forms, in order.
pub fn import_references(css: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)@import\s+(?:url\(\s*(?:"([^"]*)"|'([^']*)'|([^'"\s)]*))\s*\)|"([^"]*)"|'([^']*)')"#)
            .expect("import target regex is valid")
    });
    re.captures_iter(css)
        .filter_map(|caps| {
            (1..=5)
                .find_map(|i| caps.get(i))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|href| !href.is_empty())
        .collect()
}

fn reference_of<'a>(caps: &Captures<'a>) -> Option<&'a str> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim())
}

/// Replace every `url()` reference for which `f` returns a new value,
/// keeping the original quote style.
pub fn replace_urls<F>(css: &str, mut f: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    url_re()
        .replace_all(css, |caps: &Captures<'_>| {
            let original = caps[0].to_string();
            let Some(reference) = reference_of(caps) else {
                return original;
            };
            match f(reference) {
                Some(new) => {
                    let quote = if caps.get(1).is_some() {
                        "\""
                    } else if caps.get(2).is_some() {
                        "'"
                    } else if new.contains(|c: char| c.is_whitespace() || "()'\"".contains(c)) {
                        "\""
                    } else {
                        ""
                    };
                    format!("url({quote}{new}{quote})")
                }
                None => original,
            }
        })
        .into_owned()
}

/// References that are never rewritten.
pub fn is_inert(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    reference.is_empty()
        || reference.starts_with('#')
        || lower.starts_with("data:")
        || lower.starts_with("about:")
        || lower.starts_with("javascript:")
}

/// Resolved parameters for rebasing one stylesheet.
pub struct Rebaser<'a> {
    root: &'a Location,
    source: Location,
    target: Location,
    policy: &'a RebasePolicy,
}

impl<'a> Rebaser<'a> {
    /// `stylesheet` is the stylesheet's own location, `target_dir` the
    /// directory the rewritten text must be valid from.
    pub fn new(
        root: &'a Location,
        stylesheet: &Location,
        target_dir: Location,
        policy: &'a RebasePolicy,
    ) -> Result<Self> {
        let (source, target) = match policy {
            RebasePolicy::Remap { from, to } => {
                let source = match from {
                    Some(from) => mapped_directory(root, from)?,
                    None => stylesheet.parent(),
                };
                let target = match to {
                    Some(to) => mapped_directory(root, to)?,
                    None => target_dir,
                };
                (source, target)
            }
            _ => (stylesheet.parent(), target_dir),
        };
        Ok(Self {
            root,
            source,
            target,
            policy,
        })
    }

    /// Rewrite every relocatable reference in `css`.
    pub fn rebase(&self, css: &str) -> String {
        if matches!(self.policy, RebasePolicy::Disabled) {
            return css.to_string();
        }

        let pass = replace_urls(css, |reference| self.rewrite(reference));

        import_re()
            .replace_all(&pass, |caps: &Captures<'_>| {
                let original = caps[0].to_string();
                let Some(reference) = reference_of(caps) else {
                    return original;
                };
                match self.rewrite(reference) {
                    Some(new) if caps.get(1).is_some() => format!("@import \"{new}\""),
                    Some(new) => format!("@import '{new}'"),
                    None => original,
                }
            })
            .into_owned()
    }

    /// New reference for `reference`, or `None` to keep it verbatim.
    pub fn rewrite(&self, reference: &str) -> Option<String> {
        if is_inert(reference) || is_remote(reference) {
            return None;
        }

        if reference.starts_with('/') {
            // Root-absolute references stay valid while source and target
            // share the same root.
            return match (&self.source, &self.target) {
                (Location::Remote(src), Location::Remote(dst)) if same_origin(src, dst) => None,
                (Location::Remote(src), _) => src.join(reference).ok().map(|u| u.to_string()),
                _ => None,
            };
        }

        let split = reference
            .find(|c: char| c == '?' || c == '#')
            .unwrap_or(reference.len());
        let (path_part, suffix) = reference.split_at(split);
        if path_part.is_empty() {
            return None;
        }

        let asset_location = join_path(&self.source, path_part).ok()?;

        match self.policy {
            RebasePolicy::Disabled => None,
            RebasePolicy::Custom(f) => {
                let asset = Asset {
                    href: reference.to_string(),
                    absolute_path: format!(
                        "{}{suffix}",
                        virtual_path(self.root, &asset_location)
                    ),
                    location: asset_location,
                    contents: None,
                };
                f(&asset)
            }
            RebasePolicy::Relative | RebasePolicy::Remap { .. } => {
                let new = match (&self.target, &asset_location) {
                    (Location::Remote(_), Location::Local(_)) => {
                        let virt = virtual_path(self.root, &asset_location);
                        if !virt.starts_with('/') {
                            return None;
                        }
                        virt
                    }
                    _ => relative_reference(&self.target, &asset_location),
                };
                Some(format!("{new}{suffix}"))
            }
        }
    }
}

/// Interpret a `from`/`to` value: URLs as-is, anything else as a path
/// under the virtual root.
fn locate(root: &Location, reference: &str) -> Result<Location> {
    if is_remote(reference) {
        return join_path(root, reference);
    }
    join_path(root, reference.trim_start_matches('/'))
}

/// Directory a `from`/`to` value stands for: the value itself when it
/// names a directory, else the directory of the file it names.
fn mapped_directory(root: &Location, reference: &str) -> Result<Location> {
    let located = locate(root, &path_part(reference).replace('\\', "/"))?;
    if names_directory(reference) {
        Ok(located)
    } else {
        Ok(located.parent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use url::Url;

    fn local(p: &str) -> Location {
        Location::Local(PathBuf::from(p))
    }

    fn root() -> Location {
        local("/site")
    }

    #[test]
    fn test_relative_rebase_into_document_dir() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let rebaser =
            Rebaser::new(&root, &local("/site/css/main.css"), local("/site"), &policy).unwrap();
        let out = rebaser.rebase(".a{background:url(../img/a.png)} .b{background:url('b.png')}");
        assert_eq!(
            out,
            ".a{background:url(img/a.png)} .b{background:url('css/b.png')}"
        );
    }

    #[test]
    fn test_inert_and_absolute_references_untouched() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let rebaser =
            Rebaser::new(&root, &local("/site/css/main.css"), local("/site/pages"), &policy).unwrap();
        let css = r#"a{b:url(data:image/png;base64,AAA=)} c{d:url("/img/x.png")} e{f:url(https://cdn.test/y.png)} g{filter:url(#blur)}"#;
        assert_eq!(rebaser.rebase(css), css);
    }

    #[test]
    fn test_query_and_fragment_preserved() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let rebaser =
            Rebaser::new(&root, &local("/site/fonts/f.css"), local("/site"), &policy).unwrap();
        assert_eq!(
            rebaser.rewrite("font.eot?#iefix").as_deref(),
            Some("fonts/font.eot?#iefix")
        );
    }

    #[test]
    fn test_string_import_rebased() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let rebaser =
            Rebaser::new(&root, &local("/site/css/main.css"), local("/site"), &policy).unwrap();
        assert_eq!(
            rebaser.rebase("@import \"reset.css\";"),
            "@import \"css/reset.css\";"
        );
    }

    #[test]
    fn test_disabled_policy_keeps_text() {
        let root = root();
        let policy = RebasePolicy::Disabled;
        let rebaser =
            Rebaser::new(&root, &local("/site/css/main.css"), local("/site"), &policy).unwrap();
        let css = "a{b:url(../img/a.png)}";
        assert_eq!(rebaser.rebase(css), css);
    }

    #[test]
    fn test_remap_policy() {
        let root = root();
        let policy = RebasePolicy::Remap {
            from: Some("/assets/css/app.css".into()),
            to: Some("/dist/index.html".into()),
        };
        let rebaser =
            Rebaser::new(&root, &local("/tmp/elsewhere.css"), local("/site"), &policy).unwrap();
        assert_eq!(rebaser.rewrite("../img/a.png").as_deref(), Some("../assets/img/a.png"));
    }

    #[test]
    fn test_remap_directory_values_are_the_directory() {
        let root = root();
        let policy = RebasePolicy::Remap {
            from: Some("/assets/css/".into()),
            to: Some("/pages/".into()),
        };
        let rebaser =
            Rebaser::new(&root, &local("/tmp/elsewhere.css"), local("/site"), &policy).unwrap();
        assert_eq!(rebaser.rewrite("../img/a.png").as_deref(), Some("../assets/img/a.png"));

        let file_form = RebasePolicy::Remap {
            from: Some("/assets/css/app.css".into()),
            to: Some("/pages/index.html".into()),
        };
        let rebaser =
            Rebaser::new(&root, &local("/tmp/elsewhere.css"), local("/site"), &file_form).unwrap();
        assert_eq!(rebaser.rewrite("../img/a.png").as_deref(), Some("../assets/img/a.png"));
    }

    #[test]
    fn test_custom_policy_receives_absolute_path() {
        let root = root();
        let policy =
            RebasePolicy::custom(|asset| Some(format!("https://cdn.example.com{}", asset.absolute_path)));
        let rebaser =
            Rebaser::new(&root, &local("/site/css/main.css"), local("/site"), &policy).unwrap();
        assert_eq!(
            rebaser.rebase("a{b:url(../img/a.png?v=1)}"),
            "a{b:url(https://cdn.example.com/img/a.png?v=1)}"
        );
    }

    #[test]
    fn test_remote_stylesheet_into_local_document_becomes_absolute() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let sheet = Location::Remote(Url::parse("https://cdn.test/css/app.css").unwrap());
        let rebaser = Rebaser::new(&root, &sheet, local("/site"), &policy).unwrap();
        assert_eq!(
            rebaser.rebase("a{b:url(../img/a.png)} c{d:url(/x.png)}"),
            "a{b:url(https://cdn.test/img/a.png)} c{d:url(https://cdn.test/x.png)}"
        );
    }

    #[test]
    fn test_rebase_roundtrip_resolves_to_same_asset() {
        let root = root();
        let policy = RebasePolicy::Relative;
        let sheet = local("/site/a/b/c/style.css");
        for target_dir in ["/site", "/site/a", "/site/x/y", "/site/a/b/c/d"] {
            let target_dir = local(target_dir);
            let rebaser = Rebaser::new(&root, &sheet, target_dir.clone(), &policy).unwrap();
            for reference in ["img.png", "../img.png", "../../../img.png", "sub/dir/img.png"] {
                let rewritten = rebaser.rewrite(reference).unwrap();
                assert_eq!(
                    join_path(&target_dir, &rewritten).unwrap(),
                    join_path(&sheet.parent(), reference).unwrap(),
                    "{reference} -> {rewritten}"
                );
            }
        }
    }

    #[test]
    fn test_reference_extraction() {
        let css = r#"@import url("a.css"); @import 'b.css'; x{y:url(c.png)} z{w:url( "d e.png" )}"#;
        assert_eq!(url_references(css), vec!["a.css", "c.png", "d e.png"]);
        assert_eq!(import_references(css), vec!["a.css", "b.css"]);
    }
}
