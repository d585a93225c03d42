//! Stylesheet discovery, resolution, fetching and rebasing.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};

use crate::path::{is_remote, join_path, parse_remote, path_part, virtual_path, Resolver};
use crate::rebase::{import_references, is_inert, url_references, RebasePolicy, Rebaser};
use crate::scope::ResourceScope;
use crate::types::{Asset, Document, Location, Result};

#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// A source of styles in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleSource {
    /// `<link rel="stylesheet" href>`
    Link(String),
    /// `@import` inside a `<style>` block.
    Import(String),
    /// Text of a `<style>` block.
    Inline(String),
}

/// Every stylesheet link, `@import` and inline style block, in document order.
pub fn discover_styles(html: &str) -> Vec<StyleSource> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("link[href], style").expect("style selector is valid");
    let mut sources = Vec::new();

    for element in document.select(&sel) {
        let el = element.value();
        if el.name() == "link" {
            let is_stylesheet = el
                .attr("rel")
                .map(|rel| {
                    rel.split_ascii_whitespace()
                        .any(|token| token.eq_ignore_ascii_case("stylesheet"))
                })
                .unwrap_or(false);
            let href = el.attr("href").unwrap_or("").trim();
            if is_stylesheet && !href.is_empty() && !is_inert(href) {
                sources.push(StyleSource::Link(href.to_string()));
            }
        } else {
            let text: String = element.text().collect();
            for href in import_references(&text) {
                if !is_inert(&href) {
                    sources.push(StyleSource::Import(href));
                }
            }
            sources.push(StyleSource::Inline(text));
        }
    }
    sources
}

/// Stylesheet references (`<link>` and `@import`) in first-seen order.
/// Duplicates are kept.
pub fn get_stylesheet_hrefs(html: &str) -> Vec<String> {
    discover_styles(html)
        .into_iter()
        .filter_map(|source| match source {
            StyleSource::Link(href) | StyleSource::Import(href) => Some(href),
            StyleSource::Inline(_) => None,
        })
        .collect()
}

/// Local `url()` references in `css`, excluding `data:` URIs and remote URLs.
pub fn get_assets(css: &str) -> Vec<String> {
    url_references(css)
        .into_iter()
        .filter(|r| !is_inert(r) && !is_remote(r))
        .collect()
}

/// Local `url()` references inside the document's `<style>` blocks and
/// `style` attributes.
pub fn get_document_assets(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("style, [style]").expect("style selector is valid");
    let mut assets = Vec::new();
    for element in document.select(&sel) {
        if element.value().name() == "style" {
            let text: String = element.text().collect();
            assets.extend(get_assets(&text));
        }
        if let Some(style) = element.value().attr("style") {
            assets.extend(get_assets(style));
        }
    }
    assets
}

fn strip_imports(css: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)@import\s[^;]*;?").expect("import regex is valid"));
    re.replace_all(css, "").trim().to_string()
}

/// Combined, rebased CSS for a document plus the temp file it was written to.
#[derive(Debug)]
pub struct CollectedCss {
    pub document: Document,
    pub css_file: PathBuf,
}

/// Locates, fetches and rebases the stylesheets of a document.
pub struct StylesheetResolver<'a> {
    resolver: &'a Resolver,
    policy: &'a RebasePolicy,
    cwd: PathBuf,
    asset_paths: Vec<Location>,
}

impl<'a> StylesheetResolver<'a> {
    pub fn new(resolver: &'a Resolver, policy: &'a RebasePolicy, cwd: PathBuf) -> Self {
        Self {
            resolver,
            policy,
            cwd,
            asset_paths: Vec::new(),
        }
    }

    /// Extra directories or URLs searched when a stylesheet is not where
    /// the document says it is.
    pub fn with_asset_paths(mut self, asset_paths: Vec<Location>) -> Self {
        self.asset_paths = asset_paths;
        self
    }

    /// Concrete location for a stylesheet reference found in `document`.
    pub fn get_stylesheet_path(&self, document: &Document, href: &str) -> Result<Location> {
        if is_remote(href) {
            let scheme = document.url().map(|u| u.scheme());
            return Ok(Location::Remote(parse_remote(href, scheme)?));
        }
        let (base, reference) = match href.strip_prefix('/') {
            Some(rooted) => (document.root.clone(), rooted),
            None => (document.directory(), href),
        };
        match base {
            // Cache busters mean nothing on disk.
            Location::Local(_) => join_path(&base, path_part(reference)),
            Location::Remote(_) => join_path(&base, reference),
        }
    }

    /// Fetch one stylesheet and rebase its references for the document.
    pub async fn get_stylesheet(&self, document: &Document, href: &str) -> Result<Asset> {
        let primary = self.get_stylesheet_path(document, href)?;
        let location = match &primary {
            Location::Local(_) if !self.resolver.file_exists(&primary).await => {
                let reference = path_part(href.trim_start_matches('/'));
                let mut bases = vec![
                    if href.starts_with('/') {
                        document.root.clone()
                    } else {
                        document.directory()
                    },
                    document.root.clone(),
                    Location::Local(self.cwd.clone()),
                ];
                bases.extend(self.asset_paths.iter().cloned());
                bases.dedup();
                self.resolver.resolve(reference, &bases).await?
            }
            _ => primary,
        };
        self.load(document, href, location).await
    }

    /// Resolve an explicitly configured stylesheet (relative to the virtual
    /// root, then the working directory) and rebase it for the document.
    pub async fn get_explicit_stylesheet(&self, document: &Document, reference: &str) -> Result<Asset> {
        let location = if is_remote(reference) {
            Location::Remote(parse_remote(reference, None)?)
        } else {
            let mut bases = vec![document.root.clone(), Location::Local(self.cwd.clone())];
            bases.dedup();
            self.resolver.resolve(path_part(reference), &bases).await?
        };
        self.load(document, reference, location).await
    }

    async fn load(&self, document: &Document, href: &str, location: Location) -> Result<Asset> {
        let bytes = self.resolver.fetcher().fetch(&location).await?;
        let text = String::from_utf8_lossy(&bytes);
        let rebaser = Rebaser::new(&document.root, &location, document.directory(), self.policy)?;
        let rebased = rebaser.rebase(&text);
        tracing::debug!("loaded stylesheet {href} from {location} ({} bytes)", bytes.len());
        Ok(Asset {
            href: href.to_string(),
            absolute_path: virtual_path(&document.root, &location),
            location,
            contents: Some(rebased.into_bytes()),
        })
    }

    /// Gather the document's CSS in discovery order (or the explicit
    /// `css` list), join it, write it to a temp file and attach it to a
    /// new document value.
    pub async fn collect(
        &self,
        document: Document,
        explicit: &[String],
        ignore_inlined_styles: bool,
        scope: &ResourceScope,
    ) -> Result<CollectedCss> {
        let mut parts: Vec<String> = Vec::new();

        if explicit.is_empty() {
            for source in discover_styles(&document.html()) {
                match source {
                    StyleSource::Link(href) | StyleSource::Import(href) => {
                        parts.push(self.get_stylesheet(&document, &href).await?.text());
                    }
                    StyleSource::Inline(text) if !ignore_inlined_styles => {
                        let text = strip_imports(&text);
                        if text.is_empty() {
                            continue;
                        }
                        let location = document.effective_location();
                        let rebaser = Rebaser::new(
                            &document.root,
                            &location,
                            document.directory(),
                            self.policy,
                        )?;
                        parts.push(rebaser.rebase(&text));
                    }
                    StyleSource::Inline(_) => {}
                }
            }
        } else {
            for reference in explicit {
                parts.push(self.get_explicit_stylesheet(&document, reference).await?.text());
            }
        }

        let css = parts
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(LINE_ENDING);
        let css_file = scope.write_temp(".css", css.as_bytes()).await?;

        Ok(CollectedCss {
            document: Document { css, ..document },
            css_file,
        })
    }
}
