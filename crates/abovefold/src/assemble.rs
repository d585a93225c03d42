//! Turning per-viewport render output into the final result.

use std::path::{Path, PathBuf};

use crate::config::{InlineOptions, Options};
use crate::css_engine;
use crate::html::{inline_critical, LinkAction};
use crate::images::ImageInliner;
use crate::orchestrator::Rendered;
use crate::path::{normalize, relative_reference, Resolver};
use crate::stylesheet::{get_assets, get_document_assets, LINE_ENDING};
use crate::types::{CriticalResult, Document, Location, Result};

/// Combine per-viewport CSS in the given (ascending-width) order. A single
/// input is returned unchanged.
pub fn combine(css_per_dimension: &[String]) -> Result<String> {
    match css_per_dimension {
        [] => Ok(String::new()),
        [single] => Ok(single.clone()),
        many => css_engine::merge(&many.join(LINE_ENDING)),
    }
}

/// Where an output path lands: absolute paths as given, relative ones under
/// the local base directory, else under `cwd`.
pub fn output_path(options: &Options, cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    match options.base_dir() {
        Some(base) if !crate::path::is_remote(&base.to_string_lossy()) => {
            normalize(&cwd.join(base).join(path))
        }
        _ => normalize(&cwd.join(path)),
    }
}

pub struct ResultAssembler<'a> {
    options: &'a Options,
    resolver: &'a Resolver,
    cwd: &'a Path,
    asset_paths: Vec<Location>,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(options: &'a Options, resolver: &'a Resolver, cwd: &'a Path) -> Self {
        Self {
            options,
            resolver,
            cwd,
            asset_paths: Vec::new(),
        }
    }

    pub fn with_asset_paths(mut self, asset_paths: Vec<Location>) -> Self {
        self.asset_paths = asset_paths;
        self
    }

    /// Combine, filter, inline images, minify and optionally splice the
    /// result into the document.
    pub async fn assemble(&self, document: &Document, rendered: Rendered) -> Result<CriticalResult> {
        let per_dimension = match rendered {
            Rendered::Unloaded => {
                return Ok(CriticalResult::new(
                    String::new(),
                    document.html(),
                    document.css.clone(),
                ))
            }
            Rendered::Css(per_dimension) => per_dimension,
        };

        let combined = combine(&per_dimension)?;
        let mut css = css_engine::discard(&combined, &self.options.ignore)?;

        if self.options.inline_images {
            let origin = match &document.root {
                Location::Remote(_) => Some(&document.root),
                Location::Local(_) => None,
            };
            let mut references = get_assets(&css);
            references.extend(get_document_assets(&document.html()));
            let search = ImageInliner::search_locations(
                &references,
                &document.directory(),
                origin,
                &self.asset_paths,
            );
            css = ImageInliner::new(self.resolver, self.options.max_image_file_size, search)
                .inline(&css)
                .await?;
        }

        let css = if css.trim().is_empty() {
            String::new()
        } else if self.options.minify {
            css_engine::minify(&css)?
        } else {
            css_engine::normalize(&css)?
        };

        let mut result = CriticalResult::new(css, document.html(), document.css.clone());
        if let Some(inline) = &self.options.inline {
            let action = self.link_action(document, &result, inline);
            tracing::debug!("inlining critical CSS with {action:?}");
            result.html = inline_critical(&document.html(), &result.css, &action, inline.strategy);
        }
        Ok(result)
    }

    /// Replacement priority: explicit list or function, then nothing when
    /// extracting and the uncritical CSS is empty, then the uncritical
    /// target when it lies inside the virtual root, then the `extract` flag.
    pub fn link_action(
        &self,
        document: &Document,
        result: &CriticalResult,
        inline: &InlineOptions,
    ) -> LinkAction {
        if let Some(replace) = &inline.replace_stylesheets {
            let hrefs = replace.hrefs(&document.stylesheets);
            return if hrefs.is_empty() {
                LinkAction::Remove
            } else {
                LinkAction::Replace(hrefs)
            };
        }
        if self.options.extract && result.uncritical().trim().is_empty() {
            return LinkAction::Remove;
        }
        if let Some(target) = &self.options.target.uncritical {
            if let Some(href) = self.uncritical_href(document, target, inline.base_path.as_deref()) {
                return LinkAction::Replace(vec![href]);
            }
        }
        if self.options.extract {
            LinkAction::Remove
        } else {
            LinkAction::Keep
        }
    }

    /// Href of the uncritical target as seen from the document, when the
    /// target lies inside the local virtual root.
    fn uncritical_href(&self, document: &Document, target: &Path, base_path: Option<&str>) -> Option<String> {
        let Location::Local(root) = &document.root else {
            return None;
        };
        let absolute = output_path(self.options, self.cwd, target);
        let inside = absolute.strip_prefix(normalize(root)).ok()?;
        let virtual_path = inside
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Some(match base_path {
            Some(prefix) => format!("{}/{virtual_path}", prefix.trim_end_matches('/')),
            None => relative_reference(&document.directory(), &Location::Local(absolute)),
        })
    }
}
