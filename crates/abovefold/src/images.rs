//! Embedding small images referenced by CSS as base64 `data:` URIs.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;

use crate::path::{is_remote, join_path, parse_remote, path_part, Resolver};
use crate::rebase::{is_inert, replace_urls, url_references};
use crate::types::{Location, Result};

/// MIME type for an image reference, judged by its extension.
pub fn image_mime(reference: &str) -> Option<&'static str> {
    let ext = Path::new(path_part(reference))
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        "ico" => Some("image/x-icon"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Inlines images no larger than `max_size` bytes, looking them up under an
/// ordered list of search locations.
pub struct ImageInliner<'a> {
    resolver: &'a Resolver,
    max_size: u64,
    search: Vec<Location>,
}

impl<'a> ImageInliner<'a> {
    pub fn new(resolver: &'a Resolver, max_size: u64, search: Vec<Location>) -> Self {
        Self {
            resolver,
            max_size,
            search,
        }
    }

    /// Search locations in lookup order: the document directory, every
    /// directory named by a local asset reference (relative to it), the
    /// remote origin and any extra asset paths.
    pub fn search_locations(
        references: &[String],
        document_dir: &Location,
        origin: Option<&Location>,
        asset_paths: &[Location],
    ) -> Vec<Location> {
        let mut search = vec![document_dir.clone()];
        for reference in references {
            if let Some((dir, _)) = reference.trim_start_matches('/').rsplit_once('/') {
                if let Ok(location) = join_path(document_dir, dir) {
                    if !search.contains(&location) {
                        search.push(location);
                    }
                }
            }
        }
        for extra in origin.into_iter().chain(asset_paths) {
            if !search.contains(extra) {
                search.push(extra.clone());
            }
        }
        search
    }

    async fn locate(&self, reference: &str) -> Option<Location> {
        if is_remote(reference) {
            return parse_remote(reference, None).ok().map(Location::Remote);
        }
        let clean = path_part(reference);
        if let Ok(found) = self.resolver.resolve(clean, &self.search).await {
            return Some(found);
        }
        let file_name = clean.rsplit('/').next().unwrap_or(clean);
        if file_name != clean {
            if let Ok(found) = self.resolver.resolve(file_name, &self.search).await {
                return Some(found);
            }
        }
        tracing::warn!("image {reference} not found; leaving it linked");
        None
    }

    async fn embed(&self, reference: &str) -> Result<Option<String>> {
        let Some(mime) = image_mime(reference) else {
            return Ok(None);
        };
        let Some(location) = self.locate(reference).await else {
            return Ok(None);
        };
        let bytes = self.resolver.fetcher().fetch(&location).await?;
        if bytes.is_empty() || bytes.len() as u64 > self.max_size {
            tracing::debug!("not inlining {reference} ({} bytes)", bytes.len());
            return Ok(None);
        }
        Ok(Some(data_uri(mime, &bytes)))
    }

    /// Replace qualifying `url()` references in `css` with data URIs.
    pub async fn inline(&self, css: &str) -> Result<String> {
        let mut embedded: HashMap<String, String> = HashMap::new();
        for reference in url_references(css) {
            if is_inert(&reference) || embedded.contains_key(&reference) {
                continue;
            }
            if let Some(uri) = self.embed(&reference).await? {
                embedded.insert(reference, uri);
            }
        }
        if embedded.is_empty() {
            return Ok(css.to_string());
        }
        Ok(replace_urls(css, |reference| embedded.get(reference).cloned()))
    }
}
