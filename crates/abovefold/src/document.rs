//! Building a [`Document`] from a path, URL, raw HTML or a pre-read resource.

use std::path::PathBuf;

use url::Url;

use crate::path::{
    is_remote, join_path, names_directory, normalize, path_part, virtual_path, Resolver,
};
use crate::rebase::RebasePolicy;
use crate::stylesheet::get_stylesheet_hrefs;
use crate::types::{Document, DocumentInput, Location, Result};

/// Loads documents and fixes their place under the virtual root.
pub struct DocumentLoader<'a> {
    resolver: &'a Resolver,
    base: Option<Location>,
    folder: Option<String>,
    rebase: &'a RebasePolicy,
    cwd: PathBuf,
}

impl<'a> DocumentLoader<'a> {
    pub fn new(resolver: &'a Resolver, rebase: &'a RebasePolicy, cwd: PathBuf) -> Self {
        Self {
            resolver,
            base: None,
            folder: None,
            rebase,
            cwd,
        }
    }

    /// Directory or URL acting as the virtual root.
    pub fn with_base(mut self, base: Option<Location>) -> Self {
        self.base = base;
        self
    }

    /// Virtual directory of in-memory HTML, relative to the root.
    pub fn with_folder(mut self, folder: Option<String>) -> Self {
        self.folder = folder;
        self
    }

    pub async fn get_document(&self, input: DocumentInput) -> Result<Document> {
        match input {
            DocumentInput::Loaded { location, bytes } => Ok(self.from_location(location, bytes)),
            DocumentInput::Remote { url } => {
                let (final_url, bytes) = self.resolver.fetcher().fetch_document(&url).await?;
                if final_url != url {
                    tracing::debug!("{url} redirected to {final_url}");
                }
                Ok(self.from_location(Location::Remote(final_url), bytes))
            }
            DocumentInput::Local { path } => {
                let mut candidates = Vec::new();
                if let Some(base) = &self.base {
                    candidates.push(base.clone());
                    if let Some(folder) = &self.folder {
                        candidates.push(join_path(base, folder)?);
                    }
                }
                candidates.push(Location::Local(self.cwd.clone()));
                candidates.dedup();

                let location = self.resolver.resolve(&path, &candidates).await?;
                let bytes = self.resolver.fetcher().fetch(&location).await?;
                Ok(self.from_location(location, bytes))
            }
            DocumentInput::Inline { bytes } => Ok(self.get_document_from_source(bytes)),
        }
    }

    fn from_location(&self, location: Location, contents: Vec<u8>) -> Document {
        let root = self.root_for(&location);
        let path = get_document_path(&root, &location);
        let stylesheets = get_stylesheet_hrefs(&String::from_utf8_lossy(&contents));
        tracing::debug!("loaded document {location} as {path} under {root}");
        Document {
            path: Some(path),
            root,
            location: Some(location),
            contents,
            css: String::new(),
            stylesheets,
        }
    }

    /// The configured base when it contains `location`, else the
    /// document's own directory (local) or origin (remote).
    fn root_for(&self, location: &Location) -> Location {
        match (location, &self.base) {
            (Location::Local(path), Some(Location::Local(base)))
                if normalize(path).starts_with(normalize(base)) =>
            {
                Location::Local(normalize(base))
            }
            (Location::Remote(url), Some(Location::Remote(base)))
                if crate::path::same_origin(url, base) =>
            {
                Location::Remote(base.clone())
            }
            (Location::Remote(url), _) => Location::Remote(origin_root(url)),
            (Location::Local(_), _) => location.parent(),
        }
    }

    /// Document for raw HTML. Its virtual path comes from the rebase `to`
    /// mapping, then `folder`, then the deepest `../` run among its
    /// stylesheet references.
    pub fn get_document_from_source(&self, contents: Vec<u8>) -> Document {
        let stylesheets = get_stylesheet_hrefs(&String::from_utf8_lossy(&contents));
        let root = match &self.base {
            Some(base) => base.clone(),
            None => Location::Local(self.cwd.clone()),
        };

        let path = match (self.rebase, &self.folder) {
            (RebasePolicy::Remap { to: Some(to), .. }, _) => virtual_document_path(&root, to),
            (RebasePolicy::Custom(_), _) => "/index.html".to_string(),
            (_, Some(folder)) => {
                let folder = folder.trim_matches('/');
                if folder.is_empty() {
                    "/index.html".to_string()
                } else {
                    format!("/{folder}/index.html")
                }
            }
            _ => infer_document_path(&stylesheets),
        };
        tracing::debug!("in-memory document placed at {path} under {root}");

        Document {
            path: Some(path),
            root,
            location: None,
            contents,
            css: String::new(),
            stylesheets,
        }
    }
}

/// Virtual-root-relative path of a document loaded from `location`.
pub fn get_document_path(root: &Location, location: &Location) -> String {
    virtual_path(root, location)
}

fn origin_root(url: &Url) -> Url {
    let mut root = url.clone();
    root.set_path("/");
    root.set_query(None);
    root.set_fragment(None);
    root
}

/// `to` may name a file or a directory (trailing `/`).
fn virtual_document_path(root: &Location, to: &str) -> String {
    if is_remote(to) {
        return match (root, Url::parse(to)) {
            (Location::Remote(root), Ok(url)) if crate::path::same_origin(root, &url) => {
                directory_to_document(url.path())
            }
            _ => "/index.html".to_string(),
        };
    }
    let to = to.replace('\\', "/");
    let rooted = if to.starts_with('/') { to } else { format!("/{to}") };
    directory_to_document(&rooted)
}

fn directory_to_document(path: &str) -> String {
    if names_directory(path) {
        let (dir, suffix) = path.split_at(path_part(path).len());
        format!("{dir}index.html{suffix}")
    } else {
        path.to_string()
    }
}

/// Depth of the document below the virtual root, judged by the longest
/// leading `../` run among relative stylesheet references.
pub fn infer_document_path(hrefs: &[String]) -> String {
    let relative: Vec<&String> = hrefs
        .iter()
        .filter(|href| !is_remote(href) && !href.starts_with('/'))
        .collect();
    if relative.is_empty() {
        tracing::warn!(
            "Missing base path for in-memory HTML; consider the 'folder' option. \
             Treating the document as living at the virtual root"
        );
        return "/index.html".to_string();
    }

    let depth = relative
        .iter()
        .map(|href| {
            href.trim_start_matches("./")
                .split('/')
                .take_while(|segment| *segment == "..")
                .count()
        })
        .max()
        .unwrap_or(0);
    format!("/{}index.html", "_/".repeat(depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{AssetFetcher, RequestOptions};
    use crate::rebase::Rebaser;

    fn resolver() -> Resolver {
        Resolver::new(AssetFetcher::new(&RequestOptions::default(), None, None).unwrap())
    }

    #[test]
    fn test_infer_depth_uses_longest_run() {
        let hrefs = vec![
            "../a.css".to_string(),
            "../../../b.css".to_string(),
            "/c.css".to_string(),
        ];
        assert_eq!(infer_document_path(&hrefs), "/_/_/_/index.html");
    }

    #[test]
    fn test_infer_without_relative_hrefs_defaults_to_root() {
        assert_eq!(infer_document_path(&["/a.css".to_string()]), "/index.html");
        assert_eq!(infer_document_path(&[]), "/index.html");
    }

    #[test]
    fn test_source_path_priority() {
        let resolver = resolver();
        let html = br#"<link rel="stylesheet" href="../../x.css">"#.to_vec();

        let remap = RebasePolicy::Remap {
            from: None,
            to: Some("/pages/".into()),
        };
        let doc = DocumentLoader::new(&resolver, &remap, PathBuf::from("/srv"))
            .with_folder(Some("ignored".into()))
            .get_document_from_source(html.clone());
        assert_eq!(doc.path.as_deref(), Some("/pages/index.html"));

        let relative = RebasePolicy::Relative;
        let doc = DocumentLoader::new(&resolver, &relative, PathBuf::from("/srv"))
            .with_folder(Some("blog/".into()))
            .get_document_from_source(html.clone());
        assert_eq!(doc.path.as_deref(), Some("/blog/index.html"));

        let doc = DocumentLoader::new(&resolver, &relative, PathBuf::from("/srv"))
            .get_document_from_source(html);
        assert_eq!(doc.path.as_deref(), Some("/_/_/index.html"));
        assert_eq!(doc.directory(), Location::Local(PathBuf::from("/srv/_/_")));
        assert!(doc.location.is_none());
    }

    #[test]
    fn test_remapped_document_resolves_rebased_references() {
        let resolver = resolver();
        let html = br#"<link rel="stylesheet" href="css/main.css">"#.to_vec();
        let stylesheet = Location::Local(PathBuf::from("/srv/css/main.css"));

        for to in ["/pages/", "/pages/index.html"] {
            let policy = RebasePolicy::Remap {
                from: None,
                to: Some(to.into()),
            };
            let doc = DocumentLoader::new(&resolver, &policy, PathBuf::from("/srv"))
                .get_document_from_source(html.clone());
            assert_eq!(doc.directory(), Location::Local(PathBuf::from("/srv/pages")));

            let rebaser = Rebaser::new(&doc.root, &stylesheet, doc.directory(), &policy).unwrap();
            let rewritten = rebaser.rewrite("../img/a.png").unwrap();
            assert_eq!(
                join_path(&doc.directory(), &rewritten).unwrap(),
                Location::Local(PathBuf::from("/srv/img/a.png")),
                "to = {to}"
            );
        }
    }

    #[test]
    fn test_directory_to_document_keeps_query() {
        assert_eq!(directory_to_document("/blog/?v=1"), "/blog/index.html?v=1");
        assert_eq!(directory_to_document("/blog/post.html"), "/blog/post.html");
    }

    #[tokio::test]
    async fn test_local_document_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("blog")).unwrap();
        std::fs::write(
            dir.path().join("blog/post.html"),
            r#"<link rel="stylesheet" href="/css/site.css">"#,
        )
        .unwrap();

        let resolver = resolver();
        let policy = RebasePolicy::default();
        let doc = DocumentLoader::new(&resolver, &policy, PathBuf::from("/nonexistent"))
            .with_base(Some(Location::Local(dir.path().to_path_buf())))
            .get_document(DocumentInput::Local {
                path: "blog/post.html".into(),
            })
            .await
            .unwrap();

        assert_eq!(doc.path.as_deref(), Some("/blog/post.html"));
        assert_eq!(doc.stylesheets, vec!["/css/site.css"]);
        assert_eq!(doc.root, Location::Local(normalize(dir.path())));
    }

    #[tokio::test]
    async fn test_missing_local_document_lists_candidates() {
        let resolver = resolver();
        let policy = RebasePolicy::default();
        let err = DocumentLoader::new(&resolver, &policy, PathBuf::from("/nonexistent-cwd"))
            .get_document(DocumentInput::Local {
                path: "missing.html".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.html"));
    }

    #[test]
    fn test_remote_document_root_is_origin() {
        let resolver = resolver();
        let policy = RebasePolicy::default();
        let loader = DocumentLoader::new(&resolver, &policy, PathBuf::from("/"));
        let doc = loader.from_location(
            Location::Remote(Url::parse("https://example.com/blog/post.html?x=1").unwrap()),
            b"<html></html>".to_vec(),
        );
        assert_eq!(doc.path.as_deref(), Some("/blog/post.html?x=1"));
        assert_eq!(doc.root.to_string(), "https://example.com/");
        assert!(doc.is_remote());
    }
}
