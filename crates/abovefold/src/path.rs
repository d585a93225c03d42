//! Path and URL algebra.
//!
//! Joins references onto local directories or URLs, computes relative
//! references between two locations, and resolves a reference against an
//! ordered list of candidate bases. Candidate order is the only tie-break:
//! the first base under which the reference exists wins.

use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::fetch::AssetFetcher;
use crate::types::{CriticalError, Location, Result};

/// True for protocol-relative (`//cdn/x.css`) and protocol-qualified
/// (`https://...`) references.
pub fn is_remote(reference: &str) -> bool {
    reference.starts_with("//") || reference.contains("://")
}

/// Parse a remote reference, filling in a scheme for protocol-relative ones.
pub fn parse_remote(reference: &str, scheme: Option<&str>) -> Result<Url> {
    if reference.starts_with("//") {
        let scheme = scheme.unwrap_or("https");
        return Ok(Url::parse(&format!("{scheme}:{reference}"))?);
    }
    Ok(Url::parse(reference)?)
}

/// `reference` without its `?query` and `#fragment`.
pub fn path_part(reference: &str) -> &str {
    reference
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or(reference)
}

/// A path or URL ending in a separator names a directory rather than a file.
pub fn names_directory(reference: &str) -> bool {
    path_part(reference).ends_with(|c: char| c == '/' || c == '\\')
}

/// Join `part` onto `base`.
///
/// URL bases are treated as directories and merged with URL semantics, so
/// `..` never climbs above the origin. Local bases are joined and
/// normalized lexically; the result may escape `base`.
pub fn join_path(base: &Location, part: &str) -> Result<Location> {
    if is_remote(part) {
        let scheme = match base {
            Location::Remote(url) => Some(url.scheme()),
            Location::Local(_) => None,
        };
        return Ok(Location::Remote(parse_remote(part, scheme)?));
    }

    match base {
        Location::Remote(url) => {
            let mut dir = url.clone();
            if !dir.path().ends_with('/') {
                let path = format!("{}/", dir.path());
                dir.set_path(&path);
            }
            Ok(Location::Remote(dir.join(part)?))
        }
        Location::Local(dir) => Ok(Location::Local(normalize(&dir.join(part)))),
    }
}

/// Lexically normalize a path: drop `.` segments and fold `..` into the
/// preceding segment. Leading `..` on relative paths are kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    let normalized: PathBuf = parts.iter().collect();
    if normalized.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        normalized
    }
}

/// Reference that, joined onto `from_dir`, yields `target`.
///
/// Local-to-local and same-origin URL pairs produce relative references;
/// anything else falls back to the absolute form of `target`.
pub fn relative_reference(from_dir: &Location, target: &Location) -> String {
    match (from_dir, target) {
        (Location::Local(from), Location::Local(to)) => relative_local(from, to),
        (Location::Remote(from), Location::Remote(to)) if same_origin(from, to) => {
            relative_url(from, to)
        }
        (_, target) => target.to_string(),
    }
}

/// Path of `target` relative to the virtual `root`, with a leading `/`.
/// Locations outside the root are returned in absolute form.
pub fn virtual_path(root: &Location, target: &Location) -> String {
    match (root, target) {
        (Location::Local(root), Location::Local(path)) => {
            let root = normalize(root);
            let path = normalize(path);
            match path.strip_prefix(&root) {
                Ok(rest) => format!("/{}", to_slash(rest)),
                Err(_) => to_slash(&path),
            }
        }
        (Location::Remote(root), Location::Remote(url)) if same_origin(root, url) => {
            let mut out = url.path().to_string();
            if let Some(query) = url.query() {
                out.push('?');
                out.push_str(query);
            }
            out
        }
        (_, target) => target.to_string(),
    }
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            Component::RootDir => Some(String::new()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn relative_local(from: &Path, to: &Path) -> String {
    let from = normalize(from);
    let to = normalize(to);
    let from_parts: Vec<Component<'_>> = from.components().collect();
    let to_parts: Vec<Component<'_>> = to.components().collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut segments: Vec<String> = Vec::new();
    for _ in common..from_parts.len() {
        segments.push("..".to_string());
    }
    for component in &to_parts[common..] {
        segments.push(component.as_os_str().to_string_lossy().into_owned());
    }

    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

fn relative_url(from_dir: &Url, to: &Url) -> String {
    let from_segments: Vec<&str> = from_dir
        .path()
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let mut to_segments: Vec<&str> = to.path().trim_start_matches('/').split('/').collect();
    let file = to_segments.pop().unwrap_or("");
    let to_dirs: Vec<&str> = to_segments.into_iter().filter(|s| !s.is_empty()).collect();

    let common = from_segments
        .iter()
        .zip(to_dirs.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut segments: Vec<&str> = Vec::new();
    for _ in common..from_segments.len() {
        segments.push("..");
    }
    segments.extend(&to_dirs[common..]);
    segments.push(file);

    let mut out = segments.join("/");
    if out.is_empty() {
        out.push_str("./");
    } else if out.split('/').next().is_some_and(|first| first.contains(':')) {
        out.insert_str(0, "./");
    }
    if let Some(query) = to.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = to.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Resolves references against candidate bases, checking existence through
/// the configured fetcher.
#[derive(Clone)]
pub struct Resolver {
    fetcher: AssetFetcher,
}

impl Resolver {
    pub fn new(fetcher: AssetFetcher) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &AssetFetcher {
        &self.fetcher
    }

    /// Local locations must be regular files; remote ones must answer the
    /// configured existence request with a 2xx status.
    pub async fn file_exists(&self, location: &Location) -> bool {
        match location {
            Location::Local(path) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false),
            Location::Remote(url) => self.fetcher.exists(url).await,
        }
    }

    /// Try `reference` under each candidate in order and return the first
    /// that exists.
    pub async fn resolve(&self, reference: &str, candidates: &[Location]) -> Result<Location> {
        let mut attempted = Vec::with_capacity(candidates.len());
        for base in candidates {
            let candidate = match join_path(base, reference) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::debug!("cannot join {reference} onto {base}: {e}");
                    continue;
                }
            };
            if self.file_exists(&candidate).await {
                tracing::debug!("resolved {reference} to {candidate}");
                return Ok(candidate);
            }
            attempted.push(candidate.to_string());
        }
        Err(CriticalError::FileNotFound {
            reference: reference.to_string(),
            candidates: attempted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RequestOptions;

    fn local(p: &str) -> Location {
        Location::Local(PathBuf::from(p))
    }

    fn remote(u: &str) -> Location {
        Location::Remote(Url::parse(u).unwrap())
    }

    fn resolver() -> Resolver {
        Resolver::new(AssetFetcher::new(&RequestOptions::default(), None, None).unwrap())
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("//cdn.example.com/a.css"));
        assert!(is_remote("https://example.com/a.css"));
        assert!(is_remote("file:///tmp/a.css"));
        assert!(!is_remote("/styles/a.css"));
        assert!(!is_remote("../a.css"));
    }

    #[test]
    fn test_names_directory() {
        assert!(names_directory("/pages/"));
        assert!(names_directory("https://example.com/blog/?v=1"));
        assert!(names_directory("pages\\"));
        assert!(!names_directory("/pages/index.html"));
        assert!(!names_directory("/pages"));
        assert_eq!(path_part("main.css?v=2#x"), "main.css");
    }

    #[test]
    fn test_join_url_is_bounded_at_origin() {
        let joined = join_path(&remote("https://example.com/a/"), "../../../x.css").unwrap();
        assert_eq!(joined, remote("https://example.com/x.css"));
    }

    #[test]
    fn test_join_url_treats_base_as_directory() {
        let joined = join_path(&remote("https://example.com/assets"), "a.css").unwrap();
        assert_eq!(joined, remote("https://example.com/assets/a.css"));
    }

    #[test]
    fn test_join_protocol_relative_uses_base_scheme() {
        let joined = join_path(&remote("http://example.com/"), "//cdn.test/a.css").unwrap();
        assert_eq!(joined, remote("http://cdn.test/a.css"));
    }

    #[test]
    fn test_join_local_may_escape_base() {
        let joined = join_path(&local("/srv/site/css"), "../../shared/a.css").unwrap();
        assert_eq!(joined, local("/srv/shared/a.css"));
    }

    #[test]
    fn test_normalize_keeps_leading_parent_on_relative() {
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize(Path::new("/../b")), PathBuf::from("/b"));
        assert_eq!(normalize(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn test_relative_local_roundtrip() {
        let base = local("/srv/site/pages/blog");
        for target in [
            "/srv/site/images/a.png",
            "/srv/site/pages/blog/b.png",
            "/srv/site/pages/blog/deep/c.png",
            "/other/d.png",
        ] {
            let target = local(target);
            let rel = relative_reference(&base, &target);
            assert_eq!(join_path(&base, &rel).unwrap(), target, "via {rel}");
        }
    }

    #[test]
    fn test_relative_url_roundtrip() {
        let base = remote("https://example.com/a/b/");
        for target in [
            "https://example.com/img/x.png",
            "https://example.com/a/b/c/y.png?v=2",
            "https://example.com/a/z.png#frag",
        ] {
            let target = remote(target);
            let rel = relative_reference(&base, &target);
            assert_eq!(join_path(&base, &rel).unwrap(), target, "via {rel}");
        }
    }

    #[test]
    fn test_relative_cross_origin_is_absolute() {
        let rel = relative_reference(
            &remote("https://example.com/a/"),
            &remote("https://cdn.example.org/x.png"),
        );
        assert_eq!(rel, "https://cdn.example.org/x.png");
    }

    #[test]
    fn test_virtual_path() {
        assert_eq!(
            virtual_path(&local("/srv/site"), &local("/srv/site/css/a.css")),
            "/css/a.css"
        );
        assert_eq!(
            virtual_path(&remote("https://example.com/"), &remote("https://example.com/x/y.css?v=1")),
            "/x/y.css?v=1"
        );
    }

    #[tokio::test]
    async fn test_resolve_prefers_first_existing_candidate() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("a.css"), "a{}").unwrap();
        std::fs::write(second.path().join("a.css"), "b{}").unwrap();

        let bases = vec![
            Location::Local(second.path().to_path_buf()),
            Location::Local(first.path().to_path_buf()),
        ];
        let found = resolver().resolve("a.css", &bases).await.unwrap();
        assert_eq!(found, Location::Local(second.path().join("a.css")));
    }

    #[tokio::test]
    async fn test_resolve_lists_attempted_candidates() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let bases = vec![
            Location::Local(a.path().to_path_buf()),
            Location::Local(b.path().to_path_buf()),
        ];
        match resolver().resolve("missing.css", &bases).await {
            Err(CriticalError::FileNotFound {
                reference,
                candidates,
            }) => {
                assert_eq!(reference, "missing.css");
                assert_eq!(
                    candidates,
                    vec![
                        a.path().join("missing.css").display().to_string(),
                        b.path().join("missing.css").display().to_string(),
                    ]
                );
            }
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_directories_do_not_exist_as_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            !resolver()
                .file_exists(&Location::Local(dir.path().to_path_buf()))
                .await
        );
    }
}
