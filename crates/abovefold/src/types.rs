//! Core data types shared by every stage of the pipeline.

use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use url::Url;

/// A concrete place a resource lives: a local file/directory or a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Local(PathBuf),
    Remote(Url),
}

impl Location {
    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote(_))
    }

    /// Directory containing this location. For URLs this is the URL with
    /// the last path segment removed (trailing slash kept).
    pub fn parent(&self) -> Location {
        match self {
            Location::Local(path) => Location::Local(
                path.parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| path.clone()),
            ),
            Location::Remote(url) => {
                let mut dir = url.clone();
                dir.set_query(None);
                dir.set_fragment(None);
                let trimmed = match url.path().rfind('/') {
                    Some(idx) => url.path()[..=idx].to_string(),
                    None => "/".to_string(),
                };
                dir.set_path(&trimmed);
                Location::Remote(dir)
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// Input handed to the document loader.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    /// A local file path, resolved against the configured base.
    Local { path: String },
    /// A remote document fetched over HTTP(S).
    Remote { url: Url },
    /// Raw HTML with no inherent location.
    Inline { bytes: Vec<u8> },
    /// A resource the caller already located and read.
    Loaded { location: Location, bytes: Vec<u8> },
}

impl DocumentInput {
    /// Classify a `src` reference as local or remote.
    pub fn from_reference(reference: &str) -> crate::Result<Self> {
        if crate::path::is_remote(reference) {
            Ok(DocumentInput::Remote {
                url: crate::path::parse_remote(reference, None)?,
            })
        } else {
            Ok(DocumentInput::Local {
                path: reference.to_string(),
            })
        }
    }
}

/// Any referenced resource: stylesheet, image or font.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Reference as written in the source.
    pub href: String,
    /// Where the reference resolves to.
    pub location: Location,
    /// Virtual-root-relative path (`/images/a.png`) or full URL.
    pub absolute_path: String,
    /// Raw bytes, present only for fetched stylesheets.
    pub contents: Option<Vec<u8>>,
}

impl Asset {
    pub fn is_remote(&self) -> bool {
        self.location.is_remote()
    }

    pub fn text(&self) -> String {
        self.contents
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }
}

/// The HTML page being analysed.
#[derive(Debug, Clone)]
pub struct Document {
    /// Virtual-root-relative path (`/pages/index.html`), `None` when the
    /// location could not be determined.
    pub path: Option<String>,
    /// Virtual root: the directory or origin that root-absolute references
    /// are interpreted against.
    pub root: Location,
    /// Real location; `None` for in-memory sources.
    pub location: Option<Location>,
    pub contents: Vec<u8>,
    /// Combined, rebased stylesheet text used for rendering.
    pub css: String,
    /// Discovered stylesheet references, in document order.
    pub stylesheets: Vec<String>,
}

impl Document {
    pub fn is_remote(&self) -> bool {
        self.location.as_ref().is_some_and(Location::is_remote)
            || (self.location.is_none() && self.root.is_remote())
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.location {
            Some(Location::Remote(url)) => Some(url),
            _ => None,
        }
    }

    pub fn html(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }

    /// Where the document sits (or is treated as sitting) in real terms.
    pub fn effective_location(&self) -> Location {
        if let Some(location) = &self.location {
            return location.clone();
        }
        let virtual_path = self.path.as_deref().unwrap_or("/index.html");
        crate::path::join_path(&self.root, virtual_path.trim_start_matches('/'))
            .unwrap_or_else(|_| self.root.clone())
    }

    /// Directory used as the target when rebasing stylesheet references.
    pub fn directory(&self) -> Location {
        self.effective_location().parent()
    }
}

/// A `{width, height}` viewport pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output of a `generate` call.
#[derive(Debug)]
pub struct CriticalResult {
    pub css: String,
    pub html: String,
    full_css: String,
    uncritical: OnceLock<String>,
}

impl CriticalResult {
    pub fn new(css: String, html: String, full_css: String) -> Self {
        Self {
            css,
            html,
            full_css,
            uncritical: OnceLock::new(),
        }
    }

    /// Everything in the document's stylesheets that is not critical.
    /// Computed on first access and cached.
    pub fn uncritical(&self) -> &str {
        self.uncritical
            .get_or_init(|| crate::css_engine::difference(&self.full_css, &self.css))
    }

    pub fn is_uncritical_computed(&self) -> bool {
        self.uncritical.get().is_some()
    }
}

/// Errors that can occur while generating critical CSS.
#[derive(thiserror::Error, Debug)]
pub enum CriticalError {
    #[error("Invalid options: {0}")]
    Config(String),

    #[error("File not found: {reference} (tried {})", .candidates.join(", "))]
    FileNotFound {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("No usable stylesheets found in document and no css option given")]
    NoCss,

    #[error("Render timed out after {timeout_ms}ms at {width}x{height}")]
    RenderTimeout {
        width: u32,
        height: u32,
        timeout_ms: u64,
    },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Request to {url} failed with status {status}")]
    Http { url: String, status: u16 },

    #[error("CSS error: {0}")]
    Css(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience result type.
pub type Result<T, E = CriticalError> = std::result::Result<T, E>;
