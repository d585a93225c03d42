//! Render collaborator abstraction.
//!
//! A `CriticalRenderer` receives one viewport request and returns the CSS
//! needed above the fold for that viewport. The Chromium implementation
//! drives a headless browser; tests use deterministic stubs.

pub mod chromium;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::css_engine::Matcher;

/// Everything the renderer needs for one viewport.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Document URL (`file://` for local and in-memory documents).
    pub url: String,
    /// Combined, rebased stylesheet text.
    pub css: String,
    /// Temp file holding `css`. Renderers that load the stylesheet from
    /// disk read it from here.
    pub css_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    /// Selectors kept regardless of their position.
    pub force_include: Vec<Matcher>,
    pub timeout: Duration,
    /// Declarations embedding longer `data:` URIs are dropped.
    pub max_embedded_base64_length: usize,
    pub user_agent: Option<String>,
    /// Extra request headers (`Authorization` when credentials are set).
    pub headers: BTreeMap<String, String>,
}

/// Failure modes of a render call.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// The page's execution environment went away before the CSS was
    /// computed.
    #[error("render environment unloaded: {0}")]
    Unloaded(String),

    #[error("render timed out after {0}ms")]
    Timeout(u64),

    #[error("render failed: {0}")]
    Failed(String),
}

/// An engine computing critical CSS for one viewport.
#[async_trait]
pub trait CriticalRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<String, RenderError>;
}

/// Renderer used when no browser is available: every call fails.
pub struct NoopRenderer;

#[async_trait]
impl CriticalRenderer for NoopRenderer {
    async fn render(&self, _request: &RenderRequest) -> Result<String, RenderError> {
        Err(RenderError::Failed("browser not available".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_renderer_fails() {
        let request = RenderRequest {
            url: "file:///index.html".into(),
            css: String::new(),
            css_path: None,
            width: 1300,
            height: 900,
            force_include: Vec::new(),
            timeout: Duration::from_secs(1),
            max_embedded_base64_length: 1000,
            user_agent: None,
            headers: BTreeMap::new(),
        };
        assert!(matches!(
            NoopRenderer.render(&request).await,
            Err(RenderError::Failed(_))
        ));
    }
}
