//! Multi-viewport render fan-out.
//!
//! Dimensions are stable-sorted by width, dispatched to the renderer under
//! an optional concurrency bound, and collected into slots by position so
//! the combined output never depends on which render finishes first.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::css_engine::Matcher;
use crate::renderer::{CriticalRenderer, RenderError, RenderRequest};
use crate::types::{CriticalError, Dimension, Result};

/// Per-call render parameters shared by every viewport.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub timeout: Duration,
    pub force_include: Vec<Matcher>,
    pub max_embedded_base64_length: usize,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            force_include: Vec::new(),
            max_embedded_base64_length: 1000,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

/// Outcome of rendering every viewport of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// CSS per viewport, in ascending-width order.
    Css(Vec<String>),
    /// The render environment unloaded in at least one viewport; the whole
    /// document degrades to no critical CSS.
    Unloaded,
}

/// Stable sort by width; equal widths keep their given order.
pub fn sort_dimensions(dimensions: &[Dimension]) -> Vec<Dimension> {
    let mut sorted = dimensions.to_vec();
    sorted.sort_by_key(|d| d.width);
    sorted
}

/// Drives the renderer across viewports.
pub struct CriticalOrchestrator {
    renderer: Arc<dyn CriticalRenderer>,
    concurrency: Option<usize>,
}

impl CriticalOrchestrator {
    pub fn new(renderer: Arc<dyn CriticalRenderer>) -> Self {
        Self {
            renderer,
            concurrency: None,
        }
    }

    /// Maximum renders in flight. `None` runs every viewport at once.
    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub async fn run(
        &self,
        url: &str,
        css: &str,
        css_path: Option<PathBuf>,
        dimensions: &[Dimension],
        settings: &RenderSettings,
    ) -> Result<Rendered> {
        let sorted = sort_dimensions(dimensions);
        if sorted.is_empty() {
            return Ok(Rendered::Css(Vec::new()));
        }
        let limit = self.concurrency.unwrap_or(sorted.len()).max(1);
        tracing::debug!(
            "rendering {} viewport(s) of {url} with concurrency {limit}",
            sorted.len()
        );

        let tasks = sorted.iter().enumerate().map(|(slot, dimension)| {
            let request = RenderRequest {
                url: url.to_string(),
                css: css.to_string(),
                css_path: css_path.clone(),
                width: dimension.width,
                height: dimension.height,
                force_include: settings.force_include.clone(),
                timeout: settings.timeout,
                max_embedded_base64_length: settings.max_embedded_base64_length,
                user_agent: settings.user_agent.clone(),
                headers: settings.headers.clone(),
            };
            let renderer = Arc::clone(&self.renderer);
            async move {
                let outcome = render_one(renderer.as_ref(), &request).await;
                (slot, outcome)
            }
        });

        let mut slots: Vec<Option<std::result::Result<String, RenderError>>> =
            (0..sorted.len()).map(|_| None).collect();
        let mut finished = stream::iter(tasks).buffer_unordered(limit);
        while let Some((slot, outcome)) = finished.next().await {
            tracing::debug!("viewport {} finished", sorted[slot]);
            slots[slot] = Some(outcome);
        }

        if slots
            .iter()
            .any(|s| matches!(s, Some(Err(RenderError::Unloaded(_)))))
        {
            tracing::warn!("render environment unloaded for {url}; returning no critical CSS");
            return Ok(Rendered::Unloaded);
        }

        let mut css_per_dimension = Vec::with_capacity(slots.len());
        for (slot, outcome) in slots.into_iter().enumerate() {
            let dimension = sorted[slot];
            match outcome {
                Some(Ok(css)) => css_per_dimension.push(css),
                Some(Err(RenderError::Timeout(timeout_ms))) => {
                    return Err(CriticalError::RenderTimeout {
                        width: dimension.width,
                        height: dimension.height,
                        timeout_ms,
                    })
                }
                Some(Err(e)) => return Err(CriticalError::Render(format!("{dimension}: {e}"))),
                None => {
                    return Err(CriticalError::Render(format!(
                        "{dimension}: render task did not complete"
                    )))
                }
            }
        }
        Ok(Rendered::Css(css_per_dimension))
    }
}

async fn render_one(
    renderer: &dyn CriticalRenderer,
    request: &RenderRequest,
) -> std::result::Result<String, RenderError> {
    match tokio::time::timeout(request.timeout, renderer.render(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RenderError::Timeout(request.timeout.as_millis() as u64)),
    }
}
