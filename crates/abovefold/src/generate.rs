//! The `generate` pipeline.
//!
//! Resolving -> Fetching -> Rendering -> Combining -> PostProcessing. Every
//! call owns a [`ResourceScope`]; its temp files are removed when the call
//! returns, whatever the outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::assemble::{output_path, ResultAssembler};
use crate::config::Options;
use crate::document::DocumentLoader;
use crate::fetch::{AssetFetcher, Credentials};
use crate::orchestrator::{CriticalOrchestrator, RenderSettings};
use crate::path::{is_remote, normalize, parse_remote, Resolver};
use crate::renderer::CriticalRenderer;
use crate::scope::ResourceScope;
use crate::stylesheet::StylesheetResolver;
use crate::types::{CriticalError, CriticalResult, Document, DocumentInput, Location, Result};

/// Critical CSS generator bound to one render collaborator.
#[derive(Clone)]
pub struct Critical {
    renderer: Arc<dyn CriticalRenderer>,
    cwd: Option<PathBuf>,
}

impl Critical {
    pub fn new(renderer: Arc<dyn CriticalRenderer>) -> Self {
        Self {
            renderer,
            cwd: None,
        }
    }

    /// Directory relative paths are resolved against. Defaults to the
    /// process working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Compute critical CSS for one document.
    pub async fn generate(&self, options: Options) -> Result<CriticalResult> {
        options.validate()?;
        let scope = ResourceScope::new();
        let result = self.run(&options, &scope).await;
        scope.cleanup();
        result
    }

    async fn run(&self, options: &Options, scope: &ResourceScope) -> Result<CriticalResult> {
        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };

        let credentials = options.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            pass: options.pass.clone(),
        });
        let fetcher = AssetFetcher::new(
            &options.request,
            credentials.clone(),
            options.user_agent.as_deref(),
        )?;
        let resolver = Resolver::new(fetcher);

        let base = options
            .base
            .as_deref()
            .map(|base| locate(base, &cwd))
            .transpose()?;
        let asset_paths = options
            .asset_paths
            .iter()
            .map(|p| locate(p, base_dir(&base, &cwd)))
            .collect::<Result<Vec<_>>>()?;

        // Resolving
        let input = match (&options.html, &options.src) {
            (Some(html), _) => DocumentInput::Inline {
                bytes: html.clone().into_bytes(),
            },
            (None, Some(src)) => DocumentInput::from_reference(src)?,
            (None, None) => {
                return Err(CriticalError::Config("one of html or src is required".into()))
            }
        };
        let document = DocumentLoader::new(&resolver, &options.rebase, cwd.clone())
            .with_base(base.clone())
            .with_folder(options.folder.clone())
            .get_document(input)
            .await?;
        tracing::debug!(
            "document {} with {} stylesheet reference(s)",
            document.path.as_deref().unwrap_or("<inline>"),
            document.stylesheets.len()
        );

        // Fetching
        let collected = StylesheetResolver::new(&resolver, &options.rebase, cwd.clone())
            .with_asset_paths(asset_paths.clone())
            .collect(document, &options.css, options.ignore_inlined_styles, scope)
            .await?;
        let document = collected.document;

        if document.css.trim().is_empty() {
            if options.strict && options.css.is_empty() {
                return Err(CriticalError::NoCss);
            }
            tracing::warn!("no CSS found for document; skipping render");
            let result = CriticalResult::new(String::new(), document.html(), String::new());
            write_targets(options, &cwd, &result).await?;
            return Ok(result);
        }

        // Rendering
        let url = document_url(&document, scope).await?;
        let mut headers = BTreeMap::new();
        if let Some(credentials) = &credentials {
            headers.insert("Authorization".to_string(), credentials.header_value());
        }
        let settings = RenderSettings {
            timeout: Duration::from_millis(options.renderer.timeout),
            force_include: options.force_include(),
            max_embedded_base64_length: options.renderer.max_embedded_base64_length,
            user_agent: options.user_agent.clone(),
            headers,
        };
        let rendered = CriticalOrchestrator::new(Arc::clone(&self.renderer))
            .with_concurrency(options.concurrency)
            .run(
                &url,
                &document.css,
                Some(collected.css_file),
                &options.dimensions(),
                &settings,
            )
            .await?;

        // Combining, PostProcessing
        let result = ResultAssembler::new(options, &resolver, &cwd)
            .with_asset_paths(asset_paths)
            .assemble(&document, rendered)
            .await?;
        write_targets(options, &cwd, &result).await?;
        Ok(result)
    }
}

/// A remote reference as a URL, anything else as a directory relative to
/// `dir`.
fn locate(reference: &str, dir: &Path) -> Result<Location> {
    if is_remote(reference) {
        Ok(Location::Remote(parse_remote(reference, None)?))
    } else {
        Ok(Location::Local(normalize(&dir.join(reference))))
    }
}

fn base_dir<'p>(base: &'p Option<Location>, cwd: &'p Path) -> &'p Path {
    match base {
        Some(Location::Local(dir)) => dir,
        _ => cwd,
    }
}

/// URL the renderer loads. In-memory documents are written to a temp file
/// owned by `scope`.
async fn document_url(document: &Document, scope: &ResourceScope) -> Result<String> {
    let path = match &document.location {
        Some(Location::Remote(url)) => return Ok(url.to_string()),
        Some(Location::Local(path)) => path.clone(),
        None => write_virtual_document(document, scope).await?,
    };
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|_| CriticalError::Config(format!("cannot express {} as a URL", absolute.display())))
}

/// Write an in-memory document where it claims to live, so relative
/// references resolve in the browser the way they did when collecting CSS.
/// Remote roots and unwritable directories fall back to the system temp
/// directory.
async fn write_virtual_document(document: &Document, scope: &ResourceScope) -> Result<PathBuf> {
    if let Location::Local(dir) = document.directory() {
        let placed = match scope.ensure_dir(&dir).await {
            Ok(()) => scope.write_temp_in(&dir, ".html", &document.contents).await,
            Err(e) => Err(e),
        };
        match placed {
            Ok(path) => return Ok(path),
            Err(e) => tracing::warn!("cannot place document in {}: {e}", dir.display()),
        }
    }
    scope.write_temp(".html", &document.contents).await
}

async fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    tracing::debug!("wrote {}", path.display());
    Ok(())
}

async fn write_targets(options: &Options, cwd: &Path, result: &CriticalResult) -> Result<()> {
    let targets = &options.target;
    if let Some(css) = &targets.css {
        write_output(&output_path(options, cwd, css), &result.css).await?;
    }
    if let Some(html) = &targets.html {
        write_output(&output_path(options, cwd, html), &result.html).await?;
    }
    if let Some(uncritical) = &targets.uncritical {
        write_output(&output_path(options, cwd, uncritical), result.uncritical()).await?;
    }
    Ok(())
}
