//! Chromium-based critical CSS renderer using chromiumoxide.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::json;

use super::{CriticalRenderer, RenderError, RenderRequest};
use crate::css_engine::Matcher;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. ABOVEFOLD_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("ABOVEFOLD_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.abovefold/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".abovefold/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".abovefold/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".abovefold/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".abovefold/chromium/chrome-linux64/chrome"),
                home.join(".abovefold/chromium/chrome"),
            ]
        };
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            return Some(found);
        }
    }

    // 3. System PATH
    ["google-chrome", "chromium", "chromium-browser"]
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Walks the supplied stylesheet in the page and keeps what is needed
/// above the fold.
const EXTRACT_JS: &str = r#"
(function (args) {
  var fold = args.height;
  var sheet = new CSSStyleSheet();
  sheet.replaceSync(args.css);

  var ignoredPseudo = /::?(after|before|first-line|first-letter|selection|placeholder|marker|backdrop)\b/gi;
  var statePseudo = /:(hover|focus|focus-within|focus-visible|active|visited|target)\b/gi;
  var dataUri = /url\(\s*['"]?data:[^)]*\)/gi;

  function splitSelectors(text) {
    var out = [], depth = 0, start = 0;
    for (var i = 0; i < text.length; i++) {
      var c = text[i];
      if (c === '(' || c === '[') depth++;
      else if (c === ')' || c === ']') depth--;
      else if (c === ',' && depth === 0) { out.push(text.slice(start, i).trim()); start = i + 1; }
    }
    out.push(text.slice(start).trim());
    return out.filter(function (s) { return s.length > 0; });
  }

  function forced(selector) {
    return args.include.some(function (m) {
      return m.literal !== undefined ? m.literal === selector : new RegExp(m.source, m.flags).test(selector);
    });
  }

  function aboveFold(selector) {
    var clean = selector.replace(ignoredPseudo, '').replace(statePseudo, '').trim();
    if (!clean || /[>+~]$/.test(clean)) clean = '*';
    var nodes;
    try { nodes = document.querySelectorAll(clean); } catch (e) { return false; }
    for (var i = 0; i < nodes.length; i++) {
      if (nodes[i].getBoundingClientRect().top < fold) return true;
    }
    return false;
  }

  function dropLargeDataUris(style) {
    for (var i = style.length - 1; i >= 0; i--) {
      var name = style[i];
      var matches = style.getPropertyValue(name).match(dataUri) || [];
      if (matches.some(function (m) { return m.length > args.maxEmbeddedBase64Length; })) {
        style.removeProperty(name);
      }
    }
  }

  function walk(rules) {
    var out = [];
    for (var i = 0; i < rules.length; i++) {
      var rule = rules[i];
      if (rule instanceof CSSStyleRule) {
        var keep = splitSelectors(rule.selectorText).filter(function (s) { return forced(s) || aboveFold(s); });
        if (keep.length === 0) continue;
        dropLargeDataUris(rule.style);
        if (rule.style.length > 0) out.push(keep.join(',') + '{' + rule.style.cssText + '}');
      } else if (rule instanceof CSSMediaRule) {
        if (!window.matchMedia(rule.media.mediaText).matches) continue;
        var inner = walk(rule.cssRules);
        if (inner.length > 0) out.push('@media ' + rule.media.mediaText + '{' + inner.join('') + '}');
      } else if (rule instanceof CSSSupportsRule) {
        if (!CSS.supports(rule.conditionText)) continue;
        var nested = walk(rule.cssRules);
        if (nested.length > 0) out.push('@supports ' + rule.conditionText + '{' + nested.join('') + '}');
      } else if (rule instanceof CSSFontFaceRule || rule instanceof CSSKeyframesRule) {
        out.push(rule.cssText);
      }
    }
    return out;
  }

  return walk(sheet.cssRules).join('\n');
})
"#;

fn include_args(matchers: &[Matcher]) -> Vec<serde_json::Value> {
    matchers
        .iter()
        .filter_map(|m| match m {
            Matcher::Literal(literal) => Some(json!({ "literal": literal })),
            Matcher::Pattern(pattern) => Some(json!({
                "source": pattern.source,
                "flags": pattern.flags.replace(|c: char| c == 'g' || c == 'y', ""),
            })),
            Matcher::Kind(_) => None,
        })
        .collect()
}

/// The stylesheet handed off on disk when there is one, else the inline copy.
async fn stylesheet_text(request: &RenderRequest) -> Result<String, RenderError> {
    match &request.css_path {
        Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            RenderError::Failed(format!("failed to read stylesheet {}: {e}", path.display()))
        }),
        None => Ok(request.css.clone()),
    }
}

fn classify(e: impl std::fmt::Display) -> RenderError {
    let message = e.to_string();
    if message.contains("Execution context was destroyed")
        || message.contains("Cannot find context with specified id")
        || message.contains("Target closed")
    {
        RenderError::Unloaded(message)
    } else {
        RenderError::Failed(message)
    }
}

/// Headless Chromium computing critical CSS, one page per request.
pub struct ChromiumRenderer {
    browser: Browser,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> Result<Self, RenderError> {
        let chrome_path = find_chromium().ok_or_else(|| {
            RenderError::Failed(
                "Chromium not found. Set ABOVEFOLD_CHROMIUM_PATH or install Chrome.".into(),
            )
        })?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| RenderError::Failed(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Failed(format!("failed to launch Chromium: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn active_pages(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    async fn render_on(&self, page: &Page, request: &RenderRequest) -> Result<String, RenderError> {
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(request.width),
            i64::from(request.height),
            1.0,
            false,
        ))
        .await
        .map_err(classify)?;

        if let Some(user_agent) = &request.user_agent {
            page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(classify)?;
        }
        if !request.headers.is_empty() {
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(json!(
                request.headers
            ))))
            .await
            .map_err(classify)?;
        }

        let navigation = tokio::time::timeout(request.timeout, page.goto(request.url.as_str())).await;
        match navigation {
            Ok(Ok(_)) => {
                let _ = page.wait_for_navigation().await;
            }
            Ok(Err(e)) => return Err(classify(e)),
            Err(_) => return Err(RenderError::Timeout(request.timeout.as_millis() as u64)),
        }

        let css = stylesheet_text(request).await?;
        let args = json!({
            "css": css,
            "height": request.height,
            "include": include_args(&request.force_include),
            "maxEmbeddedBase64Length": request.max_embedded_base64_length,
        });
        let script = format!("({EXTRACT_JS})({args})");
        let result = page.evaluate(script).await.map_err(classify)?;
        result
            .into_value::<String>()
            .map_err(|e| RenderError::Failed(format!("failed to convert render result: {e}")))
    }
}

#[async_trait]
impl CriticalRenderer for ChromiumRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<String, RenderError> {
        let page = self.browser.new_page("about:blank").await.map_err(classify)?;
        self.active_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("rendering {} at {}x{}", request.url, request.width, request.height);

        let result = self.render_on(&page, request).await;

        self.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = page.close().await;
        result
    }
}
