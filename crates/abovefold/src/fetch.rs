//! Asset fetching over the local filesystem and HTTP(S).
//!
//! Remote requests go through a single reqwest client configured from the
//! request options: method for existence checks, extra headers, basic auth,
//! user agent and redirect policy. A stylesheet answering 403 or 404 is
//! treated as empty; any other non-2xx status is an error. Nothing is retried.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::types::{CriticalError, Location, Result};

const DEFAULT_USER_AGENT: &str = concat!("abovefold/", env!("CARGO_PKG_VERSION"));

/// Method used for remote existence checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    #[default]
    Head,
    Get,
}

/// HTTP request configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RequestOptions {
    pub method: ProbeMethod,
    pub headers: BTreeMap<String, String>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub timeout_ms: Option<u64>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: ProbeMethod::Head,
            headers: BTreeMap::new(),
            follow_redirects: true,
            max_redirects: 10,
            timeout_ms: None,
        }
    }
}

/// Basic-auth credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: Option<String>,
}

impl Credentials {
    /// `Authorization` header value for these credentials.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.user, self.pass.as_deref().unwrap_or(""));
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// Reads local files and performs HTTP requests.
#[derive(Clone)]
pub struct AssetFetcher {
    client: reqwest::Client,
    probe: ProbeMethod,
    credentials: Option<Credentials>,
}

impl AssetFetcher {
    pub fn new(
        options: &RequestOptions,
        credentials: Option<Credentials>,
        user_agent: Option<&str>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CriticalError::Config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CriticalError::Config(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let redirect = if options.follow_redirects {
            reqwest::redirect::Policy::limited(options.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .redirect(redirect)
            .default_headers(headers)
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT));
        if let Some(ms) = options.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        Ok(Self {
            client: builder.build()?,
            probe: options.method,
            credentials,
        })
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    fn request(&self, method: Method, url: &Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url.clone());
        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.user, creds.pass.as_ref()),
            None => builder,
        }
    }

    /// Raw bytes of an asset. Remote 403/404 responses yield empty content.
    pub async fn fetch(&self, location: &Location) -> Result<Vec<u8>> {
        match location {
            Location::Local(path) => Ok(tokio::fs::read(path).await?),
            Location::Remote(url) => {
                let resp = self.request(Method::GET, url).send().await?;
                let status = resp.status();
                if matches!(status, StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
                    tracing::warn!("{url} answered {status}; using empty content");
                    return Ok(Vec::new());
                }
                if !status.is_success() {
                    return Err(CriticalError::Http {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Ok(resp.bytes().await?.to_vec())
            }
        }
    }

    /// Fetch an HTML document, returning the final URL after redirects.
    /// Unlike [`fetch`](Self::fetch), every non-2xx status is an error.
    pub async fn fetch_document(&self, url: &Url) -> Result<(Url, Vec<u8>)> {
        let resp = self.request(Method::GET, url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CriticalError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = resp.url().clone();
        let body = resp.bytes().await?.to_vec();
        Ok((final_url, body))
    }

    /// Whether a remote resource answers with a 2xx status. A HEAD probe
    /// rejected with 405/501 falls back to GET.
    pub async fn exists(&self, url: &Url) -> bool {
        let method = match self.probe {
            ProbeMethod::Head => Method::HEAD,
            ProbeMethod::Get => Method::GET,
        };
        match self.request(method.clone(), url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp)
                if method == Method::HEAD
                    && matches!(
                        resp.status(),
                        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
                    ) =>
            {
                matches!(
                    self.request(Method::GET, url).send().await,
                    Ok(r) if r.status().is_success()
                )
            }
            Ok(resp) => {
                tracing::debug!("{url} does not exist ({})", resp.status());
                false
            }
            Err(e) => {
                tracing::debug!("existence check for {url} failed: {e}");
                false
            }
        }
    }
}
