use axum::body::{Body, Bytes};
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use tracing::{debug, error};
use url::Url;

use crate::error::FetchError;
use crate::shared::{ProxyState, ACCEPT_LANGUAGE, BROWSER_USER_AGENT};

/// Per-call knobs for [`fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub referer: String,
    pub accept: &'static str,
    /// Hand non-2xx responses back as data instead of failing. The page proxy
    /// wants this so upstream 404s reach the browser with their own body.
    pub accept_any_status: bool,
}

/// Status and headers of an upstream reply. The body has not been read yet:
/// callers either buffer it with [`UpstreamResponse::bytes`] or hand it to the
/// browser as a stream with [`UpstreamResponse::into_body`].
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    url: String,
    response: reqwest::Response,
}

impl UpstreamResponse {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        let url = self.url;
        self.response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&url, e))
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self.response.bytes_stream())
    }
}

pub async fn fetch(
    state: &ProxyState,
    url: &Url,
    options: &FetchOptions,
) -> Result<UpstreamResponse, FetchError> {
    debug!("Fetching {} (referer: {})", url, options.referer);

    let response = state
        .client
        .get(url.clone())
        .header(header::USER_AGENT, BROWSER_USER_AGENT)
        .header(header::ACCEPT, options.accept)
        .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
        .header(header::REFERER, options.referer.as_str())
        .send()
        .await
        .map_err(|e| {
            error!("Upstream request failed for '{}': {}", url, e);
            FetchError::from_reqwest(url.as_str(), e)
        })?;

    let status = response.status();
    debug!("Upstream status {} for {}", status, url);

    if !options.accept_any_status && !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let headers = response.headers().clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(UpstreamResponse {
        status,
        headers,
        content_type,
        url: url.to_string(),
        response,
    })
}
