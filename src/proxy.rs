use crate::error::{FetchError, ProxyError};
use crate::inject::{classify, InjectionPolicy};
use crate::resolve::{resolve, Resolution};
use crate::rewrite::{root_relative, RewriteContext};
use crate::shared::{origin_of, ProxyState, ACCEPT_HTML, ACCEPT_IMAGE};
use crate::transform::transform_page;
use crate::upstream::{fetch, FetchOptions, UpstreamResponse};
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use html_escape::encode_text;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};
use url::Url;

pub const IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";
const LINK2_PREFIX: &str = "/link2/";

/// Upstream response headers that must not be replayed to the browser.
const DROPPED_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "connection",
    "keep-alive",
    "content-security-policy",
    "x-frame-options",
];

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub movie: Option<String>,
    pub title: Option<String>,
    pub page: Option<String>,
}

// Middleware to log all incoming requests
async fn log_requests(req: Request, next: Next) -> Response {
    info!("PROXY REQUEST: {} {}", req.method(), req.uri());
    next.run(req).await
}

pub fn router(state: ProxyState) -> Router {
    let static_dir = ServeDir::new(&state.config.static_dir);

    Router::new()
        .route("/proxy-image", get(proxy_image_handler))
        .route("/api/parse-nunuyy", get(parse_nunuyy_handler))
        .route("/download", get(download_handler))
        .nest_service("/custom", static_dir)
        .fallback(proxy_handler)
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
}

pub async fn start_proxy_server(state: ProxyState) -> std::io::Result<()> {
    let addr = state.config.listen_addr;
    let listener = TcpListener::bind(addr).await?;
    info!("douban proxy listening on http://{}", addr);
    axum::serve(listener, router(state)).await
}

// Handler for /proxy-image?url=..., refetches with a referer the image host accepts
async fn proxy_image_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let Some(raw) = query.url.filter(|u| !u.trim().is_empty()) else {
        warn!("Image proxy: no 'url' parameter provided");
        return ProxyError::MissingParameter("url").into_response();
    };

    let url = match Url::parse(raw.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => {
            warn!("Image proxy: not an absolute http(s) URL: '{}'", raw);
            return (StatusCode::BAD_REQUEST, "Invalid image URL").into_response();
        }
    };

    let options = FetchOptions {
        referer: origin_of(&state.config.upstream_base),
        accept: ACCEPT_IMAGE,
        accept_any_status: false,
    };

    match fetch(&state, &url, &options).await {
        Ok(image) => {
            let content_type = image
                .content_type
                .clone()
                .unwrap_or_else(|| guess_image_type(&url));
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, IMAGE_CACHE_CONTROL.to_string()),
                ],
                image.into_body(),
            )
                .into_response()
        }
        Err(e) => {
            error!("Image proxy error for '{}': {}", url, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Image proxy error").into_response()
        }
    }
}

fn guess_image_type(url: &Url) -> String {
    mime_guess::from_path(url.path())
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .map(|m| m.to_string())
        .unwrap_or_else(|| "image/jpeg".to_string())
}

async fn parse_nunuyy_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    let Some(title) = query.title.filter(|t| !t.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing movie title" })),
        )
            .into_response();
    };

    match resolve(&state, &title).await {
        Resolution::Matched { url } => {
            info!("Resolved '{}' -> {}", title, url);
            Json(json!({ "success": true, "url": url, "title": title })).into_response()
        }
        Resolution::NoMatch { fallback } => Json(json!({
            "success": false,
            "url": fallback,
            "message": "No direct play link found, use the search page instead",
        }))
        .into_response(),
        Resolution::Failed { fallback, reason } => {
            error!("Resolving '{}' failed: {}", title, reason);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": reason, "url": fallback })),
            )
                .into_response()
        }
    }
}

async fn proxy_handler(State(state): State<ProxyState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let path = uri.path();
    if path.starts_with(LINK2_PREFIX) {
        return link2_redirect(&state, uri.query());
    }

    let target = match upstream_target(&state, &uri) {
        Ok(url) => url,
        Err(e) => {
            warn!("Could not build upstream URL for '{}': {}", uri, e);
            return (StatusCode::BAD_REQUEST, "Invalid request path").into_response();
        }
    };
    info!("Proxying {} -> {}", uri, target);

    let options = FetchOptions {
        referer: state.referer_for(&target),
        accept: ACCEPT_HTML,
        accept_any_status: true,
    };
    let upstream = match fetch(&state, &target, &options).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Proxy error for '{}': {}", target, e);
            return error_page(&e, target.as_str());
        }
    };

    if !upstream.is_html() {
        return passthrough(upstream);
    }

    let status = upstream.status;
    let headers = upstream.headers.clone();
    let html = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Reading page body from '{}' failed: {}", target, e);
            return error_page(&e, target.as_str());
        }
    };

    let kind = classify(path);
    let ctx = RewriteContext::new(target.clone(), state.config.allowlist.clone());
    let policy = InjectionPolicy::new(state.config.injection, state.config.mirror_base.clone());
    let body = match transform_page(&html, &ctx, &kind, &policy) {
        Ok(html) => html,
        Err(e) => {
            warn!("Serving '{}' untransformed: {}", target, e);
            html.to_vec()
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    copy_headers(&headers, response.headers_mut());
    response
}

/// Site-wide search goes to the search host; everything else keeps its path
/// and query on the movie site.
fn upstream_target(state: &ProxyState, uri: &Uri) -> Result<Url, url::ParseError> {
    let config = &state.config;
    let params = query_params(uri.query());

    let search_text = params.get("search_text").filter(|t| !t.is_empty());
    if uri.path().starts_with("/search") || search_text.is_some() {
        let text = search_text
            .or_else(|| params.get("q"))
            .map(String::as_str)
            .unwrap_or("");
        return Url::parse(&format!(
            "{}search?q={}&cat=1002",
            origin_of(&config.search_base),
            urlencoding::encode(text)
        ));
    }

    let mut url = config.upstream_base.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

fn link2_redirect(state: &ProxyState, query: Option<&str>) -> Response {
    let params = query_params(query);
    let target = params
        .get("url")
        .and_then(|raw| Url::parse(raw).ok())
        .filter(|url| {
            url.host_str()
                .is_some_and(|host| state.config.allowlist.contains(host))
        });

    match target {
        Some(url) => {
            let location = root_relative(&url);
            info!("link2 redirect: {} -> {}", url, location);
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        None => {
            warn!("link2: rejecting {:?}", params.get("url"));
            (StatusCode::NOT_FOUND, "Invalid link2 URL").into_response()
        }
    }
}

// Non-HTML payloads are streamed through without being buffered
fn passthrough(upstream: UpstreamResponse) -> Response {
    let status = upstream.status;
    let mut headers = HeaderMap::new();
    copy_headers(&upstream.headers, &mut headers);

    let mut response = Response::new(upstream.into_body());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (key, value) in from {
        if !DROPPED_HEADERS.contains(&key.as_str()) {
            to.append(key.clone(), value.clone());
        }
    }
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn error_page(err: &FetchError, attempted: &str) -> Response {
    let status = err
        .upstream_status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let url = err.url().unwrap_or(attempted);

    let page = format!(
        r#"<html>
<head><meta charset="utf-8"><title>Proxy error</title></head>
<body>
<h1>Proxy request failed</h1>
<p>Error: {message}</p>
<p>Upstream status: {status}</p>
<p>Requested URL: {url}</p>
<p>Check the network connection or try again later.</p>
<a href="/">Back to home</a>
</body>
</html>"#,
        message = encode_text(&err.to_string()),
        status = status,
        url = encode_text(url),
    );
    (StatusCode::INTERNAL_SERVER_ERROR, Html(page)).into_response()
}

// Local resource page linked from the injected panel
async fn download_handler(Query(query): Query<DownloadQuery>) -> Html<String> {
    let movie = query.movie.as_deref().filter(|m| !m.is_empty());
    let title = query
        .title
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or("Unknown title");
    let page = query.page.as_deref().filter(|p| !p.is_empty());

    let content = match (movie, page) {
        (Some(movie), _) => {
            let id = urlencoding::encode(movie);
            format!(
                r#"<div class="movie-title">{title}</div>
<div class="info-box">
<h3>📋 Details</h3>
<div class="info-item"><span class="info-label">Subject ID:</span> {movie}</div>
<div class="info-item"><span class="info-label">Douban:</span> <a href="https://movie.douban.com/subject/{id}/" target="_blank" rel="noopener noreferrer">open on douban</a></div>
<div class="info-item"><span class="info-label">Proxy:</span> <a href="/subject/{id}/">open through the proxy</a></div>
</div>"#,
                title = encode_text(title),
                movie = encode_text(movie),
                id = id,
            )
        }
        (None, Some(page)) => format!(
            r#"<div class="info-box">
<h3>📄 Page resources</h3>
<div class="info-item"><span class="info-label">Page:</span> {page}</div>
</div>"#,
            page = encode_text(page),
        ),
        (None, None) => r#"<div class="notice">⚠️ Nothing to download was specified</div>"#.to_string(),
    };

    Html(format!(
        r#"<html>
<head>
<meta charset="utf-8">
<title>Resources - {title}</title>
<style>
body {{ margin: 0; padding: 40px; min-height: 100vh; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Arial, sans-serif; background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); }}
.container {{ max-width: 800px; margin: 0 auto; padding: 40px; background: #fff; border-radius: 12px; box-shadow: 0 10px 40px rgba(0,0,0,.2); }}
.movie-title {{ margin-bottom: 20px; color: #42bd56; font-size: 24px; font-weight: bold; }}
.info-box {{ margin: 20px 0; padding: 20px; background: #f5f5f5; border-radius: 8px; }}
.info-item {{ margin: 10px 0; padding: 10px; background: #fff; border-radius: 4px; }}
.info-label {{ display: inline-block; width: 120px; color: #666; font-weight: bold; }}
.notice {{ margin: 20px 0; padding: 15px; color: #856404; background: #fff3cd; border: 1px solid #ffc107; border-radius: 6px; }}
</style>
</head>
<body>
<div class="container">
<h1>🎬 Resources</h1>
{content}
<button onclick="history.back()">← Back</button>
</div>
</body>
</html>"#,
        title = encode_text(title),
        content = content,
    ))
}
