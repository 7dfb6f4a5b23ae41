//! Link rewriting rules shared by every node the transformer touches.
//!
//! Links that point at an allowlisted host are turned into root-relative
//! URLs so the browser's next request comes back through the proxy. Anything
//! else is left alone.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

use crate::shared::DomainAllowlist;

/// Route the image de-hotlink handler is mounted on.
pub const IMAGE_PROXY_PATH: &str = "/proxy-image";

// `0; url='https://...'`: prefix, opening quote, target
static REFRESH_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(url\s*=\s*)(['"]?)([^'"\s;]+)"#).unwrap());

/// Upstream a single response is being rewritten against. Every rewrite for
/// one response goes through the same context.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub base: Url,
    pub allowlist: DomainAllowlist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenUrl {
    pub url: String,
    /// Absolute link to a host outside the allowlist.
    pub external: bool,
}

impl RewrittenUrl {
    fn unchanged(raw: &str) -> Self {
        Self {
            url: raw.to_string(),
            external: false,
        }
    }
}

impl RewriteContext {
    pub fn new(base: Url, allowlist: DomainAllowlist) -> Self {
        Self { base, allowlist }
    }

    pub fn rewrite(&self, raw: &str) -> RewrittenUrl {
        rewrite_url(raw, &self.allowlist)
    }

    /// Absolute URL for an image reference, routed through the image proxy.
    /// Returns `None` for values that should be left untouched.
    pub fn proxied_image(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.starts_with("data:")
            || raw.starts_with("blob:")
            || raw.starts_with(IMAGE_PROXY_PATH)
        {
            return None;
        }

        let absolute = self.base.join(raw).ok()?;
        if !matches!(absolute.scheme(), "http" | "https") {
            return None;
        }
        Some(image_proxy_url(absolute.as_str()))
    }

    /// Applies the link rules to the target of a `<meta http-equiv="refresh">`
    /// value, keeping the delay prefix and any quotes around the URL.
    pub fn rewrite_meta_refresh(&self, content: &str) -> String {
        REFRESH_TARGET
            .replace(content, |caps: &Captures| {
                let rewritten = self.rewrite(&caps[3]);
                format!("{}{}{}", &caps[1], &caps[2], rewritten.url)
            })
            .into_owned()
    }
}

pub fn image_proxy_url(absolute: &str) -> String {
    format!("{}?url={}", IMAGE_PROXY_PATH, urlencoding::encode(absolute))
}

/// Maps a link found in upstream markup to the form served to the browser.
///
/// * root-relative paths are kept as they are
/// * protocol-relative and absolute links to allowlisted hosts become
///   root-relative (path, query and fragment preserved)
/// * absolute links elsewhere are kept and flagged as external
/// * anything that does not parse is returned untouched
pub fn rewrite_url(raw: &str, allowlist: &DomainAllowlist) -> RewrittenUrl {
    if raw.starts_with('/') && !raw.starts_with("//") {
        return RewrittenUrl::unchanged(raw);
    }

    if let Some(rest) = raw.strip_prefix("//") {
        return match Url::parse(&format!("https://{}", rest)) {
            Ok(url) if url.host_str().is_some_and(|h| allowlist.contains(h)) => {
                let relative = root_relative(&url);
                debug!("Rewriting protocol-relative '{}' -> '{}'", raw, relative);
                RewrittenUrl {
                    url: relative,
                    external: false,
                }
            }
            _ => RewrittenUrl::unchanged(raw),
        };
    }

    let lower = raw.trim_start().to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return RewrittenUrl::unchanged(raw);
    }

    match Url::parse(raw.trim()) {
        Ok(url) => match url.host_str() {
            Some(host) if allowlist.contains(host) => {
                let relative = root_relative(&url);
                debug!("Rewriting absolute '{}' -> '{}'", raw, relative);
                RewrittenUrl {
                    url: relative,
                    external: false,
                }
            }
            Some(_) => RewrittenUrl {
                url: raw.to_string(),
                external: true,
            },
            None => RewrittenUrl::unchanged(raw),
        },
        Err(_) => RewrittenUrl::unchanged(raw),
    }
}

/// Path, query and fragment of `url`, always starting with `/`.
pub fn root_relative(url: &Url) -> String {
    let mut out = url.path().to_string();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
