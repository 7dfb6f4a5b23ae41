//! Best-effort lookup of a direct play page on the nunuyy mirror.
//!
//! The mirror has no API, so we fetch its search page and look for the first
//! link shaped like `/dianying/20259243.html`. Selectors are tried from the
//! most specific DOM location to the broadest and the first validated href
//! wins outright.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::shared::{origin_of, ProxyState, ACCEPT_HTML};
use crate::upstream::{fetch, FetchOptions};

/// Search-result selectors in priority order.
pub const LINK_CANDIDATES: &[&str] = &[
    r#"a[href*="/dianying/"]"#,
    r#"a[href*="/dianshiju/"]"#,
    r#"a[href*="/zongyi/"]"#,
    r#"a[href*="/dongman/"]"#,
    ".lists-content a",
    ".thumbnail a",
    "li a",
];

const MIN_HREF_LEN: usize = 15;

static CONTENT_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(dianying|dianshiju|zongyi|dongman)/\d+\.html").unwrap());

static SELECTORS: LazyLock<Vec<(&'static str, Selector)>> =
    LazyLock::new(|| compile_candidates(LINK_CANDIDATES));

/// Parses a priority list of selectors, dropping any that fail to parse.
pub fn compile_candidates(list: &[&'static str]) -> Vec<(&'static str, Selector)> {
    list.iter()
        .filter_map(|s| Selector::parse(s).ok().map(|sel| (*s, sel)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched { url: String },
    NoMatch { fallback: String },
    /// The search page could not be fetched; `reason` is for logs and the
    /// JSON error body.
    Failed { fallback: String, reason: String },
}

pub fn search_prefix(mirror: &Url) -> String {
    format!("{}so?q=", origin_of(mirror))
}

pub fn search_url(mirror: &Url, title: &str) -> String {
    format!("{}{}", search_prefix(mirror), urlencoding::encode(title))
}

pub fn is_content_link(href: &str) -> bool {
    !href.is_empty()
        && href.contains(".html")
        && href.len() > MIN_HREF_LEN
        && CONTENT_LINK.is_match(href)
}

/// First validated href on the page, made absolute against `mirror`.
pub fn find_content_link(html: &str, mirror: &Url) -> Option<String> {
    find_with_candidates(html, mirror, &SELECTORS)
}

pub fn find_with_candidates(
    html: &str,
    mirror: &Url,
    candidates: &[(&'static str, Selector)],
) -> Option<String> {
    let document = Html::parse_document(html);

    for (raw, selector) in candidates {
        for element in document.select(selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            debug!("Checking [{}] {}", raw, href);
            if !is_content_link(href) {
                continue;
            }
            let absolute = if href.starts_with("http") {
                href.to_string()
            } else {
                match mirror.join(href) {
                    Ok(url) => url.to_string(),
                    Err(_) => continue,
                }
            };
            debug!("Matched content link via [{}]: {}", raw, absolute);
            return Some(absolute);
        }
    }
    None
}

pub async fn resolve(state: &ProxyState, title: &str) -> Resolution {
    let mirror = &state.config.mirror_base;
    let search = search_url(mirror, title);
    info!("Resolving '{}' via {}", title, search);

    let url = match Url::parse(&search) {
        Ok(url) => url,
        Err(e) => {
            return Resolution::Failed {
                fallback: search,
                reason: e.to_string(),
            }
        }
    };

    let options = FetchOptions {
        referer: origin_of(mirror),
        accept: ACCEPT_HTML,
        accept_any_status: false,
    };
    let page = match fetch(state, &url, &options).await {
        Ok(page) => page.bytes().await,
        Err(e) => Err(e),
    };
    let page = match page {
        Ok(page) => page,
        Err(e) => {
            warn!("Search fetch failed for '{}': {}", title, e);
            return Resolution::Failed {
                fallback: search,
                reason: e.to_string(),
            };
        }
    };

    let html = String::from_utf8_lossy(&page);
    match find_content_link(&html, mirror) {
        Some(url) => Resolution::Matched { url },
        None => {
            warn!("No content link found for '{}'", title);
            Resolution::NoMatch { fallback: search }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror() -> Url {
        Url::parse("https://nnyy.in").unwrap()
    }

    #[test]
    fn all_candidate_selectors_parse() {
        assert_eq!(SELECTORS.len(), LINK_CANDIDATES.len());
    }

    #[test]
    fn content_link_shape() {
        assert!(is_content_link("/dianying/20259243.html"));
        assert!(is_content_link("https://nnyy.in/dongman/7.html"));
        assert!(!is_content_link("/dianying/"));
        assert!(!is_content_link("/dianying/abc.html"));
        assert!(!is_content_link("/news/20259243.html"));
        assert!(!is_content_link("/zongyi/1.html"));
        assert!(!is_content_link(""));
    }

    #[test]
    fn broadest_selector_still_finds_link() {
        let html = r#"<html><body>
            <ul>
              <li><a href="/">home</a></li>
              <li><a href="/so?q=x">search</a></li>
              <li><a href="/dianying/20259243.html">Result</a></li>
            </ul>
        </body></html>"#;
        // "/dianying/" selector matches first regardless of container
        assert_eq!(
            find_content_link(html, &mirror()).as_deref(),
            Some("https://nnyy.in/dianying/20259243.html")
        );
    }

    #[test]
    fn only_broadest_selector_matches() {
        let candidates = compile_candidates(&[".lists-content a", ".thumbnail a", "li a"]);
        let html = r#"<div class="lists-content"><a href="/about.html">about us</a></div>
            <div class="thumbnail"><a href="/dianying/">all movies</a></div>
            <ul><li><a href="/dianying/20259243.html">Result</a></li></ul>"#;
        assert_eq!(
            find_with_candidates(html, &mirror(), &candidates).as_deref(),
            Some("https://nnyy.in/dianying/20259243.html")
        );
    }

    #[test]
    fn first_selector_wins_over_third() {
        let candidates = compile_candidates(&[".lists-content a", ".thumbnail a", "li a"]);
        let html = r#"<ul><li><a href="/dianying/11111111.html">list item</a></li></ul>
            <div class="lists-content"><a href="/dianying/22222222.html">container</a></div>"#;
        assert_eq!(
            find_with_candidates(html, &mirror(), &candidates).as_deref(),
            Some("https://nnyy.in/dianying/22222222.html")
        );
    }

    #[test]
    fn absolute_hrefs_are_kept() {
        let html = r#"<li><a href="https://nnyy.in/dianying/20259243.html">x</a></li>"#;
        assert_eq!(
            find_content_link(html, &mirror()).as_deref(),
            Some("https://nnyy.in/dianying/20259243.html")
        );
    }

    #[test]
    fn earlier_selector_beats_document_order() {
        let html = r#"<html><body>
            <ul><li><a href="/dongman/11111111.html">anime first in document</a></li></ul>
            <div class="lists-content"><a href="/dianying/22222222.html">movie</a></div>
        </body></html>"#;
        assert_eq!(
            find_content_link(html, &mirror()).as_deref(),
            Some("https://nnyy.in/dianying/22222222.html")
        );
    }

    #[test]
    fn first_match_within_selector_wins() {
        let html = r#"<div class="thumbnail"><a href="/dianshiju/1000001.html">a</a></div>
            <div class="thumbnail"><a href="/dianshiju/1000002.html">b</a></div>"#;
        assert_eq!(
            find_content_link(html, &mirror()).as_deref(),
            Some("https://nnyy.in/dianshiju/1000001.html")
        );
    }

    #[test]
    fn no_valid_href_is_none() {
        let html = r#"<ul><li><a href="/">home</a></li><li><a href="/dianying/">list</a></li></ul>"#;
        assert_eq!(find_content_link(html, &mirror()), None);
    }

    #[test]
    fn search_url_encodes_title() {
        assert_eq!(
            search_url(&mirror(), "肖申克的救赎 1994"),
            "https://nnyy.in/so?q=%E8%82%96%E7%94%B3%E5%85%8B%E7%9A%84%E6%95%91%E8%B5%8E%201994"
        );
    }
}
