use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use url::Url;

use crate::error::FetchError;
use crate::inject::InjectionVariant;

/// Port the proxy listens on. Fixed; the injected pages only ever talk to it
/// through root-relative URLs so nothing else depends on the value.
pub const DEFAULT_PORT: u16 = 3000;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
pub const ACCEPT_IMAGE: &str = "image/webp,image/apng,image/*,*/*;q=0.8";
pub const ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";

/// Hostnames treated as "ours" when rewriting links. A host matches when it
/// equals an entry or is a subdomain of one.
#[derive(Debug, Clone)]
pub struct DomainAllowlist {
    domains: Vec<String>,
}

impl DomainAllowlist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

impl Default for DomainAllowlist {
    fn default() -> Self {
        Self::new(["douban.com", "doubanio.com"])
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Site served for every path that is not a search.
    pub upstream_base: Url,
    /// Site-wide search host, used for `/search` and `?search_text=` requests.
    pub search_base: Url,
    /// Third-party mirror queried by the title resolver.
    pub mirror_base: Url,
    pub allowlist: DomainAllowlist,
    pub static_dir: PathBuf,
    pub timeout: Duration,
    pub max_redirects: usize,
    pub injection: InjectionVariant,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            upstream_base: Url::parse("https://movie.douban.com").unwrap(),
            search_base: Url::parse("https://www.douban.com").unwrap(),
            mirror_base: Url::parse("https://nnyy.in").unwrap(),
            allowlist: DomainAllowlist::default(),
            static_dir: PathBuf::from("custom"),
            timeout: Duration::from_secs(10),
            max_redirects: 5,
            injection: InjectionVariant::default(),
        }
    }
}

// Shared, read-only state handed to every handler
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Referer the upstream expects for a given target host.
    pub fn referer_for(&self, target: &Url) -> String {
        let search_host = self.config.search_base.host_str();
        if search_host.is_some() && target.host_str() == search_host {
            origin_of(&self.config.search_base)
        } else {
            origin_of(&self.config.upstream_base)
        }
    }
}

/// `scheme://host[:port]/`
pub fn origin_of(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}
