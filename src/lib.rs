//! Transforming reverse proxy for movie.douban.com.
//!
//! Pages are fetched server-side, their links are rewritten so navigation
//! stays on the proxy, images are re-served through `/proxy-image` to get
//! past hotlink protection, and a small UI is injected into subject pages.

pub mod error;
pub mod inject;
pub mod proxy;
pub mod resolve;
pub mod rewrite;
pub mod shared;
pub mod transform;
pub mod upstream;

pub use error::{FetchError, ProxyError, TransformError};
pub use inject::InjectionVariant;
pub use proxy::{router, start_proxy_server};
pub use shared::{DomainAllowlist, ProxyConfig, ProxyState};
