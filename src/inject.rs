use std::sync::LazyLock;

use html_escape::{encode_double_quoted_attribute, encode_text};
use regex::Regex;
use url::Url;

use crate::resolve::search_prefix;

static SUBJECT_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/subject/(\d+)").unwrap());

/// Which set of fragments gets appended to proxied pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InjectionVariant {
    /// Floating panel plus a player-source modal on subject pages.
    #[default]
    Overlay,
    /// Stylesheet/script from `/custom`, a download section under `#info`
    /// and a proxy badge on every page.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    Detail { subject_id: String },
    ListOrOther,
}

pub fn classify(path: &str) -> PageKind {
    match SUBJECT_PATH.captures(path) {
        Some(caps) => PageKind::Detail {
            subject_id: caps[1].to_string(),
        },
        None => PageKind::ListOrOther,
    }
}

/// Markup to splice into one page. Each piece is inserted at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Injection {
    /// Appended inside `<head>`.
    pub head: Option<String>,
    /// Inserted right after the `#info` block.
    pub after_info: Option<String>,
    /// Appended at the end of `<body>`.
    pub body: String,
}

pub struct PlayerSource {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    /// Title is URL-encoded and appended to this prefix.
    pub search_prefix: &'static str,
    /// Ask `/api/parse-nunuyy` for a direct link before navigating.
    pub resolve: bool,
}

pub const PLAYER_SOURCES: &[PlayerSource] = &[
    PlayerSource {
        key: "youtube",
        name: "YouTube",
        description: "HD streams, international",
        icon: "🎥",
        search_prefix: "https://www.youtube.com/results?search_query=",
        resolve: false,
    },
    PlayerSource {
        key: "nunuyy",
        name: "Nunu Cinema",
        description: "Free streaming, updated quickly",
        icon: "🎬",
        search_prefix: "",
        resolve: true,
    },
    PlayerSource {
        key: "dytt",
        name: "Movie Heaven",
        description: "Classic catalogue, downloads",
        icon: "🌟",
        search_prefix: "https://www.dy2018.com/e/search/result/?searchid=",
        resolve: false,
    },
    PlayerSource {
        key: "xunlei",
        name: "Xunlei",
        description: "Fast downloads, Blu-ray quality",
        icon: "⚡",
        search_prefix: "https://www.xunleige.com/search?keyword=",
        resolve: false,
    },
    PlayerSource {
        key: "maoyan",
        name: "Maoyan",
        description: "Licensed, members only",
        icon: "🍿",
        search_prefix: "https://maoyan.com/films?keyword=",
        resolve: false,
    },
];

pub struct InjectionPolicy {
    pub variant: InjectionVariant,
    pub mirror_base: Url,
}

impl InjectionPolicy {
    pub fn new(variant: InjectionVariant, mirror_base: Url) -> Self {
        Self {
            variant,
            mirror_base,
        }
    }

    pub fn injection_for(&self, kind: &PageKind, page_title: &str) -> Injection {
        match (self.variant, kind) {
            (InjectionVariant::Overlay, PageKind::Detail { subject_id }) => Injection {
                body: self.overlay_detail(subject_id, page_title),
                ..Injection::default()
            },
            (InjectionVariant::Overlay, PageKind::ListOrOther) => Injection {
                body: OVERLAY_LIST_SCRIPT.to_string(),
                ..Injection::default()
            },
            (InjectionVariant::Shell, PageKind::Detail { .. }) => Injection {
                head: Some(SHELL_HEAD.to_string()),
                after_info: Some(SHELL_DOWNLOAD_SECTION.to_string()),
                body: SHELL_BADGE.to_string(),
            },
            (InjectionVariant::Shell, PageKind::ListOrOther) => Injection {
                head: Some(SHELL_HEAD.to_string()),
                after_info: None,
                body: SHELL_BADGE.to_string(),
            },
        }
    }

    fn overlay_detail(&self, subject_id: &str, page_title: &str) -> String {
        let title_text = encode_text(page_title);
        let title_attr = encode_double_quoted_attribute(page_title);
        let id_text = encode_text(subject_id);
        let id_attr = encode_double_quoted_attribute(subject_id);

        let mut out = String::with_capacity(OVERLAY_STYLE.len() + OVERLAY_SCRIPT.len() + 4096);
        out.push_str(OVERLAY_STYLE);
        out.push_str(&format!(
            r#"<div class="dp-panel" id="dp-panel" data-subject-id="{id_attr}" data-title="{title_attr}">
<button class="dp-panel-close" data-action="hide-panel" title="Hide">×</button>
<h3>🎬 Douban Proxy</h3>
<div class="dp-movie-info"><strong>Now viewing:</strong><br>{title_text}<br><small>ID: {id_text}</small></div>
<button class="dp-btn" data-action="open-sources">▶ Watch online</button>
<button class="dp-btn" data-action="resources">💾 Resources</button>
</div>
<div class="dp-modal-overlay" id="dp-modal-overlay">
<div class="dp-modal">
<button class="dp-modal-close" data-action="close-modal" title="Close">×</button>
<h2>Choose a source</h2>
<div class="dp-source-list">
"#
        ));
        for source in PLAYER_SOURCES {
            out.push_str(&self.source_item(source));
        }
        out.push_str(
            "</div>\n<div class=\"dp-modal-footer\">Sources open in a new tab.</div>\n</div>\n</div>\n<script>",
        );
        out.push_str(OVERLAY_SCRIPT);
        out.push_str("</script>\n");
        out
    }

    fn source_item(&self, source: &PlayerSource) -> String {
        let prefix = if source.resolve {
            search_prefix(&self.mirror_base)
        } else {
            source.search_prefix.to_string()
        };
        let resolve_attr = if source.resolve { " data-resolve" } else { "" };
        format!(
            r#"<div class="dp-source-item" data-source="{key}" data-search="{prefix}"{resolve_attr}>
<div class="dp-source-icon">{icon}</div>
<div class="dp-source-info"><div class="dp-source-name">{name}</div><div class="dp-source-desc">{desc}</div></div>
<div class="dp-source-arrow">→</div>
</div>
"#,
            key = source.key,
            prefix = encode_double_quoted_attribute(&prefix),
            icon = source.icon,
            name = source.name,
            desc = source.description,
        )
    }
}

const OVERLAY_LIST_SCRIPT: &str = "<script>console.log('[douban-proxy] list page', window.location.pathname);</script>\n";

const OVERLAY_STYLE: &str = r#"<style>
.dp-panel { position: fixed; bottom: 20px; right: 20px; min-width: 200px; padding: 15px; background: #fff; border: 2px solid #42bd56; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,.1); z-index: 99999 !important; }
.dp-panel h3 { margin: 0 0 10px; color: #42bd56; font-size: 16px; }
.dp-panel-close { position: absolute; top: 5px; right: 8px; padding: 0; border: none; background: none; color: #999; font-size: 18px; line-height: 1; cursor: pointer; }
.dp-panel-close:hover, .dp-modal-close:hover { color: #333; }
.dp-movie-info { margin-bottom: 10px; padding: 8px; background: #f5f5f5; border-radius: 4px; color: #666; font-size: 12px; word-break: break-all; }
.dp-btn { display: block; width: 100%; margin-bottom: 8px; padding: 10px 20px; border: none; border-radius: 4px; background: #42bd56; color: #fff; font-size: 14px; cursor: pointer; }
.dp-btn:hover { background: #3aa047; }
.dp-modal-overlay { display: none; position: fixed; inset: 0; background: rgba(0,0,0,.7); z-index: 999999; justify-content: center; align-items: center; }
.dp-modal-overlay.active { display: flex; }
.dp-modal { position: relative; width: 90%; max-width: 500px; max-height: 80vh; overflow-y: auto; padding: 30px; background: #fff; border-radius: 12px; box-shadow: 0 20px 60px rgba(0,0,0,.3); animation: dp-slide-in .3s ease-out; }
@keyframes dp-slide-in { from { transform: translateY(-50px); opacity: 0; } to { transform: translateY(0); opacity: 1; } }
.dp-modal h2 { margin: 0 0 20px; color: #333; font-size: 24px; text-align: center; }
.dp-modal-close { position: absolute; top: 15px; right: 15px; width: 30px; height: 30px; padding: 0; border: none; background: none; color: #999; font-size: 28px; line-height: 1; cursor: pointer; }
.dp-source-list { display: grid; gap: 12px; }
.dp-source-item { display: flex; align-items: center; padding: 15px 20px; background: #f8f9fa; border: 2px solid #e9ecef; border-radius: 8px; cursor: pointer; transition: all .3s; }
.dp-source-item:hover { background: #e8f5e9; border-color: #42bd56; transform: translateX(5px); }
.dp-source-icon { margin-right: 15px; font-size: 24px; }
.dp-source-info { flex: 1; }
.dp-source-name { margin-bottom: 4px; color: #333; font-size: 16px; font-weight: bold; }
.dp-source-desc { color: #666; font-size: 12px; }
.dp-source-arrow { color: #999; font-size: 20px; }
.dp-modal-footer { margin-top: 20px; padding-top: 20px; border-top: 1px solid #e9ecef; color: #666; font-size: 12px; text-align: center; }
</style>
"#;

// Modal is either "closed" or "open"; picking a source always closes it.
const OVERLAY_SCRIPT: &str = r#"
(function () {
  var panel = document.getElementById('dp-panel');
  var overlay = document.getElementById('dp-modal-overlay');
  if (!panel || !overlay) return;
  var title = panel.dataset.title || '';
  var modalState = 'closed';

  function setModal(next) {
    if (next === modalState) return;
    modalState = next;
    overlay.classList.toggle('active', next === 'open');
    document.body.style.overflow = next === 'open' ? 'hidden' : '';
  }

  function openTab(url) {
    window.open(url, '_blank');
  }

  async function play(item) {
    setModal('closed');
    var fallback = item.dataset.search + encodeURIComponent(title);
    if (!item.hasAttribute('data-resolve')) {
      openTab(fallback);
      return;
    }
    try {
      var resp = await fetch('/api/parse-nunuyy?title=' + encodeURIComponent(title));
      var data = await resp.json();
      openTab(data.url || fallback);
    } catch (err) {
      console.error('[douban-proxy] resolve failed', err);
      openTab(fallback);
    }
  }

  document.addEventListener('click', function (event) {
    if (event.target === overlay) {
      setModal('closed');
      return;
    }
    var el = event.target.closest && event.target.closest('[data-action],[data-source]');
    if (!el) return;
    if (el.dataset.source) {
      play(el);
      return;
    }
    switch (el.dataset.action) {
      case 'open-sources':
        setModal('open');
        break;
      case 'close-modal':
        setModal('closed');
        break;
      case 'hide-panel':
        panel.style.display = 'none';
        break;
      case 'resources':
        openTab('/download?movie=' + encodeURIComponent(panel.dataset.subjectId || '') +
          '&title=' + encodeURIComponent(title));
        break;
    }
  });

  document.addEventListener('keydown', function (event) {
    if (event.key === 'Escape') {
      setModal('closed');
    }
    if ((event.ctrlKey || event.metaKey) && event.shiftKey && (event.key === 'D' || event.key === 'd')) {
      panel.style.display = panel.style.display === 'none' ? '' : 'none';
    }
  });

  console.log('[douban-proxy] subject page', panel.dataset.subjectId);
})();
"#;

const SHELL_HEAD: &str = r#"<link rel="stylesheet" href="/custom/style.css"><script src="/custom/inject.js"></script>"#;

const SHELL_DOWNLOAD_SECTION: &str = r#"<div class="dp-download-section">
<h3>📥 Downloads</h3>
<div class="dp-download-buttons">
<button class="dp-download-btn" data-quality="1080p">HD (1080P)</button>
<button class="dp-download-btn" data-quality="720p">SD (720P)</button>
<button class="dp-download-btn" data-quality="4k">Ultra HD (4K)</button>
</div>
<p class="dp-download-note">Injected by douban-proxy, for personal study only.</p>
</div>"#;

const SHELL_BADGE: &str = r#"<div class="dp-badge">🔧 proxy mode</div>"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(variant: InjectionVariant) -> InjectionPolicy {
        InjectionPolicy::new(variant, Url::parse("https://nnyy.in").unwrap())
    }

    #[test]
    fn classify_detects_subject_pages() {
        assert_eq!(
            classify("/subject/1292052/"),
            PageKind::Detail {
                subject_id: "1292052".to_string()
            }
        );
        assert_eq!(
            classify("/subject/35267208/comments"),
            PageKind::Detail {
                subject_id: "35267208".to_string()
            }
        );
        assert_eq!(classify("/"), PageKind::ListOrOther);
        assert_eq!(classify("/chart"), PageKind::ListOrOther);
        assert_eq!(classify("/subject/"), PageKind::ListOrOther);
        assert_eq!(classify("/subject/abc/"), PageKind::ListOrOther);
    }

    #[test]
    fn overlay_detail_carries_metadata_and_sources() {
        let kind = classify("/subject/1292052/");
        let inj = policy(InjectionVariant::Overlay).injection_for(&kind, "The Shawshank Redemption");

        assert!(inj.head.is_none());
        assert!(inj.after_info.is_none());
        assert_eq!(inj.body.matches(r#"id="dp-panel""#).count(), 1);
        assert!(inj.body.contains(r#"data-subject-id="1292052""#));
        assert!(inj.body.contains("The Shawshank Redemption"));
        for source in PLAYER_SOURCES {
            assert!(inj.body.contains(&format!(r#"data-source="{}""#, source.key)));
        }
        assert!(inj.body.contains(r#"data-search="https://nnyy.in/so?q=" data-resolve"#));
        assert!(inj.body.contains("/api/parse-nunuyy?title="));
    }

    #[test]
    fn overlay_detail_escapes_title() {
        let kind = classify("/subject/1/");
        let inj = policy(InjectionVariant::Overlay)
            .injection_for(&kind, r#"<script>alert("x")</script>"#);
        assert!(!inj.body.contains(r#"<script>alert("x")</script>"#));
        assert!(inj.body.contains("&lt;script&gt;"));
    }

    #[test]
    fn overlay_list_is_minimal() {
        let inj = policy(InjectionVariant::Overlay).injection_for(&PageKind::ListOrOther, "Top 250");
        assert!(inj.body.contains("console.log"));
        assert!(!inj.body.contains("dp-panel"));
        assert!(!inj.body.contains("dp-modal"));
    }

    #[test]
    fn shell_variant_uses_static_assets() {
        let detail = policy(InjectionVariant::Shell).injection_for(&classify("/subject/2/"), "x");
        assert_eq!(detail.head.as_deref(), Some(SHELL_HEAD));
        assert!(detail.after_info.is_some());
        assert!(detail.body.contains("dp-badge"));

        let list = policy(InjectionVariant::Shell).injection_for(&PageKind::ListOrOther, "x");
        assert!(list.after_info.is_none());
        assert!(list.body.contains("dp-badge"));
    }
}
