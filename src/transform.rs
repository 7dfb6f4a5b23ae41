use std::cell::Cell;
use std::sync::LazyLock;

use lol_html::{element, html_content::ContentType, HtmlRewriter, Settings};
use scraper::{Html, Selector};
use tracing::debug;

use crate::error::TransformError;
use crate::inject::{Injection, InjectionPolicy, PageKind};
use crate::rewrite::RewriteContext;

static TITLE_SPAN: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1 span").unwrap());
static TITLE_TAG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

/// Movie title shown on a subject page: the first `h1 span`, falling back to
/// the document `<title>`.
pub fn page_title(html: &str) -> String {
    let document = Html::parse_document(html);
    [&*TITLE_SPAN, &*TITLE_TAG]
        .into_iter()
        .filter_map(|selector| document.select(selector).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// Rewrites one upstream HTML page and splices in the fragments the policy
/// picks for `kind`.
pub fn transform_page(
    html: &[u8],
    ctx: &RewriteContext,
    kind: &PageKind,
    policy: &InjectionPolicy,
) -> Result<Vec<u8>, TransformError> {
    let title = match kind {
        PageKind::Detail { .. } => page_title(&String::from_utf8_lossy(html)),
        PageKind::ListOrOther => String::new(),
    };
    let injection = policy.injection_for(kind, &title);
    rewrite_html(html, ctx, &injection)
}

/// Single streaming pass: link, asset, form, image and meta-refresh nodes are
/// rewritten in place, everything else is emitted as it came in. Injected
/// markup is never fed back through the handlers.
pub fn rewrite_html(
    html: &[u8],
    ctx: &RewriteContext,
    injection: &Injection,
) -> Result<Vec<u8>, TransformError> {
    let head_done = Cell::new(false);
    let info_done = Cell::new(false);
    let body_done = Cell::new(false);
    let mut output = Vec::with_capacity(html.len() + injection.body.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                // Navigation links
                element!("a[href]", |el| {
                    if let Some(href) = el.get_attribute("href") {
                        let rewritten = ctx.rewrite(&href);
                        if rewritten.url != href {
                            debug!("Rewriting href '{}' -> '{}'", href, rewritten.url);
                            el.set_attribute("href", &rewritten.url)?;
                        }
                        if rewritten.external {
                            el.set_attribute("target", "_blank")?;
                            el.set_attribute("rel", "noopener noreferrer")?;
                        }
                    }
                    Ok(())
                }),
                // Stylesheets
                element!("link[href]", |el| {
                    let is_stylesheet = el
                        .get_attribute("rel")
                        .is_some_and(|rel| {
                            rel.split_ascii_whitespace()
                                .any(|r| r.eq_ignore_ascii_case("stylesheet"))
                        });
                    if !is_stylesheet {
                        return Ok(());
                    }
                    if let Some(href) = el.get_attribute("href") {
                        let rewritten = ctx.rewrite(&href);
                        if rewritten.url != href {
                            el.set_attribute("href", &rewritten.url)?;
                        }
                    }
                    Ok(())
                }),
                element!("script[src]", |el| {
                    if let Some(src) = el.get_attribute("src") {
                        let rewritten = ctx.rewrite(&src);
                        if rewritten.url != src {
                            el.set_attribute("src", &rewritten.url)?;
                        }
                    }
                    Ok(())
                }),
                element!("form[action]", |el| {
                    if let Some(action) = el.get_attribute("action") {
                        let rewritten = ctx.rewrite(&action);
                        if rewritten.url != action {
                            el.set_attribute("action", &rewritten.url)?;
                        }
                    }
                    Ok(())
                }),
                // Images go through /proxy-image; a lazy data-src is copied
                // into src so it loads right away.
                element!("img", |el| {
                    if let Some(data_src) = el.get_attribute("data-src") {
                        if let Some(proxied) = ctx.proxied_image(&data_src) {
                            el.set_attribute("data-src", &proxied)?;
                            el.set_attribute("src", &proxied)?;
                            return Ok(());
                        }
                    }
                    if let Some(src) = el.get_attribute("src") {
                        if let Some(proxied) = ctx.proxied_image(&src) {
                            el.set_attribute("src", &proxied)?;
                        }
                    }
                    Ok(())
                }),
                element!("meta[http-equiv][content]", |el| {
                    let is_refresh = el
                        .get_attribute("http-equiv")
                        .is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"));
                    if let (true, Some(content)) = (is_refresh, el.get_attribute("content")) {
                        let rewritten = ctx.rewrite_meta_refresh(&content);
                        if rewritten != content {
                            el.set_attribute("content", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
                element!("head", |el| {
                    if let Some(head) = &injection.head {
                        if !head_done.replace(true) {
                            el.append(head, ContentType::Html);
                        }
                    }
                    Ok(())
                }),
                element!("#info", |el| {
                    if let Some(section) = &injection.after_info {
                        if !info_done.replace(true) {
                            el.after(section, ContentType::Html);
                        }
                    }
                    Ok(())
                }),
                element!("body", |el| {
                    if !body_done.replace(true) {
                        el.append(&injection.body, ContentType::Html);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter.write(html)?;
    rewriter.end()?;

    // Fragments and bodiless documents still get their injection, once.
    if !body_done.get() {
        if let (Some(head), false) = (&injection.head, head_done.get()) {
            output.extend_from_slice(head.as_bytes());
        }
        output.extend_from_slice(injection.body.as_bytes());
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::{classify, InjectionVariant};
    use crate::shared::DomainAllowlist;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext::new(
            Url::parse("https://movie.douban.com").unwrap(),
            DomainAllowlist::default(),
        )
    }

    fn policy(variant: InjectionVariant) -> InjectionPolicy {
        InjectionPolicy::new(variant, Url::parse("https://nnyy.in").unwrap())
    }

    fn plain(body: &str) -> Injection {
        Injection {
            body: body.to_string(),
            ..Injection::default()
        }
    }

    fn run(html: &str) -> String {
        let out = rewrite_html(html.as_bytes(), &ctx(), &plain("<!--injected-->")).unwrap();
        String::from_utf8(out).unwrap()
    }

    const PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<meta http-equiv="Refresh" content="0;url=https://movie.douban.com/subject/1292052/">
<link rel="stylesheet" href="https://img3.doubanio.com/f/movie/base.css">
<link rel="icon" href="https://img3.doubanio.com/favicon.ico">
<script src="//img3.doubanio.com/f/movie/lib.js"></script>
<title>The Shawshank Redemption (豆瓣)</title>
</head><body>
<h1><span property="v:itemreviewed">肖申克的救赎 The Shawshank Redemption</span></h1>
<a href="https://movie.douban.com/subject/1292052/?from=top#intro">self</a>
<a href="/chart">chart</a>
<a href="https://www.imdb.com/title/tt0111161">imdb</a>
<a>no href</a>
<img src="https://img9.doubanio.com/view/photo/p480747492.jpg" alt="poster">
<img src="/pics/grey.gif" data-src="//img1.doubanio.com/lazy.jpg">
<form action="https://www.douban.com/search"><input name="q"></form>
<div id="info">director: Frank Darabont</div>
</body></html>"#;

    #[test]
    fn rewrites_links_assets_and_forms() {
        let out = run(PAGE);

        assert!(out.contains(r#"<a href="/subject/1292052/?from=top#intro">self</a>"#));
        assert!(out.contains(r#"<a href="/chart">chart</a>"#));
        assert!(out.contains(
            r#"<a href="https://www.imdb.com/title/tt0111161" target="_blank" rel="noopener noreferrer">imdb</a>"#
        ));
        assert!(out.contains("<a>no href</a>"));
        assert!(out.contains(r#"<link rel="stylesheet" href="/f/movie/base.css">"#));
        // non-stylesheet links keep their href
        assert!(out.contains(r#"<link rel="icon" href="https://img3.doubanio.com/favicon.ico">"#));
        assert!(out.contains(r#"<script src="/f/movie/lib.js"></script>"#));
        assert!(out.contains(r#"<form action="/search">"#));
        assert!(out.contains(r#"content="0;url=/subject/1292052/""#));
    }

    #[test]
    fn images_are_proxied_and_lazy_sources_forced() {
        let out = run(PAGE);
        assert!(out.contains(
            r#"<img src="/proxy-image?url=https%3A%2F%2Fimg9.doubanio.com%2Fview%2Fphoto%2Fp480747492.jpg" alt="poster">"#
        ));
        assert!(out.contains(
            r#"<img src="/proxy-image?url=https%3A%2F%2Fimg1.doubanio.com%2Flazy.jpg" data-src="/proxy-image?url=https%3A%2F%2Fimg1.doubanio.com%2Flazy.jpg">"#
        ));
    }

    #[test]
    fn untouched_markup_is_preserved() {
        let out = run(PAGE);
        assert!(out.starts_with("<!DOCTYPE html>\n<html><head>\n"));
        assert!(out.contains(r#"<div id="info">director: Frank Darabont</div>"#));
        assert!(out.contains(r#"<input name="q">"#));
    }

    #[test]
    fn injection_is_appended_once_at_body_end() {
        let out = run(PAGE);
        assert_eq!(out.matches("<!--injected-->").count(), 1);
        assert!(out.contains("<!--injected--></body>"));
    }

    #[test]
    fn injected_markup_is_not_rewritten() {
        let injection = plain(r#"<a href="https://movie.douban.com/x">kept</a>"#);
        let out = rewrite_html(PAGE.as_bytes(), &ctx(), &injection).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(r#"<a href="https://movie.douban.com/x">kept</a></body>"#));
    }

    #[test]
    fn bodiless_fragment_still_gets_injection() {
        let out = run(r#"<p><a href="https://movie.douban.com/a">a</a></p>"#);
        assert_eq!(out, r#"<p><a href="/a">a</a></p><!--injected-->"#);
    }

    #[test]
    fn malformed_markup_does_not_fail() {
        let out = run(r#"<a href="http://[bad">x<img src=""><body><div <<>"#);
        assert!(out.contains(r#"href="http://[bad""#));
        assert_eq!(out.matches("<!--injected-->").count(), 1);
    }

    #[test]
    fn second_pass_leaves_links_alone() {
        let first = run(PAGE);
        let second = run(&first);

        let links = |html: &str| -> Vec<String> {
            let doc = Html::parse_document(html);
            let sel = Selector::parse("a[href], link[href], script[src], img, form[action]").unwrap();
            doc.select(&sel)
                .map(|el| {
                    let v = el.value();
                    format!(
                        "{:?} {:?} {:?} {:?}",
                        v.attr("href"),
                        v.attr("src"),
                        v.attr("data-src"),
                        v.attr("action")
                    )
                })
                .collect()
        };
        assert_eq!(links(&first), links(&second));
    }

    #[test]
    fn page_title_prefers_heading() {
        assert_eq!(page_title(PAGE), "肖申克的救赎 The Shawshank Redemption");
        assert_eq!(
            page_title("<html><head><title> Top 250 </title></head><body></body></html>"),
            "Top 250"
        );
        assert_eq!(page_title("<p>nothing</p>"), "");
    }

    #[test]
    fn detail_page_gets_overlay_once() {
        let kind = classify("/subject/1292052/");
        let out = transform_page(PAGE.as_bytes(), &ctx(), &kind, &policy(InjectionVariant::Overlay)).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches(r#"id="dp-panel""#).count(), 1);
        assert!(out.contains(r#"data-title="肖申克的救赎 The Shawshank Redemption""#));
    }

    #[test]
    fn shell_variant_places_fragments() {
        let kind = classify("/subject/1292052/");
        let out = transform_page(PAGE.as_bytes(), &ctx(), &kind, &policy(InjectionVariant::Shell)).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(r#"<script src="/custom/inject.js"></script></head>"#));
        assert!(out.contains(r#"director: Frank Darabont</div><div class="dp-download-section">"#));
        assert_eq!(out.matches("dp-badge").count(), 1);
    }
}
