//! The HTML rewrite pass.
//!
//! Streams the fetched document through `lol_html`, rewriting every
//! resource-bearing attribute and every `url(...)` occurrence in inline
//! styles, stripping CSP meta tags and subresource-integrity attributes, and
//! prepending the runtime-interception script to `<head>`.

use lol_html::{
    element,
    html_content::{ContentType, Element},
    text, HtmlRewriter, Settings,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::{codec, inject, resolve};

/// Origin-scoping policy for rewritten references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewritePolicy {
    /// Every resolvable reference becomes a proxy URL.
    ProxyAll,
    /// Only references sharing the target's origin become proxy URLs;
    /// cross-origin references are rewritten to their absolute form and
    /// fetched directly by the browser.
    SameOriginOnly,
}

/// Read-only per-request state shared by every step of the rewrite pass.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// The absolute URL the document was fetched from; every relative
    /// reference resolves against it.
    pub target: Url,
    pub policy: RewritePolicy,
    /// Path of the proxy endpoint, e.g. `/proxy`.
    pub endpoint: String,
}

impl RewriteContext {
    pub fn new(target: Url, policy: RewritePolicy, endpoint: &str) -> Self {
        Self {
            target,
            policy,
            endpoint: endpoint.to_string(),
        }
    }
}

/// Applies the origin-scoping policy to one raw reference.
///
/// `None` means "leave the value exactly as found": the value is excluded
/// (empty, fragment, non-fetchable scheme), fails to resolve, already points
/// at the proxy, or is a cross-origin absolute URL under the same-origin
/// policy that needs no change.
pub fn apply_policy(raw: &str, ctx: &RewriteContext) -> Option<String> {
    if resolve::is_proxied(raw, &ctx.endpoint) {
        return None;
    }
    let resolved = resolve::resolve(raw, &ctx.target)?;
    match ctx.policy {
        RewritePolicy::ProxyAll => Some(codec::encode(&resolved, &ctx.endpoint)),
        RewritePolicy::SameOriginOnly => {
            if resolve::same_origin(&resolved, &ctx.target) {
                Some(codec::encode(&resolved, &ctx.endpoint))
            } else if raw == resolved.as_str() {
                None
            } else {
                Some(resolved.into())
            }
        }
    }
}

fn rewrite_attribute(
    el: &mut Element,
    name: &str,
    ctx: &RewriteContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let value = match el.get_attribute(name) {
        Some(value) => value,
        None => return Ok(()),
    };
    match apply_policy(&value, ctx) {
        Some(rewritten) => el.set_attribute(name, &rewritten)?,
        None => debug!(attribute = name, value = %value, "reference left untouched"),
    }
    Ok(())
}

/// Rewrites a `srcset` value: a comma-separated list of `<url> <descriptor>?`
/// pairs. Each URL is rewritten independently; descriptors are preserved
/// verbatim. Unresolvable entries are kept as found.
pub fn rewrite_srcset(srcset: &str, ctx: &RewriteContext) -> String {
    srcset
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let mut parts = entry.splitn(2, char::is_whitespace);
            let raw = parts.next().unwrap_or("");
            let descriptor = parts.next().map(str::trim).unwrap_or("");
            let rewritten = apply_policy(raw, ctx).unwrap_or_else(|| raw.to_string());
            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// Matches url(value), url('value'), and url("value"). Rust's regex has no
// backreferences, so the three quoting styles are separate alternatives.
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*(?:'([^']*)'|"([^"]*)"|([^'"()\s][^)\s]*))\s*\)"#)
        .unwrap_or_else(|err| panic!("invalid css url pattern: {err}"))
});

/// Rewrites every `url(...)` occurrence in a style attribute or `<style>`
/// block, preserving the quoting style of each occurrence.
pub fn rewrite_css(css: &str, ctx: &RewriteContext) -> String {
    CSS_URL
        .replace_all(css, |caps: &regex::Captures| {
            let (quote, raw) = if let Some(m) = caps.get(1) {
                ("'", m.as_str())
            } else if let Some(m) = caps.get(2) {
                ("\"", m.as_str())
            } else {
                ("", caps.get(3).map_or("", |m| m.as_str()))
            };
            match apply_policy(raw, ctx) {
                Some(rewritten) => format!("url({quote}{rewritten}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Runs the full rewrite pass over one HTML document and returns the
/// serialized result. Per-reference failures never abort the pass; the only
/// error source is the HTML rewriter itself.
pub fn rewrite_html(
    html: &[u8],
    ctx: &RewriteContext,
) -> Result<Vec<u8>, lol_html::errors::RewritingError> {
    let script = inject::interceptor_script(ctx);
    let mut output = Vec::with_capacity(html.len());
    // <style> text may arrive split across chunks; buffer until the final
    // chunk so a url(...) spanning a boundary is still seen whole.
    let mut style_text = String::new();
    let injected = std::cell::Cell::new(false);

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head", |el| {
                    el.prepend(&script, ContentType::Html);
                    injected.set(true);
                    Ok(())
                }),
                // Head-less documents still get the script, as early in
                // <body> as possible.
                element!("body", |el| {
                    if !injected.get() {
                        el.prepend(&script, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }),
                element!("meta[http-equiv]", |el| {
                    let is_csp = el
                        .get_attribute("http-equiv")
                        .map(|v| v.eq_ignore_ascii_case("content-security-policy"))
                        .unwrap_or(false);
                    if is_csp {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("script[integrity]", |el| {
                    el.remove_attribute("integrity");
                    Ok(())
                }),
                element!("link[integrity]", |el| {
                    el.remove_attribute("integrity");
                    Ok(())
                }),
                element!("[src]", |el| {
                    rewrite_attribute(el, "src", ctx)
                }),
                element!("[href]", |el| {
                    rewrite_attribute(el, "href", ctx)
                }),
                element!("[poster]", |el| {
                    rewrite_attribute(el, "poster", ctx)
                }),
                element!("[srcset]", |el| {
                    if let Some(value) = el.get_attribute("srcset") {
                        el.set_attribute("srcset", &rewrite_srcset(&value, ctx))?;
                    }
                    Ok(())
                }),
                element!("[style]", |el| {
                    if let Some(value) = el.get_attribute("style") {
                        el.set_attribute("style", &rewrite_css(&value, ctx))?;
                    }
                    Ok(())
                }),
                text!("style", |chunk| {
                    style_text.push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let rewritten = rewrite_css(&style_text, ctx);
                        chunk.replace(&rewritten, ContentType::Html);
                        style_text.clear();
                    } else {
                        chunk.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter.write(html)?;
    rewriter.end()?;
    Ok(output)
}
