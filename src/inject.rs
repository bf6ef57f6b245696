//! Runtime interception: the script prepended to `<head>` that redirects
//! script-initiated network calls back through the proxy.
//!
//! The target URL is embedded in the script as a string literal, so escaping
//! is an integrity requirement: a target containing `'` or `</script>` must
//! not be able to terminate the literal or the surrounding script element.

use crate::rewrite::{RewriteContext, RewritePolicy};

/// Quotes a value as a single-quoted JavaScript string literal.
///
/// `<` is emitted as `\x3C` so no `</script>` sequence can appear inside the
/// literal, and the U+2028/U+2029 line separators are escaped because they
/// terminate JS string literals despite being valid in URLs.
pub fn js_string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '<' => out.push_str("\\x3C"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Builds the interceptor `<script>` element for one request.
///
/// The script wraps `window.fetch` and `XMLHttpRequest.prototype.open` with
/// versions that resolve the call target against the embedded base URL,
/// apply the same origin-scoping and already-proxied pass-through rules as
/// the markup rewrite, and delegate to the original primitive. Resolution
/// failures fall back to the original, unmodified argument rather than
/// blocking the call.
pub fn interceptor_script(ctx: &RewriteContext) -> String {
    let base = js_string_literal(ctx.target.as_str());
    let endpoint = js_string_literal(&ctx.endpoint);
    let same_origin_only = matches!(ctx.policy, RewritePolicy::SameOriginOnly);
    format!(
        r#"<script data-mirror-injected="true">(function(){{
var base={base};
var endpoint={endpoint};
var sameOriginOnly={same_origin_only};
var toProxy=function(u){{
  try{{
    if(typeof u==='string'&&u.indexOf(endpoint+'?url=')===0){{return u;}}
    var abs=new URL(u,base);
    if(abs.protocol!=='http:'&&abs.protocol!=='https:'){{return u;}}
    if(sameOriginOnly&&abs.origin!==new URL(base).origin){{return abs.toString();}}
    return endpoint+'?url='+encodeURIComponent(abs.toString());
  }}catch(e){{return u;}}
}};
var originalFetch=window.fetch;
window.fetch=function(resource,init){{
  if(typeof resource==='string'){{resource=toProxy(resource);}}
  else if(resource instanceof Request){{resource=new Request(toProxy(resource.url),resource);}}
  return originalFetch.call(window,resource,init);
}};
var originalOpen=XMLHttpRequest.prototype.open;
XMLHttpRequest.prototype.open=function(method,u){{
  var args=Array.prototype.slice.call(arguments);
  try{{args[1]=toProxy(u);}}catch(e){{}}
  return originalOpen.apply(this,args);
}};
}})();</script>"#
    )
}
