//! HTML asset-link rewriting.
//!
//! Best-effort text substitution, not an HTML parser. Only quoted `href`,
//! `src` and `action` attribute values that start with `/static/` are
//! touched, so asset fetches issued by the browser stay under the
//! token-scoped path.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static STATIC_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s(?:href|src|action)\s*=\s*)(["'])/static/"#)
        .expect("Invalid regex pattern for static asset attributes")
});

/// Rewrite `/static/...` references to `{prefix}/{token}/static/...`.
pub fn rewrite_static_links(html: &str, prefix: &str, token: &str) -> String {
    let scoped = format!("{}/{}/static/", prefix, token);
    STATIC_ATTR
        .replace_all(html, |caps: &Captures<'_>| {
            format!("{}{}{}", &caps[1], &caps[2], scoped)
        })
        .into_owned()
}

/// True for `text/html` content types, parameters ignored.
pub fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}
