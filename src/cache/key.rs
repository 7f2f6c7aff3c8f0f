//! Cache-key template substitution
//!
//! A location's cache key is a template over a fixed placeholder set:
//! `$scheme`, `$host`, `$uri`, `$querystring`, `$method`. Substitution is
//! a single literal pass; any other `$`-prefixed text passes through
//! unchanged, and substituted values are never re-scanned.

/// Request attributes available to key templates
#[derive(Debug)]
pub struct KeyVars<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub uri: &'a str,
    pub querystring: &'a str,
    pub method: &'a str,
}

/// Render a cache key from a template and one request's attributes
pub fn render_cache_key(template: &str, vars: &KeyVars<'_>) -> String {
    let placeholders: [(&str, &str); 5] = [
        ("$querystring", vars.querystring),
        ("$scheme", vars.scheme),
        ("$method", vars.method),
        ("$host", vars.host),
        ("$uri", vars.uri),
    ];

    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    'outer: while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        for (name, value) in placeholders {
            if rest.starts_with(name) {
                out.push_str(value);
                rest = &rest[name.len()..];
                continue 'outer;
            }
        }
        // Unrecognized $-text is passed through literally
        out.push('$');
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}
