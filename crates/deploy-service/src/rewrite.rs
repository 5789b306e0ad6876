//! Entry-document rewriting
//!
//! A project served from beneath a path prefix assumed it would be served
//! from its own directory root. Two rewrites fix its asset references when
//! the entry document is delivered: relative `href`/`src` values gain the
//! nested subdirectory prefix, and root-absolute values are made relative.

/// Rewrite an entry document for serving.
///
/// `nested_prefix` is the subdirectory the entry document actually lives
/// in, when the serving root uses a nested layout.
pub fn rewrite_entry_document(html: &str, nested_prefix: Option<&str>) -> String {
    let html = match nested_prefix {
        Some(prefix) => rewrite_attrs(html, |value| prefix_relative(value, prefix)),
        None => html.to_string(),
    };
    rewrite_attrs(&html, strip_root_slash)
}

/// Prefix a relative reference with the nested subdirectory name.
///
/// Absolute, protocol-relative, root-absolute, data, already-prefixed and
/// parent-escaping references are left alone.
fn prefix_relative(value: &str, prefix: &str) -> Option<String> {
    if value.starts_with("http://")
        || value.starts_with("https://")
        || value.starts_with("//")
        || value.starts_with('/')
        || value.starts_with("data:")
        || value.starts_with("..")
        || value.starts_with(prefix)
    {
        return None;
    }
    Some(format!("{prefix}/{value}"))
}

/// Turn a root-absolute reference into a relative one by stripping the
/// leading slash. Protocol-relative and external references are left alone.
fn strip_root_slash(value: &str) -> Option<String> {
    let rest = value.strip_prefix('/')?;
    if rest.starts_with('/') || rest.starts_with("http") {
        return None;
    }
    Some(rest.to_string())
}

/// Apply `f` to every quoted `href`/`src` attribute value. `f` returns
/// `None` to leave a value unchanged.
fn rewrite_attrs<F>(html: &str, f: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(html.len());
    let mut i = 0;

    while i < html.len() {
        let Some((quote, value_start)) = attr_at(html, i) else {
            let ch = html[i..].chars().next().unwrap_or('\0');
            out.push(ch);
            i += ch.len_utf8().max(1);
            continue;
        };

        let Some(value_len) = html[value_start..].find(quote) else {
            out.push_str(&html[i..]);
            break;
        };

        let value = &html[value_start..value_start + value_len];
        out.push_str(&html[i..value_start]);
        match f(value) {
            Some(rewritten) => out.push_str(&rewritten),
            None => out.push_str(value),
        }
        out.push(quote);
        i = value_start + value_len + 1;
    }

    out
}

/// If an `href=` or `src=` attribute with a quoted value starts at byte
/// `i`, return the quote char and the index of the value's first byte.
fn attr_at(html: &str, i: usize) -> Option<(char, usize)> {
    let bytes = html.as_bytes();

    // Reject matches inside longer names such as data-src
    if i > 0 {
        let prev = bytes[i - 1] as char;
        if prev.is_ascii_alphanumeric() || prev == '-' || prev == '_' {
            return None;
        }
    }

    let rest = &html[i..];
    let attr_len = if rest.starts_with("href=") {
        5
    } else if rest.starts_with("src=") {
        4
    } else {
        return None;
    };

    let quote = *bytes.get(i + attr_len)? as char;
    if quote != '"' && quote != '\'' {
        return None;
    }

    Some((quote, i + attr_len + 1))
}
