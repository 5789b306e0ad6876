//! Request-time artifact resolution
//!
//! Maps an incoming path plus a deployment working directory to a concrete
//! file, handling nested output layouts and SPA-style fallback. Resolution
//! never mutates deployment state; a miss is a per-request outcome.

use std::path::{Component, Path, PathBuf};

use crate::detect::{ENTRY_DOCUMENT, OUTPUT_DIR};

/// The directory a deployment is served from, plus the nested subdirectory
/// prefix when the entry documents live one level below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingRoot {
    pub dir: PathBuf,
    pub nested_prefix: Option<String>,
}

/// Locate the serving root for a deployment working directory.
///
/// Checks, in order: canonical output with a root entry document; canonical
/// output with entry documents in an immediate subdirectory; the raw
/// working directory under the same two checks. First match wins.
pub fn find_serving_root(workdir: &Path) -> Option<ServingRoot> {
    let out = workdir.join(OUTPUT_DIR);

    if out.join(ENTRY_DOCUMENT).is_file() {
        return Some(ServingRoot {
            dir: out,
            nested_prefix: None,
        });
    }

    if out.is_dir() {
        if has_markup_file(&out) {
            return Some(ServingRoot {
                dir: out,
                nested_prefix: None,
            });
        }
        if let Some(sub) = subdir_with_markup(&out) {
            return Some(ServingRoot {
                dir: out,
                nested_prefix: Some(sub),
            });
        }
    }

    if has_markup_file(workdir) {
        return Some(ServingRoot {
            dir: workdir.to_path_buf(),
            nested_prefix: None,
        });
    }

    if let Some(sub) = subdir_with_markup(workdir) {
        return Some(ServingRoot {
            dir: workdir.to_path_buf(),
            nested_prefix: Some(sub),
        });
    }

    None
}

/// Resolve a request path to a concrete file inside the serving directory.
///
/// Empty and trailing-slash paths resolve to the entry document. Otherwise
/// the literal path is tried, then the conventional assets subdirectory,
/// then the path as a directory holding an entry document.
pub fn resolve_path(serving_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let cleaned = clean_request_path(request_path)?;

    if cleaned.is_empty() {
        let idx = serving_dir.join(ENTRY_DOCUMENT);
        return idx.is_file().then_some(idx);
    }

    let candidates = [
        serving_dir.join(&cleaned),
        serving_dir.join("assets").join(&cleaned),
        serving_dir.join(&cleaned).join(ENTRY_DOCUMENT),
    ];

    candidates.into_iter().find(|c| c.is_file())
}

/// Whether a request looks navigational: the entry document itself, or a
/// path whose last segment carries no file extension. Navigational misses
/// fall back to the entry document so client-side routers keep working;
/// asset-shaped misses do not.
pub fn is_navigational(request_path: &str) -> bool {
    let Some(cleaned) = clean_request_path(request_path) else {
        return false;
    };
    if cleaned.is_empty() || cleaned == ENTRY_DOCUMENT {
        return true;
    }
    let last = cleaned.rsplit('/').next().unwrap_or(&cleaned);
    !last.contains('.')
}

/// The entry document to serve for a navigational miss: the serving root's
/// own index, then the nested subdirectory's index, then the first markup
/// file in the nested subdirectory, then the first markup file anywhere
/// under the root.
pub fn fallback_entry(root: &ServingRoot) -> Option<PathBuf> {
    let idx = root.dir.join(ENTRY_DOCUMENT);
    if idx.is_file() {
        return Some(idx);
    }

    if let Some(prefix) = &root.nested_prefix {
        let nested = root.dir.join(prefix);
        let nested_idx = nested.join(ENTRY_DOCUMENT);
        if nested_idx.is_file() {
            return Some(nested_idx);
        }
        if let Some(name) = first_markup_name(&nested) {
            return Some(nested.join(name));
        }
    }

    find_first_markup(&root.dir)
}

/// Strip the query string and leading slashes; reject parent components so
/// a request can never escape the serving root. Returns `None` for
/// traversal attempts.
fn clean_request_path(request_path: &str) -> Option<String> {
    let no_query = request_path.split('?').next().unwrap_or("");
    let trimmed = no_query.trim_start_matches('/');

    // Trailing-slash requests ask for the entry document
    if trimmed.ends_with('/') {
        return Some(String::new());
    }

    let path = Path::new(trimmed);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }

    Some(trimmed.to_string())
}

/// First markup file found by a depth-first walk, skipping dependency
/// caches and version control
pub fn find_first_markup(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "node_modules" || name == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_file() && is_markup(&name) {
            return Some(path);
        }
    }

    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "node_modules" || name == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_first_markup(&path) {
                return Some(found);
            }
        }
    }

    None
}

/// Content type for a resolved file, by extension
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn is_markup(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

fn has_markup_file(dir: &Path) -> bool {
    first_markup_name(dir).is_some()
}

fn first_markup_name(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| is_markup(n))
        .collect();
    names.sort();
    names.into_iter().next()
}

fn subdir_with_markup(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| !n.starts_with('.') && n != "node_modules")
        .collect();
    names.sort();
    names.into_iter().find(|n| has_markup_file(&dir.join(n)))
}
