//! Publish target detection
//!
//! Decides what inside an arbitrary fetched tree should be treated as "the
//! site". Detection is an ordered list of pure probes evaluated
//! top-to-bottom; the order is a deliberate tie-break (prebuilt output
//! beats source heuristics, a directory entry point beats a lone file).
//! Probes never look deeper than one directory level; only the manifest
//! search recurses.

use berth_common::{PublishTarget, TargetKind};
use std::path::{Path, PathBuf};

/// Project manifest marking a tree that needs a build step
pub const MANIFEST: &str = "package.json";

/// Canonical build output directory name
pub const OUTPUT_DIR: &str = "dist";

/// Entry document name
pub const ENTRY_DOCUMENT: &str = "index.html";

type Probe = fn(&Path) -> Option<PublishTarget>;

/// Evaluated in order; first hit wins.
const PROBES: &[Probe] = &[
    probe_dist_output,
    probe_build_output,
    probe_root_entry,
    probe_subdir_entry,
    probe_subdir_markup,
];

/// Decide the publish target for a working directory, or `None` when the
/// tree has nothing servable.
pub fn detect_publish_target(root: &Path) -> Option<PublishTarget> {
    PROBES.iter().find_map(|probe| probe(root))
}

fn probe_dist_output(root: &Path) -> Option<PublishTarget> {
    dir_with_entry(root, OUTPUT_DIR)
}

fn probe_build_output(root: &Path) -> Option<PublishTarget> {
    dir_with_entry(root, "build")
}

fn dir_with_entry(root: &Path, dir: &str) -> Option<PublishTarget> {
    root.join(dir)
        .join(ENTRY_DOCUMENT)
        .is_file()
        .then(|| PublishTarget {
            kind: TargetKind::Directory,
            relative_path: PathBuf::from(dir),
        })
}

fn probe_root_entry(root: &Path) -> Option<PublishTarget> {
    root.join(ENTRY_DOCUMENT).is_file().then(|| PublishTarget {
        kind: TargetKind::SingleFile,
        relative_path: PathBuf::from(ENTRY_DOCUMENT),
    })
}

fn probe_subdir_entry(root: &Path) -> Option<PublishTarget> {
    subdirs(root).into_iter().find_map(|sub| {
        root.join(&sub)
            .join(ENTRY_DOCUMENT)
            .is_file()
            .then(|| PublishTarget {
                kind: TargetKind::Directory,
                relative_path: PathBuf::from(sub),
            })
    })
}

fn probe_subdir_markup(root: &Path) -> Option<PublishTarget> {
    subdirs(root).into_iter().find_map(|sub| {
        let files = sorted_entries(&root.join(&sub));
        files
            .into_iter()
            .find(|name| is_markup(name))
            .map(|file| PublishTarget {
                kind: TargetKind::SingleFile,
                relative_path: PathBuf::from(sub).join(file),
            })
    })
}

/// Whether the tree requires a build step
pub fn needs_build(root: &Path) -> bool {
    find_project_root(root).is_some()
}

/// Locate the directory holding the project manifest.
///
/// Priority: manifest at the root, then a conventional `client` directory,
/// then the first manifest found by a depth-first walk that skips
/// dependency caches, version control and hidden directories.
pub fn find_project_root(root: &Path) -> Option<PathBuf> {
    if root.join(MANIFEST).is_file() {
        return Some(root.to_path_buf());
    }

    let client = root.join("client");
    if client.join(MANIFEST).is_file() {
        return Some(client);
    }

    for sub in subdirs(root) {
        if let Some(found) = find_project_root(&root.join(sub)) {
            return Some(found);
        }
    }

    None
}

/// Whether a deployment already carries real build output.
///
/// `dist/src` means the source tree was copied into `dist`, which does not
/// count as built. Otherwise a non-empty `dist/assets` or `build` directory
/// that itself holds no `src` does.
pub fn is_built(workdir: &Path) -> bool {
    if workdir.join(OUTPUT_DIR).join("src").is_dir() {
        return false;
    }

    let indicators = [workdir.join(OUTPUT_DIR).join("assets"), workdir.join("build")];
    indicators.iter().any(|dir| {
        let entries = sorted_entries(dir);
        !entries.is_empty() && !entries.iter().any(|name| name == "src")
    })
}

fn is_markup(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Immediate subdirectory names, sorted, skipping hidden directories,
/// dependency caches and version control
fn subdirs(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') && name != "node_modules")
        .collect();
    names.sort();
    names
}

/// File names directly inside `dir`, sorted
fn sorted_entries(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
