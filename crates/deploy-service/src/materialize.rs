//! Artifact materialization
//!
//! Normalizes whatever detection or the build produced into the canonical
//! output directory (`<workdir>/dist`), so the resolver only ever has to
//! look in one place per deployment.

use berth_common::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::detect::OUTPUT_DIR;

/// Copy a directory tree. Follows the structure, not symlinks' targets.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Materialize a no-build site: copy the whole working tree into the
/// canonical output directory, excluding any pre-existing output directory
/// to avoid nesting it inside itself.
///
/// Returns the canonical output directory.
pub fn materialize_static(workdir: &Path) -> Result<PathBuf> {
    let out = workdir.join(OUTPUT_DIR);
    std::fs::create_dir_all(&out)
        .map_err(|e| Error::Materialization(format!("failed to create output directory: {e}")))?;

    let entries = std::fs::read_dir(workdir)
        .map_err(|e| Error::Materialization(format!("failed to read working directory: {e}")))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::Materialization(e.to_string()))?;
        if entry.file_name() == OUTPUT_DIR {
            continue;
        }
        let target = out.join(entry.file_name());
        let result = if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)
        } else {
            std::fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|e| {
            Error::Materialization(format!(
                "failed to copy {}: {e}",
                entry.path().display()
            ))
        })?;
    }

    info!("Materialized static tree into {}", out.display());
    Ok(out)
}

/// Materialize build output: replace the canonical output directory with
/// the output the build produced under `project_root`. A no-op when the
/// project root is the working directory itself (the output is already
/// canonical).
pub fn materialize_build_output(workdir: &Path, project_root: &Path) -> Result<PathBuf> {
    let out = workdir.join(OUTPUT_DIR);
    let produced = project_root.join(OUTPUT_DIR);

    if !produced.is_dir() {
        return Err(Error::Materialization(format!(
            "build output missing: {}",
            produced.display()
        )));
    }

    if produced == out {
        return Ok(out);
    }

    if out.exists() {
        std::fs::remove_dir_all(&out).map_err(|e| {
            Error::Materialization(format!("failed to clear previous output: {e}"))
        })?;
    }

    copy_dir_recursive(&produced, &out)
        .map_err(|e| Error::Materialization(format!("failed to copy build output: {e}")))?;

    info!(
        "Materialized build output {} into {}",
        produced.display(),
        out.display()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn static_copy_excludes_existing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("index.html"), "<html></html>");
        touch(&dir.path().join("css/style.css"), "body {}");
        touch(&dir.path().join("dist/stale.txt"), "old");

        let out = materialize_static(dir.path()).unwrap();

        assert!(out.join("index.html").is_file());
        assert!(out.join("css/style.css").is_file());
        // The pre-existing output directory is not nested into itself
        assert!(!out.join("dist").exists());
    }

    #[test]
    fn build_output_is_copied_from_nested_project() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("client/dist/index.html"), "<html></html>");
        touch(&dir.path().join("dist/old.txt"), "old");

        let out = materialize_build_output(dir.path(), &dir.path().join("client")).unwrap();

        assert!(out.join("index.html").is_file());
        assert!(!out.join("old.txt").exists());
    }

    #[test]
    fn root_project_output_is_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("dist/index.html"), "<html></html>");

        let out = materialize_build_output(dir.path(), dir.path()).unwrap();
        assert!(out.join("index.html").is_file());
    }

    #[test]
    fn missing_build_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("client")).unwrap();

        let err = materialize_build_output(dir.path(), &dir.path().join("client")).unwrap_err();
        assert!(err.to_string().contains("Materialization failed"));
    }
}
