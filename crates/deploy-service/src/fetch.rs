//! Source fetching
//!
//! Clones a remote repository into a deployment's working directory. The
//! fetcher is a trait so the pipeline can be driven without network access;
//! the test suite substitutes [`LocalDirFetcher`] for [`GitFetcher`].

use async_trait::async_trait;
use berth_common::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

use crate::materialize::copy_dir_recursive;

/// Fetches a source tree into a fresh working directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source_ref: &str, dest: &Path) -> Result<()>;
}

/// Clones with the `git` binary as a timeout-bound child process
pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source_ref: &str, dest: &Path) -> Result<()> {
        info!("Cloning {} into {}", source_ref, dest.display());

        let child = Command::new("git")
            .arg("clone")
            .arg(source_ref)
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Fetch(format!("failed to spawn git: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| Error::Fetch(format!("git clone failed: {e}")))?,
            Err(_) => {
                error!(
                    "git clone of {} timed out after {:?}",
                    source_ref, self.timeout
                );
                return Err(Error::Fetch("clone timed out".to_string()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("git clone of {} failed: {}", source_ref, stderr.trim());
            return Err(Error::Fetch("clone failed".to_string()));
        }

        Ok(())
    }
}

/// Copies a local directory tree instead of cloning.
///
/// Treats the source reference as a filesystem path. The integration tests
/// drive the whole pipeline through this fetcher so no network or git
/// binary is required.
pub struct LocalDirFetcher;

#[async_trait]
impl SourceFetcher for LocalDirFetcher {
    async fn fetch(&self, source_ref: &str, dest: &Path) -> Result<()> {
        let src = Path::new(source_ref);
        if !src.is_dir() {
            return Err(Error::Fetch(format!("no such directory: {source_ref}")));
        }
        std::fs::create_dir_all(dest)
            .map_err(|e| Error::Fetch(format!("failed to create working directory: {e}")))?;
        copy_dir_recursive(src, dest)
            .map_err(|e| Error::Fetch(format!("failed to copy source tree: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fetcher_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("index.html"), "<html></html>").unwrap();
        std::fs::create_dir(src.path().join("css")).unwrap();
        std::fs::write(src.path().join("css/style.css"), "body {}").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let workdir = dest.path().join("site");

        LocalDirFetcher
            .fetch(src.path().to_str().unwrap(), &workdir)
            .await
            .unwrap();

        assert!(workdir.join("index.html").is_file());
        assert!(workdir.join("css/style.css").is_file());
    }

    #[tokio::test]
    async fn local_fetcher_rejects_missing_source() {
        let dest = tempfile::tempdir().unwrap();
        let err = LocalDirFetcher
            .fetch("/nonexistent/source", &dest.path().join("site"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Fetch failed"));
    }

    // Needs the git binary; run manually with --ignored.
    #[tokio::test]
    #[ignore]
    async fn git_fetcher_clones_local_repository() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("index.html"), "<html></html>").unwrap();

        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(src.path())
                .output()
                .unwrap()
        };
        run(&["init"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);

        let dest = tempfile::tempdir().unwrap();
        let workdir = dest.path().join("site");

        GitFetcher::new(Duration::from_secs(60))
            .fetch(src.path().to_str().unwrap(), &workdir)
            .await
            .unwrap();

        assert!(workdir.join("index.html").is_file());
    }
}
