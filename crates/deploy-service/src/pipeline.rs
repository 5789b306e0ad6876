//! Deployment orchestration
//!
//! Drives a deployment from "requested" to "servable": fetch, target
//! detection, build when a manifest is present, materialization, the quota
//! gate, and the status/log writes for every transition. All work for one
//! deployment id runs behind a per-id lock; operations on different ids
//! proceed in parallel.

use anyhow::Context;
use berth_common::{
    BillingDecision, DeployStatus, DeploymentRecord, Error, Result, StepStatus, TargetKind,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::{BillingGate, FixedSizeAccounting};
use crate::build::{BuildExecutor, BuildOutcome};
use crate::config::Config;
use crate::detect;
use crate::fetch::SourceFetcher;
use crate::materialize;
use crate::store::RecordStore;

/// Result of a deploy request
#[derive(Debug)]
pub enum DeployOutcome {
    Live { url: String },
    PaymentRequired(BillingDecision),
    Failed,
}

/// Result of a redeploy request
#[derive(Debug)]
pub enum RedeployOutcome {
    Live { url: String },
    /// The record's current status does not permit a redeploy
    NotAllowed,
    Failed,
}

/// Result of the payment-verification callback
#[derive(Debug)]
pub enum VerifyOutcome {
    Verified { url: String },
    /// The record is not waiting for payment
    WrongState,
}

enum AttemptOutcome {
    Live(String),
    Payment(BillingDecision),
}

/// Per-deployment-id mutual exclusion. A double-clicked redeploy queues
/// behind the running one instead of racing it.
struct DeployLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DeployLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(id).or_default().clone()
    }
}

/// The deployment orchestrator
pub struct Pipeline {
    base_url: String,
    deploy_dir: PathBuf,
    build_timeout_secs: u64,
    store: Arc<RecordStore>,
    fetcher: Arc<dyn SourceFetcher>,
    executor: BuildExecutor,
    gate: BillingGate,
    locks: DeployLocks,
}

impl Pipeline {
    pub fn new(config: &Config, store: Arc<RecordStore>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            deploy_dir: config.deploy_dir.clone(),
            build_timeout_secs: config.build_timeout_secs,
            store,
            fetcher,
            executor: BuildExecutor::new(Duration::from_secs(config.build_timeout_secs)),
            gate: BillingGate::new(
                config.free_limit_mb,
                Arc::new(FixedSizeAccounting {
                    size_mb: config.project_size_mb,
                }),
            ),
            locks: DeployLocks::new(),
        }
    }

    /// The working directory for a deployment id
    pub fn workdir(&self, id: Uuid) -> PathBuf {
        self.deploy_dir.join(id.to_string())
    }

    /// The stable servable URL for a deployment id
    pub fn site_url(&self, id: Uuid) -> String {
        format!("{}/sites/{}", self.base_url, id)
    }

    /// Quota constants, surfaced in the payment-required payload
    pub fn free_limit_mb(&self) -> u64 {
        self.gate.free_limit_mb()
    }

    /// Run a fresh deployment end to end.
    ///
    /// Pipeline errors are absorbed here: the record ends up `Failed` with
    /// a reason step in its log and the caller sees a generic failure.
    pub async fn deploy(
        &self,
        owner_id: &str,
        source_ref: &str,
        project_name: Option<String>,
    ) -> (Uuid, DeployOutcome) {
        let id = Uuid::new_v4();
        let name = project_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| derive_name(source_ref));

        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        info!("Deploying {} for {} as {}", source_ref, owner_id, id);

        let record =
            DeploymentRecord::new(id, owner_id.to_string(), name, source_ref.to_string());
        if let Err(e) = self.store.insert(record).await {
            error!("Failed to create record for {}: {}", id, e);
            return (id, DeployOutcome::Failed);
        }
        if let Err(e) = self
            .store
            .update(id, |r| {
                r.append_log("Initializing", StepStatus::Complete);
                Ok(())
            })
            .await
        {
            error!("Failed to initialize record for {}: {}", id, e);
            return (id, DeployOutcome::Failed);
        }

        match self.run_attempt(id, owner_id).await {
            Ok(AttemptOutcome::Live(url)) => {
                info!("Deployment {} is live at {}", id, url);
                (id, DeployOutcome::Live { url })
            }
            Ok(AttemptOutcome::Payment(decision)) => {
                info!(
                    "Deployment {} blocked pending payment ({}MB used)",
                    id, decision.current_usage_mb
                );
                (id, DeployOutcome::PaymentRequired(decision))
            }
            Err(e) => {
                self.record_failure(id, &e).await;
                (id, DeployOutcome::Failed)
            }
        }
    }

    async fn run_attempt(&self, id: Uuid, owner_id: &str) -> Result<AttemptOutcome> {
        let workdir = self.workdir(id);
        let record = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        self.store
            .update(id, |r| {
                r.append_log("Cloning repository", StepStatus::Running);
                Ok(())
            })
            .await?;

        self.fetcher.fetch(&record.source_ref, &workdir).await?;

        self.store
            .update(id, |r| {
                r.correct_last_log(StepStatus::Complete);
                Ok(())
            })
            .await?;

        let artifact_dir = if let Some(project_root) = detect::find_project_root(&workdir) {
            self.store
                .update(id, |r| {
                    r.transition(DeployStatus::Building)?;
                    r.append_log("Building project", StepStatus::Running);
                    Ok(())
                })
                .await?;

            match self
                .executor
                .run(&project_root)
                .await
                .map_err(|e| Error::Build(e.to_string()))?
            {
                BuildOutcome::Completed => {
                    self.store
                        .update(id, |r| {
                            r.correct_last_log(StepStatus::Complete);
                            Ok(())
                        })
                        .await?;
                }
                BuildOutcome::TimedOut => {
                    return Err(Error::BuildTimeout(self.build_timeout_secs));
                }
                BuildOutcome::Failed { .. } => {
                    // stderr was already logged by the executor
                    return Err(Error::Build("build command failed".to_string()));
                }
                BuildOutcome::MissingOutput => {
                    return Err(Error::MissingOutput(format!(
                        "{}/{}",
                        detect::OUTPUT_DIR,
                        detect::ENTRY_DOCUMENT
                    )));
                }
            }

            materialize::materialize_build_output(&workdir, &project_root)?
        } else {
            let target = detect::detect_publish_target(&workdir).ok_or(Error::Detection)?;

            if target.kind == TargetKind::Directory
                && target.relative_path.as_os_str() == detect::OUTPUT_DIR
            {
                // Prebuilt output committed to the repository
                workdir.join(detect::OUTPUT_DIR)
            } else {
                materialize::materialize_static(&workdir)?
            }
        };

        let owner_records = self.store.list_by_owner(owner_id).await;
        let decision = self.gate.evaluate(&owner_records, id, &artifact_dir);

        self.store
            .update(id, |r| {
                r.storage_mb = Some(decision.project_size_mb);
                Ok(())
            })
            .await?;

        if decision.requires_payment {
            self.store
                .update(id, |r| {
                    r.transition(DeployStatus::PaymentRequired)?;
                    r.append_log("Payment required", StepStatus::Blocked);
                    Ok(())
                })
                .await?;
            return Ok(AttemptOutcome::Payment(decision));
        }

        let url = self.site_url(id);
        self.store
            .update(id, |r| {
                r.go_live(url.clone())?;
                r.append_log("Deploying", StepStatus::Complete);
                r.append_log("Cleanup", StepStatus::Complete);
                r.append_log("Post-processing", StepStatus::Complete);
                Ok(())
            })
            .await?;

        Ok(AttemptOutcome::Live(url))
    }

    /// Redeploy an existing record: clear the working directory and log,
    /// re-run the clone, and go straight back to live. The billing gate is
    /// deliberately not re-run — the record keeps its fixed storage slot.
    pub async fn redeploy(&self, id: Uuid) -> RedeployOutcome {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let Some(record) = self.store.get(id).await else {
            return RedeployOutcome::NotAllowed;
        };
        if !record.status.can_transition(DeployStatus::Redeploying) {
            warn!(
                "Redeploy of {} rejected in status {:?}",
                id, record.status
            );
            return RedeployOutcome::NotAllowed;
        }

        info!("Redeploying {}", id);

        let workdir = self.workdir(id);
        if workdir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workdir) {
                error!("Failed to clear working directory for {}: {}", id, e);
                return RedeployOutcome::Failed;
            }
        }

        let started = self
            .store
            .update(id, |r| {
                r.reset_for_redeploy()?;
                r.append_log("Initializing", StepStatus::Complete);
                r.append_log("Cloning repository", StepStatus::Running);
                Ok(())
            })
            .await;
        if let Err(e) = started {
            error!("Failed to reset record for {}: {}", id, e);
            return RedeployOutcome::Failed;
        }

        match self.fetcher.fetch(&record.source_ref, &workdir).await {
            Ok(()) => {
                let url = self.site_url(id);
                let finished = self
                    .store
                    .update(id, |r| {
                        r.correct_last_log(StepStatus::Complete);
                        r.go_live(url.clone())?;
                        r.append_log("Deploying", StepStatus::Complete);
                        r.append_log("Cleanup", StepStatus::Complete);
                        r.append_log("Post-processing", StepStatus::Complete);
                        Ok(())
                    })
                    .await;
                match finished {
                    Ok(_) => RedeployOutcome::Live { url },
                    Err(e) => {
                        error!("Failed to finish redeploy of {}: {}", id, e);
                        RedeployOutcome::Failed
                    }
                }
            }
            Err(e) => {
                self.record_failure(id, &e).await;
                RedeployOutcome::Failed
            }
        }
    }

    /// Remove a record and its on-disk artifacts. Irreversible.
    pub async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let removed = self.store.remove(id).await?;
        if removed {
            let workdir = self.workdir(id);
            if workdir.exists() {
                std::fs::remove_dir_all(&workdir).with_context(|| {
                    format!("Failed to remove artifacts: {}", workdir.display())
                })?;
            }
            info!("Deleted deployment {}", id);
        }
        Ok(removed)
    }

    /// The externally triggered `PaymentRequired -> Live` edge, owned by
    /// the billing collaborator.
    pub async fn verify_payment(&self, id: Uuid) -> anyhow::Result<Option<VerifyOutcome>> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let Some(record) = self.store.get(id).await else {
            return Ok(None);
        };
        if record.status != DeployStatus::PaymentRequired {
            return Ok(Some(VerifyOutcome::WrongState));
        }

        let url = self.site_url(id);
        self.store
            .update(id, |r| {
                r.payment_verified = true;
                if r.log.last().is_some_and(|e| e.step == "Payment required") {
                    r.correct_last_log(StepStatus::Complete);
                }
                r.go_live(url.clone())?;
                r.append_log("Deploying", StepStatus::Complete);
                r.append_log("Payment verified", StepStatus::Complete);
                Ok(())
            })
            .await?;

        info!("Payment verified for {}, now live at {}", id, url);
        Ok(Some(VerifyOutcome::Verified { url }))
    }

    /// Build an existing deployment's tree in place.
    ///
    /// Returns `Ok(false)` when the tree has no manifest to build.
    pub async fn build_existing(&self, id: Uuid) -> anyhow::Result<bool> {
        let lock = self.locks.acquire(id).await;
        let _guard = lock.lock().await;

        let workdir = self.workdir(id);
        let Some(project_root) = detect::find_project_root(&workdir) else {
            return Ok(false);
        };

        match self.executor.run(&project_root).await? {
            BuildOutcome::Completed => {
                materialize::materialize_build_output(&workdir, &project_root)?;
                Ok(true)
            }
            BuildOutcome::TimedOut => anyhow::bail!("build timed out"),
            BuildOutcome::Failed { .. } => anyhow::bail!("build failed"),
            BuildOutcome::MissingOutput => anyhow::bail!("build produced no output"),
        }
    }

    /// Build every deployment in the deployments directory that has a
    /// manifest but no real build output. Run in the background at startup.
    pub async fn sweep_unbuilt(&self) -> usize {
        let entries = match std::fs::read_dir(&self.deploy_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan deployments directory: {}", e);
                return 0;
            }
        };

        let mut built = 0;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(&name) else {
                continue;
            };

            let workdir = entry.path();
            if detect::is_built(&workdir) {
                continue;
            }
            if detect::find_project_root(&workdir).is_none() {
                continue;
            }

            match self.build_existing(id).await {
                Ok(true) => built += 1,
                Ok(false) => {}
                Err(e) => warn!("Startup build of {} failed: {}", id, e),
            }
        }

        if built > 0 {
            info!("Startup sweep built {} deployment(s)", built);
        }
        built
    }

    async fn record_failure(&self, id: Uuid, error: &Error) {
        error!("Deployment {} failed: {}", id, error);

        let step = failure_step(error);
        let result = self
            .store
            .update(id, |r| {
                if r.log.last().is_some_and(|e| e.status == StepStatus::Running) {
                    r.correct_last_log(StepStatus::Failed);
                }
                r.append_log(step, StepStatus::Failed);
                if r.status.can_transition(DeployStatus::Failed) {
                    r.transition(DeployStatus::Failed)?;
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            error!("Failed to record failure for {}: {}", id, e);
        }
    }
}

/// Human-readable log step for a pipeline error. Internal diagnostics stay
/// in the server logs.
fn failure_step(error: &Error) -> &'static str {
    match error {
        Error::Fetch(_) => "Clone failed",
        Error::Detection => "No publishable file",
        Error::Build(_) => "Build failed",
        Error::BuildTimeout(_) => "Build timed out",
        Error::MissingOutput(_) => "dist/index.html not found",
        Error::Materialization(_) => "Copy failed",
        _ => "Deployment failed",
    }
}

/// Display name from the repository URL tail
fn derive_name(source_ref: &str) -> String {
    source_ref
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source_ref)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::LocalDirFetcher;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 5000,
            base_url: "http://localhost:5000".to_string(),
            deploy_dir: dir.join("deployments"),
            store_path: dir.join("records.json"),
            clone_timeout_secs: 30,
            build_timeout_secs: 30,
            project_size_mb: 40,
            free_limit_mb: 200,
        }
    }

    fn test_pipeline(dir: &Path) -> (Pipeline, Arc<RecordStore>) {
        let config = test_config(dir);
        std::fs::create_dir_all(&config.deploy_dir).unwrap();
        let store = Arc::new(RecordStore::open(&config.store_path).unwrap());
        let pipeline = Pipeline::new(&config, store.clone(), Arc::new(LocalDirFetcher));
        (pipeline, store)
    }

    fn static_site_fixture(dir: &Path) -> PathBuf {
        let src = dir.join("fixture");
        std::fs::create_dir_all(src.join("css")).unwrap();
        std::fs::write(src.join("index.html"), "<html><body>hi</body></html>").unwrap();
        std::fs::write(src.join("css/style.css"), "body {}").unwrap();
        src
    }

    #[tokio::test]
    async fn static_deploy_goes_live() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        let (id, outcome) = pipeline
            .deploy("user-1", src.to_str().unwrap(), Some("my-site".to_string()))
            .await;

        let url = match outcome {
            DeployOutcome::Live { url } => url,
            other => panic!("expected Live, got {other:?}"),
        };
        assert_eq!(url, format!("http://localhost:5000/sites/{id}"));

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, DeployStatus::Live);
        assert_eq!(record.servable_url, url);
        assert_eq!(record.storage_mb, Some(40));
        assert_eq!(record.name, "my-site");

        let steps: Vec<&str> = record.log.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(
            steps,
            [
                "Initializing",
                "Cloning repository",
                "Deploying",
                "Cleanup",
                "Post-processing"
            ]
        );
        assert!(record.log.iter().all(|e| e.status == StepStatus::Complete));

        // The tree was materialized into the canonical output directory
        assert!(pipeline.workdir(id).join("dist/index.html").is_file());
        assert!(pipeline.workdir(id).join("dist/css/style.css").is_file());
    }

    #[tokio::test]
    async fn deploy_without_markup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());

        let src = dir.path().join("fixture");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("README.md"), "nothing servable").unwrap();

        let (id, outcome) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        assert!(matches!(outcome, DeployOutcome::Failed));

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, DeployStatus::Failed);
        assert!(record.servable_url.is_empty());
        assert!(record
            .log
            .iter()
            .any(|e| e.step == "No publishable file" && e.status == StepStatus::Failed));
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());

        let (id, outcome) = pipeline
            .deploy("user-1", "/nonexistent/repo", None)
            .await;
        assert!(matches!(outcome, DeployOutcome::Failed));

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, DeployStatus::Failed);
        let steps: Vec<&str> = record.log.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(steps, ["Initializing", "Cloning repository", "Clone failed"]);
        // The running clone step was corrected, not rewritten
        assert_eq!(record.log[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn sixth_deployment_requires_payment() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        for _ in 0..5 {
            let (_, outcome) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
            assert!(matches!(outcome, DeployOutcome::Live { .. }));
        }

        let (id, outcome) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        let decision = match outcome {
            DeployOutcome::PaymentRequired(d) => d,
            other => panic!("expected PaymentRequired, got {other:?}"),
        };
        assert_eq!(decision.current_usage_mb, 200);
        assert_eq!(decision.project_size_mb, 40);

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, DeployStatus::PaymentRequired);
        assert!(record.servable_url.is_empty());
        assert!(record
            .log
            .iter()
            .any(|e| e.step == "Payment required" && e.status == StepStatus::Blocked));

        // A different owner is unaffected
        let (_, outcome) = pipeline.deploy("user-2", src.to_str().unwrap(), None).await;
        assert!(matches!(outcome, DeployOutcome::Live { .. }));
    }

    #[tokio::test]
    async fn payment_verification_flips_to_live() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        for _ in 0..5 {
            pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        }
        let (id, _) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;

        let outcome = pipeline.verify_payment(id).await.unwrap().unwrap();
        let url = match outcome {
            VerifyOutcome::Verified { url } => url,
            other => panic!("expected Verified, got {other:?}"),
        };

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, DeployStatus::Live);
        assert_eq!(record.servable_url, url);
        assert!(record.payment_verified);
        // The blocked entry was corrected in place
        assert!(record
            .log
            .iter()
            .any(|e| e.step == "Payment required" && e.status == StepStatus::Complete));
        assert_eq!(record.log.last().unwrap().step, "Payment verified");

        // Verifying twice is rejected as a wrong-state call
        let again = pipeline.verify_payment(id).await.unwrap().unwrap();
        assert!(matches!(again, VerifyOutcome::WrongState));
    }

    #[tokio::test]
    async fn redeploy_round_trip_preserves_id_and_log_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        let (id, outcome) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        assert!(matches!(outcome, DeployOutcome::Live { .. }));
        let fresh_steps: Vec<String> = store
            .get(id)
            .await
            .unwrap()
            .log
            .iter()
            .map(|e| e.step.clone())
            .collect();

        let outcome = pipeline.redeploy(id).await;
        let url = match outcome {
            RedeployOutcome::Live { url } => url,
            other => panic!("expected Live, got {other:?}"),
        };

        let record = store.get(id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.status, DeployStatus::Live);
        assert_eq!(record.servable_url, url);

        let redeploy_steps: Vec<String> =
            record.log.iter().map(|e| e.step.clone()).collect();
        assert_eq!(redeploy_steps, fresh_steps);
    }

    #[tokio::test]
    async fn redeploy_is_rejected_mid_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        for _ in 0..5 {
            pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        }
        let (id, _) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        assert_eq!(
            store.get(id).await.unwrap().status,
            DeployStatus::PaymentRequired
        );

        let outcome = pipeline.redeploy(id).await;
        assert!(matches!(outcome, RedeployOutcome::NotAllowed));
    }

    #[tokio::test]
    async fn delete_removes_record_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = test_pipeline(dir.path());
        let src = static_site_fixture(dir.path());

        let (id, _) = pipeline.deploy("user-1", src.to_str().unwrap(), None).await;
        assert!(pipeline.workdir(id).is_dir());

        assert!(pipeline.delete(id).await.unwrap());
        assert!(store.get(id).await.is_none());
        assert!(!pipeline.workdir(id).exists());

        assert!(!pipeline.delete(id).await.unwrap());
    }

    #[test]
    fn name_derivation_takes_the_url_tail() {
        assert_eq!(derive_name("https://github.com/acme/my-site"), "my-site");
        assert_eq!(derive_name("https://github.com/acme/my-site/"), "my-site");
    }
}
