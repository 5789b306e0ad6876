//! Deployment record store
//!
//! All records live in one JSON document on disk. Every mutation runs as a
//! load-mutate-persist cycle behind a single async mutex, so concurrent
//! writers cannot lose each other's updates; the document is written back
//! before the lock is released.

use anyhow::{Context, Result};
use berth_common::DeploymentRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// On-disk document shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    deployments: Vec<DeploymentRecord>,
}

struct StoreInner {
    path: PathBuf,
    doc: StoreDocument,
}

impl StoreInner {
    fn persist(&self) -> Result<()> {
        let json =
            serde_json::to_string_pretty(&self.doc).context("Failed to serialize record store")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write record store: {}", self.path.display()))?;
        Ok(())
    }
}

/// Single-writer store for deployment records
pub struct RecordStore {
    inner: Mutex<StoreInner>,
}

impl RecordStore {
    /// Open a store backed by `path`, loading the existing document if there
    /// is one. A missing or empty file starts an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => StoreDocument::default(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse record store: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read record store: {}", path.display())
                })
            }
        };

        info!(
            "Opened record store at {} ({} records)",
            path.display(),
            doc.deployments.len()
        );

        Ok(Self {
            inner: Mutex::new(StoreInner { path, doc }),
        })
    }

    /// Insert a new record
    pub async fn insert(&self, record: DeploymentRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        debug!("Inserting record: {}", record.id);
        inner.doc.deployments.push(record);
        inner.persist()
    }

    /// Get a record by id
    pub async fn get(&self, id: Uuid) -> Option<DeploymentRecord> {
        let inner = self.inner.lock().await;
        inner.doc.deployments.iter().find(|r| r.id == id).cloned()
    }

    /// All records, in insertion order
    pub async fn list_all(&self) -> Vec<DeploymentRecord> {
        let inner = self.inner.lock().await;
        inner.doc.deployments.clone()
    }

    /// All records owned by `owner_id`
    pub async fn list_by_owner(&self, owner_id: &str) -> Vec<DeploymentRecord> {
        let inner = self.inner.lock().await;
        inner
            .doc
            .deployments
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Apply `f` to the record with `id` and persist the document.
    ///
    /// Returns `Ok(false)` if no such record exists. If `f` fails, nothing
    /// is persisted and the error propagates.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Result<bool>
    where
        F: FnOnce(&mut DeploymentRecord) -> Result<()>,
    {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.doc.deployments.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        f(record)?;
        inner.persist()?;
        Ok(true)
    }

    /// Remove a record. Returns whether a record was removed.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.doc.deployments.len();
        inner.doc.deployments.retain(|r| r.id != id);
        if inner.doc.deployments.len() == before {
            return Ok(false);
        }
        inner.persist()?;
        debug!("Removed record: {}", id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_common::{DeployStatus, StepStatus};

    fn record(owner: &str) -> DeploymentRecord {
        DeploymentRecord::new(
            Uuid::new_v4(),
            owner.to_string(),
            "site".to_string(),
            "https://github.com/acme/site".to_string(),
        )
    }

    #[tokio::test]
    async fn insert_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("records.json")).unwrap();

        let a = record("user-1");
        let b = record("user-2");
        let a_id = a.id;

        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        assert_eq!(store.list_all().await.len(), 2);
        assert_eq!(store.list_by_owner("user-1").await.len(), 1);
        assert_eq!(store.get(a_id).await.unwrap().owner_id, "user-1");
        assert!(store.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let rec = record("user-1");
        let id = rec.id;
        {
            let store = RecordStore::open(&path).unwrap();
            store.insert(rec).await.unwrap();
            let found = store
                .update(id, |r| {
                    r.append_log("Initializing", StepStatus::Complete);
                    r.transition(DeployStatus::Building)?;
                    Ok(())
                })
                .await
                .unwrap();
            assert!(found);
        }

        // Reopen from disk
        let store = RecordStore::open(&path).unwrap();
        let rec = store.get(id).await.unwrap();
        assert_eq!(rec.status, DeployStatus::Building);
        assert_eq!(rec.log.len(), 1);
    }

    #[tokio::test]
    async fn update_missing_record_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("records.json")).unwrap();

        let found = store.update(Uuid::new_v4(), |_| Ok(())).await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn failed_update_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let store = RecordStore::open(&path).unwrap();

        let rec = record("user-1");
        let id = rec.id;
        store.insert(rec).await.unwrap();

        // Cloning -> Redeploying is not a legal edge
        let result = store
            .update(id, |r| {
                r.transition(DeployStatus::Redeploying)?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        let reloaded = RecordStore::open(&path).unwrap();
        assert_eq!(
            reloaded.get(id).await.unwrap().status,
            DeployStatus::Cloning
        );
    }

    #[tokio::test]
    async fn remove_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("records.json")).unwrap();

        let rec = record("user-1");
        let id = rec.id;
        store.insert(rec).await.unwrap();

        assert!(store.remove(id).await.unwrap());
        assert!(!store.remove(id).await.unwrap());
        assert!(store.get(id).await.is_none());
    }
}
