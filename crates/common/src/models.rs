//! Shared data model for deployments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Deployment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    /// Initial state: fetching the source repository
    Cloning,
    /// A project manifest was found and the build step is running
    Building,
    /// The quota gate blocked publication; waits for external payment verification
    PaymentRequired,
    /// Servable; `servable_url` is set
    Live,
    /// Terminal for this attempt; retry is a user-initiated redeploy
    Failed,
    /// Re-entrant cycle on an existing record
    Redeploying,
}

impl DeployStatus {
    /// Whether `self -> to` is an edge of the status graph.
    ///
    /// `PaymentRequired -> Live` is the externally triggered edge owned by
    /// the payment-verification callback; every other edge is driven by the
    /// deployment pipeline.
    pub fn can_transition(self, to: DeployStatus) -> bool {
        use DeployStatus::*;
        matches!(
            (self, to),
            (Cloning, Building)
                | (Cloning, PaymentRequired)
                | (Cloning, Live)
                | (Cloning, Failed)
                | (Building, PaymentRequired)
                | (Building, Live)
                | (Building, Failed)
                | (PaymentRequired, Live)
                | (Live, Redeploying)
                | (Failed, Redeploying)
                | (Redeploying, Live)
                | (Redeploying, Failed)
        )
    }
}

/// Status of a single pipeline step in the deployment log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Complete,
    Failed,
    Blocked,
}

/// One entry in a deployment's ordered log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Human-readable step name, e.g. "Cloning repository"
    pub step: String,

    /// Step outcome; `Running` entries are corrected in place on completion
    pub status: StepStatus,

    /// When the entry was appended
    pub time: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(step: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step: step.into(),
            status,
            time: Utc::now(),
        }
    }
}

/// A deployment record, one per deployment attempt across its whole
/// lifecycle including redeploys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique deployment identifier
    pub id: Uuid,

    /// Identifier of the requesting user
    pub owner_id: String,

    /// Display name, from the request or the repository URL tail
    pub name: String,

    /// Repository URL the deployment is built from
    pub source_ref: String,

    /// Current lifecycle status
    pub status: DeployStatus,

    /// Public URL; non-empty iff `status == Live`
    pub servable_url: String,

    /// Ordered, append-only pipeline log
    pub log: Vec<LogEntry>,

    /// Fixed accounting size, assigned when the deployment first reaches
    /// a billable state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_mb: Option<u64>,

    /// Set by the payment-verification callback
    #[serde(default)]
    pub payment_verified: bool,

    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a new record in the `Cloning` state
    pub fn new(id: Uuid, owner_id: String, name: String, source_ref: String) -> Self {
        Self {
            id,
            owner_id,
            name,
            source_ref,
            status: DeployStatus::Cloning,
            servable_url: String::new(),
            log: Vec::new(),
            storage_mb: None,
            payment_verified: false,
            created_at: Utc::now(),
        }
    }

    /// Move to `to`, rejecting edges not in the transition table.
    ///
    /// Leaving `Live` clears `servable_url` so the url stays non-empty
    /// exactly while the record is live.
    pub fn transition(&mut self, to: DeployStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{to:?}"),
            });
        }
        self.status = to;
        if to != DeployStatus::Live {
            self.servable_url.clear();
        }
        Ok(())
    }

    /// Transition to `Live` and set the servable URL
    pub fn go_live(&mut self, url: String) -> Result<()> {
        self.transition(DeployStatus::Live)?;
        self.servable_url = url;
        Ok(())
    }

    /// Append a log entry
    pub fn append_log(&mut self, step: impl Into<String>, status: StepStatus) {
        self.log.push(LogEntry::new(step, status));
    }

    /// Correct the status of the most recently appended entry in place.
    /// This is the only permitted mutation of an existing entry.
    pub fn correct_last_log(&mut self, status: StepStatus) {
        if let Some(last) = self.log.last_mut() {
            last.status = status;
        }
    }

    /// Reset for a redeploy: clear the log and enter `Redeploying`.
    /// The id, owner, name and source reference are preserved.
    pub fn reset_for_redeploy(&mut self) -> Result<()> {
        self.transition(DeployStatus::Redeploying)?;
        self.log.clear();
        Ok(())
    }
}

/// What the publish-target detector decided to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub kind: TargetKind,

    /// Path relative to the deployment's working directory
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    SingleFile,
    Directory,
}

/// Outcome of the quota gate for one deploy attempt
#[derive(Debug, Clone, Copy)]
pub struct BillingDecision {
    pub requires_payment: bool,
    pub current_usage_mb: u64,
    pub project_size_mb: u64,
}
