//! Billing gate
//!
//! Decides whether publishing one more deployment would exceed the owner's
//! free-tier storage ceiling. Accounting is count-based: every live
//! deployment charges the same fixed size. That approximation is a product
//! decision, kept behind [`SizeAccounting`] so a byte-measuring
//! implementation can replace it without touching the state machine.

use berth_common::{BillingDecision, DeployStatus, DeploymentRecord};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How much storage a deployment artifact is charged for
pub trait SizeAccounting: Send + Sync {
    fn project_size_mb(&self, artifact_dir: &Path) -> u64;
}

/// Charges the fixed per-deployment size regardless of actual bytes
pub struct FixedSizeAccounting {
    pub size_mb: u64,
}

impl SizeAccounting for FixedSizeAccounting {
    fn project_size_mb(&self, _artifact_dir: &Path) -> u64 {
        self.size_mb
    }
}

/// Stateless quota gate
pub struct BillingGate {
    free_limit_mb: u64,
    accounting: Arc<dyn SizeAccounting>,
}

impl BillingGate {
    pub fn new(free_limit_mb: u64, accounting: Arc<dyn SizeAccounting>) -> Self {
        Self {
            free_limit_mb,
            accounting,
        }
    }

    pub fn free_limit_mb(&self) -> u64 {
        self.free_limit_mb
    }

    /// Evaluate the gate for one deploy attempt.
    ///
    /// `owner_records` is the owner's full record set; only `Live` records
    /// other than the candidate count toward current usage.
    pub fn evaluate(
        &self,
        owner_records: &[DeploymentRecord],
        candidate_id: Uuid,
        artifact_dir: &Path,
    ) -> BillingDecision {
        let project_size_mb = self.accounting.project_size_mb(artifact_dir);

        let live_count = owner_records
            .iter()
            .filter(|r| r.status == DeployStatus::Live && r.id != candidate_id)
            .count() as u64;

        let current_usage_mb = live_count * project_size_mb;

        // Payment is due when the owner is already at the ceiling, or when
        // this deployment would push them past it.
        let requires_payment = current_usage_mb >= self.free_limit_mb
            || current_usage_mb + project_size_mb > self.free_limit_mb;

        debug!(
            "Billing check: live={} current={}MB project={}MB limit={}MB requires_payment={}",
            live_count, current_usage_mb, project_size_mb, self.free_limit_mb, requires_payment
        );

        BillingDecision {
            requires_payment,
            current_usage_mb,
            project_size_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_common::DeploymentRecord;

    fn gate() -> BillingGate {
        BillingGate::new(200, Arc::new(FixedSizeAccounting { size_mb: 40 }))
    }

    fn live_records(owner: &str, n: usize) -> Vec<DeploymentRecord> {
        (0..n)
            .map(|i| {
                let mut r = DeploymentRecord::new(
                    Uuid::new_v4(),
                    owner.to_string(),
                    format!("site-{i}"),
                    "https://github.com/acme/site".to_string(),
                );
                r.transition(DeployStatus::Building).unwrap();
                r.go_live(format!("http://localhost:5000/sites/{}", r.id))
                    .unwrap();
                r
            })
            .collect()
    }

    #[test]
    fn fifth_deployment_exactly_fills_the_free_tier() {
        let records = live_records("user-1", 4);
        let decision = gate().evaluate(&records, Uuid::new_v4(), Path::new("/tmp/x"));

        assert_eq!(decision.current_usage_mb, 160);
        assert_eq!(decision.project_size_mb, 40);
        // 160 + 40 == 200, not over the ceiling
        assert!(!decision.requires_payment);
    }

    #[test]
    fn sixth_deployment_is_blocked() {
        let records = live_records("user-1", 5);
        let decision = gate().evaluate(&records, Uuid::new_v4(), Path::new("/tmp/x"));

        assert_eq!(decision.current_usage_mb, 200);
        assert!(decision.requires_payment);
    }

    #[test]
    fn first_deployment_is_free() {
        let decision = gate().evaluate(&[], Uuid::new_v4(), Path::new("/tmp/x"));
        assert_eq!(decision.current_usage_mb, 0);
        assert!(!decision.requires_payment);
    }

    #[test]
    fn candidate_record_does_not_count_toward_usage() {
        let records = live_records("user-1", 5);
        let candidate = records[0].id;
        // Re-evaluating the candidate itself: only the other four count.
        let decision = gate().evaluate(&records, candidate, Path::new("/tmp/x"));
        assert_eq!(decision.current_usage_mb, 160);
        assert!(!decision.requires_payment);
    }

    #[test]
    fn non_live_records_do_not_count() {
        let mut records = live_records("user-1", 2);
        records.push(DeploymentRecord::new(
            Uuid::new_v4(),
            "user-1".to_string(),
            "pending".to_string(),
            "https://github.com/acme/pending".to_string(),
        ));

        let decision = gate().evaluate(&records, Uuid::new_v4(), Path::new("/tmp/x"));
        assert_eq!(decision.current_usage_mb, 80);
    }
}
