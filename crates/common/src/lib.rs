pub mod error;
pub mod models;

pub use error::{Error, Result};
pub use models::{
    BillingDecision, DeployStatus, DeploymentRecord, LogEntry, PublishTarget, StepStatus,
    TargetKind,
};
