use thiserror::Error;

use crate::types::{ConsultantId, LeadId};

#[derive(Debug, Error)]
pub enum LeadflowError {
    #[error("not initialized: no .leadflow/config.yaml under the project root")]
    NotInitialized,

    #[error("weight table has no consultant with a positive weight")]
    EmptyWeightTable,

    #[error("no consultants available to receive leads")]
    NoConsultantsAvailable,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("rollback for unrecognized consultant {0}")]
    InvalidRollback(ConsultantId),

    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),

    #[error("invalid cycle key '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidCycleKey(String),

    #[error("invalid lead status: {0}")]
    InvalidStatus(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LeadflowError {
    /// Whether the caller may reasonably retry the same request later.
    ///
    /// Only infrastructure faults qualify. Capacity outcomes such as
    /// `NoConsultantsAvailable` are final for the current request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Io(_))
    }
}

/// Map any store-layer failure into `StoreUnavailable`.
pub(crate) fn unavailable(e: impl std::fmt::Display) -> LeadflowError {
    LeadflowError::StoreUnavailable(e.to_string())
}

pub type Result<T> = std::result::Result<T, LeadflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_faults_are_transient() {
        assert!(LeadflowError::StoreUnavailable("disk full".into()).is_transient());
        assert!(!LeadflowError::NoConsultantsAvailable.is_transient());
        assert!(!LeadflowError::EmptyWeightTable.is_transient());
        assert!(!LeadflowError::InvalidRollback(ConsultantId(7)).is_transient());
    }

    #[test]
    fn messages_name_the_subject() {
        let msg = LeadflowError::InvalidRollback(ConsultantId(35)).to_string();
        assert!(msg.contains("35"), "message: {msg}");
    }
}
