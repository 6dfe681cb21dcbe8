//! Per-document results of an import run

use serde::{Deserialize, Serialize};

/// What happened to a document that went through successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessAction {
    Created,
    Updated,
    /// Target already matched the source; nothing written
    Unchanged,
}

impl SuccessAction {
    pub fn label(&self) -> &'static str {
        match self {
            SuccessAction::Created => "created",
            SuccessAction::Updated => "updated",
            SuccessAction::Unchanged => "unchanged",
        }
    }
}

/// Failure taxonomy for rows and groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    AuthFailure,
    Unreachable,
    CoercionError,
    UnresolvedReference,
    Ambiguous,
    NotMutable,
    SemanticRejection,
    DuplicateInBatch,
    TransientFailure,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::AuthFailure => "AuthFailure",
            FailureKind::Unreachable => "Unreachable",
            FailureKind::CoercionError => "CoercionError",
            FailureKind::UnresolvedReference => "UnresolvedReference",
            FailureKind::Ambiguous => "Ambiguous",
            FailureKind::NotMutable => "NotMutable",
            FailureKind::SemanticRejection => "SemanticRejection",
            FailureKind::DuplicateInBatch => "DuplicateInBatch",
            FailureKind::TransientFailure => "TransientFailure",
        }
    }

    /// Kinds reported as skipped rather than failed
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            FailureKind::Ambiguous | FailureKind::NotMutable | FailureKind::DuplicateInBatch
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of processing one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success {
        action: SuccessAction,
        /// Remote identifier; absent for creations planned in a dry run
        record_id: Option<i64>,
    },
    Failure { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn success(action: SuccessAction, record_id: Option<i64>) -> Self {
        Outcome::Success { action, record_id }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }
}

/// An outcome tied back to its source rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub group: usize,
    /// Source lines of the group's rows
    pub lines: Vec<usize>,
    pub label: String,
    pub outcome: Outcome,
}

/// Cumulative counters, persisted with each checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Counters {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success { action, .. } => match action {
                SuccessAction::Created => self.created += 1,
                SuccessAction::Updated => self.updated += 1,
                SuccessAction::Unchanged => self.unchanged += 1,
            },
            Outcome::Failure { kind, .. } if kind.is_skip() => self.skipped += 1,
            Outcome::Failure { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.skipped + self.failed
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut counters = Counters::default();
        counters.record(&Outcome::success(SuccessAction::Created, Some(1)));
        counters.record(&Outcome::success(SuccessAction::Unchanged, Some(2)));
        counters.record(&Outcome::failure(FailureKind::NotMutable, "posted"));
        counters.record(&Outcome::failure(FailureKind::CoercionError, "bad date"));

        assert_eq!(counters.created, 1);
        assert_eq!(counters.unchanged, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.total(), 4);
        assert_eq!(counters.succeeded(), 2);
    }
}
