//! Reconciler step state machine
//!
//! Steps run in a fixed order ending in [`ReconcileStep::Converged`]. A step
//! may also transition to itself, which is how a retry is recorded.

use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of schema reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStep {
    /// Create schemas and restore bulk snapshots into empty ones
    ImportBaseline,
    /// Copy tenants missing from the canonical registry
    MigrateTenantRegistry,
    /// Upsert one routing row per tenant per managed table
    RegenerateRoutingRows,
    /// Convert tables whose collation differs from the schema default
    NormalizeCollation,
    /// Re-run failed migration ledger entries
    ReconcileMigrationLedger,
    /// Terminal
    Converged,
}

impl ReconcileStep {
    /// Steps in execution order
    pub const ORDER: [ReconcileStep; 6] = [
        Self::ImportBaseline,
        Self::MigrateTenantRegistry,
        Self::RegenerateRoutingRows,
        Self::NormalizeCollation,
        Self::ReconcileMigrationLedger,
        Self::Converged,
    ];

    /// Following step; `Converged` is its own successor
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::ImportBaseline => Self::MigrateTenantRegistry,
            Self::MigrateTenantRegistry => Self::RegenerateRoutingRows,
            Self::RegenerateRoutingRows => Self::NormalizeCollation,
            Self::NormalizeCollation => Self::ReconcileMigrationLedger,
            Self::ReconcileMigrationLedger | Self::Converged => Self::Converged,
        }
    }

    /// Kebab-case name used in logs and errors
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ImportBaseline => "import-baseline",
            Self::MigrateTenantRegistry => "migrate-tenant-registry",
            Self::RegenerateRoutingRows => "regenerate-routing-rows",
            Self::NormalizeCollation => "normalize-collation",
            Self::ReconcileMigrationLedger => "reconcile-migration-ledger",
            Self::Converged => "converged",
        }
    }
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Steps reachable from `from`
#[must_use]
pub fn allowed_transitions(from: ReconcileStep) -> Vec<ReconcileStep> {
    match from {
        ReconcileStep::Converged => vec![],
        step => vec![step, step.next()],
    }
}

/// Check a step transition
///
/// # Errors
/// [`ReconcileError::InvalidTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: ReconcileStep, to: ReconcileStep) -> Result<(), ReconcileError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ReconcileError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_follows_next() {
        for pair in ReconcileStep::ORDER.windows(2) {
            assert_eq!(pair[0].next(), pair[1]);
            assert!(validate_transition(pair[0], pair[1]).is_ok());
        }
    }

    #[test]
    fn retry_is_a_self_transition() {
        assert!(validate_transition(ReconcileStep::NormalizeCollation, ReconcileStep::NormalizeCollation).is_ok());
    }

    #[test]
    fn steps_cannot_be_skipped() {
        assert!(validate_transition(ReconcileStep::ImportBaseline, ReconcileStep::NormalizeCollation).is_err());
        assert!(validate_transition(ReconcileStep::ReconcileMigrationLedger, ReconcileStep::ImportBaseline).is_err());
    }

    #[test]
    fn converged_is_terminal() {
        assert!(allowed_transitions(ReconcileStep::Converged).is_empty());
    }
}
