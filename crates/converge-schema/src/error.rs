//! Error types for schema reconciliation

use crate::step::ReconcileStep;

/// Errors from a [`crate::SchemaCatalog`] implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    /// Could not connect or the connection dropped
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// A statement failed
    #[error("query failed ({context}): {message}")]
    Query { context: String, message: String },

    /// Schema, table or column name is not a plain identifier
    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    /// A migration script failed to execute
    #[error("script execution failed: {0}")]
    Script(String),

    /// A routing row cannot be inserted because the table has other required columns
    #[error("cannot insert into {table}: columns {} are NOT NULL without a default", .columns.join(", "))]
    UnsupportedTable { table: String, columns: Vec<String> },
}

impl CatalogError {
    /// Create query error with context
    pub fn query(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Query {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Query { .. })
    }
}

/// Result alias for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors surfaced by the reconciler
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A step failed on its first attempt and on its retry
    #[error("{step} failed after retry: {source}")]
    Step {
        step: ReconcileStep,
        #[source]
        source: CatalogError,
    },

    /// Failed ledger entry could not be repaired under the fail-fast policy
    #[error("ledger entry {script} (rank {installed_rank}) in {ledger} could not be repaired: {reason}")]
    LedgerRepair {
        ledger: String,
        installed_rank: i64,
        script: String,
        reason: String,
    },

    /// Baseline snapshot import failed
    #[error("baseline import into {schema} failed: {message}")]
    Baseline { schema: String, message: String },

    /// Reconciler attempted an undefined step transition
    #[error("invalid step transition: {from} -> {to}")]
    InvalidTransition {
        from: ReconcileStep,
        to: ReconcileStep,
    },
}

impl ReconcileError {
    /// Step the error was raised in
    #[must_use]
    pub fn step(&self) -> ReconcileStep {
        match self {
            Self::Step { step, .. } => *step,
            Self::LedgerRepair { .. } => ReconcileStep::ReconcileMigrationLedger,
            Self::Baseline { .. } => ReconcileStep::ImportBaseline,
            Self::InvalidTransition { from, .. } => *from,
        }
    }
}
