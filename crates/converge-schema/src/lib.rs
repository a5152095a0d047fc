//! # Converge Schema
//!
//! Brings the tenant database to a converged state: schemas exist and hold
//! their baseline data, every tenant is in the canonical registry and has
//! exactly one routing row per managed routing table, table collations
//! match their schema defaults, and no migration ledger entry is marked
//! failed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌────────────────┐
//! │  Reconciler  │──▶│  SchemaCatalog    │◀──│  MySqlCatalog  │
//! │  (steps)     │   │  (trait)          │   │  (sqlx pool)   │
//! └──────┬───────┘   └───────────────────┘   └────────────────┘
//!        │
//!        ├──▶ BaselineImport  (mysql client restore)
//!        └──▶ ScriptLocator   (failed ledger scripts)
//! ```
//!
//! ## Ledger policy
//!
//! A failed ledger entry blocks every later application start. Under
//! [`LedgerPolicy::Unblock`] an entry whose script cannot be re-applied is
//! marked successful anyway and reported as a [`LedgerRepairWarning`];
//! [`LedgerPolicy::FailFast`] stops instead.

pub mod baseline;
pub mod catalog;
pub mod error;
pub mod ledger;
pub mod mysql;
pub mod reconciler;
pub mod step;

pub use baseline::{BaselineImport, BaselineSnapshot, MysqlClientImport};
pub use catalog::{
    MigrationLedgerEntry, RoutingMode, RoutingTable, SchemaCatalog, SchemaCollation,
    SchemaRoutingRow, TableCollation, TableRef, TenantRecord, TenantTable, UpsertOutcome,
};
pub use error::{CatalogError, CatalogResult, ReconcileError};
pub use ledger::{LedgerPolicy, LedgerRepairWarning, ScriptLocator};
pub use mysql::{MySqlCatalog, MySqlSettings};
pub use reconciler::{
    BaselineSummary, LedgerSummary, ReconcilePlan, ReconcileReport, Reconciler, RoutingSummary,
    TenantMigration,
};
pub use step::ReconcileStep;

/// Re-exports of commonly used types
pub mod prelude {
    pub use crate::catalog::{SchemaCatalog, TableRef, TenantRecord};
    pub use crate::error::{CatalogError, ReconcileError};
    pub use crate::ledger::{LedgerPolicy, LedgerRepairWarning};
    pub use crate::reconciler::{ReconcilePlan, ReconcileReport, Reconciler};
    pub use crate::step::ReconcileStep;
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
