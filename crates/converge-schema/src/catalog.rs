//! Catalog abstraction over the tenant database
//!
//! The reconciler reads all of its state through [`SchemaCatalog`], never
//! from side files, so a crashed run can be resumed by simply running again.

use crate::error::{CatalogError, CatalogResult};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default character set for new schemas
pub const DEFAULT_CHARSET: &str = "utf8mb4";

/// Default collation for new schemas
pub const DEFAULT_COLLATION: &str = "utf8mb4_general_ci";

/// `schema.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema (database) name
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableRef {
    /// Create from parts
    #[must_use]
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`
    ///
    /// # Errors
    /// [`CatalogError::InvalidIdentifier`] when either part is missing or not a plain identifier.
    pub fn parse(text: &str) -> CatalogResult<Self> {
        let (schema, table) = text
            .split_once('.')
            .ok_or_else(|| CatalogError::InvalidIdentifier(text.to_string()))?;
        validate_identifier(schema)?;
        validate_identifier(table)?;
        Ok(Self::new(schema, table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Reject anything that is not a plain identifier before it is spliced into DDL
///
/// # Errors
/// [`CatalogError::InvalidIdentifier`] for empty names or names with characters
/// outside `[A-Za-z0-9_$]`.
pub fn validate_identifier(name: &str) -> CatalogResult<&str> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(name)
    } else {
        Err(CatalogError::InvalidIdentifier(name.to_string()))
    }
}

/// One tenant (enterprise)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Unique tenant id
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Schema holding the tenant's data, when the registry records it
    pub schema: Option<String>,
}

impl TenantRecord {
    /// Tenant with only an id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            schema: None,
        }
    }

    /// Set the schema holding this tenant's data
    #[must_use]
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the display name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Tenant table and the columns read from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTable {
    /// Table location
    pub table: TableRef,
    /// Tenant id column
    pub id_column: String,
    /// Display name column
    pub name_column: Option<String>,
    /// Schema column
    pub schema_column: Option<String>,
}

/// Tenant → physical schema mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaRoutingRow {
    /// Tenant id
    pub tenant_id: String,
    /// Physical schema name
    pub schema: String,
}

impl SchemaRoutingRow {
    /// Create a row
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            schema: schema.into(),
        }
    }
}

/// How a routing table assigns schemas
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMode {
    /// Every row references one schema; this is the table the runtime consults first
    Canonical {
        /// Canonical physical schema
        schema: String,
    },
    /// Each tenant references the schema holding its data
    PerTenant {
        /// Used when a tenant record has no schema
        default_schema: String,
    },
}

/// One managed routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    /// Table location
    pub table: TableRef,
    /// Tenant id column
    pub tenant_column: String,
    /// Schema name column
    pub schema_column: String,
    /// Routing semantics
    pub mode: RoutingMode,
}

impl RoutingTable {
    /// Schema this table should route `tenant` to
    #[must_use]
    pub fn schema_for<'a>(&'a self, tenant: &'a TenantRecord) -> &'a str {
        match &self.mode {
            RoutingMode::Canonical { schema } => schema,
            RoutingMode::PerTenant { default_schema } => {
                tenant.schema.as_deref().unwrap_or(default_schema)
            }
        }
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Row did not exist
    Inserted,
    /// Row existed with a different schema, or duplicates were collapsed
    Updated,
    /// Row already matched
    Unchanged,
}

/// Default character set and collation of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCollation {
    /// Character set
    pub charset: String,
    /// Collation
    pub collation: String,
}

impl Default for SchemaCollation {
    fn default() -> Self {
        Self {
            charset: DEFAULT_CHARSET.to_string(),
            collation: DEFAULT_COLLATION.to_string(),
        }
    }
}

/// Base table whose collation differs from its schema default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCollation {
    /// Table name
    pub table: String,
    /// Current collation
    pub collation: String,
}

/// One row of a migration ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLedgerEntry {
    /// Ordering key
    pub installed_rank: i64,
    /// Version label; `None` for repeatable migrations
    pub version: Option<String>,
    /// Description
    pub description: String,
    /// Script identifier
    pub script: String,
    /// Whether the migration applied successfully
    pub success: bool,
    /// Installation time
    pub installed_on: Option<NaiveDateTime>,
}

/// Database operations the reconciler needs
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Check connectivity
    async fn ping(&self) -> CatalogResult<()>;

    /// Create the schema if it does not exist; returns whether it was created
    async fn ensure_schema(&self, schema: &str, collation: &SchemaCollation) -> CatalogResult<bool>;

    /// Number of base tables in a schema
    async fn table_count(&self, schema: &str) -> CatalogResult<u64>;

    /// All tenants in a tenant table
    async fn tenants(&self, table: &TenantTable) -> CatalogResult<Vec<TenantRecord>>;

    /// Copy the source row for `tenant_id` unless the target already has that id;
    /// returns whether a row was inserted
    async fn copy_tenant_if_absent(
        &self,
        source: &TenantTable,
        target: &TenantTable,
        tenant_id: &str,
    ) -> CatalogResult<bool>;

    /// All rows of a routing table
    async fn routing_rows(&self, table: &RoutingTable) -> CatalogResult<Vec<SchemaRoutingRow>>;

    /// Leave exactly one row for the tenant, pointing at `row.schema`
    async fn upsert_routing_row(
        &self,
        table: &RoutingTable,
        row: &SchemaRoutingRow,
    ) -> CatalogResult<UpsertOutcome>;

    /// Point every row that references another schema at `schema`; returns rows changed
    async fn repoint_routing_rows(&self, table: &RoutingTable, schema: &str) -> CatalogResult<u64>;

    /// Default character set and collation of a schema
    async fn default_collation(&self, schema: &str) -> CatalogResult<SchemaCollation>;

    /// Base tables whose collation differs from the schema default
    async fn tables_with_foreign_collation(&self, schema: &str) -> CatalogResult<Vec<TableCollation>>;

    /// Convert one table to the given character set and collation
    async fn convert_table_collation(
        &self,
        schema: &str,
        table: &str,
        target: &SchemaCollation,
    ) -> CatalogResult<()>;

    /// Ledger entries ordered by installed rank
    async fn ledger_entries(&self, ledger: &TableRef) -> CatalogResult<Vec<MigrationLedgerEntry>>;

    /// Set `success = true` for one entry
    async fn mark_ledger_success(&self, ledger: &TableRef, installed_rank: i64) -> CatalogResult<()>;

    /// Execute a migration script against a schema
    async fn execute_script(&self, schema: &str, sql: &str) -> CatalogResult<()>;
}
