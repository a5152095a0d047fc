//! Schema and migration reconciler
//!
//! Drives the catalog through [`ReconcileStep`] order until `Converged`.
//! Every step reads current state from the catalog and only issues the
//! writes still needed, so a run interrupted half-way is finished by running
//! again. Catalog failures are retried once before the step fails.
//!
//! # Example
//!
//! ```rust,ignore
//! let catalog = Arc::new(MySqlCatalog::connect_lazy(&settings));
//! let report = Reconciler::new(catalog, plan)
//!     .with_scripts(ScriptLocator::new(dirs))
//!     .run()
//!     .await?;
//! for warning in &report.warnings {
//!     eprintln!("{warning}");
//! }
//! ```

use crate::baseline::{BaselineImport, BaselineSnapshot};
use crate::catalog::{
    RoutingMode, RoutingTable, SchemaCatalog, SchemaCollation, SchemaRoutingRow, TableRef,
    TenantTable, UpsertOutcome,
};
use crate::error::{CatalogResult, ReconcileError};
use crate::ledger::{LedgerPolicy, LedgerRepairWarning, ScriptLocator};
use crate::step::{validate_transition, ReconcileStep};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default pause before retrying a failed catalog call
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Legacy tenant table copied into the canonical one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMigration {
    /// Legacy or staging table
    pub source: TenantTable,
    /// Canonical table; routing rows are generated from it
    pub target: TenantTable,
}

/// What the reconciler manages
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Schemas that must exist; collation is normalized in each
    pub schemas: Vec<String>,
    /// Character set and collation for created schemas
    pub collation: SchemaCollation,
    /// Snapshots restored into empty schemas
    pub baselines: Vec<BaselineSnapshot>,
    /// Tenant registry migration
    pub tenant_registry: Option<TenantMigration>,
    /// Managed routing tables
    pub routing_tables: Vec<RoutingTable>,
    /// Migration ledgers
    pub ledgers: Vec<TableRef>,
    /// Failed ledger entry handling
    pub ledger_policy: LedgerPolicy,
}

impl ReconcilePlan {
    fn managed_schemas(&self) -> Vec<&str> {
        let mut schemas: Vec<&str> = self.schemas.iter().map(String::as_str).collect();
        for snapshot in &self.baselines {
            if !schemas.contains(&snapshot.schema.as_str()) {
                schemas.push(&snapshot.schema);
            }
        }
        schemas
    }
}

/// Schemas created and snapshots restored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BaselineSummary {
    /// Schemas that did not exist
    pub created: Vec<String>,
    /// Schemas restored from a snapshot
    pub imported: Vec<String>,
}

/// Routing row changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoutingSummary {
    /// Rows added for uncovered tenants
    pub inserted: u64,
    /// Rows pointed at a different schema, or collapsed duplicates
    pub updated: u64,
    /// Rows outside the registry re-pointed at a canonical schema
    pub repointed: u64,
}

impl RoutingSummary {
    /// Total rows written
    #[must_use]
    pub fn changes(&self) -> u64 {
        self.inserted + self.updated + self.repointed
    }
}

/// Failed ledger entries handled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    /// Entries whose script re-ran successfully
    pub reexecuted: u64,
    /// Entries marked successful without re-running
    pub warnings: Vec<LedgerRepairWarning>,
}

impl LedgerSummary {
    /// Entries whose flag was changed
    #[must_use]
    pub fn repairs(&self) -> u64 {
        self.reexecuted + self.warnings.len() as u64
    }
}

/// Outcome of a full reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Steps completed, in order
    pub steps: Vec<ReconcileStep>,
    /// Baseline import
    pub baseline: BaselineSummary,
    /// Tenants copied into the canonical registry
    pub tenants_copied: u64,
    /// Routing changes
    pub routing: RoutingSummary,
    /// Tables converted, as `schema.table`
    pub tables_converted: Vec<String>,
    /// Ledger repairs
    pub ledger: LedgerSummary,
}

impl ReconcileReport {
    /// Ledger entries marked successful without their script being applied
    #[inline]
    #[must_use]
    pub fn warnings(&self) -> &[LedgerRepairWarning] {
        &self.ledger.warnings
    }
}

/// Runs reconciliation against a catalog
pub struct Reconciler {
    catalog: Arc<dyn SchemaCatalog>,
    plan: ReconcilePlan,
    scripts: ScriptLocator,
    baseline: Option<Arc<dyn BaselineImport>>,
    retry_delay: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("plan", &self.plan)
            .field("scripts", &self.scripts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler with no script directories and no baseline importer
    #[must_use]
    pub fn new(catalog: Arc<dyn SchemaCatalog>, plan: ReconcilePlan) -> Self {
        Self {
            catalog,
            plan,
            scripts: ScriptLocator::default(),
            baseline: None,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Where failed ledger scripts are looked up
    #[must_use]
    pub fn with_scripts(mut self, scripts: ScriptLocator) -> Self {
        self.scripts = scripts;
        self
    }

    /// Importer for empty schemas
    #[must_use]
    pub fn with_baseline(mut self, importer: Arc<dyn BaselineImport>) -> Self {
        self.baseline = Some(importer);
        self
    }

    /// Pause before the single retry
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The managed plan
    #[inline]
    #[must_use]
    pub fn plan(&self) -> &ReconcilePlan {
        &self.plan
    }

    /// Run every step in order
    ///
    /// # Errors
    /// The first step that fails after its retry, or a ledger entry that
    /// cannot be repaired under [`LedgerPolicy::FailFast`].
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let mut step = ReconcileStep::ImportBaseline;

        while step != ReconcileStep::Converged {
            tracing::info!("Reconcile step: {}", step);
            match step {
                ReconcileStep::ImportBaseline => report.baseline = self.import_baseline().await?,
                ReconcileStep::MigrateTenantRegistry => {
                    report.tenants_copied = self.migrate_tenant_registry().await?;
                }
                ReconcileStep::RegenerateRoutingRows => {
                    report.routing = self.regenerate_routing_rows().await?;
                }
                ReconcileStep::NormalizeCollation => {
                    report.tables_converted = self.normalize_collation().await?;
                }
                ReconcileStep::ReconcileMigrationLedger => {
                    report.ledger = self.reconcile_ledger().await?;
                }
                ReconcileStep::Converged => {}
            }
            report.steps.push(step);
            let next = step.next();
            validate_transition(step, next)?;
            step = next;
        }

        report.steps.push(ReconcileStep::Converged);
        tracing::info!(
            "Database converged: {} tenants copied, {} routing changes, {} tables converted, {} ledger repairs",
            report.tenants_copied,
            report.routing.changes(),
            report.tables_converted.len(),
            report.ledger.repairs()
        );
        Ok(report)
    }

    /// Create missing schemas and restore snapshots into schemas without tables
    ///
    /// # Errors
    /// [`ReconcileError::Baseline`] when snapshot files are missing, no importer
    /// is configured, or the import fails; [`ReconcileError::Step`] for catalog
    /// failures.
    pub async fn import_baseline(&self) -> Result<BaselineSummary, ReconcileError> {
        let step = ReconcileStep::ImportBaseline;
        let mut summary = BaselineSummary::default();

        for schema in self.plan.managed_schemas() {
            let created = self
                .retry_once(step, || self.catalog.ensure_schema(schema, &self.plan.collation))
                .await?;
            if created {
                tracing::info!("Created schema {}", schema);
                summary.created.push(schema.to_string());
            }
        }

        let mut pending = Vec::new();
        for snapshot in &self.plan.baselines {
            let tables = self
                .retry_once(step, || self.catalog.table_count(&snapshot.schema))
                .await?;
            if tables > 0 {
                tracing::debug!("Schema {} already has {} tables, skipping import", snapshot.schema, tables);
            } else {
                pending.push(snapshot);
            }
        }
        if pending.is_empty() {
            return Ok(summary);
        }

        let missing: Vec<String> = pending
            .iter()
            .filter(|s| !s.path.is_file())
            .map(|s| s.path.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ReconcileError::Baseline {
                schema: pending[0].schema.clone(),
                message: format!("snapshot files not found: {}", missing.join(", ")),
            });
        }
        let importer = self.baseline.as_ref().ok_or_else(|| ReconcileError::Baseline {
            schema: pending[0].schema.clone(),
            message: "schema is empty and no importer is configured".to_string(),
        })?;

        for snapshot in pending {
            importer.import(&snapshot.schema, &snapshot.path).await?;
            tracing::info!("Imported baseline into {}", snapshot.schema);
            summary.imported.push(snapshot.schema.clone());
        }
        Ok(summary)
    }

    /// Copy tenants missing from the canonical registry; returns how many were copied
    ///
    /// # Errors
    /// [`ReconcileError::Step`] when a catalog call fails twice.
    pub async fn migrate_tenant_registry(&self) -> Result<u64, ReconcileError> {
        let Some(registry) = &self.plan.tenant_registry else {
            return Ok(0);
        };
        let step = ReconcileStep::MigrateTenantRegistry;
        let tenants = self.retry_once(step, || self.catalog.tenants(&registry.source)).await?;

        let mut copied = 0;
        for tenant in &tenants {
            let inserted = self
                .retry_once(step, || {
                    self.catalog
                        .copy_tenant_if_absent(&registry.source, &registry.target, &tenant.id)
                })
                .await?;
            if inserted {
                tracing::debug!("Copied tenant {} into {}", tenant.id, registry.target.table);
                copied += 1;
            }
        }
        if copied > 0 {
            tracing::info!("Copied {} tenants into {}", copied, registry.target.table);
        }
        Ok(copied)
    }

    /// Upsert one routing row per tenant in every managed routing table
    ///
    /// Canonical tables additionally have every remaining row pointed at the
    /// canonical schema, including rows for tenants outside the registry.
    ///
    /// # Errors
    /// [`ReconcileError::Step`] when a catalog call fails twice.
    pub async fn regenerate_routing_rows(&self) -> Result<RoutingSummary, ReconcileError> {
        let mut summary = RoutingSummary::default();
        let Some(registry) = &self.plan.tenant_registry else {
            if !self.plan.routing_tables.is_empty() {
                tracing::warn!("Routing tables configured without a tenant registry; skipping");
            }
            return Ok(summary);
        };
        let step = ReconcileStep::RegenerateRoutingRows;
        let tenants = self.retry_once(step, || self.catalog.tenants(&registry.target)).await?;

        for table in &self.plan.routing_tables {
            for tenant in &tenants {
                let row = SchemaRoutingRow::new(tenant.id.clone(), table.schema_for(tenant));
                match self
                    .retry_once(step, || self.catalog.upsert_routing_row(table, &row))
                    .await?
                {
                    UpsertOutcome::Inserted => summary.inserted += 1,
                    UpsertOutcome::Updated => summary.updated += 1,
                    UpsertOutcome::Unchanged => {}
                }
            }
            if let RoutingMode::Canonical { schema } = &table.mode {
                summary.repointed += self
                    .retry_once(step, || self.catalog.repoint_routing_rows(table, schema))
                    .await?;
            }
        }
        if summary.changes() > 0 {
            tracing::info!(
                "Routing rows: {} inserted, {} updated, {} repointed",
                summary.inserted,
                summary.updated,
                summary.repointed
            );
        }
        Ok(summary)
    }

    /// Convert every table whose collation differs from its schema default
    ///
    /// Returns the converted tables as `schema.table`.
    ///
    /// # Errors
    /// [`ReconcileError::Step`] when a catalog call fails twice.
    pub async fn normalize_collation(&self) -> Result<Vec<String>, ReconcileError> {
        let step = ReconcileStep::NormalizeCollation;
        let mut converted = Vec::new();

        for schema in self.plan.managed_schemas() {
            let target = self.retry_once(step, || self.catalog.default_collation(schema)).await?;
            let offenders = self
                .retry_once(step, || self.catalog.tables_with_foreign_collation(schema))
                .await?;
            for table in offenders {
                tracing::info!(
                    "Converting {}.{} from {} to {}",
                    schema,
                    table.table,
                    table.collation,
                    target.collation
                );
                self.retry_once(step, || {
                    self.catalog.convert_table_collation(schema, &table.table, &target)
                })
                .await?;
                converted.push(format!("{schema}.{}", table.table));
            }
        }
        Ok(converted)
    }

    /// Re-run failed ledger entries and mark them successful
    ///
    /// Entries are never deleted. Under [`LedgerPolicy::Unblock`] an entry
    /// whose script is missing or fails is marked successful anyway and a
    /// [`LedgerRepairWarning`] is logged and returned.
    ///
    /// # Errors
    /// [`ReconcileError::LedgerRepair`] under [`LedgerPolicy::FailFast`];
    /// [`ReconcileError::Step`] when a catalog call fails twice.
    pub async fn reconcile_ledger(&self) -> Result<LedgerSummary, ReconcileError> {
        let step = ReconcileStep::ReconcileMigrationLedger;
        let mut summary = LedgerSummary::default();

        for ledger in &self.plan.ledgers {
            let entries = self.retry_once(step, || self.catalog.ledger_entries(ledger)).await?;
            for entry in entries.iter().filter(|e| !e.success) {
                match self.reexecute(&ledger.schema, &entry.script).await {
                    Ok(()) => {
                        tracing::info!("Re-applied {} (rank {}) in {}", entry.script, entry.installed_rank, ledger);
                        summary.reexecuted += 1;
                    }
                    Err(reason) => {
                        if self.plan.ledger_policy == LedgerPolicy::FailFast {
                            return Err(ReconcileError::LedgerRepair {
                                ledger: ledger.to_string(),
                                installed_rank: entry.installed_rank,
                                script: entry.script.clone(),
                                reason,
                            });
                        }
                        let warning = LedgerRepairWarning {
                            ledger: ledger.to_string(),
                            installed_rank: entry.installed_rank,
                            script: entry.script.clone(),
                            reason,
                        };
                        tracing::warn!("LEDGER REPAIR WARNING: {}", warning);
                        summary.warnings.push(warning);
                    }
                }
                self.retry_once(step, || self.catalog.mark_ledger_success(ledger, entry.installed_rank))
                    .await?;
            }
        }
        Ok(summary)
    }

    async fn reexecute(&self, schema: &str, script: &str) -> Result<(), String> {
        let path = self
            .scripts
            .locate(script)
            .ok_or_else(|| "script not found".to_string())?;
        let sql = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        self.catalog
            .execute_script(schema, &sql)
            .await
            .map_err(|e| e.to_string())
    }

    /// Whether every step would be a no-op
    ///
    /// Read-only; issues no writes.
    ///
    /// # Errors
    /// Catalog failures, including an unreachable database.
    pub async fn is_converged(&self) -> CatalogResult<bool> {
        self.catalog.ping().await?;

        for snapshot in &self.plan.baselines {
            if self.catalog.table_count(&snapshot.schema).await? == 0 {
                return Ok(false);
            }
        }

        if let Some(registry) = &self.plan.tenant_registry {
            let canonical = self.catalog.tenants(&registry.target).await?;
            let legacy = self.catalog.tenants(&registry.source).await?;
            if legacy.iter().any(|t| !canonical.iter().any(|c| c.id == t.id)) {
                return Ok(false);
            }
            for table in &self.plan.routing_tables {
                let rows = self.catalog.routing_rows(table).await?;
                let mut by_tenant: HashMap<&str, Vec<&str>> = HashMap::new();
                for row in &rows {
                    by_tenant.entry(&row.tenant_id).or_default().push(&row.schema);
                }
                let covered = canonical.iter().all(|tenant| {
                    by_tenant.get(tenant.id.as_str()).map(Vec::as_slice) == Some(&[table.schema_for(tenant)][..])
                });
                let canonical_ok = match &table.mode {
                    RoutingMode::Canonical { schema } => rows.iter().all(|r| &r.schema == schema),
                    RoutingMode::PerTenant { .. } => true,
                };
                if !covered || !canonical_ok {
                    return Ok(false);
                }
            }
        }

        for schema in self.plan.managed_schemas() {
            if !self.catalog.tables_with_foreign_collation(schema).await?.is_empty() {
                return Ok(false);
            }
        }

        for ledger in &self.plan.ledgers {
            if self.catalog.ledger_entries(ledger).await?.iter().any(|e| !e.success) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn retry_once<T, F, Fut>(&self, step: ReconcileStep, mut op: F) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CatalogResult<T>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() => {
                tracing::warn!("{} failed, retrying once: {}", step, err);
                validate_transition(step, step)?;
                tokio::time::sleep(self.retry_delay).await;
                op().await.map_err(|source| ReconcileError::Step { step, source })
            }
            Err(source) => Err(ReconcileError::Step { step, source }),
        }
    }
}
