//! Testing utilities for the Converge workspace
//!
//! In-memory catalog, recording stage actions, switchable predicates and
//! fixture builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::NaiveDate;
use converge_kernel::{ActionOutput, CompletionPredicate, StageAction, StageError, StageResult};
use converge_schema::{
    CatalogError, CatalogResult, MigrationLedgerEntry, RoutingMode, RoutingTable, SchemaCatalog,
    SchemaCollation, SchemaRoutingRow, TableCollation, TableRef, TenantRecord, TenantTable,
    UpsertOutcome,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// MemoryCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SchemaState {
    collation: SchemaCollation,
    tables: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct CatalogState {
    schemas: BTreeMap<String, SchemaState>,
    tenants: HashMap<TableRef, Vec<TenantRecord>>,
    routing: HashMap<TableRef, Vec<SchemaRoutingRow>>,
    ledgers: HashMap<TableRef, Vec<MigrationLedgerEntry>>,
    executed: Vec<(String, String)>,
    conversions: Vec<String>,
    failing_scripts: Vec<String>,
    fail_next: HashMap<&'static str, u32>,
    calls: HashMap<&'static str, usize>,
    unreachable: bool,
}

/// In-memory [`SchemaCatalog`] with failure injection
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(self, schema: &str) -> Self {
        self.state.lock().schemas.entry(schema.to_string()).or_default();
        self
    }

    pub fn with_table(self, schema: &str, table: &str, collation: &str) -> Self {
        self.state
            .lock()
            .schemas
            .entry(schema.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), collation.to_string());
        self
    }

    pub fn with_tenants(self, table: &TableRef, tenants: Vec<TenantRecord>) -> Self {
        self.state.lock().tenants.insert(table.clone(), tenants);
        self
    }

    pub fn with_routing_rows(self, table: &TableRef, rows: Vec<SchemaRoutingRow>) -> Self {
        self.state.lock().routing.insert(table.clone(), rows);
        self
    }

    pub fn with_ledger(self, ledger: &TableRef, entries: Vec<MigrationLedgerEntry>) -> Self {
        self.state.lock().ledgers.insert(ledger.clone(), entries);
        self
    }

    /// Scripts whose SQL contains `needle` fail to execute
    pub fn with_failing_script(self, needle: &str) -> Self {
        self.state.lock().failing_scripts.push(needle.to_string());
        self
    }

    /// The next `times` calls of `operation` fail with a query error
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.state.lock().fail_next.insert(operation, times);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn tenants_in(&self, table: &TableRef) -> Vec<TenantRecord> {
        self.state.lock().tenants.get(table).cloned().unwrap_or_default()
    }

    pub fn rows_in(&self, table: &TableRef) -> Vec<SchemaRoutingRow> {
        self.state.lock().routing.get(table).cloned().unwrap_or_default()
    }

    pub fn ledger(&self, ledger: &TableRef) -> Vec<MigrationLedgerEntry> {
        self.state.lock().ledgers.get(ledger).cloned().unwrap_or_default()
    }

    pub fn table_collation(&self, schema: &str, table: &str) -> Option<String> {
        self.state
            .lock()
            .schemas
            .get(schema)
            .and_then(|s| s.tables.get(table).cloned())
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.state.lock().schemas.contains_key(schema)
    }

    /// `(schema, sql)` of every executed script
    pub fn executed_scripts(&self) -> Vec<(String, String)> {
        self.state.lock().executed.clone()
    }

    /// Converted tables as `schema.table`, in order
    pub fn conversions(&self) -> Vec<String> {
        self.state.lock().conversions.clone()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    fn enter(&self, operation: &'static str) -> CatalogResult<parking_lot::MutexGuard<'_, CatalogState>> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_default() += 1;
        if state.unreachable {
            return Err(CatalogError::Unreachable("connection refused".to_string()));
        }
        if let Some(remaining) = state.fail_next.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CatalogError::query(operation, "injected failure"));
            }
        }
        Ok(state)
    }
}

fn missing_schema(schema: &str) -> CatalogError {
    CatalogError::query("schema lookup", format!("unknown schema {schema}"))
}

#[async_trait]
impl SchemaCatalog for MemoryCatalog {
    async fn ping(&self) -> CatalogResult<()> {
        self.enter("ping").map(|_| ())
    }

    async fn ensure_schema(&self, schema: &str, collation: &SchemaCollation) -> CatalogResult<bool> {
        let mut state = self.enter("ensure_schema")?;
        if state.schemas.contains_key(schema) {
            return Ok(false);
        }
        state.schemas.insert(
            schema.to_string(),
            SchemaState {
                collation: collation.clone(),
                tables: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn table_count(&self, schema: &str) -> CatalogResult<u64> {
        let state = self.enter("table_count")?;
        Ok(state.schemas.get(schema).map_or(0, |s| s.tables.len() as u64))
    }

    async fn tenants(&self, table: &TenantTable) -> CatalogResult<Vec<TenantRecord>> {
        let state = self.enter("tenants")?;
        let mut tenants = state.tenants.get(&table.table).cloned().unwrap_or_default();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn copy_tenant_if_absent(
        &self,
        source: &TenantTable,
        target: &TenantTable,
        tenant_id: &str,
    ) -> CatalogResult<bool> {
        let mut state = self.enter("copy_tenant_if_absent")?;
        let Some(record) = state
            .tenants
            .get(&source.table)
            .and_then(|rows| rows.iter().find(|t| t.id == tenant_id))
            .cloned()
        else {
            return Ok(false);
        };
        let rows = state.tenants.entry(target.table.clone()).or_default();
        if rows.iter().any(|t| t.id == tenant_id) {
            return Ok(false);
        }
        rows.push(record);
        Ok(true)
    }

    async fn routing_rows(&self, table: &RoutingTable) -> CatalogResult<Vec<SchemaRoutingRow>> {
        let state = self.enter("routing_rows")?;
        Ok(state.routing.get(&table.table).cloned().unwrap_or_default())
    }

    async fn upsert_routing_row(
        &self,
        table: &RoutingTable,
        row: &SchemaRoutingRow,
    ) -> CatalogResult<UpsertOutcome> {
        let mut state = self.enter("upsert_routing_row")?;
        let rows = state.routing.entry(table.table.clone()).or_default();
        let existing: Vec<&SchemaRoutingRow> = rows.iter().filter(|r| r.tenant_id == row.tenant_id).collect();
        let outcome = match existing.as_slice() {
            [] => UpsertOutcome::Inserted,
            [only] if only.schema == row.schema => return Ok(UpsertOutcome::Unchanged),
            _ => UpsertOutcome::Updated,
        };
        rows.retain(|r| r.tenant_id != row.tenant_id);
        rows.push(row.clone());
        Ok(outcome)
    }

    async fn repoint_routing_rows(&self, table: &RoutingTable, schema: &str) -> CatalogResult<u64> {
        let mut state = self.enter("repoint_routing_rows")?;
        let mut changed = 0;
        for row in state.routing.entry(table.table.clone()).or_default() {
            if row.schema != schema {
                row.schema = schema.to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn default_collation(&self, schema: &str) -> CatalogResult<SchemaCollation> {
        let state = self.enter("default_collation")?;
        state
            .schemas
            .get(schema)
            .map(|s| s.collation.clone())
            .ok_or_else(|| missing_schema(schema))
    }

    async fn tables_with_foreign_collation(&self, schema: &str) -> CatalogResult<Vec<TableCollation>> {
        let state = self.enter("tables_with_foreign_collation")?;
        let s = state.schemas.get(schema).ok_or_else(|| missing_schema(schema))?;
        Ok(s.tables
            .iter()
            .filter(|(_, collation)| **collation != s.collation.collation)
            .map(|(table, collation)| TableCollation {
                table: table.clone(),
                collation: collation.clone(),
            })
            .collect())
    }

    async fn convert_table_collation(
        &self,
        schema: &str,
        table: &str,
        target: &SchemaCollation,
    ) -> CatalogResult<()> {
        let mut state = self.enter("convert_table_collation")?;
        let s = state.schemas.get_mut(schema).ok_or_else(|| missing_schema(schema))?;
        let current = s
            .tables
            .get_mut(table)
            .ok_or_else(|| CatalogError::query("convert collation", format!("unknown table {table}")))?;
        *current = target.collation.clone();
        state.conversions.push(format!("{schema}.{table}"));
        Ok(())
    }

    async fn ledger_entries(&self, ledger: &TableRef) -> CatalogResult<Vec<MigrationLedgerEntry>> {
        let state = self.enter("ledger_entries")?;
        let mut entries = state.ledgers.get(ledger).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.installed_rank);
        Ok(entries)
    }

    async fn mark_ledger_success(&self, ledger: &TableRef, installed_rank: i64) -> CatalogResult<()> {
        let mut state = self.enter("mark_ledger_success")?;
        if let Some(entry) = state
            .ledgers
            .get_mut(ledger)
            .and_then(|entries| entries.iter_mut().find(|e| e.installed_rank == installed_rank))
        {
            entry.success = true;
        }
        Ok(())
    }

    async fn execute_script(&self, schema: &str, sql: &str) -> CatalogResult<()> {
        let mut state = self.enter("execute_script")?;
        if state.failing_scripts.iter().any(|needle| sql.contains(needle.as_str())) {
            return Err(CatalogError::Script(format!("error executing script in {schema}")));
        }
        state.executed.push((schema.to_string(), sql.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage doubles
// ---------------------------------------------------------------------------

/// Shared, ordered log of action runs
pub type RunLog = Arc<Mutex<Vec<String>>>;

pub fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Stage action that appends its name to a [`RunLog`]
#[derive(Debug, Clone)]
pub struct RecordingAction {
    name: String,
    log: RunLog,
    fail: bool,
    warnings: Vec<String>,
    runs: Arc<AtomicUsize>,
    completes: Option<Arc<AtomicBool>>,
}

impl RecordingAction {
    pub fn new(name: &str, log: &RunLog) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail: false,
            warnings: Vec::new(),
            runs: Arc::new(AtomicUsize::new(0)),
            completes: None,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }

    /// Set `predicate` when the action succeeds, so a re-run skips the stage
    pub fn completes(mut self, predicate: &StaticPredicate) -> Self {
        self.completes = Some(Arc::clone(&predicate.satisfied));
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageAction for RecordingAction {
    async fn run(&self) -> StageResult<ActionOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(self.name.clone());
        if self.fail {
            return Err(StageError::Unsatisfied(format!("{} failed", self.name)));
        }
        if let Some(flag) = &self.completes {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(ActionOutput {
            warnings: self.warnings.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("run {}", self.name)
    }
}

/// Predicate whose answer is set by the test
#[derive(Debug, Clone)]
pub struct StaticPredicate {
    satisfied: Arc<AtomicBool>,
    checks: Arc<AtomicUsize>,
}

impl StaticPredicate {
    pub fn new(satisfied: bool) -> Self {
        Self {
            satisfied: Arc::new(AtomicBool::new(satisfied)),
            checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, satisfied: bool) {
        self.satisfied.store(satisfied, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionPredicate for StaticPredicate {
    async fn is_satisfied(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.satisfied.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn tenant_table(table: &TableRef) -> TenantTable {
    TenantTable {
        table: table.clone(),
        id_column: "enterpriseId".to_string(),
        name_column: Some("name".to_string()),
        schema_column: Some("schemaName".to_string()),
    }
}

pub fn canonical_routing(table: &TableRef, schema: &str) -> RoutingTable {
    RoutingTable {
        table: table.clone(),
        tenant_column: "enterpriseId".to_string(),
        schema_column: "schemaName".to_string(),
        mode: RoutingMode::Canonical {
            schema: schema.to_string(),
        },
    }
}

pub fn per_tenant_routing(table: &TableRef, default_schema: &str) -> RoutingTable {
    RoutingTable {
        table: table.clone(),
        tenant_column: "enterpriseId".to_string(),
        schema_column: "schemaName".to_string(),
        mode: RoutingMode::PerTenant {
            default_schema: default_schema.to_string(),
        },
    }
}

pub fn ledger_entry(rank: i64, script: &str, success: bool) -> MigrationLedgerEntry {
    MigrationLedgerEntry {
        installed_rank: rank,
        version: Some(rank.to_string()),
        description: script.trim_end_matches(".sql").to_string(),
        script: script.to_string(),
        success,
        installed_on: NaiveDate::from_ymd_opt(2024, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)),
    }
}

pub fn tenants(ids: &[&str]) -> Vec<TenantRecord> {
    ids.iter().map(|id| TenantRecord::new(*id)).collect()
}

/// Template with comments, a sequence and nested sections
pub const SAMPLE_TEMPLATE: &str = "\
# Local development settings
server:
  port: 8080   # do not change

datasource:
  url: jdbc:mysql://localhost:3306/legiondb
  pool:
    max: 10
    min: 2

management:
  health:
    enabled: false

profiles:
  - local
  - dev
";
