//! Reconciler behaviour against the in-memory catalog

use converge_schema::{
    BaselineImport, BaselineSnapshot, LedgerPolicy, ReconcileError, ReconcilePlan, ReconcileStep,
    Reconciler, SchemaCollation, ScriptLocator, TableRef, TenantMigration, TenantRecord,
};
use converge_test_utils::{
    canonical_routing, ledger_entry, per_tenant_routing, tenant_table, tenants, MemoryCatalog,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn legacy() -> TableRef {
    TableRef::new("legiondb", "EnterpriseSchema")
}

fn canonical() -> TableRef {
    TableRef::new("legiondb0", "EnterpriseSchema")
}

fn primary_routing() -> TableRef {
    TableRef::new("legiondb0", "EnterpriseSchemaRouting")
}

fn secondary_routing() -> TableRef {
    TableRef::new("legiondb", "EnterpriseSchemaRouting")
}

fn history() -> TableRef {
    TableRef::new("legiondb", "flyway_schema_history")
}

fn registry_plan() -> ReconcilePlan {
    ReconcilePlan {
        schemas: vec!["legiondb".into(), "legiondb0".into()],
        tenant_registry: Some(TenantMigration {
            source: tenant_table(&legacy()),
            target: tenant_table(&canonical()),
        }),
        routing_tables: vec![
            canonical_routing(&primary_routing(), "legiondb"),
            per_tenant_routing(&secondary_routing(), "legiondb"),
        ],
        ..ReconcilePlan::default()
    }
}

fn reconciler(catalog: &MemoryCatalog, plan: ReconcilePlan) -> Reconciler {
    Reconciler::new(Arc::new(catalog.clone()), plan).with_retry_delay(Duration::ZERO)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

// ============================================================================
// Tenant registry and routing
// ============================================================================

#[tokio::test]
async fn tenant_copy_never_overwrites_canonical_rows() {
    let catalog = MemoryCatalog::new()
        .with_schema("legiondb")
        .with_schema("legiondb0")
        .with_tenants(
            &legacy(),
            vec![TenantRecord::new("1").named("legacy one"), TenantRecord::new("2")],
        )
        .with_tenants(&canonical(), vec![TenantRecord::new("1").named("canonical one")]);

    let copied = reconciler(&catalog, registry_plan()).migrate_tenant_registry().await.unwrap();

    assert_eq!(copied, 1);
    let rows = catalog.tenants_in(&canonical());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name.as_deref(), Some("canonical one"));
}

#[tokio::test]
async fn primary_table_points_every_row_at_canonical_schema() {
    let catalog = MemoryCatalog::new()
        .with_schema("legiondb")
        .with_schema("legiondb0")
        .with_tenants(&canonical(), vec![TenantRecord::new("7").in_schema("legiondb_7")])
        .with_routing_rows(
            &primary_routing(),
            vec![
                converge_schema::SchemaRoutingRow::new("7", "legiondb_7"),
                converge_schema::SchemaRoutingRow::new("orphan", "legiondb_old"),
            ],
        );

    let summary = reconciler(&catalog, registry_plan()).regenerate_routing_rows().await.unwrap();

    assert!(catalog.rows_in(&primary_routing()).iter().all(|r| r.schema == "legiondb"));
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.repointed, 1);
    let secondary = catalog.rows_in(&secondary_routing());
    assert_eq!(secondary.len(), 1);
    assert_eq!(secondary[0].schema, "legiondb_7");
}

#[tokio::test]
async fn regenerating_twice_changes_nothing() {
    let catalog = MemoryCatalog::new()
        .with_schema("legiondb")
        .with_schema("legiondb0")
        .with_tenants(&legacy(), tenants(&["1", "2", "3"]));
    let reconciler = reconciler(&catalog, registry_plan());

    reconciler.run().await.unwrap();
    let second = reconciler.run().await.unwrap();

    assert_eq!(second.tenants_copied, 0);
    assert_eq!(second.routing.changes(), 0);
    assert_eq!(catalog.rows_in(&primary_routing()).len(), 3);
    assert!(reconciler.is_converged().await.unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_tenant_gets_exactly_one_row_per_table(
        legacy_ids in prop::collection::btree_set(1u32..60, 0..20),
        existing in prop::collection::vec((1u32..80, prop::sample::select(vec!["legiondb", "legiondb_1", "legiondb_old"])), 0..30),
        tenant_schemas in prop::collection::vec(prop::option::of(prop::sample::select(vec!["legiondb", "legiondb_2"])), 60),
    ) {
        let records: Vec<TenantRecord> = legacy_ids
            .iter()
            .map(|id| {
                let record = TenantRecord::new(id.to_string());
                match tenant_schemas[*id as usize - 1] {
                    Some(schema) => record.in_schema(schema),
                    None => record,
                }
            })
            .collect();
        let stale: Vec<_> = existing
            .iter()
            .map(|(id, schema)| converge_schema::SchemaRoutingRow::new(id.to_string(), *schema))
            .collect();
        let catalog = MemoryCatalog::new()
            .with_schema("legiondb")
            .with_schema("legiondb0")
            .with_tenants(&legacy(), records.clone())
            .with_routing_rows(&primary_routing(), stale.clone())
            .with_routing_rows(&secondary_routing(), stale);

        runtime().block_on(async {
            let reconciler = reconciler(&catalog, registry_plan());
            reconciler.migrate_tenant_registry().await.unwrap();
            reconciler.regenerate_routing_rows().await.unwrap();
        });

        for table in [primary_routing(), secondary_routing()] {
            let rows = catalog.rows_in(&table);
            for tenant in &records {
                let matching: Vec<_> = rows.iter().filter(|r| r.tenant_id == tenant.id).collect();
                prop_assert_eq!(matching.len(), 1);
                if table == secondary_routing() {
                    prop_assert_eq!(matching[0].schema.as_str(), tenant.schema.as_deref().unwrap_or("legiondb"));
                }
            }
        }
        prop_assert!(catalog.rows_in(&primary_routing()).iter().all(|r| r.schema == "legiondb"));
    }

    #[test]
    fn collation_scan_is_empty_after_normalizing(
        tables in prop::collection::btree_map(
            "[a-z]{1,8}",
            prop::sample::select(vec!["utf8mb4_general_ci", "utf8mb4_unicode_ci", "latin1_swedish_ci", "utf8mb4_bin"]),
            0..25,
        ),
    ) {
        let mut catalog = MemoryCatalog::new().with_schema("legiondb");
        for (table, collation) in &tables {
            catalog = catalog.with_table("legiondb", table, collation);
        }
        let expected = tables.values().filter(|c| **c != "utf8mb4_general_ci").count();
        let plan = ReconcilePlan { schemas: vec!["legiondb".into()], ..ReconcilePlan::default() };

        let (converted, remaining) = runtime().block_on(async {
            let reconciler = reconciler(&catalog, plan);
            let converted = reconciler.normalize_collation().await.unwrap();
            let again = reconciler.normalize_collation().await.unwrap();
            assert!(again.is_empty());
            let remaining = converge_schema::SchemaCatalog::tables_with_foreign_collation(&catalog, "legiondb")
                .await
                .unwrap();
            (converted, remaining)
        });

        prop_assert_eq!(converted.len(), expected);
        prop_assert!(remaining.is_empty());
    }
}

// ============================================================================
// Migration ledger
// ============================================================================

fn scripts_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("db/migration");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("V10__add_shift_index.sql"), "CREATE INDEX idx_shift ON Shift (start);").unwrap();
    dir
}

fn ledger_plan(policy: LedgerPolicy) -> ReconcilePlan {
    ReconcilePlan {
        ledgers: vec![history()],
        ledger_policy: policy,
        ..ReconcilePlan::default()
    }
}

#[tokio::test]
async fn one_missing_script_gives_exactly_one_warning() {
    let scripts = scripts_dir();
    let catalog = MemoryCatalog::new().with_ledger(
        &history(),
        vec![
            ledger_entry(9, "V9__baseline.sql", true),
            ledger_entry(10, "V10__add_shift_index.sql", false),
            ledger_entry(11, "V11__drop_legacy_column.sql", false),
        ],
    );
    let reconciler = reconciler(&catalog, ledger_plan(LedgerPolicy::Unblock))
        .with_scripts(ScriptLocator::new([scripts.path().to_path_buf()]));

    let summary = reconciler.reconcile_ledger().await.unwrap();

    assert_eq!(summary.reexecuted, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].script, "V11__drop_legacy_column.sql");
    assert_eq!(summary.warnings[0].installed_rank, 11);
    assert!(catalog.ledger(&history()).iter().all(|e| e.success));
    assert_eq!(catalog.ledger(&history()).len(), 3);
    assert_eq!(catalog.executed_scripts().len(), 1);
    assert_eq!(catalog.executed_scripts()[0].0, "legiondb");

    let second = reconciler.reconcile_ledger().await.unwrap();
    assert_eq!(second.repairs(), 0);
    assert_eq!(catalog.executed_scripts().len(), 1);
}

#[tokio::test]
async fn failing_script_is_unblocked_with_warning() {
    let scripts = scripts_dir();
    let catalog = MemoryCatalog::new()
        .with_ledger(&history(), vec![ledger_entry(10, "V10__add_shift_index.sql", false)])
        .with_failing_script("idx_shift");
    let reconciler = reconciler(&catalog, ledger_plan(LedgerPolicy::Unblock))
        .with_scripts(ScriptLocator::new([scripts.path().to_path_buf()]));

    let summary = reconciler.reconcile_ledger().await.unwrap();

    assert_eq!(summary.reexecuted, 0);
    assert!(summary.warnings[0].reason.contains("script execution failed"));
    assert!(catalog.ledger(&history())[0].success);
}

#[tokio::test]
async fn fail_fast_leaves_entry_failed() {
    let catalog = MemoryCatalog::new()
        .with_ledger(&history(), vec![ledger_entry(11, "V11__drop_legacy_column.sql", false)]);
    let reconciler = reconciler(&catalog, ledger_plan(LedgerPolicy::FailFast));

    let err = reconciler.reconcile_ledger().await.unwrap_err();

    assert!(matches!(err, ReconcileError::LedgerRepair { installed_rank: 11, .. }));
    assert!(!catalog.ledger(&history())[0].success);
}

// ============================================================================
// Retry and step ordering
// ============================================================================

#[tokio::test]
async fn single_failure_is_retried() {
    let catalog = MemoryCatalog::new().with_table("legiondb", "Shift", "latin1_swedish_ci");
    catalog.fail_next("tables_with_foreign_collation", 1);
    let plan = ReconcilePlan {
        schemas: vec!["legiondb".into()],
        ..ReconcilePlan::default()
    };

    let converted = reconciler(&catalog, plan).normalize_collation().await.unwrap();

    assert_eq!(converted, vec!["legiondb.Shift".to_string()]);
    assert_eq!(catalog.calls("tables_with_foreign_collation"), 2);
}

#[tokio::test]
async fn second_failure_surfaces_as_step_error() {
    let catalog = MemoryCatalog::new().with_table("legiondb", "Shift", "latin1_swedish_ci");
    catalog.fail_next("convert_table_collation", 2);
    let plan = ReconcilePlan {
        schemas: vec!["legiondb".into()],
        ..ReconcilePlan::default()
    };

    let err = reconciler(&catalog, plan).run().await.unwrap_err();

    assert_eq!(err.step(), ReconcileStep::NormalizeCollation);
    assert!(matches!(err, ReconcileError::Step { .. }));
    assert_eq!(catalog.table_collation("legiondb", "Shift").as_deref(), Some("latin1_swedish_ci"));
}

#[tokio::test]
async fn run_visits_every_step_in_order() {
    let catalog = MemoryCatalog::new();
    let report = reconciler(&catalog, ReconcilePlan::default()).run().await.unwrap();
    assert_eq!(report.steps, ReconcileStep::ORDER.to_vec());
}

#[tokio::test]
async fn missing_schemas_are_created_with_default_collation() {
    let catalog = MemoryCatalog::new().with_schema("legiondb");
    let plan = ReconcilePlan {
        schemas: vec!["legiondb".into(), "legiondb0".into()],
        collation: SchemaCollation::default(),
        ..ReconcilePlan::default()
    };

    let summary = reconciler(&catalog, plan).import_baseline().await.unwrap();

    assert_eq!(summary.created, vec!["legiondb0".to_string()]);
    assert!(catalog.has_schema("legiondb0"));
}

// ============================================================================
// Baseline import
// ============================================================================

#[derive(Default)]
struct RecordingImport {
    imported: parking_lot::Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait::async_trait]
impl BaselineImport for RecordingImport {
    async fn import(&self, schema: &str, snapshot: &Path) -> Result<(), ReconcileError> {
        self.imported.lock().push((schema.to_string(), snapshot.to_path_buf()));
        Ok(())
    }
}

#[tokio::test]
async fn only_empty_schemas_are_imported() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("legiondb0.sql");
    std::fs::write(&dump, "-- dump").unwrap();
    let catalog = MemoryCatalog::new().with_table("legiondb", "Shift", "utf8mb4_general_ci");
    let importer = Arc::new(RecordingImport::default());
    let plan = ReconcilePlan {
        baselines: vec![
            BaselineSnapshot::new("legiondb", dir.path().join("legiondb.sql")),
            BaselineSnapshot::new("legiondb0", &dump),
        ],
        ..ReconcilePlan::default()
    };

    let summary = reconciler(&catalog, plan).with_baseline(importer.clone()).import_baseline().await.unwrap();

    assert_eq!(summary.imported, vec!["legiondb0".to_string()]);
    assert_eq!(importer.imported.lock().clone(), vec![("legiondb0".to_string(), dump)]);
}

#[tokio::test]
async fn missing_snapshot_files_are_listed() {
    let catalog = MemoryCatalog::new();
    let plan = ReconcilePlan {
        baselines: vec![BaselineSnapshot::new("legiondb", "/nonexistent/legiondb.sql")],
        ..ReconcilePlan::default()
    };

    let err = reconciler(&catalog, plan)
        .with_baseline(Arc::new(RecordingImport::default()))
        .import_baseline()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("/nonexistent/legiondb.sql"));
}

#[tokio::test]
async fn unreachable_database_is_not_converged() {
    let catalog = MemoryCatalog::new();
    catalog.set_unreachable(true);
    assert!(reconciler(&catalog, ReconcilePlan::default()).is_converged().await.is_err());
}
