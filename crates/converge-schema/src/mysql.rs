//! MySQL catalog backed by a `sqlx` connection pool
//!
//! Identifiers cannot be bound as parameters, so every schema, table and
//! column name passes [`validate_identifier`] before it is quoted into SQL.
//! Values are always bound.
//!
//! Routing rows are written as `(tenant, schema)` pairs. A routing table
//! with any other NOT NULL column lacking a default is rejected with
//! [`CatalogError::UnsupportedTable`] before anything is written.

use crate::catalog::{
    validate_identifier, MigrationLedgerEntry, RoutingTable, SchemaCatalog, SchemaCollation,
    SchemaRoutingRow, TableCollation, TableRef, TenantRecord, TenantTable, UpsertOutcome,
};
use crate::error::{CatalogError, CatalogResult};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Row};
use std::time::Duration;

/// Connection settings
#[derive(Debug, Clone)]
pub struct MySqlSettings {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// Pool size
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,
}

impl MySqlSettings {
    /// Settings with a small pool and a short acquire timeout
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// [`SchemaCatalog`] over a live MySQL server
#[derive(Debug, Clone)]
pub struct MySqlCatalog {
    pool: MySqlPool,
}

impl MySqlCatalog {
    /// Build a pool that connects on first use
    ///
    /// Construction never fails, so the catalog can back a completion
    /// predicate before the database is started.
    #[must_use]
    pub fn connect_lazy(settings: &MySqlSettings) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .charset("utf8mb4");
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_lazy_with(options);
        Self { pool }
    }
}

fn quote(name: &str) -> CatalogResult<String> {
    Ok(format!("`{}`", validate_identifier(name)?))
}

fn qualified(table: &TableRef) -> CatalogResult<String> {
    Ok(format!("{}.{}", quote(&table.schema)?, quote(&table.table)?))
}

fn map_err(context: &'static str) -> impl Fn(sqlx::Error) -> CatalogError {
    move |err| match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CatalogError::Unreachable(err.to_string()),
        _ => CatalogError::query(context, err),
    }
}

#[async_trait]
impl SchemaCatalog for MySqlCatalog {
    async fn ping(&self) -> CatalogResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err("ping"))?;
        Ok(())
    }

    async fn ensure_schema(&self, schema: &str, collation: &SchemaCollation) -> CatalogResult<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err("schema lookup"))?;
        if exists > 0 {
            return Ok(false);
        }

        let ddl = format!(
            "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET {} COLLATE {}",
            quote(schema)?,
            validate_identifier(&collation.charset)?,
            validate_identifier(&collation.collation)?,
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_err("create schema"))?;
        Ok(true)
    }

    async fn table_count(&self, schema: &str) -> CatalogResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err("table count"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn tenants(&self, table: &TenantTable) -> CatalogResult<Vec<TenantRecord>> {
        let optional = |column: &Option<String>| -> CatalogResult<String> {
            match column {
                Some(c) => Ok(format!("CAST({} AS CHAR)", quote(c)?)),
                None => Ok("CAST(NULL AS CHAR)".to_string()),
            }
        };
        let id = quote(&table.id_column)?;
        let sql = format!(
            "SELECT CAST({id} AS CHAR) AS tenant_id, {} AS tenant_name, {} AS tenant_schema \
             FROM {} ORDER BY {id}",
            optional(&table.name_column)?,
            optional(&table.schema_column)?,
            qualified(&table.table)?,
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err("list tenants"))?;
        rows.iter()
            .map(|row| {
                Ok(TenantRecord {
                    id: row.try_get("tenant_id").map_err(map_err("decode tenant"))?,
                    name: row.try_get("tenant_name").map_err(map_err("decode tenant"))?,
                    schema: row.try_get("tenant_schema").map_err(map_err("decode tenant"))?,
                })
            })
            .collect()
    }

    async fn copy_tenant_if_absent(
        &self,
        source: &TenantTable,
        target: &TenantTable,
        tenant_id: &str,
    ) -> CatalogResult<bool> {
        let sql = format!(
            "INSERT INTO {target} SELECT s.* FROM {source} s \
             WHERE s.{source_id} = ? \
             AND NOT EXISTS (SELECT 1 FROM {target} t WHERE t.{target_id} = ?)",
            target = qualified(&target.table)?,
            source = qualified(&source.table)?,
            source_id = quote(&source.id_column)?,
            target_id = quote(&target.id_column)?,
        );
        let result = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(map_err("copy tenant"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn routing_rows(&self, table: &RoutingTable) -> CatalogResult<Vec<SchemaRoutingRow>> {
        let sql = format!(
            "SELECT CAST({tenant} AS CHAR) AS tenant_id, CAST({schema} AS CHAR) AS schema_name \
             FROM {table} ORDER BY {tenant}",
            tenant = quote(&table.tenant_column)?,
            schema = quote(&table.schema_column)?,
            table = qualified(&table.table)?,
        );
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err("list routing rows"))?;
        Ok(rows
            .into_iter()
            .map(|(tenant_id, schema)| SchemaRoutingRow {
                tenant_id,
                schema: schema.unwrap_or_default(),
            })
            .collect())
    }

    async fn upsert_routing_row(
        &self,
        table: &RoutingTable,
        row: &SchemaRoutingRow,
    ) -> CatalogResult<UpsertOutcome> {
        let name = qualified(&table.table)?;
        let tenant = quote(&table.tenant_column)?;
        let schema = quote(&table.schema_column)?;

        let mut tx = self.pool.begin().await.map_err(map_err("begin upsert"))?;
        let current: Vec<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT CAST({schema} AS CHAR) FROM {name} WHERE {tenant} = ? FOR UPDATE"
        ))
        .bind(&row.tenant_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err("read routing row"))?;

        let outcome = match current.as_slice() {
            [existing] if existing.as_deref() == Some(row.schema.as_str()) => UpsertOutcome::Unchanged,
            [_] => {
                sqlx::query(&format!("UPDATE {name} SET {schema} = ? WHERE {tenant} = ?"))
                    .bind(&row.schema)
                    .bind(&row.tenant_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err("update routing row"))?;
                UpsertOutcome::Updated
            }
            rows => {
                let required: Vec<String> = sqlx::query_scalar(
                    "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.COLUMNS \
                     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND IS_NULLABLE = 'NO' \
                     AND COLUMN_DEFAULT IS NULL AND EXTRA NOT LIKE '%auto_increment%' \
                     AND EXTRA NOT LIKE '%GENERATED%' ORDER BY ORDINAL_POSITION",
                )
                .bind(&table.table.schema)
                .bind(&table.table.table)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_err("read routing columns"))?;
                let unfilled = unfilled_columns(table, required);
                if !unfilled.is_empty() {
                    return Err(CatalogError::UnsupportedTable {
                        table: table.table.to_string(),
                        columns: unfilled,
                    });
                }
                if !rows.is_empty() {
                    sqlx::query(&format!("DELETE FROM {name} WHERE {tenant} = ?"))
                        .bind(&row.tenant_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_err("collapse routing rows"))?;
                }
                sqlx::query(&format!("INSERT INTO {name} ({tenant}, {schema}) VALUES (?, ?)"))
                    .bind(&row.tenant_id)
                    .bind(&row.schema)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err("insert routing row"))?;
                if rows.is_empty() {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                }
            }
        };
        tx.commit().await.map_err(map_err("commit upsert"))?;
        Ok(outcome)
    }

    async fn repoint_routing_rows(&self, table: &RoutingTable, schema: &str) -> CatalogResult<u64> {
        let column = quote(&table.schema_column)?;
        let sql = format!(
            "UPDATE {} SET {column} = ? WHERE {column} IS NULL OR {column} <> ?",
            qualified(&table.table)?
        );
        let result = sqlx::query(&sql)
            .bind(schema)
            .bind(schema)
            .execute(&self.pool)
            .await
            .map_err(map_err("repoint routing rows"))?;
        Ok(result.rows_affected())
    }

    async fn default_collation(&self, schema: &str) -> CatalogResult<SchemaCollation> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT CAST(DEFAULT_CHARACTER_SET_NAME AS CHAR), CAST(DEFAULT_COLLATION_NAME AS CHAR) \
             FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err("default collation"))?;
        let (charset, collation) =
            row.ok_or_else(|| CatalogError::query("default collation", format!("schema {schema} not found")))?;
        Ok(SchemaCollation { charset, collation })
    }

    async fn tables_with_foreign_collation(&self, schema: &str) -> CatalogResult<Vec<TableCollation>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT CAST(t.TABLE_NAME AS CHAR), CAST(t.TABLE_COLLATION AS CHAR) \
             FROM information_schema.TABLES t \
             JOIN information_schema.SCHEMATA s ON s.SCHEMA_NAME = t.TABLE_SCHEMA \
             WHERE t.TABLE_SCHEMA = ? AND t.TABLE_TYPE = 'BASE TABLE' \
             AND t.TABLE_COLLATION <> s.DEFAULT_COLLATION_NAME \
             ORDER BY t.TABLE_NAME",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err("collation scan"))?;
        Ok(rows
            .into_iter()
            .map(|(table, collation)| TableCollation { table, collation })
            .collect())
    }

    async fn convert_table_collation(
        &self,
        schema: &str,
        table: &str,
        target: &SchemaCollation,
    ) -> CatalogResult<()> {
        let ddl = format!(
            "ALTER TABLE {}.{} CONVERT TO CHARACTER SET {} COLLATE {}",
            quote(schema)?,
            quote(table)?,
            validate_identifier(&target.charset)?,
            validate_identifier(&target.collation)?,
        );
        let mut conn = self.pool.acquire().await.map_err(map_err("acquire"))?;
        raw_execute(&mut *conn, "SET FOREIGN_KEY_CHECKS = 0")
            .await
            .map_err(map_err("disable foreign key checks"))?;
        let converted = raw_execute(&mut *conn, &ddl).await;
        raw_execute(&mut *conn, "SET FOREIGN_KEY_CHECKS = 1")
            .await
            .map_err(map_err("enable foreign key checks"))?;
        converted.map_err(map_err("convert collation"))?;
        Ok(())
    }

    async fn ledger_entries(&self, ledger: &TableRef) -> CatalogResult<Vec<MigrationLedgerEntry>> {
        let sql = format!(
            "SELECT CAST(installed_rank AS SIGNED) AS installed_rank, \
             CAST(version AS CHAR) AS version, CAST(description AS CHAR) AS description, \
             CAST(script AS CHAR) AS script, CAST(success AS SIGNED) AS success, installed_on \
             FROM {} ORDER BY installed_rank",
            qualified(ledger)?
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err("read ledger"))?;
        rows.iter()
            .map(|row| {
                let decode = map_err("decode ledger entry");
                let success: i64 = row.try_get("success").map_err(&decode)?;
                let description: Option<String> = row.try_get("description").map_err(&decode)?;
                Ok(MigrationLedgerEntry {
                    installed_rank: row.try_get("installed_rank").map_err(&decode)?,
                    version: row.try_get("version").map_err(&decode)?,
                    description: description.unwrap_or_default(),
                    script: row.try_get("script").map_err(&decode)?,
                    success: success != 0,
                    installed_on: row
                        .try_get::<Option<NaiveDateTime>, _>("installed_on")
                        .map_err(&decode)?,
                })
            })
            .collect()
    }

    async fn mark_ledger_success(&self, ledger: &TableRef, installed_rank: i64) -> CatalogResult<()> {
        let sql = format!(
            "UPDATE {} SET success = 1 WHERE installed_rank = ?",
            qualified(ledger)?
        );
        sqlx::query(&sql)
            .bind(installed_rank)
            .execute(&self.pool)
            .await
            .map_err(map_err("mark ledger success"))?;
        Ok(())
    }

    async fn execute_script(&self, schema: &str, sql: &str) -> CatalogResult<()> {
        let use_schema = format!("USE {}", quote(schema)?);
        // Detached: `USE` changes session state the pool must not hand out again.
        let mut conn = self.pool.acquire().await.map_err(map_err("acquire"))?.detach();
        let result = run_in_schema(&mut conn, &use_schema, sql).await;
        if let Err(err) = conn.close().await {
            tracing::debug!("Closing script connection failed: {}", err);
        }
        result
    }
}

/// Runs `sql` via `sqlx::raw_sql` on `conn`, boxed so the future has a concrete
/// lifetime (works around higher-ranked `Executor` inference in `async_trait`).
fn raw_execute<'a>(
    conn: &'a mut MySqlConnection,
    sql: &'a str,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<sqlx::mysql::MySqlQueryResult, sqlx::Error>> + Send + 'a>,
> {
    sqlx::Executor::execute(conn, sqlx::raw_sql(sql))
}

async fn run_in_schema(conn: &mut MySqlConnection, use_schema: &str, sql: &str) -> CatalogResult<()> {
    raw_execute(&mut *conn, use_schema)
        .await
        .map_err(map_err("select schema"))?;
    raw_execute(&mut *conn, sql)
        .await
        .map_err(|e| CatalogError::Script(e.to_string()))?;
    Ok(())
}

/// Required columns the routing upsert does not fill
fn unfilled_columns(table: &RoutingTable, required: Vec<String>) -> Vec<String> {
    required
        .into_iter()
        .filter(|c| {
            !c.eq_ignore_ascii_case(&table.tenant_column) && !c.eq_ignore_ascii_case(&table.schema_column)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(
            qualified(&TableRef::new("legiondb", "flyway_schema_history")).unwrap(),
            "`legiondb`.`flyway_schema_history`"
        );
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        assert!(quote("users`; DROP TABLE x").is_err());
        assert!(quote("").is_err());
    }

    #[test]
    fn io_errors_are_unreachable() {
        let err = map_err("ping")(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CatalogError::Unreachable(_)));
        let err = map_err("ping")(sqlx::Error::RowNotFound);
        assert!(matches!(err, CatalogError::Query { .. }));
    }

    #[tokio::test]
    async fn lazy_pool_reports_unreachable_server() {
        let mut settings = MySqlSettings::new("127.0.0.1", 1, "nobody", "");
        settings.acquire_timeout = Duration::from_millis(500);
        let catalog = MySqlCatalog::connect_lazy(&settings);
        assert!(catalog.ping().await.is_err());
    }

    fn routing_table() -> RoutingTable {
        RoutingTable {
            table: TableRef::new("legiondb0", "EnterpriseSchema"),
            tenant_column: "enterpriseId".to_string(),
            schema_column: "schemaName".to_string(),
            mode: crate::catalog::RoutingMode::Canonical {
                schema: "legiondb".to_string(),
            },
        }
    }

    #[test]
    fn routing_columns_are_not_reported_as_unfilled() {
        let required = vec!["ENTERPRISEID".to_string(), "schemaName".to_string()];
        assert!(unfilled_columns(&routing_table(), required).is_empty());
    }

    #[test]
    fn other_required_columns_are_reported() {
        let required = vec!["enterpriseId".to_string(), "createdBy".to_string()];
        assert_eq!(unfilled_columns(&routing_table(), required), vec!["createdBy".to_string()]);
    }

    /// Server for the ignored tests: `CONVERGE_TEST_MYSQL_HOST`, `_PORT`, `_USER`, `_PASSWORD`
    fn live_settings() -> MySqlSettings {
        let var = |name: &str, default: &str| {
            std::env::var(format!("CONVERGE_TEST_MYSQL_{name}")).unwrap_or_else(|_| default.to_string())
        };
        let mut settings = MySqlSettings::new(
            var("HOST", "127.0.0.1"),
            var("PORT", "3306").parse().unwrap(),
            var("USER", "root"),
            var("PASSWORD", ""),
        );
        settings.max_connections = 1;
        settings
    }

    #[tokio::test]
    #[ignore] // needs a MySQL server; run with: cargo test -- --ignored
    async fn script_schema_does_not_leak_into_the_pool() {
        let catalog = MySqlCatalog::connect_lazy(&live_settings());
        catalog.ensure_schema("converge_script_test", &SchemaCollation::default()).await.unwrap();

        catalog
            .execute_script("converge_script_test", "CREATE TABLE IF NOT EXISTS marker (id INT)")
            .await
            .unwrap();

        let current: Option<String> = sqlx::query_scalar("SELECT CAST(DATABASE() AS CHAR)")
            .fetch_one(&catalog.pool)
            .await
            .unwrap();
        assert_eq!(current, None);
    }

    #[tokio::test]
    #[ignore] // needs a MySQL server; run with: cargo test -- --ignored
    async fn routing_table_with_extra_required_column_is_rejected() {
        let catalog = MySqlCatalog::connect_lazy(&live_settings());
        catalog.ensure_schema("legiondb0", &SchemaCollation::default()).await.unwrap();
        sqlx::raw_sql(
            "DROP TABLE IF EXISTS `legiondb0`.`EnterpriseSchema`; \
             CREATE TABLE `legiondb0`.`EnterpriseSchema` \
             (enterpriseId VARCHAR(64) NOT NULL, schemaName VARCHAR(64), createdBy VARCHAR(64) NOT NULL)",
        )
        .execute(&catalog.pool)
        .await
        .unwrap();

        let row = SchemaRoutingRow {
            tenant_id: "acme".to_string(),
            schema: "legiondb".to_string(),
        };
        let err = catalog.upsert_routing_row(&routing_table(), &row).await.unwrap_err();

        assert!(matches!(&err, CatalogError::UnsupportedTable { columns, .. } if columns == &["createdBy"]));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM `legiondb0`.`EnterpriseSchema`")
            .fetch_one(&catalog.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
