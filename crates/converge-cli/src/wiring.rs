//! Settings to stage plan
//!
//! Each stage gets the action that does its work and the predicate that
//! recognises it as done, so a second run against a converged machine only
//! evaluates predicates.

use anyhow::Context;
use converge_config::settings::{
    DatabaseSettings, LedgerPolicySetting, ReadinessSettings, RoutingModeSettings,
    TenantRegistrySettings,
};
use converge_config::{BackupStore, Settings};
use converge_kernel::actions::{CommandStep, Prerequisite, Repository, Service};
use converge_kernel::prelude::*;
use converge_kernel::CommandRender;
use converge_monitor::ReadinessConfig;
use converge_schema::{
    BaselineSnapshot, LedgerPolicy, MySqlCatalog, MySqlSettings, MysqlClientImport, ReconcilePlan,
    Reconciler, RoutingMode, RoutingTable, SchemaCatalog, SchemaCollation, ScriptLocator,
    TableRef, TenantMigration, TenantTable,
};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the sequencer needs
#[derive(Debug)]
pub(crate) struct Wiring {
    pub(crate) plan: StagePlan,
    pub(crate) config: Option<Arc<ConfigConvergence>>,
}

/// Build the stage plan and configuration convergence from settings
pub(crate) fn build(settings: &Settings) -> anyhow::Result<Wiring> {
    let database = settings.database.as_ref().map(connect_database).transpose()?;
    let config = settings
        .config
        .as_ref()
        .map(|template| -> anyhow::Result<_> {
            let patches = template.patches().context("building configuration patches")?;
            let mut convergence = ConfigConvergence::new(
                &template.template,
                &template.artifact,
                patches,
                BackupStore::in_dir(settings.workspace.backup_dir()),
            );
            if let Some(render) = &template.render {
                convergence = convergence.with_render(Arc::new(CommandRender::new(render.clone())));
            }
            Ok(Arc::new(convergence))
        })
        .transpose()?;

    let prerequisites: Vec<Prerequisite> = settings
        .prerequisites
        .iter()
        .map(|p| Prerequisite {
            name: p.name.clone(),
            command: p.command().to_string(),
            install: p.install.clone(),
        })
        .collect();
    let repositories: Vec<Repository> = settings
        .repositories
        .iter()
        .map(|(name, repo)| Repository {
            name: name.clone(),
            url: repo.url.clone(),
            path: repo.path.clone(),
            branch: repo.branch.clone(),
            timeout: Duration::from_secs(repo.timeout_secs),
            submodules: repo.submodules,
        })
        .collect();
    let services: Vec<Service> = settings
        .services
        .iter()
        .map(|(name, service)| Service {
            name: name.clone(),
            host: service.host.clone(),
            port: service.port,
            start: service.start.clone(),
            optional: service.optional,
            wait: Duration::from_secs(service.wait_secs),
        })
        .collect();

    let mut directories = vec![
        settings.workspace.root.clone(),
        settings.workspace.backup_dir(),
        settings.workspace.log_dir(),
    ];
    directories.extend(
        repositories
            .iter()
            .filter_map(|r| r.path.parent().map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty()),
    );
    directories.dedup();

    let mut validate = ValidateEnvironment::new()
        .directories(directories)
        .prerequisites(prerequisites.clone());
    for service in &services {
        validate = validate.port(&service.name, &service.host, service.port);
    }

    let service_checks: Vec<Arc<dyn CompletionPredicate>> = services
        .iter()
        .map(|s| Arc::new(TcpReachable::new(&s.host, s.port)) as Arc<dyn CompletionPredicate>)
        .collect();
    let cloned = PathExists::new(repositories.iter().map(|r| r.path.join(".git")));
    let installed = CommandsAvailable::new(prerequisites.iter().map(|p| p.command.clone()));
    let built = PathExists::new(settings.build.outputs.iter().cloned());

    let mut verify_checks = service_checks.clone();
    if !settings.build.outputs.is_empty() {
        verify_checks.push(Arc::new(built.clone()));
    }
    if let Some(template) = &settings.config {
        verify_checks.push(Arc::new(PathExists::new([template.artifact.clone()])));
    }

    let mut plan = StagePlan::builder()
        .stage(Stage::new(StageId::Validate, Arc::new(validate)))
        .stage(
            Stage::new(StageId::InstallPrerequisites, Arc::new(InstallPrerequisites::new(prerequisites)))
                .depends_on([StageId::Validate])
                .completed_when(Arc::new(installed)),
        )
        .stage(
            Stage::new(StageId::AcquireRepositories, Arc::new(CloneRepositories::new(repositories)))
                .depends_on([StageId::Validate])
                .completed_when(Arc::new(cloned)),
        )
        .stage(
            Stage::new(StageId::StartServices, Arc::new(StartServices::new(services)))
                .depends_on([StageId::Validate])
                .completed_when(Arc::new(AllOf::new(service_checks))),
        );

    if let Some((catalog, reconciler)) = database {
        verify_checks.push(Arc::new(DatabaseReachable::new(catalog, "database")));
        plan = plan.stage(
            Stage::new(StageId::ConvergeDatabase, Arc::new(ConvergeDatabase::new(Arc::clone(&reconciler))))
                .depends_on([StageId::StartServices])
                .completed_when(Arc::new(DatabaseConverged::new(reconciler)))
                .remediation(format!(
                    "check the database credentials (or {}) and run: converge --resume-from {}",
                    converge_config::settings::DB_PASSWORD_ENV,
                    StageId::ConvergeDatabase
                )),
        );
    }

    let build_steps: Vec<CommandStep> = settings
        .build
        .steps
        .iter()
        .map(|step| CommandStep {
            name: step.name.clone(),
            command: step.command.clone(),
            optional: step.optional,
        })
        .collect();
    let mut build = Stage::new(StageId::BuildArtifacts, Arc::new(BuildArtifacts::new(build_steps)))
        .depends_on([StageId::AcquireRepositories])
        .needs_config();
    if !settings.build.outputs.is_empty() {
        build = build.completed_when(Arc::new(built));
    }

    let plan = plan
        .stage(build)
        .stage(
            Stage::new(StageId::Verify, Arc::new(VerifyEnvironment::new(verify_checks)))
                .depends_on([StageId::BuildArtifacts]),
        )
        .build()?;

    Ok(Wiring { plan, config })
}

fn connect_database(db: &DatabaseSettings) -> anyhow::Result<(Arc<dyn SchemaCatalog>, Arc<Reconciler>)> {
    let catalog: Arc<dyn SchemaCatalog> = Arc::new(MySqlCatalog::connect_lazy(&MySqlSettings::new(
        &db.host,
        db.port,
        &db.user,
        &db.password,
    )));

    let routing_tables = db
        .routing_tables
        .iter()
        .map(|t| -> anyhow::Result<RoutingTable> {
            Ok(RoutingTable {
                table: table_ref(&t.table)?,
                tenant_column: t.tenant_column.clone(),
                schema_column: t.schema_column.clone(),
                mode: match &t.mode {
                    RoutingModeSettings::Canonical { schema } => RoutingMode::Canonical {
                        schema: schema.clone(),
                    },
                    RoutingModeSettings::PerTenant { default_schema } => RoutingMode::PerTenant {
                        default_schema: default_schema.clone(),
                    },
                },
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let plan = ReconcilePlan {
        schemas: db.schemas.clone(),
        collation: SchemaCollation::default(),
        baselines: db
            .baseline
            .iter()
            .map(|(schema, path)| BaselineSnapshot::new(schema, path))
            .collect(),
        tenant_registry: db.tenant_registry.as_ref().map(tenant_migration).transpose()?,
        routing_tables,
        ledgers: db
            .ledgers
            .iter()
            .map(|l| table_ref(l))
            .collect::<anyhow::Result<Vec<_>>>()?,
        ledger_policy: match db.ledger_policy {
            LedgerPolicySetting::FailFast => LedgerPolicy::FailFast,
            LedgerPolicySetting::Unblock => LedgerPolicy::Unblock,
        },
    };

    let reconciler = Reconciler::new(Arc::clone(&catalog), plan)
        .with_scripts(ScriptLocator::new(db.script_dirs.iter().cloned()))
        .with_baseline(Arc::new(MysqlClientImport::new(
            &db.client,
            &db.host,
            db.port,
            &db.user,
            &db.password,
        )));
    Ok((catalog, Arc::new(reconciler)))
}

fn tenant_migration(registry: &TenantRegistrySettings) -> anyhow::Result<TenantMigration> {
    let table = |name: &str| -> anyhow::Result<TenantTable> {
        Ok(TenantTable {
            table: table_ref(name)?,
            id_column: registry.id_column.clone(),
            name_column: registry.name_column.clone(),
            schema_column: registry.schema_column.clone(),
        })
    };
    Ok(TenantMigration {
        source: table(&registry.source)?,
        target: table(&registry.target)?,
    })
}

fn table_ref(name: &str) -> anyhow::Result<TableRef> {
    TableRef::parse(name).with_context(|| format!("invalid table name '{name}'"))
}

/// Monitor settings from the readiness section
pub(crate) fn readiness(settings: &ReadinessSettings) -> ReadinessConfig {
    ReadinessConfig {
        health_url: settings.health_url.clone(),
        log_file: settings.log_file.clone(),
        markers: settings.markers.clone(),
        poll_interval: Duration::from_secs(settings.poll_interval_secs),
        max_wait: Duration::from_secs(settings.max_wait_secs),
        progress_interval: Duration::from_secs(settings.progress_interval_secs),
    }
}
