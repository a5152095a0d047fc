//! Operator settings
//!
//! The settings file is YAML. Before it is mapped onto typed structs, `~` is
//! expanded in every string and `${section.key}` references are substituted
//! from the same tree until no reference remains. A string that is exactly
//! one reference takes the referenced value with its type, so
//! `port: ${services.mysql.port}` stays a number.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = Settings::load("converge.yaml")?;
//! for (name, repo) in &settings.repositories {
//!     println!("{name}: {}", repo.path.display());
//! }
//! ```

use crate::error::{ConfigResult, SettingsError};
use crate::patch::{ManagedKeys, Patch};
use crate::KeyPath;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `database.password`
pub const DB_PASSWORD_ENV: &str = "CONVERGE_DB_PASSWORD";

const MAX_RESOLVE_PASSES: usize = 10;

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("reference regex is valid"));

/// Root of the operator settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Workspace directories
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    /// Tools that must be on `PATH`
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteSettings>,
    /// Source repositories, cloned in order
    #[serde(default)]
    pub repositories: IndexMap<String, RepositorySettings>,
    /// Auxiliary services, started in order
    #[serde(default)]
    pub services: IndexMap<String, ServiceSettings>,
    /// Database convergence
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    /// Templated configuration and its derived artifact
    #[serde(default)]
    pub config: Option<TemplateSettings>,
    /// Build commands and their outputs
    #[serde(default)]
    pub build: BuildSettings,
    /// Post-build readiness wait
    #[serde(default)]
    pub readiness: Option<ReadinessSettings>,
}

impl Settings {
    /// Read, resolve and validate a settings file
    ///
    /// # Errors
    /// [`SettingsError`] for IO, parse, reference or validation failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_yaml_str(&text)?;
        if let Ok(password) = std::env::var(DB_PASSWORD_ENV) {
            if let Some(db) = settings.database.as_mut() {
                db.password = password;
            }
        }
        Ok(settings)
    }

    /// Resolve and validate settings from YAML text
    ///
    /// # Errors
    /// [`SettingsError`] for parse, reference or validation failures.
    pub fn from_yaml_str(text: &str) -> Result<Self, SettingsError> {
        let raw: Value = serde_yaml::from_str(text).map_err(|e| SettingsError::Parse(e.to_string()))?;
        let raw = match raw {
            Value::Null => Value::Mapping(serde_yaml::Mapping::new()),
            other => other,
        };
        let expanded = expand_tilde(raw, home_dir().as_deref());
        let resolved = resolve_references(expanded)?;
        let settings: Self =
            serde_yaml::from_value(resolved).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        for (name, repo) in &self.repositories {
            if repo.url.trim().is_empty() {
                return Err(SettingsError::Validation(format!("repository {name} has no url")));
            }
        }
        for (name, service) in &self.services {
            if service.port == 0 {
                return Err(SettingsError::Validation(format!("service {name} has port 0")));
            }
        }
        if let Some(db) = &self.database {
            db.validate()?;
        }
        if let Some(config) = &self.config {
            config.patches().map_err(|e| SettingsError::Validation(e.to_string()))?;
        }
        if let Some(readiness) = &self.readiness {
            if readiness.poll_interval_secs == 0 {
                return Err(SettingsError::Validation(
                    "readiness.poll_interval_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Workspace layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Root of the development workspace
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    /// Backups of patched documents; defaults under the root
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Run logs and reports; defaults under the root
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl WorkspaceSettings {
    /// Effective backup directory
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".converge").join("backups"))
    }

    /// Effective log directory
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".converge").join("logs"))
    }
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            backup_dir: None,
            log_dir: None,
        }
    }
}

/// External command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Kill the command after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// Command with no arguments
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: IndexMap::new(),
            timeout_secs: None,
        }
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set working directory
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A tool that must be available on `PATH`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrerequisiteSettings {
    /// Display name
    pub name: String,
    /// Executable looked up on `PATH`; defaults to the name
    #[serde(default)]
    pub command: Option<String>,
    /// How to install it when missing
    #[serde(default)]
    pub install: Option<CommandSpec>,
}

impl PrerequisiteSettings {
    /// Executable name to look up
    #[must_use]
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }
}

/// A source repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Clone URL
    pub url: String,
    /// Checkout location
    pub path: PathBuf,
    /// Branch to check out
    #[serde(default)]
    pub branch: Option<String>,
    /// Clone timeout in seconds
    #[serde(default = "default_clone_timeout")]
    pub timeout_secs: u64,
    /// Initialize submodules after cloning
    #[serde(default)]
    pub submodules: bool,
}

/// An auxiliary service reachable on a TCP port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Host to probe
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to probe
    pub port: u16,
    /// Command that starts the service
    #[serde(default)]
    pub start: Option<CommandSpec>,
    /// A failing optional service does not fail the stage
    #[serde(default)]
    pub optional: bool,
    /// Seconds to wait for the port after starting
    #[serde(default = "default_service_wait")]
    pub wait_secs: u64,
}

/// How failed ledger entries are handled when their script cannot be re-run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerPolicySetting {
    /// Stop with an error
    FailFast,
    /// Mark the entry successful and emit a warning
    #[default]
    Unblock,
}

/// Routing semantics for one managed routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingModeSettings {
    /// Every row points at one schema
    Canonical {
        /// Schema all rows must reference
        schema: String,
    },
    /// Each tenant points at the schema holding its data
    PerTenant {
        /// Used when the tenant record carries no schema
        default_schema: String,
    },
}

/// One managed routing table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTableSettings {
    /// `schema.table`
    pub table: String,
    /// Column holding the tenant id
    #[serde(default = "default_tenant_column")]
    pub tenant_column: String,
    /// Column holding the physical schema name
    #[serde(default = "default_schema_column")]
    pub schema_column: String,
    /// Routing semantics
    #[serde(flatten)]
    pub mode: RoutingModeSettings,
}

/// Legacy and canonical tenant tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRegistrySettings {
    /// `schema.table` tenants are copied from
    pub source: String,
    /// `schema.table` tenants are copied into
    pub target: String,
    /// Tenant id column
    #[serde(default = "default_tenant_column")]
    pub id_column: String,
    /// Optional display name column
    #[serde(default)]
    pub name_column: Option<String>,
    /// Optional column naming the tenant's physical schema
    #[serde(default)]
    pub schema_column: Option<String>,
}

/// Database connection and convergence targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Server host
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// User name
    pub user: String,
    /// Password; overridden by `CONVERGE_DB_PASSWORD`
    #[serde(default)]
    pub password: String,
    /// Schemas that must exist
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Snapshot file per schema for the baseline import
    #[serde(default)]
    pub baseline: IndexMap<String, PathBuf>,
    /// Client used for baseline import
    #[serde(default = "default_mysql_client")]
    pub client: String,
    /// Tenant registry migration
    #[serde(default)]
    pub tenant_registry: Option<TenantRegistrySettings>,
    /// Managed routing tables
    #[serde(default)]
    pub routing_tables: Vec<RoutingTableSettings>,
    /// Migration ledgers as `schema.table`
    #[serde(default)]
    pub ledgers: Vec<String>,
    /// Directories searched for migration scripts
    #[serde(default)]
    pub script_dirs: Vec<PathBuf>,
    /// Failed ledger entry handling
    #[serde(default)]
    pub ledger_policy: LedgerPolicySetting,
}

impl DatabaseSettings {
    fn validate(&self) -> Result<(), SettingsError> {
        let qualified = |what: &str, name: &str| {
            let ok = name
                .split_once('.')
                .is_some_and(|(schema, table)| !schema.is_empty() && !table.is_empty() && !table.contains('.'));
            if ok {
                Ok(())
            } else {
                Err(SettingsError::Validation(format!("{what} must be schema.table, got '{name}'")))
            }
        };
        for ledger in &self.ledgers {
            qualified("ledger", ledger)?;
        }
        for routing in &self.routing_tables {
            qualified("routing table", &routing.table)?;
        }
        if let Some(registry) = &self.tenant_registry {
            qualified("tenant registry source", &registry.source)?;
            qualified("tenant registry target", &registry.target)?;
        }
        Ok(())
    }
}

/// One patch from settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    /// Fix tag
    pub tag: String,
    /// Dotted key path
    pub key: String,
    /// Desired value
    pub value: Value,
    /// Regex over the document text that also means "already applied"
    #[serde(default)]
    pub marker: Option<String>,
    /// Values the template ships with
    #[serde(default)]
    pub template_defaults: Vec<Value>,
}

/// Templated document, derived artifact and patches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Template file patched in place
    pub template: PathBuf,
    /// Artifact rendered from the template
    pub artifact: PathBuf,
    /// Render step
    #[serde(default)]
    pub render: Option<CommandSpec>,
    /// Extra managed key prefixes
    #[serde(default)]
    pub managed_keys: Vec<String>,
    /// Patches applied before configuration-dependent stages
    #[serde(default)]
    pub patches: Vec<PatchSettings>,
}

impl TemplateSettings {
    /// Managed key set: defaults plus configured prefixes
    ///
    /// # Errors
    /// [`crate::ConfigError::InvalidKeyPath`] for a malformed prefix.
    pub fn managed_keys(&self) -> ConfigResult<ManagedKeys> {
        let extra = self
            .managed_keys
            .iter()
            .map(|k| KeyPath::parse(k))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(ManagedKeys::default().with(extra))
    }

    /// Build the configured patches
    ///
    /// # Errors
    /// [`crate::ConfigError`] when a key is invalid or unmanaged, or a marker does not compile.
    pub fn patches(&self) -> ConfigResult<Vec<Patch>> {
        let managed = self.managed_keys()?;
        self.patches
            .iter()
            .map(|spec| {
                let mut patch = Patch::new(&spec.tag, &spec.key, spec.value.clone(), &managed)?
                    .with_template_defaults(spec.template_defaults.clone());
                if let Some(marker) = &spec.marker {
                    patch = patch.with_marker(marker)?;
                }
                Ok(patch)
            })
            .collect()
    }
}

/// A build command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    /// Display name
    pub name: String,
    /// Command to run
    #[serde(flatten)]
    pub command: CommandSpec,
    /// Failure is logged but does not fail the stage
    #[serde(default)]
    pub optional: bool,
}

/// Build commands and the files they produce
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Commands, run in order
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    /// Files whose presence means the build is done
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

/// Readiness wait after the build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSettings {
    /// Health endpoint polled with GET
    #[serde(default)]
    pub health_url: Option<String>,
    /// Application log tailed for markers
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Lines that mean startup completed
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    /// Seconds between health polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Give up after this many seconds
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    /// Seconds between progress reports
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
}

fn default_workspace_root() -> PathBuf {
    home_dir().map_or_else(|| PathBuf::from("workspace"), |home| home.join("Development"))
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_clone_timeout() -> u64 {
    1800
}

fn default_service_wait() -> u64 {
    120
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_client() -> String {
    "mysql".to_string()
}

fn default_tenant_column() -> String {
    "enterpriseId".to_string()
}

fn default_schema_column() -> String {
    "schemaName".to_string()
}

fn default_markers() -> Vec<String> {
    vec![
        "Started Application".to_string(),
        "Tomcat started on port".to_string(),
        "Started SpringWebServer".to_string(),
    ]
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_wait() -> u64 {
    600
}

fn default_progress_interval() -> u64 {
    30
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~` in every string of the tree
#[must_use]
pub fn expand_tilde(value: Value, home: Option<&Path>) -> Value {
    let Some(home) = home else {
        return value;
    };
    match value {
        Value::String(s) if s == "~" => Value::String(home.display().to_string()),
        Value::String(s) => match s.strip_prefix("~/") {
            Some(rest) => Value::String(home.join(rest).display().to_string()),
            None => Value::String(s),
        },
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(|v| expand_tilde(v, Some(home))).collect())
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, expand_tilde(v, Some(home))))
                .collect(),
        ),
        other => other,
    }
}

/// Substitute `${a.b}` references until none remain
///
/// # Errors
/// [`SettingsError::UnresolvedReference`] for a missing key,
/// [`SettingsError::ReferenceCycle`] when passes stop making progress.
pub fn resolve_references(root: Value) -> Result<Value, SettingsError> {
    let mut current = root;
    for _ in 0..MAX_RESOLVE_PASSES {
        if !contains_reference(&current) {
            return Ok(current);
        }
        current = substitute(&current, &current)?;
    }
    if contains_reference(&current) {
        return Err(SettingsError::ReferenceCycle(MAX_RESOLVE_PASSES));
    }
    Ok(current)
}

fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => REFERENCE.is_match(s),
        Value::Sequence(items) => items.iter().any(contains_reference),
        Value::Mapping(map) => map.values().any(contains_reference),
        _ => false,
    }
}

fn substitute(value: &Value, root: &Value) -> Result<Value, SettingsError> {
    Ok(match value {
        Value::String(s) => substitute_str(s, root)?,
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(|v| substitute(v, root))
                .collect::<Result<_, _>>()?,
        ),
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, root)?)))
                .collect::<Result<_, SettingsError>>()?,
        ),
        other => other.clone(),
    })
}

fn substitute_str(text: &str, root: &Value) -> Result<Value, SettingsError> {
    if let Some(caps) = REFERENCE.captures(text) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == text.len()) {
            return lookup(root, &caps[1]).cloned();
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        match lookup(root, &caps[1])? {
            Value::String(s) => out.push_str(s),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(&b.to_string()),
            _ => {
                return Err(SettingsError::Validation(format!(
                    "${{{}}} is not a scalar and cannot be embedded in text",
                    &caps[1]
                )))
            }
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(root: &'a Value, name: &str) -> Result<&'a Value, SettingsError> {
    let mut current = root;
    for segment in name.trim().split('.') {
        current = match current {
            Value::Mapping(map) => map.get(segment),
            _ => None,
        }
        .ok_or_else(|| SettingsError::UnresolvedReference(name.to_string()))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
workspace:
  root: /work/legion
repositories:
  enterprise:
    url: git@github.com:example/enterprise.git
    path: ${workspace.root}/code/enterprise
services:
  mysql:
    port: 3306
  elasticsearch:
    port: 9200
    start:
      program: docker
      args: [start, elasticsearch]
database:
  user: legion
  port: ${services.mysql.port}
  schemas: [legiondb, legiondb0]
  routing_tables:
    - table: legiondb0.EnterpriseSchema
      mode: canonical
      schema: legiondb
    - table: legiondb.EnterpriseSchema
      mode: per_tenant
      default_schema: legiondb
  ledgers: [legiondb.flyway_schema_history]
config:
  template: ${repositories.enterprise.path}/config/local.values.yml
  artifact: ${repositories.enterprise.path}/config/target/application.yml
  patches:
    - tag: cache-timeout
      key: cache.timeout
      value: 60
"#;

    #[test]
    fn sample_resolves_and_defaults_apply() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        let repo = &settings.repositories["enterprise"];
        assert_eq!(repo.path, PathBuf::from("/work/legion/code/enterprise"));
        assert_eq!(repo.timeout_secs, 1800);

        let db = settings.database.as_ref().unwrap();
        assert_eq!(db.port, 3306);
        assert_eq!(db.host, "localhost");
        assert_eq!(db.ledger_policy, LedgerPolicySetting::Unblock);
        assert_eq!(
            db.routing_tables[0].mode,
            RoutingModeSettings::Canonical {
                schema: "legiondb".into()
            }
        );

        let config = settings.config.as_ref().unwrap();
        assert_eq!(
            config.template,
            PathBuf::from("/work/legion/code/enterprise/config/local.values.yml")
        );
        assert_eq!(config.patches().unwrap().len(), 1);
        assert_eq!(
            settings.workspace.backup_dir(),
            PathBuf::from("/work/legion/.converge/backups")
        );
    }

    #[test]
    fn services_keep_file_order() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        let names: Vec<&str> = settings.services.keys().map(String::as_str).collect();
        assert_eq!(names, ["mysql", "elasticsearch"]);
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let err = Settings::from_yaml_str("workspace:\n  root: ${nowhere.root}\n").unwrap_err();
        assert!(matches!(err, SettingsError::UnresolvedReference(name) if name == "nowhere.root"));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let raw: Value = serde_yaml::from_str("a: ${b}\nb: ${a}\n").unwrap();
        assert!(matches!(
            resolve_references(raw),
            Err(SettingsError::ReferenceCycle(_))
        ));
    }

    #[test]
    fn chained_references_resolve() {
        let raw: Value = serde_yaml::from_str("a: x\nb: ${a}/y\nc: ${b}/z\n").unwrap();
        let resolved = resolve_references(raw).unwrap();
        assert_eq!(resolved["c"], Value::from("x/y/z"));
    }

    #[test]
    fn tilde_expands_against_home() {
        let raw: Value = serde_yaml::from_str("root: ~/dev\nother: a~b\nhome: \"~\"\n").unwrap();
        let expanded = expand_tilde(raw, Some(Path::new("/home/dev")));
        assert_eq!(expanded["root"], Value::from("/home/dev/dev"));
        assert_eq!(expanded["other"], Value::from("a~b"));
        assert_eq!(expanded["home"], Value::from("/home/dev"));
    }

    #[test]
    fn unmanaged_patch_fails_validation() {
        let text = "config:\n  template: a.yml\n  artifact: b.yml\n  patches:\n    - tag: port\n      key: server.port\n      value: 1\n";
        assert!(matches!(
            Settings::from_yaml_str(text),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn bad_table_name_fails_validation() {
        let text = "database:\n  user: root\n  ledgers: [flyway_schema_history]\n";
        assert!(matches!(
            Settings::from_yaml_str(text),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn zero_readiness_poll_interval_fails_validation() {
        let text = "readiness:\n  health_url: http://localhost:8080/health\n  poll_interval_secs: 0\n";
        let err = Settings::from_yaml_str(text).unwrap_err();
        assert!(matches!(&err, SettingsError::Validation(msg) if msg.contains("poll_interval_secs")));
    }
}
