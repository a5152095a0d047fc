//! Configuration convergence
//!
//! Patches a templated YAML document in place, keeps timestamped backups of
//! every mutation and decides when the artifact rendered from that document
//! is stale. Also loads the operator settings that drive the whole run.
//!
//! # Architecture
//!
//! ```text
//! template ──load──► ConfigDocument ──Patcher::apply──► PatchOutcome
//!                         │                  │
//!                         │            BackupStore (pre-mutation bytes)
//!                         ▼                  ▼
//!                       save()        RegenerationGate::record
//!                                            │
//!                               needs_regeneration(template, artifact)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use converge_config::prelude::*;
//!
//! let mut doc = ConfigDocument::load(&template)?;
//! let mut patcher = Patcher::new(BackupStore::in_dir(&backups));
//! let mut gate = RegenerationGate::new();
//! for patch in &patches {
//!     gate.record(&patcher.apply_and_save(&mut doc, patch)?);
//! }
//! if gate.needs_regeneration(&template, &artifact)? {
//!     // run the render step, then
//!     gate.mark_rendered();
//! }
//! ```

pub mod backup;
pub mod document;
pub mod error;
pub mod gate;
pub mod patch;
pub mod settings;

pub use backup::BackupStore;
pub use document::{ConfigDocument, KeyPath};
pub use error::{ConfigError, ConfigResult, SettingsError};
pub use gate::{RegenerationGate, RegenerationReason};
pub use patch::{ManagedKeys, Patch, PatchOutcome, PatchPreview, Patcher, DEFAULT_MANAGED_KEYS};
pub use settings::{CommandSpec, Settings};

/// Prelude for common imports
pub mod prelude {
    pub use crate::backup::BackupStore;
    pub use crate::document::{ConfigDocument, KeyPath};
    pub use crate::error::{ConfigError, ConfigResult};
    pub use crate::gate::RegenerationGate;
    pub use crate::patch::{Patch, PatchOutcome, Patcher};
    pub use crate::settings::Settings;
}

/// Version of the configuration layer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
