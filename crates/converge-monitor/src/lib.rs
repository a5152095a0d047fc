//! Converge Monitor
//!
//! Decides when a freshly started application is ready. A health endpoint
//! is polled on a fixed interval while the application log is tailed for
//! known startup markers; the first probe to fire wins. The wait is bounded
//! and reports progress while it runs.
//!
//! ```rust,ignore
//! use converge_monitor::prelude::*;
//!
//! let monitor = ReadinessMonitor::new(ReadinessConfig {
//!     health_url: Some("http://localhost:8080/legion/health".into()),
//!     log_file: Some("logs/legion.log".into()),
//!     markers: vec!["Started LegionApplication".into()],
//!     ..ReadinessConfig::default()
//! })?;
//! match monitor.wait().await {
//!     Ok(signal) => println!("ready: {signal}"),
//!     Err(err) if err.is_timeout() => eprintln!("{err}"),
//!     Err(err) => return Err(err.into()),
//! }
//! ```

pub mod error;
pub mod monitor;
pub mod tail;

pub use error::ReadinessError;
pub use monitor::{ReadinessConfig, ReadinessMonitor, ReadySignal};
pub use tail::LogTail;

/// Common imports
pub mod prelude {
    pub use crate::error::ReadinessError;
    pub use crate::monitor::{ReadinessConfig, ReadinessMonitor, ReadySignal};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
