//! Process exit codes

/// Every stage succeeded or was already complete
pub(crate) const SUCCESS: u8 = 0;

/// At least one stage failed
pub(crate) const FAILURE: u8 = 1;

/// Settings could not be loaded or wired
pub(crate) const CONFIG_ERROR: u8 = 2;

/// Operator interrupt (128 + SIGINT)
pub(crate) const INTERRUPTED: u8 = 130;
