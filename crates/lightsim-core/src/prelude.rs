/*!
 * Prelude module for lightsim core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{RangeHook, Record, RecordHook, Value};

// Re-export config types
pub use crate::config::{CleanConfig, Config, ConfigBuilder, SessionConfig};

// Re-export utility functions
pub use crate::utils::with_timeout;

// Re-export logging helpers
pub use crate::logging::{device_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
