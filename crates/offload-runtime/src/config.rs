//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};
use crate::resolve::ResolveOptions;

/// How async contexts issue their operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Operations go to a backend queue and complete later
    #[default]
    Asynchronous,
    /// Contexts keep a null queue; every operation completes before its call returns
    Synchronous,
}

/// Configuration for an [`OffloadRuntime`](crate::OffloadRuntime)
///
/// # Example
///
/// ```rust
/// use offload_runtime::{ExecutionMode, RuntimeConfig};
///
/// let config = RuntimeConfig::from_json(r#"{ "execution_mode": "synchronous" }"#).unwrap();
/// assert_eq!(config.execution_mode, ExecutionMode::Synchronous);
/// assert!(config.check_global_sizes);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub execution_mode: ExecutionMode,
    /// Timeout applied by `finalize` when it has to drain; `None` waits forever
    pub default_sync_timeout_ms: Option<u64>,
    /// Treat host/device global size disagreement as a malformed binary
    pub check_global_sizes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Asynchronous,
            default_sync_timeout_ms: None,
            check_global_sizes: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| OffloadError::InvalidConfig(e.to_string()))
    }

    /// Synchronous execution with defaults otherwise
    pub fn synchronous() -> Self {
        Self {
            execution_mode: ExecutionMode::Synchronous,
            ..Self::default()
        }
    }

    pub fn default_sync_timeout(&self) -> Option<Duration> {
        self.default_sync_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            check_global_sizes: self.check_global_sizes,
        }
    }
}
