//! Purpose: Transport tuning knobs and their JSON file form.
//! Exports: `TransportConfig`.
//! Role: Built in code or loaded by the composition root; validated before use.
//! Invariants: Unknown keys are rejected; missing keys take defaults.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Upper bound `term()` waits for in-flight sends to finish.
    pub drain_timeout_ms: u64,
    /// Inbound requests retained while awaiting a response.
    pub max_pending_requests: usize,
    /// Prefix of routing keys produced by the default resolver.
    pub key_prefix: String,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            drain_timeout_ms: 1000,
            max_pending_requests: 1024,
            key_prefix: "up".to_string(),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_pending_requests == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("max_pending_requests must be at least 1"));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains('*') {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("key_prefix must be non-empty and free of wildcards"));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::InvalidArgument)
                .with_message("invalid transport config")
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::InvalidArgument)
                .with_message("failed to read transport config")
                .with_path(path)
                .with_source(err)
        })?;
        Self::from_json_str(&text).map_err(|err| err.with_path(path))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}
