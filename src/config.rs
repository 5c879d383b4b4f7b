//! Runtime configuration for the decoration operator.
//!
//! Defaults are built in; an optional TOML file and `DECORATION__`-prefixed
//! environment variables override them (e.g. `DECORATION__RESYNC_SECS=600`).

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperatorConfig {
    /// Periodic resync interval for successfully reconciled Decorations.
    pub resync_secs: u64,

    /// Requeue delay after a reconcile error.
    pub error_requeue_secs: u64,

    /// Requeue delay while the status-up-to-date gate is unsatisfied.
    pub gate_requeue_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_secs: 300,
            error_requeue_secs: 60,
            gate_requeue_secs: 1,
        }
    }
}

impl OperatorConfig {
    /// Layered load: defaults, then an optional config file, then environment.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("resync_secs", defaults.resync_secs)?
            .set_default("error_requeue_secs", defaults.error_requeue_secs)?
            .set_default("gate_requeue_secs", defaults.gate_requeue_secs)?;
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("DECORATION").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file() {
        let cfg = OperatorConfig::load(None).unwrap();
        assert_eq!(cfg.resync_secs, 300);
        assert_eq!(cfg.error_requeue_secs, 60);
    }
}
