use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-action argument maps, keyed by action name. The surrounding
/// scheduler populates this from its own configuration surface.
pub type ActionConfigurations = HashMap<String, HashMap<String, String>>;

pub const ENABLE_PREDICATE_ERROR_CACHE_KEY: &str = "enablePredicateErrorCache";

/// Tunables for the reclaim action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Memoize predicate failures for the lifetime of the session.
    pub enable_predicate_error_cache: bool,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enable_predicate_error_cache: true,
        }
    }
}

impl ReclaimConfig {
    /// Parse this action's arguments out of the configuration map,
    /// falling back to defaults for anything absent or malformed.
    pub fn from_action_args(conf: &ActionConfigurations, action: &str) -> Self {
        let mut cfg = Self::default();
        let Some(args) = conf.get(action) else {
            return cfg;
        };
        if let Some(raw) = args.get(ENABLE_PREDICATE_ERROR_CACHE_KEY) {
            match raw.parse::<bool>() {
                Ok(value) => cfg.enable_predicate_error_cache = value,
                Err(_) => warn!(
                    "Ignoring malformed {} value '{}' for action '{}'",
                    ENABLE_PREDICATE_ERROR_CACHE_KEY, raw, action
                ),
            }
        }
        cfg
    }
}
