use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::cache::DEFAULT_CACHE_TTL;

/// Actor recorded in history when neither the event nor the context names one.
pub const DEFAULT_ACTOR: &str = "system";

/// Workflow engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub cache_ttl: Duration,
    pub default_actor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            default_actor: DEFAULT_ACTOR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// - `WORKFLOW_CACHE_TTL_SECS`: machine cache TTL (default 1800)
    /// - `WORKFLOW_DEFAULT_ACTOR`: history actor fallback (default `system`)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            cache_ttl: match env::var("WORKFLOW_CACHE_TTL_SECS") {
                Ok(secs) => Duration::from_secs(
                    secs.trim()
                        .parse()
                        .context("WORKFLOW_CACHE_TTL_SECS must be a whole number of seconds")?,
                ),
                Err(_) => defaults.cache_ttl,
            },
            default_actor: env::var("WORKFLOW_DEFAULT_ACTOR")
                .ok()
                .filter(|actor| !actor.trim().is_empty())
                .unwrap_or(defaults.default_actor),
        })
    }
}
