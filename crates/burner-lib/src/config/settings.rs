//! Engine tuning read from the environment

use crate::error::{BurnerError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Knobs that are not part of a benchmark spec
///
/// Read from `BURNER_*` environment variables; every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineSettings {
    /// Records per indexer call
    #[serde(default = "default_batch_size")]
    pub indexer_batch_size: usize,

    /// Retries of failed records before reporting an indexing error
    #[serde(default = "default_max_retries")]
    pub indexer_max_retries: u32,

    /// Retries of a retryable endpoint failure
    #[serde(default = "default_max_retries")]
    pub scrape_max_retries: u32,

    /// HTTP request timeout for metric and search endpoints
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Default poll interval for measurement collectors
    #[serde(default = "default_measurement_interval")]
    pub measurement_interval_ms: u64,
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_measurement_interval() -> u64 {
    1000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            indexer_batch_size: default_batch_size(),
            indexer_max_retries: default_max_retries(),
            scrape_max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            measurement_interval_ms: default_measurement_interval(),
        }
    }
}

impl EngineSettings {
    /// Load settings from `BURNER_*` environment variables
    pub fn load() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("BURNER").try_parsing(true))
            .build()
            .map_err(|e| BurnerError::config(format!("cannot read engine settings: {e}")))?;

        let settings: EngineSettings = settings
            .try_deserialize()
            .map_err(|e| BurnerError::config(format!("invalid engine settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexer_batch_size == 0 {
            return Err(BurnerError::config("BURNER_INDEXER_BATCH_SIZE must be at least 1"));
        }
        if self.measurement_interval_ms == 0 {
            return Err(BurnerError::config(
                "BURNER_MEASUREMENT_INTERVAL_MS must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn measurement_interval(&self) -> Duration {
        Duration::from_millis(self.measurement_interval_ms)
    }
}
