// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_BUCKET_DURATION_SECS: u64 = 10;
pub(crate) const DEFAULT_EPS: f64 = 0.01;

/// Longest accepted bucket; the flush ticker's deadlines must stay
/// representable.
pub const MAX_BUCKET_DURATION_SECS: u64 = 24 * 60 * 60;

const BUCKET_DURATION_ENV: &str = "DD_APM_CONCENTRATOR_BUCKET_DURATION";
const EPS_ENV: &str = "DD_APM_CONCENTRATOR_EPS";
const FLUSH_ON_SHUTDOWN_ENV: &str = "DD_APM_CONCENTRATOR_FLUSH_ON_SHUTDOWN";

#[derive(Clone, Debug, PartialEq)]
pub struct ConcentratorConfig {
    /// Length of a stats bucket, also the flush period.
    pub bucket_duration: Duration,
    /// Approximation error bound handed to every new bucket.
    pub eps: f64,
    /// Emit the closed and the open bucket on exit instead of dropping them.
    /// Off by default: downstream writers may already be shutting down.
    pub flush_on_shutdown: bool,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            bucket_duration: Duration::from_secs(DEFAULT_BUCKET_DURATION_SECS),
            eps: DEFAULT_EPS,
            flush_on_shutdown: false,
        }
    }
}

impl ConcentratorConfig {
    pub fn new(bucket_duration_secs: u64, eps: f64) -> Result<Self, ConfigError> {
        let config = Self {
            bucket_duration: Duration::from_secs(bucket_duration_secs),
            eps,
            flush_on_shutdown: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration built by hand through the public fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_duration < Duration::from_secs(1) {
            return Err(ConfigError::InvalidBucketDuration(
                "bucket duration must be a positive number of seconds".to_string(),
            ));
        }
        if self.bucket_duration > Duration::from_secs(MAX_BUCKET_DURATION_SECS) {
            return Err(ConfigError::InvalidBucketDuration(format!(
                "{}s exceeds the maximum of {MAX_BUCKET_DURATION_SECS}s",
                self.bucket_duration.as_secs()
            )));
        }
        if !is_valid_eps(self.eps) {
            return Err(ConfigError::InvalidEps(format!(
                "{} is not in (0, 1)",
                self.eps
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_flush_on_shutdown(mut self, flush_on_shutdown: bool) -> Self {
        self.flush_on_shutdown = flush_on_shutdown;
        self
    }

    /// Builds the configuration from `DD_APM_CONCENTRATOR_*` environment
    /// variables. Unset variables fall back to defaults, malformed ones are
    /// rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bucket_duration_secs = match env::var(BUCKET_DURATION_ENV) {
            Ok(val) => val.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidBucketDuration(format!("{BUCKET_DURATION_ENV}={val}: {e}"))
            })?,
            Err(_) => DEFAULT_BUCKET_DURATION_SECS,
        };
        let eps = match env::var(EPS_ENV) {
            Ok(val) => val
                .trim()
                .parse::<f64>()
                .map_err(|e| ConfigError::InvalidEps(format!("{EPS_ENV}={val}: {e}")))?,
            Err(_) => DEFAULT_EPS,
        };
        let flush_on_shutdown = match env::var(FLUSH_ON_SHUTDOWN_ENV) {
            Ok(val) => parse_flag(&val)?,
            Err(_) => false,
        };

        Ok(Self::new(bucket_duration_secs, eps)?.with_flush_on_shutdown(flush_on_shutdown))
    }
}

pub(crate) fn is_valid_eps(eps: f64) -> bool {
    eps > 0.0 && eps < 1.0
}

fn parse_flag(val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidFlag(format!(
            "{FLUSH_ON_SHUTDOWN_ENV}={val}"
        ))),
    }
}
