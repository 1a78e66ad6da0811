// Engine configuration with environment overrides

//! # Engine Configuration
//!
//! Defaults follow the shipped tuning; every knob can be overridden from
//! a `conductor.toml` file or `CONDUCTOR_*` environment variables, layered
//! in that order.

use serde::Deserialize;
use std::time::Duration;

use crate::models::{CircuitBreakerConfig, RetryPolicy};
use crate::{ConductorError, Result};

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine-wide cap on concurrent in-flight agent calls, protecting
    /// downstream agents across all instances
    pub max_inflight_calls: usize,

    /// Event bus channel capacity
    pub event_buffer_size: usize,

    /// Step deadline when a step declares no timeout
    pub default_step_timeout: Duration,

    /// Retry policy when neither step nor definition declares one
    pub default_retry: RetryPolicy,

    /// Circuit breaker tuning shared by all per-agent cells
    pub breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inflight_calls: 64,
            event_buffer_size: 1000,
            default_step_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Flat override document as it appears in files and environment
#[derive(Debug, Default, Deserialize)]
struct RawEngineConfig {
    max_inflight_calls: Option<usize>,
    event_buffer_size: Option<usize>,
    default_step_timeout_seconds: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    retry_jitter_fraction: Option<f64>,
    breaker_failure_threshold: Option<u32>,
    breaker_reset_timeout_seconds: Option<u64>,
}

impl EngineConfig {
    /// Load configuration from `conductor.toml` (optional) and
    /// `CONDUCTOR_*` environment variables, on top of the defaults
    pub fn from_env() -> Result<Self> {
        let raw: RawEngineConfig = config::Config::builder()
            .add_source(config::File::with_name("conductor").required(false))
            .add_source(config::Environment::with_prefix("CONDUCTOR").try_parsing(true))
            .build()
            .map_err(|e| ConductorError::Internal(format!("config load failed: {}", e)))?
            .try_deserialize()
            .map_err(|e| ConductorError::Internal(format!("config parse failed: {}", e)))?;

        let mut engine_config = Self::default();
        if let Some(v) = raw.max_inflight_calls {
            engine_config.max_inflight_calls = v;
        }
        if let Some(v) = raw.event_buffer_size {
            engine_config.event_buffer_size = v;
        }
        if let Some(v) = raw.default_step_timeout_seconds {
            engine_config.default_step_timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw.retry_max_attempts {
            engine_config.default_retry.max_attempts = v;
        }
        if let Some(v) = raw.retry_base_delay_ms {
            engine_config.default_retry.base_delay_ms = v;
        }
        if let Some(v) = raw.retry_max_delay_ms {
            engine_config.default_retry.max_delay_ms = v;
        }
        if let Some(v) = raw.retry_jitter_fraction {
            engine_config.default_retry.jitter_fraction = v;
        }
        if let Some(v) = raw.breaker_failure_threshold {
            engine_config.breaker.failure_threshold = v;
        }
        if let Some(v) = raw.breaker_reset_timeout_seconds {
            engine_config.breaker.reset_timeout = Duration::from_secs(v);
        }
        Ok(engine_config)
    }
}
