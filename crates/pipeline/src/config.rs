//! Pipeline configuration.
//!
//! Defaults are usable as-is; `from_env` overrides individual fields from
//! `MARKETSYNC_*` variables and fails on values that do not parse.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::coordinator::EarlyRetry;
use crate::gateway::{SandboxGateway, TimeoutGateway};
use crate::retry::RetryScheduler;
use crate::sweeper::SweeperConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Per-call deadline; an elapsed call counts as a failure.
    pub call_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 100,
            max_latency_ms: 500,
            call_timeout_ms: 30_000,
        }
    }
}

impl GatewayConfig {
    pub fn sandbox(&self) -> TimeoutGateway<SandboxGateway> {
        TimeoutGateway::new(
            SandboxGateway::new(
                Duration::from_millis(self.min_latency_ms),
                Duration::from_millis(self.max_latency_ms),
            ),
            Duration::from_millis(self.call_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry_ceiling: u32,
    pub base_delay_ms: u64,
    /// Optional cap on the backoff delay. Unbounded when absent.
    pub max_delay_ms: Option<u64>,
    pub early_retry: EarlyRetry,
    pub sweep_interval_ms: u64,
    pub sweep_batch: u32,
    pub max_concurrent: usize,
    pub in_flight_timeout_ms: u64,
    pub gateway: GatewayConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            base_delay_ms: 1_000,
            max_delay_ms: None,
            early_retry: EarlyRetry::Reject,
            sweep_interval_ms: 5_000,
            sweep_batch: 100,
            max_concurrent: 4,
            in_flight_timeout_ms: 300_000,
            gateway: GatewayConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        override_with(&lookup, "MARKETSYNC_RETRY_CEILING", &mut cfg.retry_ceiling)?;
        override_with(&lookup, "MARKETSYNC_BASE_DELAY_MS", &mut cfg.base_delay_ms)?;
        if let Some(raw) = lookup("MARKETSYNC_MAX_DELAY_MS") {
            cfg.max_delay_ms = Some(parse_var("MARKETSYNC_MAX_DELAY_MS", &raw)?);
        }
        override_with(&lookup, "MARKETSYNC_EARLY_RETRY", &mut cfg.early_retry)?;
        override_with(&lookup, "MARKETSYNC_SWEEP_INTERVAL_MS", &mut cfg.sweep_interval_ms)?;
        override_with(&lookup, "MARKETSYNC_SWEEP_BATCH", &mut cfg.sweep_batch)?;
        override_with(&lookup, "MARKETSYNC_MAX_CONCURRENT", &mut cfg.max_concurrent)?;
        override_with(&lookup, "MARKETSYNC_IN_FLIGHT_TIMEOUT_MS", &mut cfg.in_flight_timeout_ms)?;
        override_with(&lookup, "MARKETSYNC_GATEWAY_MIN_LATENCY_MS", &mut cfg.gateway.min_latency_ms)?;
        override_with(&lookup, "MARKETSYNC_GATEWAY_MAX_LATENCY_MS", &mut cfg.gateway.max_latency_ms)?;
        override_with(&lookup, "MARKETSYNC_GATEWAY_TIMEOUT_MS", &mut cfg.gateway.call_timeout_ms)?;

        anyhow::ensure!(cfg.retry_ceiling >= 1, "MARKETSYNC_RETRY_CEILING must be at least 1");
        Ok(cfg)
    }

    pub fn scheduler(&self) -> RetryScheduler {
        let scheduler = RetryScheduler::new(Duration::from_millis(self.base_delay_ms));
        match self.max_delay_ms {
            Some(cap) => scheduler.with_max_delay(Duration::from_millis(cap)),
            None => scheduler,
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
            batch: self.sweep_batch,
            max_concurrent: self.max_concurrent,
            in_flight_timeout: Duration::from_millis(self.in_flight_timeout_ms),
            ..SweeperConfig::default()
        }
    }
}

fn override_with<T, F>(lookup: &F, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_var(key, &raw)?;
    }
    Ok(())
}

fn parse_var<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid value for {key}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.retry_ceiling, 3);
        assert_eq!(cfg.scheduler(), RetryScheduler::new(Duration::from_secs(1)));
        assert_eq!(cfg.sweeper().in_flight_timeout, Duration::from_secs(300));
        assert_eq!(cfg.gateway.call_timeout_ms, 30_000);
    }

    #[test]
    fn env_overrides_fields() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("MARKETSYNC_RETRY_CEILING", "5"),
            ("MARKETSYNC_BASE_DELAY_MS", "250"),
            ("MARKETSYNC_MAX_DELAY_MS", "10000"),
            ("MARKETSYNC_EARLY_RETRY", "defer"),
            ("MARKETSYNC_GATEWAY_MAX_LATENCY_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(cfg.retry_ceiling, 5);
        assert_eq!(cfg.early_retry, EarlyRetry::Defer);
        assert_eq!(cfg.gateway.max_latency_ms, 0);
        assert_eq!(
            cfg.scheduler(),
            RetryScheduler::new(Duration::from_millis(250)).with_max_delay(Duration::from_secs(10))
        );
    }

    #[test]
    fn unparsable_values_are_errors() {
        let err = PipelineConfig::from_lookup(lookup(&[("MARKETSYNC_SWEEP_BATCH", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("MARKETSYNC_SWEEP_BATCH"));

        assert!(PipelineConfig::from_lookup(lookup(&[("MARKETSYNC_EARLY_RETRY", "later")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("MARKETSYNC_RETRY_CEILING", "0")])).is_err());
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: PipelineConfig = serde_json::from_value(serde_json::json!({
            "retry_ceiling": 7,
            "early_retry": "defer",
            "gateway": {"call_timeout_ms": 5000}
        }))
        .unwrap();
        assert_eq!(cfg.retry_ceiling, 7);
        assert_eq!(cfg.early_retry, EarlyRetry::Defer);
        assert_eq!(cfg.gateway.call_timeout_ms, 5000);
        assert_eq!(cfg.gateway.min_latency_ms, 100);
        assert_eq!(cfg.sweep_batch, 100);
    }
}
