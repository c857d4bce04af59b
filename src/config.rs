//! Run parameters for a single load test.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Hard cap on the result stream buffer.
pub const MAX_RESULTS: usize = 1_000_000;

/// Upper bound on idle connections kept per target host.
pub const MAX_IDLE_CONNS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Human readable aggregate report
    #[default]
    Summary,
    /// Aggregate report as JSON
    Json,
    /// One CSV row per request, streamed as results arrive
    Csv,
}

impl OutputMode {
    /// Raw-stream modes emit records as they arrive and keep no samples.
    pub fn is_raw(self) -> bool {
        matches!(self, OutputMode::Csv)
    }
}

impl FromStr for OutputMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "summary" | "text" => Ok(OutputMode::Summary),
            "json" => Ok(OutputMode::Json),
            "csv" => Ok(OutputMode::Csv),
            other => Err(Error::Config(format!(
                "unsupported output type {:?}, expected csv or json",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Total number of requests (N). Ignored in duration mode.
    pub requests: u64,
    /// Number of concurrent workers (C)
    pub concurrency: usize,
    /// Per-worker rate limit in queries per second, 0 = unlimited
    pub qps: f64,
    /// Run for a fixed duration instead of a fixed request count
    pub duration: Option<Duration>,
    /// Per-request timeout, None = wait forever
    pub timeout: Option<Duration>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Upstream HTTP proxy
    pub proxy: Option<Url>,
    pub http2: bool,
    pub disable_compression: bool,
    pub disable_keep_alives: bool,
    pub disable_redirects: bool,
    /// Replace the reserved marker with a per-iteration tag
    pub unique_marker: bool,
    /// Skip server certificate verification
    pub insecure: bool,
    pub output: OutputMode,
    /// Strings every response body must contain
    pub response_checks: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            requests: 200,
            concurrency: 50,
            qps: 0.0,
            duration: None,
            timeout: Some(Duration::from_secs(20)),
            cert_file: None,
            key_file: None,
            proxy: None,
            http2: false,
            disable_compression: false,
            disable_keep_alives: false,
            disable_redirects: false,
            unique_marker: false,
            insecure: true,
            output: OutputMode::Summary,
            response_checks: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(Error::Config("-c cannot be smaller than 1".into()));
        }
        if self.duration_mode().is_none() {
            if self.requests < 1 {
                return Err(Error::Config("-n cannot be smaller than 1".into()));
            }
            if self.requests < self.concurrency as u64 {
                return Err(Error::Config("-n cannot be less than -c".into()));
            }
        }
        if !self.qps.is_finite() || self.qps < 0.0 {
            return Err(Error::Config(format!("invalid rate limit {}", self.qps)));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.scheme() != "http" || proxy.host_str().is_none() {
                return Err(Error::Config(format!(
                    "proxy must be an http://host:port address, got {}",
                    proxy
                )));
            }
        }
        Ok(())
    }

    /// The run duration when duration mode is active. A zero duration
    /// disables the mode.
    pub fn duration_mode(&self) -> Option<Duration> {
        self.duration.filter(|d| !d.is_zero())
    }

    /// Iterations assigned to each worker, None when the run is bounded by
    /// time only. The `N mod C` remainder is never issued.
    pub fn iterations_per_worker(&self) -> Option<u64> {
        match self.duration_mode() {
            Some(_) => None,
            None => Some(self.requests / self.concurrency.max(1) as u64),
        }
    }

    pub fn result_capacity(&self) -> usize {
        self.concurrency.saturating_mul(1000).clamp(1, MAX_RESULTS)
    }

    pub fn max_idle_per_host(&self) -> usize {
        self.concurrency.min(MAX_IDLE_CONNS)
    }
}

/// Parses `500ms`, `10s`, `3m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration {:?}", input)))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(Error::Config(format!(
                "invalid duration unit {:?} in {:?}",
                other, input
            )))
        }
    };
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| Error::Config(format!("invalid duration {:?}", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests: u64, concurrency: usize) -> RunConfig {
        RunConfig {
            requests,
            concurrency,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(matches!(config(10, 0).validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_fewer_requests_than_workers() {
        assert!(matches!(config(5, 10).validate(), Err(Error::Config(_))));
        assert!(config(10, 10).validate().is_ok());
    }

    #[test]
    fn test_duration_mode_ignores_request_count() {
        let cfg = RunConfig {
            requests: 0,
            concurrency: 4,
            duration: Some(Duration::from_secs(1)),
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.iterations_per_worker(), None);
    }

    #[test]
    fn test_zero_duration_is_count_mode() {
        let cfg = RunConfig {
            duration: Some(Duration::ZERO),
            ..config(100, 10)
        };
        assert_eq!(cfg.duration_mode(), None);
        assert_eq!(cfg.iterations_per_worker(), Some(10));
    }

    #[test]
    fn test_remainder_is_truncated() {
        // 1000 requests over 33 workers issues 33 * 30 = 990
        assert_eq!(config(1000, 33).iterations_per_worker(), Some(30));
    }

    #[test]
    fn test_result_capacity_is_capped() {
        assert_eq!(config(10, 3).result_capacity(), 3000);
        assert_eq!(config(5000, 5000).result_capacity(), MAX_RESULTS);
    }

    #[test]
    fn test_idle_connections_bounded() {
        assert_eq!(config(10, 10).max_idle_per_host(), 10);
        assert_eq!(config(2000, 2000).max_idle_per_host(), MAX_IDLE_CONNS);
    }

    #[test]
    fn test_rejects_non_http_proxy() {
        let cfg = RunConfig {
            proxy: Some(Url::parse("socks5://127.0.0.1:1080").unwrap()),
            ..config(10, 1)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn test_output_mode_parse() {
        assert_eq!("".parse::<OutputMode>().unwrap(), OutputMode::Summary);
        assert_eq!("CSV".parse::<OutputMode>().unwrap(), OutputMode::Csv);
        assert!("csv".parse::<OutputMode>().unwrap().is_raw());
        assert!("xml".parse::<OutputMode>().is_err());
    }
}
