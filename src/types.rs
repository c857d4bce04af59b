use crate::error::TransportError;
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Latency of one request split into network phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Phases {
    /// DNS resolution
    pub dns: Duration,
    /// Connection setup including DNS, zero for a reused connection
    pub connect: Duration,
    /// Writing the request
    pub write: Duration,
    /// Waiting for the first response byte
    pub delay: Duration,
    /// Reading the response body
    pub read: Duration,
}

/// Outcome of one request.
#[derive(Debug)]
pub struct ResultRecord {
    pub worker: usize,
    /// Iteration number within the worker
    pub sequence: u64,
    pub outcome: Result<StatusCode, TransportError>,
    /// Issue time relative to run start
    pub offset: Duration,
    pub duration: Duration,
    pub phases: Phases,
    /// Response body bytes drained
    pub bytes: u64,
}

impl ResultRecord {
    pub fn status(&self) -> Option<StatusCode> {
        self.outcome.as_ref().ok().copied()
    }
}

/// Distribution of one latency phase, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyBreakdown {
    pub total: PhaseStats,
    pub dns: PhaseStats,
    pub connect: PhaseStats,
    pub write: PhaseStats,
    pub delay: PhaseStats,
    pub read: PhaseStats,
}

/// One bar of the response time histogram: responses at or below `mark`
/// seconds and above the previous mark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub mark: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(rename = "runId")]
    pub run_id: Uuid,
    pub target: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "successfulRequests")]
    pub successful_requests: u64,
    #[serde(rename = "failedRequests")]
    pub failed_requests: u64,
    #[serde(rename = "errorRate")]
    pub error_rate: f64,
    #[serde(rename = "bytesTotal")]
    pub bytes_total: u64,
    #[serde(rename = "bytesPerRequest")]
    pub bytes_per_request: u64,
    #[serde(rename = "totalDuration")]
    pub total_duration: f64,
    #[serde(rename = "requestsPerSecond")]
    pub requests_per_second: f64,
    #[serde(rename = "statusCodeDistribution")]
    pub status_code_distribution: BTreeMap<u16, u64>,
    #[serde(rename = "errorDistribution")]
    pub error_distribution: BTreeMap<String, u64>,
    /// None when no request succeeded
    pub latency: Option<LatencyBreakdown>,
    pub histogram: Vec<HistogramBucket>,
}

impl RunSummary {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.total_duration)
    }
}
