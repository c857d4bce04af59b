use crate::types::{
    HistogramBucket, LatencyBreakdown, PhaseStats, ResultRecord, RunSummary,
};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Slowest response the histogram tracks, in microseconds (one hour).
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;
const HISTOGRAM_STEPS: usize = 10;

/// Run facts known only to the controller, merged into the summary.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Latency samples of successful responses, in seconds.
struct Samples {
    total: Vec<f64>,
    dns: Vec<f64>,
    connect: Vec<f64>,
    write: Vec<f64>,
    delay: Vec<f64>,
    read: Vec<f64>,
    response_times: Histogram<u64>,
}

impl Samples {
    fn new() -> Option<Self> {
        let response_times = Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MICROS, 3).ok()?;
        Some(Self {
            total: Vec::new(),
            dns: Vec::new(),
            connect: Vec::new(),
            write: Vec::new(),
            delay: Vec::new(),
            read: Vec::new(),
            response_times,
        })
    }

    fn push(&mut self, record: &ResultRecord) {
        self.total.push(record.duration.as_secs_f64());
        self.dns.push(record.phases.dns.as_secs_f64());
        self.connect.push(record.phases.connect.as_secs_f64());
        self.write.push(record.phases.write.as_secs_f64());
        self.delay.push(record.phases.delay.as_secs_f64());
        self.read.push(record.phases.read.as_secs_f64());
        let micros = u64::try_from(record.duration.as_micros()).unwrap_or(u64::MAX);
        self.response_times.saturating_record(micros.max(1));
    }

    fn breakdown(&mut self) -> Option<LatencyBreakdown> {
        Some(LatencyBreakdown {
            total: phase_stats(&mut self.total)?,
            dns: phase_stats(&mut self.dns)?,
            connect: phase_stats(&mut self.connect)?,
            write: phase_stats(&mut self.write)?,
            delay: phase_stats(&mut self.delay)?,
            read: phase_stats(&mut self.read)?,
        })
    }

    /// Linear buckets between fastest and slowest response. Each response
    /// lands in the first bucket whose mark is not below it.
    fn histogram(&self, fastest: f64, slowest: f64) -> Vec<HistogramBucket> {
        let step = (slowest - fastest) / HISTOGRAM_STEPS as f64;
        let mut buckets: Vec<HistogramBucket> = (0..=HISTOGRAM_STEPS)
            .map(|i| HistogramBucket {
                mark: fastest + step * i as f64,
                count: 0,
            })
            .collect();

        let last = buckets.len() - 1;
        for value in self.response_times.iter_recorded() {
            let micros = self.response_times.lowest_equivalent(value.value_iterated_to());
            let seconds = micros as f64 / 1e6;
            let index = buckets
                .iter()
                .position(|b| seconds <= b.mark)
                .unwrap_or(last);
            buckets[index].count += value.count_at_value();
        }
        buckets
    }
}

/// Running aggregation of result records.
///
/// Counters are always kept, so `total == sum(status codes) + errors`
/// holds in every mode. Latency samples are only retained when the run
/// reports percentiles.
pub struct Statistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_total: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub errors: BTreeMap<String, u64>,
    samples: Option<Samples>,
}

impl Statistics {
    pub fn new(retain_samples: bool) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            bytes_total: 0,
            status_codes: BTreeMap::new(),
            errors: BTreeMap::new(),
            samples: if retain_samples { Samples::new() } else { None },
        }
    }

    pub fn record(&mut self, record: &ResultRecord) {
        self.total_requests += 1;
        match &record.outcome {
            Ok(status) => {
                self.successful_requests += 1;
                self.bytes_total += record.bytes;
                *self.status_codes.entry(status.as_u16()).or_insert(0) += 1;
                if let Some(samples) = self.samples.as_mut() {
                    samples.push(record);
                }
            }
            Err(err) => {
                self.failed_requests += 1;
                *self.errors.entry(err.to_string()).or_insert(0) += 1;
            }
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.failed_requests as f64 / self.total_requests as f64) * 100.0
        }
    }

    pub fn summarize(&mut self, info: RunInfo) -> RunSummary {
        let elapsed = info.elapsed.as_secs_f64();
        let requests_per_second = if elapsed > 0.0 {
            self.total_requests as f64 / elapsed
        } else {
            0.0
        };
        let bytes_per_request = self
            .bytes_total
            .checked_div(self.successful_requests)
            .unwrap_or(0);

        let latency = self.samples.as_mut().and_then(Samples::breakdown);
        let histogram = match (&self.samples, &latency) {
            (Some(samples), Some(latency)) => {
                samples.histogram(latency.total.min, latency.total.max)
            }
            _ => Vec::new(),
        };

        RunSummary {
            run_id: info.run_id,
            target: info.target,
            started_at: info.started_at,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            error_rate: self.error_rate(),
            bytes_total: self.bytes_total,
            bytes_per_request,
            total_duration: elapsed,
            requests_per_second,
            status_code_distribution: self.status_codes.clone(),
            error_distribution: self.errors.clone(),
            latency,
            histogram,
        }
    }
}

/// Sorts `samples` and describes them. None for an empty set.
pub fn phase_stats(samples: &mut [f64]) -> Option<PhaseStats> {
    samples.sort_by(f64::total_cmp);
    let (min, max) = (*samples.first()?, *samples.last()?);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    Some(PhaseStats {
        min,
        max,
        mean,
        p50: nearest_rank(samples, 50.0)?,
        p90: nearest_rank(samples, 90.0)?,
        p95: nearest_rank(samples, 95.0)?,
        p99: nearest_rank(samples, 99.0)?,
    })
}

/// Nearest-rank percentile of ascending `sorted`: the sample at rank
/// `ceil(p / 100 * n)`, ranks counted from 1. No interpolation.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (percentile * n as f64 / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}
