//! Report aggregator: drains the result stream and writes the run's output.

use crate::config::OutputMode;
use crate::stats::{RunInfo, Statistics};
use crate::types::{PhaseStats, ResultRecord, RunSummary};
use csv::Writer;
use log::warn;
use std::fmt::Display;
use std::io::{self, Write};
use tokio::sync::mpsc;

/// Columns of the raw CSV stream, durations in seconds.
pub const CSV_COLUMNS: [&str; 9] = [
    "response-time",
    "DNS+dialup",
    "DNS",
    "Request-write",
    "Response-delay",
    "Response-read",
    "status-code",
    "offset",
    "error",
];

const BAR_WIDTH: u64 = 40;
const BAR_CHAR: &str = "■";

enum Sink {
    Text(Box<dyn Write + Send>),
    Csv(Writer<Box<dyn Write + Send>>),
}

pub struct Report {
    mode: OutputMode,
    sink: Sink,
    stats: Statistics,
    write_failed: bool,
}

impl Report {
    pub fn new(mode: OutputMode, writer: Box<dyn Write + Send>) -> Self {
        let sink = if mode.is_raw() {
            Sink::Csv(Writer::from_writer(writer))
        } else {
            Sink::Text(writer)
        };
        Self {
            mode,
            sink,
            stats: Statistics::new(!mode.is_raw()),
            write_failed: false,
        }
    }

    /// Consumes records until every sender is gone. Raw modes write each
    /// record as it arrives.
    pub async fn consume(mut self, mut results: mpsc::Receiver<ResultRecord>) -> Self {
        if let Sink::Csv(csv) = &mut self.sink {
            let written = csv.write_record(CSV_COLUMNS);
            self.check(written);
        }
        while let Some(record) = results.recv().await {
            self.stats.record(&record);
            if let Sink::Csv(csv) = &mut self.sink {
                let written = csv.write_record(csv_record(&record));
                self.check(written);
            }
        }
        self
    }

    /// Builds the summary and, in aggregate modes, writes it out.
    pub fn finalize(mut self, info: RunInfo) -> RunSummary {
        let summary = self.stats.summarize(info);
        let written = match &mut self.sink {
            Sink::Text(writer) => {
                let rendered = match self.mode {
                    OutputMode::Json => serde_json::to_writer_pretty(&mut *writer, &summary)
                        .map_err(io::Error::from)
                        .and_then(|_| writeln!(writer)),
                    _ => write_text(writer, &summary),
                };
                rendered.and_then(|_| writer.flush())
            }
            Sink::Csv(csv) => csv.flush(),
        };
        self.check(written);
        summary
    }

    fn check<E: Display>(&mut self, written: Result<(), E>) {
        if let Err(err) = written {
            if !self.write_failed {
                warn!("failed to write report: {}", err);
                self.write_failed = true;
            }
        }
    }
}

/// Fields of one CSV row. Failed requests carry status 0 and the error.
pub fn csv_record(record: &ResultRecord) -> [String; 9] {
    let (status, error) = match &record.outcome {
        Ok(status) => (status.as_u16(), String::new()),
        Err(err) => (0, err.to_string()),
    };
    [
        format!("{:.4}", record.duration.as_secs_f64()),
        format!("{:.4}", record.phases.connect.as_secs_f64()),
        format!("{:.4}", record.phases.dns.as_secs_f64()),
        format!("{:.4}", record.phases.write.as_secs_f64()),
        format!("{:.4}", record.phases.delay.as_secs_f64()),
        format!("{:.4}", record.phases.read.as_secs_f64()),
        status.to_string(),
        format!("{:.4}", record.offset.as_secs_f64()),
        error,
    ]
}

/// Human readable report.
pub fn write_text<W: Write + ?Sized>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Summary:")?;
    writeln!(out, "  Total:\t{:.4} secs", summary.total_duration)?;
    if let Some(latency) = &summary.latency {
        writeln!(out, "  Slowest:\t{:.4} secs", latency.total.max)?;
        writeln!(out, "  Fastest:\t{:.4} secs", latency.total.min)?;
        writeln!(out, "  Average:\t{:.4} secs", latency.total.mean)?;
    }
    writeln!(out, "  Requests/sec:\t{:.4}", summary.requests_per_second)?;
    writeln!(out)?;
    writeln!(out, "  Total data:\t{} bytes", summary.bytes_total)?;
    writeln!(out, "  Size/request:\t{} bytes", summary.bytes_per_request)?;

    match &summary.latency {
        Some(latency) => {
            writeln!(out)?;
            writeln!(out, "Response time histogram:")?;
            let tallest = summary.histogram.iter().map(|b| b.count).max().unwrap_or(0);
            for bucket in &summary.histogram {
                let width = if tallest > 0 {
                    bucket.count * BAR_WIDTH / tallest
                } else {
                    0
                };
                writeln!(
                    out,
                    "  {:.3} [{}]\t|{}",
                    bucket.mark,
                    bucket.count,
                    BAR_CHAR.repeat(width as usize)
                )?;
            }

            writeln!(out)?;
            writeln!(out, "Latency distribution:")?;
            for (label, value) in [
                ("50%", latency.total.p50),
                ("90%", latency.total.p90),
                ("95%", latency.total.p95),
                ("99%", latency.total.p99),
            ] {
                writeln!(out, "  {} in {:.4} secs", label, value)?;
            }

            writeln!(out)?;
            writeln!(out, "Details (average, fastest, slowest):")?;
            detail(out, "DNS+dialup", &latency.connect)?;
            detail(out, "DNS-lookup", &latency.dns)?;
            detail(out, "req write", &latency.write)?;
            detail(out, "resp wait", &latency.delay)?;
            detail(out, "resp read", &latency.read)?;
        }
        None => {
            writeln!(out)?;
            writeln!(out, "No successful responses, no latency data.")?;
        }
    }

    if !summary.status_code_distribution.is_empty() {
        writeln!(out)?;
        writeln!(out, "Status code distribution:")?;
        for (code, count) in &summary.status_code_distribution {
            writeln!(out, "  [{}]\t{} responses", code, count)?;
        }
    }

    if !summary.error_distribution.is_empty() {
        writeln!(out)?;
        writeln!(out, "Error distribution:")?;
        for (err, count) in &summary.error_distribution {
            writeln!(out, "  [{}]\t{}", count, err)?;
        }
    }
    writeln!(out)
}

fn detail<W: Write + ?Sized>(out: &mut W, label: &str, stats: &PhaseStats) -> io::Result<()> {
    writeln!(
        out,
        "  {}:\t{:.4} secs, {:.4} secs, {:.4} secs",
        label, stats.mean, stats.min, stats.max
    )
}
