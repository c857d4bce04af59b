//! Request executors. A run spawns one [`Worker`] per concurrency slot, all
//! sharing the run's [`Transport`].

use crate::error::TransportError;
use crate::limiter::Throttle;
use crate::request::{PreparedRequest, RequestGenerator, RequestTemplate};
use crate::transport::{Exchange, Transport};
use crate::types::ResultRecord;
use log::debug;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Read-only state shared by every worker of a run.
#[derive(Clone)]
pub struct WorkContext {
    pub template: Arc<RequestTemplate>,
    pub generator: Option<RequestGenerator>,
    pub transport: Arc<Transport>,
    /// Per-worker rate, 0 = unlimited
    pub qps: f64,
    pub unique_marker: bool,
    pub run_start: Instant,
}

pub struct Worker {
    index: usize,
    iterations: Option<u64>,
    ctx: WorkContext,
    results: mpsc::Sender<ResultRecord>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    /// `iterations` is None in duration mode, where only a stop ends the
    /// worker.
    pub fn new(
        index: usize,
        iterations: Option<u64>,
        ctx: WorkContext,
        results: mpsc::Sender<ResultRecord>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            iterations,
            ctx,
            results,
            stop,
        }
    }

    /// Issues requests until the iteration budget is spent or a stop is
    /// observed. Returns the number of requests issued.
    pub async fn run(mut self) -> u64 {
        let mut throttle = Throttle::new(self.ctx.qps);
        let mut issued = 0u64;

        loop {
            if self.iterations.is_some_and(|limit| issued >= limit) {
                break;
            }
            if *self.stop.borrow() {
                break;
            }
            if throttle.is_enabled() {
                tokio::select! {
                    biased;
                    _ = stopped(&mut self.stop) => break,
                    _ = throttle.tick() => {}
                }
            }

            let record = self.issue(issued).await;
            issued += 1;
            // Blocks while the result stream is full.
            if self.results.send(record).await.is_err() {
                debug!("worker {}: result stream closed", self.index);
                break;
            }
        }
        issued
    }

    async fn issue(&self, sequence: u64) -> ResultRecord {
        let started = Instant::now();
        let offset = started.saturating_duration_since(self.ctx.run_start);
        let exchange = match self.prepare(sequence) {
            Ok(request) => self.ctx.transport.execute(request).await,
            Err(err) => Exchange::failed(err),
        };
        ResultRecord {
            worker: self.index,
            sequence,
            outcome: exchange.outcome,
            offset,
            duration: started.elapsed(),
            phases: exchange.phases,
            bytes: exchange.bytes,
        }
    }

    fn prepare(&self, sequence: u64) -> Result<PreparedRequest, TransportError> {
        let mut request = match &self.ctx.generator {
            Some(generate) => generate(),
            None => self.ctx.template.instantiate(),
        };
        if self.ctx.unique_marker {
            request
                .apply_marker(&unique_tag(self.index, sequence))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        }
        Ok(request)
    }
}

/// Tag substituted for the marker: unique across the run because worker
/// indexes are.
pub fn unique_tag(worker: usize, sequence: u64) -> String {
    format!("{}-{}", worker, sequence)
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let signalled = stop.wait_for(|stopped| *stopped).await.is_ok();
    if !signalled {
        // Stop handle dropped without stopping.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use std::collections::HashSet;
    use std::time::Duration;

    fn context(url: &str, qps: f64) -> WorkContext {
        let template = RequestTemplate::builder("GET", url).build().unwrap();
        WorkContext {
            template: Arc::new(template),
            generator: None,
            transport: Arc::new(Transport::build(&RunConfig::default()).unwrap()),
            qps,
            unique_marker: false,
            run_start: Instant::now(),
        }
    }

    #[test]
    fn test_unique_tags_are_distinct() {
        let tags: HashSet<String> = (0..10)
            .flat_map(|worker| (0..50).map(move |seq| unique_tag(worker, seq)))
            .collect();
        assert_eq!(tags.len(), 500);
        assert_ne!(unique_tag(1, 11), unique_tag(11, 1));
    }

    #[tokio::test]
    async fn test_stopped_worker_issues_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(true);
        let worker = Worker::new(0, Some(5), context("http://127.0.0.1:1/", 0.0), tx, stop_rx);

        assert_eq!(worker.run().await, 0);
        assert!(rx.recv().await.is_none());
        drop(stop_tx);
    }

    #[tokio::test]
    async fn test_transport_errors_are_recorded() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker::new(3, Some(2), context("http://127.0.0.1:1/", 0.0), tx, stop_rx);

        assert_eq!(worker.run().await, 2);
        for expected in 0..2 {
            let record = rx.recv().await.unwrap();
            assert_eq!(record.worker, 3);
            assert_eq!(record.sequence, expected);
            assert!(record.outcome.is_err());
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_stream_blocks_without_losing_records() {
        let (tx, mut rx) = mpsc::channel(1);
        let observer = tx.clone();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker::new(0, Some(5), context("http://127.0.0.1:1/", 0.0), tx, stop_rx);
        let handle = tokio::spawn(worker.run());

        // One record fills the stream; the worker then waits on its next send.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        assert_eq!(observer.capacity(), 0);
        drop(observer);

        let mut sequences = Vec::new();
        while let Some(record) = rx.recv().await {
            sequences.push(record.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(handle.await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_throttle_wait() {
        let (tx, _rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        // One permit per 10s: the stop arrives long before the first one.
        let worker = Worker::new(0, None, context("http://127.0.0.1:1/", 0.1), tx, stop_rx);
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), 0);
    }
}
