//! Multi-target and multi-round orchestration on top of [`LoadTest`].

use crate::config::RunConfig;
use crate::error::Result;
use crate::load_test::LoadTest;
use crate::request::TemplateBuilder;
use crate::types::RunSummary;
use log::{info, warn};
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;

/// Creates the report sink of each run.
pub type SinkFactory = Box<dyn Fn() -> Box<dyn Write + Send> + Send + Sync>;

/// Target URLs of a URL list file: every line mentioning `http`, trimmed.
pub fn parse_target_list(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains("http"))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Runs every target once per round, one independent load test at a time.
pub struct RoundDriver {
    template: TemplateBuilder,
    config: RunConfig,
    targets: Vec<String>,
    rounds: u32,
    round_sleep: Duration,
    cancel: watch::Receiver<bool>,
    sink: Option<SinkFactory>,
}

impl RoundDriver {
    /// `cancel` flipping to true stops the active run and skips the rest.
    pub fn new(
        template: TemplateBuilder,
        config: RunConfig,
        targets: Vec<String>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            template,
            config,
            targets,
            rounds: 1,
            round_sleep: Duration::ZERO,
            cancel,
            sink: None,
        }
    }

    pub fn rounds(mut self, rounds: u32, round_sleep: Duration) -> Self {
        self.rounds = rounds.max(1);
        self.round_sleep = round_sleep;
        self
    }

    pub fn with_sink(mut self, sink: SinkFactory) -> Self {
        self.sink = Some(sink);
        self
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Returns the summaries of every completed run, in execution order.
    pub async fn run(self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();

        'rounds: for round in 1..=self.rounds {
            for target in &self.targets {
                if self.cancelled() {
                    break 'rounds;
                }
                let template = match self.template.clone().url(target).build() {
                    Ok(template) => template,
                    Err(err) => {
                        warn!("skipping target {}: {}", target, err);
                        continue;
                    }
                };
                let mut test = LoadTest::new(template, self.config.clone());
                if let Some(sink) = &self.sink {
                    test = test.with_boxed_writer(sink());
                }

                let stop = test.stop_handle();
                let mut cancel = self.cancel.clone();
                let forwarder = tokio::spawn(async move {
                    let cancelled = cancel.wait_for(|c| *c).await.is_ok();
                    if cancelled {
                        stop.stop();
                    }
                });
                let finished = test.run().await;
                forwarder.abort();
                summaries.push(finished?);
            }

            if self.rounds > 1 {
                info!(
                    "Finished round {}, sleeping {:?}",
                    round, self.round_sleep
                );
            }
            if round < self.rounds && !self.round_sleep.is_zero() {
                let mut cancel = self.cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.round_sleep) => {}
                    Ok(_) = cancel.wait_for(|c| *c) => break 'rounds,
                }
            }
        }
        Ok(summaries)
    }
}
