//! HTTP(S) load generation engine.
//!
//! A [`LoadTest`] issues a request template against one target from `C`
//! concurrent workers, either a fixed number of times or for a fixed
//! duration, and aggregates per-request latency into a [`RunSummary`].

pub mod config;
pub mod driver;
pub mod error;
pub mod limiter;
pub mod report;
pub mod request;
pub mod stats;
pub mod tls;
pub mod trace;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::{OutputMode, RunConfig};
pub use driver::{parse_target_list, RoundDriver};
pub use error::{Error, Result, TransportError};
pub use load_test::{LoadTest, RunState, StopHandle};
pub use request::{PreparedRequest, RequestGenerator, RequestTemplate, TemplateBuilder};
pub use types::{Phases, ResultRecord, RunSummary};
