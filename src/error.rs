use std::time::Duration;
use thiserror::Error;

/// Run-level errors. Anything here is reported before or after the run,
/// never on behalf of a single request.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid run parameters or request template
    #[error("configuration error: {0}")]
    Config(String),

    /// Client certificate or key could not be loaded
    #[error("failed to load client credentials: {0}")]
    CredentialLoad(String),

    /// HTTP/2 was requested but could not be negotiated
    #[error("HTTP/2 negotiation failed: {0}")]
    ProtocolUpgrade(String),

    /// Operation is not valid in the current lifecycle state
    #[error("invalid run state: {0}")]
    State(String),

    /// The aggregator task did not complete
    #[error("aggregator failed: {0}")]
    Aggregator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single request. Recorded in its result, never propagated.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("dns lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no addresses found for {0}")]
    NoAddress(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy tunnel failed: {0}")]
    Proxy(String),

    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("invalid tls server name {0:?}")]
    ServerName(String),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    #[error("response body does not contain {0:?}")]
    ResponseCheck(String),
}
