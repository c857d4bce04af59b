use anyhow::{bail, Context, Result};
use clap::Parser;
use loadmaster::config::parse_duration;
use loadmaster::{parse_target_list, OutputMode, RoundDriver, RunConfig, TemplateBuilder};
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "loadmaster",
    about = "HTTP(S) load generator",
    version,
    author
)]
struct Cli {
    /// Target URL
    #[arg(value_name = "URL")]
    target: Option<String>,

    /// Target URL, alternative to the positional argument
    #[arg(long = "url", env = "LOADMASTER_URL")]
    url: Option<String>,

    /// Number of requests to run
    #[arg(short = 'n', default_value_t = 200, env = "LOADMASTER_REQUESTS")]
    requests: u64,

    /// Number of workers to run concurrently, cannot exceed -n
    #[arg(short = 'c', default_value_t = 50, env = "LOADMASTER_CONCURRENCY")]
    concurrency: usize,

    /// Rate limit per worker, in queries per second (0 = unlimited)
    #[arg(short = 'q', default_value_t = 0.0, env = "LOADMASTER_QPS")]
    qps: f64,

    /// Send requests for this long instead of -n requests, e.g. 10s or 3m
    #[arg(short = 'z', value_parser = parse_duration_arg, env = "LOADMASTER_DURATION")]
    duration: Option<Duration>,

    /// Output type: summary (default), json or csv
    #[arg(
        short = 'o',
        default_value = "summary",
        value_parser = parse_output,
        env = "LOADMASTER_OUTPUT"
    )]
    output: OutputMode,

    /// HTTP method
    #[arg(short = 'm', default_value = "GET")]
    method: String,

    /// Custom header, repeatable, e.g. -H "Accept: text/html"
    #[arg(short = 'H', value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Timeout for each request in seconds, 0 for none
    #[arg(short = 't', default_value_t = 20, env = "LOADMASTER_TIMEOUT")]
    timeout: u64,

    /// HTTP Accept header
    #[arg(short = 'A')]
    accept: Option<String>,

    /// Request body
    #[arg(short = 'd')]
    body: Option<String>,

    /// Request body read from a file
    #[arg(short = 'D')]
    body_file: Option<PathBuf>,

    /// Content-Type header
    #[arg(short = 'T', default_value = "text/html")]
    content_type: String,

    /// User-Agent, the default agent is appended
    #[arg(short = 'U')]
    user_agent: Option<String>,

    /// Basic authentication, username:password
    #[arg(short = 'a', value_parser = parse_basic_auth)]
    auth: Option<(String, String)>,

    /// HTTP proxy address as host:port
    #[arg(short = 'x', env = "LOADMASTER_PROXY")]
    proxy: Option<String>,

    /// Enable HTTP/2
    #[arg(long = "h2")]
    http2: bool,

    /// HTTP Host header
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    disable_compression: bool,

    /// Do not reuse TCP connections between requests
    #[arg(long = "disable-keepalive")]
    disable_keepalive: bool,

    #[arg(long)]
    disable_redirects: bool,

    /// Number of runtime worker threads
    #[arg(long, env = "LOADMASTER_CPUS")]
    cpus: Option<usize>,

    /// Client certificate (PEM)
    #[arg(long, env = "LOADMASTER_CERT")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "LOADMASTER_KEY")]
    key: Option<PathBuf>,

    /// File with one target URL per line
    #[arg(long)]
    urlfile: Option<PathBuf>,

    /// Number of rounds
    #[arg(short = 'r', default_value_t = 1)]
    rounds: u32,

    /// Seconds to sleep between rounds
    #[arg(long = "rs", default_value_t = 0)]
    round_sleep: u64,

    /// Replace RANDMARK (or HEY) in host, path, headers and body with a unique tag
    #[arg(long)]
    randmark: bool,

    /// String every response body must contain, repeatable
    #[arg(long = "respcheck")]
    response_checks: Vec<String>,

    /// Verify server certificates
    #[arg(long)]
    secure: bool,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(cpus) = cli.cpus.filter(|&cpus| cpus > 0) {
        runtime.worker_threads(cpus);
    }
    let runtime = runtime
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let targets = match (&cli.urlfile, cli.url.as_ref().or(cli.target.as_ref())) {
        (Some(path), _) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read url file {}", path.display()))?;
            parse_target_list(&text)
        }
        (None, Some(url)) => vec![url.clone()],
        (None, None) => bail!("no target given, pass a URL, --url or --urlfile"),
    };
    if targets.is_empty() {
        bail!("no target URLs found");
    }

    let body = match &cli.body_file {
        Some(path) => fs::read(path)
            .with_context(|| format!("failed to read body file {}", path.display()))?,
        None => cli.body.clone().unwrap_or_default().into_bytes(),
    };

    let mut template = TemplateBuilder::new(&cli.method, &targets[0])
        .content_type(&cli.content_type)
        .headers(cli.headers.iter().cloned())
        .body(body);
    if let Some(accept) = &cli.accept {
        template = template.accept(accept);
    }
    if let Some(agent) = &cli.user_agent {
        template = template.user_agent(agent);
    }
    if let Some(host) = &cli.host {
        template = template.host(host);
    }
    if let Some((username, password)) = &cli.auth {
        template = template.basic_auth(username, password);
    }
    // Reject a malformed method or header before anything is sent.
    template.clone().build()?;

    let config = RunConfig {
        requests: cli.requests,
        concurrency: cli.concurrency,
        qps: cli.qps,
        duration: cli.duration,
        timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
        cert_file: cli.cert,
        key_file: cli.key,
        proxy: cli.proxy.as_deref().map(parse_proxy).transpose()?,
        http2: cli.http2,
        disable_compression: cli.disable_compression,
        disable_keep_alives: cli.disable_keepalive,
        disable_redirects: cli.disable_redirects,
        unique_marker: cli.randmark,
        insecure: !cli.secure,
        output: cli.output,
        response_checks: cli.response_checks,
    };
    config.validate()?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Interrupt received, stopping");
            if cancel_tx.send(true).is_err() {
                debug!("no run left to cancel");
            }
        }
    });

    let summaries = RoundDriver::new(template, config, targets, cancel_rx)
        .rounds(cli.rounds, Duration::from_secs(cli.round_sleep))
        .run()
        .await?;
    info!("🏁 {} run(s) completed", summaries.len());
    Ok(())
}

fn parse_duration_arg(input: &str) -> std::result::Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}

fn parse_output(input: &str) -> std::result::Result<OutputMode, String> {
    input.parse().map_err(|e: loadmaster::Error| e.to_string())
}

/// `Name: value`, the name made of word characters and dashes.
fn parse_header(input: &str) -> std::result::Result<(String, String), String> {
    let invalid = || format!("could not parse the provided input; input = {}", input);
    let (name, value) = input.split_once(':').ok_or_else(invalid)?;
    let value = value.trim();
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    if !valid_name || value.is_empty() {
        return Err(invalid());
    }
    Ok((name.to_string(), value.to_string()))
}

/// `username:password`. The split is at the last colon that leaves a
/// password of at least two characters not starting with whitespace.
fn parse_basic_auth(input: &str) -> std::result::Result<(String, String), String> {
    input
        .match_indices(':')
        .rev()
        .map(|(at, _)| (&input[..at], &input[at + 1..]))
        .find(|(username, password)| {
            !username.is_empty()
                && password.chars().count() >= 2
                && !password.starts_with(char::is_whitespace)
        })
        .map(|(username, password)| (username.to_string(), password.to_string()))
        .ok_or_else(|| format!("could not parse the provided input; input = {}", input))
}

/// Accepts `host:port` as well as a full `http://` URL.
fn parse_proxy(input: &str) -> Result<Url> {
    let address = if input.contains("://") {
        input.to_string()
    } else {
        format!("http://{}", input)
    };
    Url::parse(&address).with_context(|| format!("invalid proxy address {}", input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["loadmaster", "http://localhost:8080/"]).unwrap();
        assert_eq!(cli.requests, 200);
        assert_eq!(cli.concurrency, 50);
        assert_eq!(cli.timeout, 20);
        assert_eq!(cli.content_type, "text/html");
        assert_eq!(cli.output, OutputMode::Summary);
        assert!(!cli.secure);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "loadmaster",
            "-n",
            "1000",
            "-c",
            "33",
            "-z",
            "3m",
            "-o",
            "csv",
            "-H",
            "X-Trace: abc",
            "-H",
            "Accept: text/plain",
            "--respcheck",
            "ok",
            "--h2",
            "--url",
            "https://example.com",
        ])
        .unwrap();
        assert_eq!(cli.concurrency, 33);
        assert_eq!(cli.duration, Some(Duration::from_secs(180)));
        assert_eq!(cli.output, OutputMode::Csv);
        assert_eq!(cli.headers.len(), 2);
        assert_eq!(cli.response_checks, vec!["ok".to_string()]);
        assert!(cli.http2);
        assert_eq!(cli.url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Content-Type: application/json").unwrap(),
            ("Content-Type".to_string(), "application/json".to_string())
        );
        assert_eq!(
            parse_header("X-Url:http://a:b").unwrap(),
            ("X-Url".to_string(), "http://a:b".to_string())
        );
        assert!(parse_header("no colon").is_err());
        assert!(parse_header("Bad Name: x").is_err());
        assert!(parse_header("Empty:   ").is_err());
    }

    #[test]
    fn test_parse_basic_auth() {
        assert_eq!(
            parse_basic_auth("user:secret").unwrap(),
            ("user".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_basic_auth("a:b:cd").unwrap(),
            ("a:b".to_string(), "cd".to_string())
        );
        assert!(parse_basic_auth("user:").is_err());
        assert!(parse_basic_auth("user: secret").is_err());
        assert!(parse_basic_auth("nouser").is_err());
    }

    #[test]
    fn test_parse_proxy() {
        assert_eq!(
            parse_proxy("127.0.0.1:3128").unwrap().as_str(),
            "http://127.0.0.1:3128/"
        );
        assert_eq!(
            parse_proxy("http://proxy.local:8080").unwrap().port(),
            Some(8080)
        );
    }
}
