use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{AppConfig, LoggingConfig};
use ratekeeper::ratelimit::{Policy, RateLimiter, RequestMeta};
use ratekeeper::replay::{parse_trace, replay};
use ratekeeper::sweeper::Sweeper;

/// Per-client rate limiting over fixed or sliding windows.
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version)]
struct Args {
    /// Configuration file (YAML); RATEKEEPER__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Maximum admitted requests per client per window
    #[arg(long)]
    limit: Option<u64>,

    /// Window length in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Counting policy
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a `<t_ms> <client>` trace and print one decision per line
    Replay {
        /// Trace file, or `-` for stdin
        #[arg(default_value = "-")]
        trace: String,

        /// Sweep expired clients every N milliseconds of trace time
        #[arg(long)]
        sweep_every_ms: Option<u64>,
    },
    /// Read one request per stdin line and decide against the wall clock.
    ///
    /// A line is the value of the configured key header, or the peer address
    /// (`ip` or `ip:port`) when no header is configured.
    Live,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Fixed,
    Sliding,
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Fixed => Policy::FixedWindow,
            PolicyArg::Sliding => Policy::SlidingWindow,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(limit) = args.limit {
        config.rate_limiting.limit = limit;
    }
    if let Some(window_ms) = args.window_ms {
        config.rate_limiting.window_ms = window_ms;
    }
    if let Some(policy) = args.policy {
        config.rate_limiting.policy = policy.into();
    }
    config.logging.json |= args.json_logs;

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = Arc::new(RateLimiter::new(config.rate_limiting.clone())?);
    info!(
        limit = config.rate_limiting.limit,
        window = ?config.rate_limiting.window(),
        policy = ?config.rate_limiting.policy,
        store = ?config.rate_limiting.store,
        on_fault = ?config.rate_limiting.on_fault,
        "Rate limiter initialized"
    );

    match args.command {
        Command::Replay {
            trace,
            sweep_every_ms,
        } => run_replay(&limiter, &trace, sweep_every_ms)?,
        Command::Live => run_live(limiter).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_replay(limiter: &RateLimiter, trace: &str, sweep_every_ms: Option<u64>) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = if trace == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(trace).with_context(|| format!("opening trace {trace}"))?;
        Box::new(BufReader::new(file))
    };

    let events = parse_trace(reader)?;
    info!(events = events.len(), "Replaying trace");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut write_err = None;

    let summary = replay(limiter, &events, sweep_every_ms, |record| {
        if write_err.is_some() {
            return;
        }
        let line = serde_json::to_string(record).map_err(io::Error::from);
        if let Err(e) = line.and_then(|line| writeln!(out, "{line}")) {
            write_err = Some(e);
        }
    });

    if let Some(e) = write_err {
        return Err(e).context("writing replay output");
    }

    writeln!(out, "{}", json!({ "summary": summary }))?;
    Ok(())
}

async fn run_live(limiter: Arc<RateLimiter>) -> anyhow::Result<()> {
    let sweeper = Sweeper::start(limiter.clone());
    let mut lines = AsyncBufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Reading client keys from stdin");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            info!("End of input");
            break;
        };
        let client = line.trim();
        if client.is_empty() {
            continue;
        }

        let request = live_request(client, limiter.config().key_header.as_deref());
        let decision = limiter.check_request_or_fallback(&request);
        let now = limiter.clock().now_millis().unwrap_or_default();
        let headers: serde_json::Map<String, serde_json::Value> = decision
            .headers(now)
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.into()))
            .collect();
        let reset_at = decision
            .reset_known()
            .then(|| chrono::DateTime::from_timestamp_millis(decision.reset_at_ms as i64))
            .flatten()
            .map(|t| t.to_rfc3339());
        let reset_after_ms = decision
            .reset_known()
            .then(|| decision.reset_after(now).as_millis() as u64);

        println!(
            "{}",
            json!({
                "client": client,
                "status": decision.status_code(),
                "admitted": decision.admitted,
                "reset_at": reset_at,
                "reset_after_ms": reset_after_ms,
                "headers": headers,
            })
        );
    }

    sweeper.shutdown().await;
    info!(stats = ?limiter.stats(), tracked = limiter.tracked_clients(), "Ratekeeper stopped");
    Ok(())
}

/// Build the request a live input line stands for.
///
/// Lines that are not addresses yield a request without a key when no header
/// is configured, which the limiter's fault mode then decides.
fn live_request(line: &str, key_header: Option<&str>) -> RequestMeta {
    let request = RequestMeta::new();
    if let Some(header) = key_header {
        return request.with_header(header, line);
    }

    let peer = line
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| line.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 0)));
    match peer {
        Some(addr) => request.with_peer(addr),
        None => request,
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
