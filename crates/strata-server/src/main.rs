//! `strata`: run the intercepting proxy from the command line.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_core::options::{ConnectionStrategy, Options, ProxyMode};
use strata_core::DEFAULT_PROXY_PORT;
use strata_server::{ProxyServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "strata", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen_host: std::net::IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Proxy mode: regular, transparent, upstream:<url> or reverse:<url>
    #[arg(short, long)]
    mode: Option<ProxyMode>,

    /// JSON file with proxy options; flags override it
    #[arg(long)]
    options: Option<PathBuf>,

    /// Directory holding the CA certificate and key
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Pass matching hosts through untouched (repeatable)
    #[arg(long = "ignore-host")]
    ignore_hosts: Vec<String>,

    /// Only intercept matching hosts (repeatable)
    #[arg(long = "allow-host")]
    allow_hosts: Vec<String>,

    /// Relay non-HTTP traffic as raw TCP
    #[arg(long)]
    rawtcp: bool,

    /// Disable HTTP/2
    #[arg(long)]
    no_http2: bool,

    /// Open server connections only when a request needs them
    #[arg(long)]
    lazy: bool,

    /// Trace every event and command through the layer stack
    #[arg(long)]
    proxy_debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) {
    let log_level = if args.proxy_debug { "debug" } else { &args.log_level };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("strata_server={},strata={},warn", log_level, log_level)));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn load_options(args: &Args) -> anyhow::Result<Options> {
    let mut options = match &args.options {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Options::default(),
    };
    if let Some(mode) = &args.mode {
        options.mode = mode.clone();
    }
    if !args.ignore_hosts.is_empty() {
        options.ignore_hosts = args.ignore_hosts.clone();
    }
    if !args.allow_hosts.is_empty() {
        options.allow_hosts = args.allow_hosts.clone();
    }
    options.rawtcp |= args.rawtcp;
    options.http2 &= !args.no_http2;
    options.proxy_debug |= args.proxy_debug;
    if args.lazy {
        options.connection_strategy = ConnectionStrategy::Lazy;
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);
    tracing::debug!("Args: {:?}", args);

    let options = load_options(&args)?;
    let mut config = ServerConfig::new()
        .with_addr(SocketAddr::new(args.listen_host, args.port))
        .with_options(options);
    if let Some(dir) = &args.ca_dir {
        config = config.with_ca_dir(dir);
    }

    let server = ProxyServer::new(config).context("configuring proxy")?;
    tracing::info!("Install {:?} as a trusted root to intercept TLS", server.ca_cert_path());

    tokio::select! {
        result = server.run() => result.context("proxy failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
