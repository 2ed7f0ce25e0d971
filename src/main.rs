//! grelay - a minimal HTTP/2 gRPC-streaming forwarding proxy
//!
//! Usage:
//!     grelay run --config <path>
//!     grelay demo [--mode batch-headers] [--header-timeout 5s]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use grelay::config::{Config, load_config};
use grelay::proxy::ProxyServer;
use grelay::relay::ForwardingMode;
use grelay::scenarios::{ScenarioOptions, run_all};
use grelay::tls::{self, CertificateMaterial};
use grelay::util::{ShutdownSignal, init_logging};

/// A minimal HTTP/2 gRPC-streaming forwarding proxy.
#[derive(Parser, Debug)]
#[command(name = "grelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the forwarding proxy
    Run {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Validate configuration and exit
        #[arg(long)]
        validate: bool,
    },

    /// Start the echo backend and the proxy in-process, then run the three
    /// exchange scenarios sequentially
    Demo {
        /// Path to the configuration file (defaults match the demo ports)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Header forwarding discipline of the relay
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Bound the await-headers step (e.g. "5s"). Omitted, the step waits
        /// indefinitely - a batching relay then hangs the headers-only
        /// scenario, which is the behavior under demonstration.
        #[arg(long, value_parser = humantime::parse_duration, value_name = "DURATION")]
        header_timeout: Option<Duration>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Immediate,
    BatchHeaders,
}

impl From<ModeArg> for ForwardingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Immediate => ForwardingMode::Immediate,
            ModeArg::BatchHeaders => ForwardingMode::BatchHeaders,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, validate } => run_proxy(config, cli.log_level, validate),
        Command::Demo {
            config,
            mode,
            header_timeout,
        } => run_demo(config, cli.log_level, mode, header_timeout),
    }
}

/// Run the proxy from a configuration file until Ctrl+C.
fn run_proxy(path: PathBuf, log_level: Option<String>, validate: bool) -> Result<()> {
    let config = load_config(&path)
        .with_context(|| format!("failed to load configuration from '{}'", path.display()))?;

    let level = log_level.as_deref().unwrap_or(&config.global.log_level);
    init_logging(level, &config.global.log_format);

    if validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen:     {}", config.proxy.listen);
        println!("  Upstream:   {}", config.proxy.upstream);
        println!("  Forwarding: {}", config.proxy.forwarding);
        return Ok(());
    }

    info!(
        config_path = %path.display(),
        listen = %config.proxy.listen,
        upstream = %config.proxy.upstream,
        mode = %config.proxy.forwarding,
        "grelay starting"
    );

    runtime()?.block_on(run_proxy_async(config))
}

async fn run_proxy_async(config: Config) -> Result<()> {
    let material = CertificateMaterial::from_config(&config.tls)
        .context("failed to obtain certificate material")?;
    let server_tls = tls::server_config(&material).context("failed to build server TLS config")?;
    let client_tls = tls::client_config(&config.tls).context("failed to build client TLS config")?;

    let shutdown = ShutdownSignal::new();

    let proxy = ProxyServer::bind(&config.proxy, server_tls, client_tls)
        .await
        .with_context(|| format!("failed to bind proxy on {}", config.proxy.listen))?;

    let handle = tokio::spawn(proxy.run(shutdown.clone()));

    info!("grelay is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    shutdown.shutdown();
    let _ = handle.await;

    info!("grelay shut down complete");
    Ok(())
}

/// Start backend + proxy and run the scenarios.
fn run_demo(
    path: Option<PathBuf>,
    log_level: Option<String>,
    mode: Option<ModeArg>,
    header_timeout: Option<Duration>,
) -> Result<()> {
    let mut config = match path {
        Some(path) => load_config(&path)
            .with_context(|| format!("failed to load configuration from '{}'", path.display()))?,
        None => demo_config(),
    };

    if let Some(mode) = mode {
        config.proxy.forwarding = mode.into();
    }

    let level = log_level.as_deref().unwrap_or(&config.global.log_level);
    init_logging(level, &config.global.log_format);

    info!(mode = %config.proxy.forwarding, "running exchange scenarios");

    let opts = ScenarioOptions {
        header_wait: header_timeout,
    };

    runtime()?.block_on(run_all(&config, &opts))?;

    println!("DONE");
    Ok(())
}

/// Built-in demo configuration: backend on 10000, proxy on 11000, loopback
/// only, self-signed certificates, verification disabled.
fn demo_config() -> Config {
    let yaml = r#"
global:
  log_level: info
  log_format: pretty

proxy:
  listen: "127.0.0.1:11000"
  upstream: "127.0.0.1:10000"

backend:
  listen: "127.0.0.1:10000"

tls:
  common_name: "Proxy"
  validation: accept_any
"#;
    // The built-in configuration is covered by tests; parsing cannot fail at
    // runtime.
    serde_yaml::from_str(yaml).expect("built-in demo configuration is valid")
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
}
