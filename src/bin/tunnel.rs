//! UDP-over-TLS Tunnel
//!
//! Runs one tunnel endpoint:
//! - Reads headered datagrams on the UDP port and forwards them to peers
//! - Accepts mutually authenticated peers on the TLS port
//! - Re-emits tunnelled datagrams on this host

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use udp_tls_tunnel::{
    config::{generate_example_config, level_directive, Config, LoggingConfig},
    delivery,
    local_addrs::SystemAddrs,
    service::ServiceOptions,
    transport::{client_config, load_identity, load_trust_roots, server_config},
    TunnelService,
};

/// UDP-over-TLS Tunnel - carries UDP datagrams between hosts over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "udp-tls-tunnel")]
#[command(about = "UDP-over-TLS Tunnel - forwards UDP datagrams over mutually authenticated TLS")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/udp_rx/udp_rx_conf.toml")]
    config: String,

    /// Address to bind both listeners to (overrides config)
    #[arg(long)]
    bindaddr: Option<String>,

    /// Private key path (overrides config)
    #[arg(long)]
    keypath: Option<String>,

    /// Certificate path (overrides config)
    #[arg(long)]
    certpath: Option<String>,

    /// CA certificate path (overrides config)
    #[arg(long)]
    cacert: Option<String>,

    /// Enable network profiling; both ends must agree
    #[arg(long)]
    netprof: bool,

    /// Log level (trace, debug, info, warn, error, or 0/1/2)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        print!("{}", example);
        return Ok(());
    }

    // Load configuration; a missing file falls back to defaults
    let (mut config, load_error) = match Config::load(&args.config) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    apply_overrides(&mut config, &args);

    init_logging(&config.logging, args.log_level.as_deref())?;

    if let Some(e) = load_error {
        warn!("{} ({}), using defaults", e, args.config);
    }
    config.validate().context("Invalid configuration")?;

    info!("UDP-over-TLS Tunnel v{}", udp_tls_tunnel::VERSION);

    // Load TLS identity and trust roots
    let identity = load_identity(&config.tls.cert_path, &config.tls.key_path)
        .context("Failed to load TLS identity")?;
    let roots =
        load_trust_roots(&config.tls.ca_cert_path).context("Failed to load CA certificate")?;
    let client_tls =
        client_config(&identity, roots.clone()).context("Failed to build TLS client config")?;
    let server_tls = server_config(&identity, roots).context("Failed to build TLS server config")?;

    let delivery =
        delivery::for_platform(config.tunnel.delivery).context("Failed to set up local delivery")?;

    let service = TunnelService::new(
        ServiceOptions::from_config(&config.tunnel),
        client_tls,
        delivery,
        Arc::new(SystemAddrs),
    );

    let listen_ip = config.tunnel.listen_ip()?;
    let tls_pump = service
        .start_tls_ingress(SocketAddr::new(listen_ip, config.tunnel.tls_port), server_tls)
        .await
        .context("Failed to start TLS ingress")?;
    let udp_pump = service
        .start_udp_ingress(SocketAddr::new(listen_ip, config.tunnel.udp_port))
        .await
        .context("Failed to start UDP ingress")?;

    info!("TLS ingress on {}", tls_pump.local_addr());
    info!("UDP ingress on {}", udp_pump.local_addr());
    if config.tunnel.net_profiling {
        info!("Network profiling enabled");
    }

    let tls_name = tls_pump.name();
    let udp_name = udp_pump.name();
    let outcome = tokio::select! {
        result = tls_pump.wait() => Some((tls_name, result)),
        result = udp_pump.wait() => Some((udp_name, result)),
        _ = tokio::signal::ctrl_c() => None,
    };

    service.shutdown().await;

    match outcome {
        None => {
            info!("Shutting down...");
            Ok(())
        }
        Some((name, Ok(()))) => {
            error!("{} stopped unexpectedly", name);
            Err(anyhow!("{} stopped unexpectedly", name))
        }
        Some((name, Err(e))) => {
            error!("{} failed: {}", name, e);
            Err(anyhow::Error::new(e).context(format!("{} failed", name)))
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(addr) = &args.bindaddr {
        config.tunnel.listen_addr = addr.clone();
    }
    if let Some(path) = &args.keypath {
        config.tls.key_path = path.clone();
    }
    if let Some(path) = &args.certpath {
        config.tls.cert_path = path.clone();
    }
    if let Some(path) = &args.cacert {
        config.tls.ca_cert_path = path.clone();
    }
    if args.netprof {
        config.tunnel.net_profiling = true;
    }
}

fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = match level_override {
        Some(level) => level_directive(level),
        None => config.filter_directive(),
    };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("Invalid log level {:?}", level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match config.format.as_str() {
                "json" => builder.json().init(),
                "compact" => builder.compact().init(),
                _ => builder.pretty().init(),
            }
        }
        None => match config.format.as_str() {
            "json" => builder.json().init(),
            "compact" => builder.compact().init(),
            _ => builder.pretty().init(),
        },
    }

    Ok(())
}
