use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use chatrelay_config::{load_default, load_dotenv, load_from_path, RelayConfig};
use chatrelay_core::endpoint::redact;
use chatrelay_dispatch::Dispatcher;
use chatrelay_endpoints::EndpointRegistry;
use chatrelay_proxy::{ProxyConfig, ProxyServer, ProxyState};
use chatrelay_telemetry::{MetricsRecorder, TelemetryOptions};

/// chatrelayd - chat-completion relay daemon
///
/// Configuration discovery rules:
/// 1. If `--config PATH` (or `-c PATH`) is provided, that path is used.
/// 2. Otherwise `/etc/chatrelay/chatrelay.toml`, then `./chatrelay.toml`.
/// 3. Otherwise built-in defaults.
///
/// `HOST`, `PORT`, `DEFAULT_MODEL`, `API_BASE` and `API_KEY` (from the
/// environment or a `.env` file) override the file.
#[derive(Debug, Parser)]
#[command(
    name = "chatrelayd",
    version,
    about = "chat-completion relay daemon",
    long_about = "chatrelayd forwards chat-completion requests to configured OpenAI-compatible upstream endpoints, retrying failed calls.",
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long = "config", short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (overrides the config file and RUST_LOG).
    ///
    /// Accepts standard tracing levels (trace, debug, info, warn, error) or a
    /// full filter expression (e.g. "info,chatrelay_dispatch=debug").
    #[arg(long = "log-level", short = 'L', value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print loaded configuration summary (credentials redacted) before starting.
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,

    /// Address to bind on, overriding `[server]` host and port.
    #[arg(long = "bind-addr", value_name = "ADDR")]
    bind_addr: Option<String>,

    /// Validate configuration and exit without starting the daemon.
    #[arg(long = "check-config", action = ArgAction::SetTrue)]
    check_config: bool,
}

fn main() {
    let cli = Cli::parse();

    let dotenv_path = load_dotenv();

    // Telemetry settings live in the config file, so configuration has to be
    // read before the subscriber exists; failures here go to stderr.
    let (mut config, source) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("chatrelayd: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = config.apply_env_overrides() {
        eprintln!("chatrelayd: {}", err);
        process::exit(1);
    }

    let telemetry = TelemetryOptions {
        level: cli
            .log_level
            .clone()
            .or_else(|| config.log_level().map(str::to_string)),
        log_file: config.log_file().map(PathBuf::from),
    };
    if let Err(err) = chatrelay_telemetry::init(telemetry) {
        eprintln!("chatrelayd: failed to initialise telemetry: {}", err);
        process::exit(1);
    }

    match &source {
        Some(path) => tracing::info!("loaded configuration from {}", path.display()),
        None => tracing::info!("no configuration file found; using built-in defaults"),
    }
    if let Some(path) = &dotenv_path {
        tracing::info!("loaded environment from {}", path.display());
    }

    if let Err(err) = config.validate() {
        tracing::error!("configuration validation failed: {}", err);
        process::exit(1);
    }

    if cli.check_config {
        tracing::info!("configuration is valid");
        return;
    }

    if cli.print_config {
        print_config_summary(&config);
    }

    // Every upstream client is constructed here, before the listener opens.
    let registry = match EndpointRegistry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            tracing::error!("failed to build endpoint registry from config: {}", err);
            process::exit(1);
        }
    };

    tracing::info!("configured {} endpoints", registry.len());
    for entry in registry.iter() {
        let endpoint = entry.endpoint();
        tracing::info!(
            "endpoint '{}' -> base_url={}, default_model={}",
            endpoint.name,
            endpoint.base_url,
            endpoint.default_model.as_deref().unwrap_or("<none>")
        );
    }

    let bind_addr = match resolve_bind_addr(&cli, &config) {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!("invalid bind address: {}", err);
            process::exit(1);
        }
    };

    let state = match build_state(&config, registry) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("failed to set up request handling: {}", err);
            process::exit(1);
        }
    };

    let server = ProxyServer::new(ProxyConfig { listen_addr: bind_addr }, state);

    tracing::info!("starting chatrelay HTTP server on {}", bind_addr);

    if let Err(err) = run_server_blocking(server) {
        tracing::error!("chatrelay HTTP server terminated with error: {}", err);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> chatrelay_core::Result<(RelayConfig, Option<PathBuf>)> {
    match &cli.config {
        Some(path) => Ok((load_from_path(path)?, Some(path.clone()))),
        None => load_default(),
    }
}

/// Wire the dispatcher (and the metrics recorder, when compiled in) into
/// the HTTP state.
fn build_state(config: &RelayConfig, registry: Arc<EndpointRegistry>) -> anyhow::Result<ProxyState> {
    let dispatcher = Dispatcher::from_config(config, registry);

    #[cfg(feature = "prometheus")]
    {
        let recorder = Arc::new(chatrelay_telemetry::PrometheusMetricsRecorder::new()?);
        let metrics: Arc<dyn MetricsRecorder> = recorder.clone();
        let dispatcher = Arc::new(dispatcher.with_metrics(metrics));
        Ok(ProxyState::new(dispatcher, config.defaults.temperature).with_prometheus(recorder))
    }

    #[cfg(not(feature = "prometheus"))]
    {
        let metrics: Arc<dyn MetricsRecorder> = Arc::new(chatrelay_telemetry::NoopMetricsRecorder);
        let dispatcher = Arc::new(dispatcher.with_metrics(metrics));
        Ok(ProxyState::new(dispatcher, config.defaults.temperature))
    }
}

/// Resolve the bind address for the HTTP server.
///
/// Priority:
/// 1. `--bind-addr` CLI flag if provided.
/// 2. `[server]` host and port (after environment overrides).
///
/// Hostnames such as `localhost` are resolved; the first address wins.
fn resolve_bind_addr(cli: &Cli, cfg: &RelayConfig) -> Result<SocketAddr, String> {
    if let Some(addr_str) = cli.bind_addr.as_deref() {
        return first_addr(addr_str.to_socket_addrs(), addr_str)
            .map_err(|e| format!("failed to resolve --bind-addr '{}': {}", addr_str, e));
    }

    let host = cfg.server.host.trim();
    let port = cfg.server.port;
    first_addr((host, port).to_socket_addrs(), host)
        .map_err(|e| format!("failed to resolve server address '{}:{}': {}", host, port, e))
}

fn first_addr(
    resolved: std::io::Result<std::vec::IntoIter<SocketAddr>>,
    what: &str,
) -> std::io::Result<SocketAddr> {
    resolved?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("'{}' resolved to no addresses", what),
        )
    })
}

/// Run the HTTP server using a Tokio runtime.
fn run_server_blocking(server: ProxyServer) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move { server.run().await })?;

    Ok(())
}

/// Print a concise summary of the loaded configuration.
fn print_config_summary(cfg: &RelayConfig) {
    println!("chatrelayd configuration summary:");
    println!("  server.host              = {}", cfg.server.host);
    println!("  server.port              = {}", cfg.server.port);
    println!("  defaults.model           = {}", cfg.defaults.model);
    println!("  defaults.max_retries     = {}", cfg.defaults.max_retries);
    println!("  defaults.retry_delay_secs = {}", cfg.defaults.retry_delay_secs);
    println!("  defaults.temperature     = {}", cfg.defaults.temperature);
    println!(
        "  defaults.request_timeout_secs = {}",
        cfg.defaults.request_timeout_secs
    );
    println!(
        "  telemetry.log_file       = {}",
        cfg.log_file()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<stdout only>".to_string())
    );

    println!("  endpoints:");
    for ep in cfg.resolved_endpoints() {
        println!("    - name          = {}", ep.name);
        println!("      base_url      = {}", ep.base_url);
        println!("      api_key       = {}", redact(&ep.api_key));
        println!(
            "      default_model = {}",
            ep.default_model.as_deref().unwrap_or("<none>")
        );
    }
}
