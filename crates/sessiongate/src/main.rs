use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};

use log::{LevelFilter, debug, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sessiongate::api::{self, AppState, GatewaySettings};
use sessiongate::auth::{ConfigValidationError, TokenConfig, TokenIssuer};
use sessiongate::db::Database;
use sessiongate::registry::{RegistrySettings, SqliteRegistryStore, TokenRegistry};

const APP_NAME: &str = "sessiongate";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging();
    debug!("resolved paths: {}", ctx.paths);

    run(ctx, cli.command)
}

#[tokio::main]
async fn run(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Sweep => handle_sweep(&ctx).await,
        Command::Stats => handle_stats(&ctx).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sessiongate - token-addressed gateway for ephemeral backends.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit JSON logs and JSON command output
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway (control plane and data plane)
    Serve(ServeCommand),
    /// Remove expired sessions and stale server registrations once
    Sweep,
    /// Print registry statistics
    Stats,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths.config_file)?;
        if let Some(dir) = &config.paths.data_dir {
            paths.data_dir = expand_str_path(dir)?;
        }
        fs::create_dir_all(&paths.data_dir)
            .with_context(|| format!("creating data directory {}", paths.data_dir.display()))?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = level.as_str().to_ascii_lowercase();
            EnvFilter::new(format!("sessiongate={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let ansi = env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
                .try_init()
                .ok();
        }

        // Service code logs through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();
    }

    fn effective_log_level(&self) -> LevelFilter {
        match self.common.verbose {
            0 => self
                .config
                .logging
                .level
                .parse()
                .unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Open the registry store. `issuer` is separate so maintenance commands
    /// can run without a signing secret.
    async fn open_registry(&self, issuer: TokenIssuer) -> Result<TokenRegistry> {
        let database = match self.config.store.url.as_deref() {
            Some(url) => Database::connect(url).await?,
            None => Database::new(&self.paths.data_dir.join("registry.db")).await?,
        };
        info!(
            "Registry store ready (namespace '{}')",
            self.config.store.namespace
        );

        let store = SqliteRegistryStore::new(&database, self.config.store.namespace.clone());
        Ok(TokenRegistry::new(
            Arc::new(store),
            issuer,
            RegistrySettings {
                default_ttl_minutes: self.config.tokens.default_ttl_minutes,
                max_sessions_per_user_per_hour: self
                    .config
                    .registry
                    .max_sessions_per_user_per_hour,
            },
        ))
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    store: StoreConfig,
    tokens: TokenConfig,
    gateway: GatewayConfig,
    tls: TlsConfig,
    registry: RegistryConfig,
    shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Everything `serve` needs before it may accept traffic.
    fn validate(&self) -> Result<(), ConfigValidationError> {
        self.tokens.validate()?;

        if let Some(url) = &self.store.url
            && url.trim().is_empty()
        {
            return Err(ConfigValidationError::MissingStoreUrl);
        }

        let prefix = &self.gateway.prefix;
        if !prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(ConfigValidationError::InvalidPrefix(prefix.clone()));
        }

        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(ConfigValidationError::IncompleteTls);
        }

        Ok(())
    }

    fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            prefix: self.gateway.prefix.clone(),
            request_timeout: Duration::from_secs(self.gateway.request_timeout_secs),
            ws_idle_timeout: Duration::from_secs(self.gateway.ws_idle_timeout_secs),
            max_body_bytes: self.gateway.max_body_bytes,
            allowed_origins: self.gateway.allowed_origins.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct StoreConfig {
    /// SQLite connection string. Defaults to `registry.db` in the data dir.
    url: Option<String>,
    /// Logical partition; gateways sharing a database but not a namespace
    /// never see each other's sessions.
    namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    prefix: String,
    allowed_origins: Vec<String>,
    request_timeout_secs: u64,
    ws_idle_timeout_secs: u64,
    max_body_bytes: usize,
    /// Base URL clients reach the gateway at. Used in logs only; backends
    /// build session URLs from their own configuration.
    public_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefix: "/s".to_string(),
            allowed_origins: Vec::new(),
            request_timeout_secs: 30,
            ws_idle_timeout_secs: 3600,
            max_body_bytes: 10 * 1024 * 1024,
            public_url: None,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct TlsConfig {
    cert_path: Option<String>,
    key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RegistryConfig {
    stale_server_minutes: i64,
    sweep_interval_secs: u64,
    /// 0 = unlimited.
    max_sessions_per_user_per_hour: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_server_minutes: 30,
            sweep_interval_secs: 60,
            max_sessions_per_user_per_hour: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ShutdownConfig {
    server_secs: u64,
    websocket_secs: u64,
    store_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            server_secs: 10,
            websocket_secs: 5,
            store_secs: 5,
        }
    }
}

async fn handle_sweep(ctx: &RuntimeContext) -> Result<()> {
    let registry = ctx.open_registry(TokenIssuer::opaque()).await?;
    let report = registry
        .sweep(ctx.config.registry.stale_server_minutes)
        .await
        .context("sweeping registry")?;
    registry.close().await;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::json!({
                "expiredSessions": report.expired_sessions,
                "staleServers": report.stale_servers,
            })
        );
    } else {
        println!(
            "Removed {} expired session(s) and {} stale server(s)",
            report.expired_sessions, report.stale_servers
        );
    }
    Ok(())
}

async fn handle_stats(ctx: &RuntimeContext) -> Result<()> {
    let registry = ctx.open_registry(TokenIssuer::opaque()).await?;
    let stats = registry.get_stats().await.context("reading registry stats")?;
    registry.close().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("serializing stats")?
    );
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    config.validate().context("invalid configuration")?;

    let issuer = TokenIssuer::from_config(&config.tokens).context("invalid token configuration")?;
    info!("Issuing {:?} tokens", issuer.format());

    let registry = ctx.open_registry(issuer).await?;
    if let Err(e) = registry.sweep(config.registry.stale_server_minutes).await {
        warn!("Startup sweep failed (continuing anyway): {:?}", e);
    }
    let sweep_task = registry.start_sweep_task(
        config.registry.sweep_interval_secs,
        config.registry.stale_server_minutes,
    );

    let state = AppState::new(registry.clone(), config.gateway_settings());
    let app = api::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .context("invalid address")?;

    let server_grace = Duration::from_secs(config.shutdown.server_secs);
    let stop = CancellationToken::new();

    let mut server_task = match (&config.tls.cert_path, &config.tls.key_path) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                expand_str_path(cert)?,
                expand_str_path(key)?,
            )
            .await
            .context("loading TLS certificate and key")?;

            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            let stop_signal = stop.clone();
            tokio::spawn(async move {
                stop_signal.cancelled().await;
                stopper.graceful_shutdown(Some(server_grace));
            });

            info!("Listening on https://{}", addr);
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .context("running server")
            })
        }
        _ => {
            let listener = TcpListener::bind(addr)
                .await
                .context("binding to address")?;
            info!("Listening on http://{}", addr);

            let stop_signal = stop.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { stop_signal.cancelled().await })
                    .await
                    .context("running server")
            })
        }
    };

    if let Some(public_url) = &config.gateway.public_url {
        info!("Sessions reachable at {}{}/{{token}}/", public_url, config.gateway.prefix);
    }

    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server_task => Some(result),
    };

    if let Some(result) = early_exit {
        sweep_task.abort();
        registry.close().await;
        return result.context("server task panicked")?;
    }

    info!("Shutdown signal received");

    // 1. Refuse new sessions.
    state.start_draining();

    // 2. Close the listener and let in-flight requests finish.
    stop.cancel();
    match tokio::time::timeout(server_grace, &mut server_task).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => warn!("HTTP server stopped with error: {:?}", e),
        Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
        Err(_) => {
            warn!("HTTP server did not stop within {:?}; aborting", server_grace);
            server_task.abort();
        }
    }

    // 3. Close relayed WebSockets.
    state
        .websockets
        .shutdown(Duration::from_secs(config.shutdown.websocket_secs))
        .await;

    // 4. Store last.
    sweep_task.abort();
    let store_grace = Duration::from_secs(config.shutdown.store_secs);
    if tokio::time::timeout(store_grace, registry.close()).await.is_err() {
        warn!("Registry store did not close within {:?}", store_grace);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Defaults, then the TOML file if present, then `SESSIONGATE__*` env vars.
fn load_config(path: &Path) -> Result<AppConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("store.namespace", "default")?
        .set_default("gateway.prefix", "/s")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("gateway.allowed_origins")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    Ok(built.try_deserialize()?)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}
