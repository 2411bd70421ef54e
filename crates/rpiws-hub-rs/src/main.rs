mod admin;
mod agent_session;
mod hub;
mod link;
mod registry;
mod site_comm;
mod viewer_session;
mod ws;

use agent_session::SessionSettings;
use anyhow::{bail, Context};
use clap::Parser;
use hub::Hub;
use rpiws_core::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use site_comm::SiteComm;
use std::{
    fs::OpenOptions,
    future::IntoFuture,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use ws::WsState;

const DEFAULT_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:9001";
const DEFAULT_AGENT_USER_AGENT: &str = "rpiws-agent";
const SITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    admin_addr: String,
    secret: String,
    secret_from_flag: bool,
    agent_user_agent: String,
    site_addr: Option<String>,
    queue_capacity: usize,
    write_timeout: Duration,
    max_message_bytes: usize,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "rpiws-hub-rs")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    admin_addr: String,
    /// Development only: visible in the process list. Prefer RPIWS_HMAC_SECRET.
    #[arg(long, default_value = "")]
    secret: String,
    #[arg(long, default_value = "")]
    agent_user_agent: String,
    #[arg(long, default_value = "")]
    site_addr: String,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = match load_config(Args::parse()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);
    if config.secret_from_flag {
        warn!(event = "secret_from_flag", hint = "set RPIWS_HMAC_SECRET instead of --secret");
    }
    if let Err(err) = run(config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;
    let admin_addr: SocketAddr = config
        .admin_addr
        .parse()
        .with_context(|| format!("invalid admin addr {}", config.admin_addr))?;
    let site = match &config.site_addr {
        Some(site_addr) => Some(SiteComm::new(site_addr, SITE_TIMEOUT)?),
        None => None,
    };

    let settings = SessionSettings {
        secret: Arc::from(config.secret.as_bytes()),
        max_message_bytes: config.max_message_bytes,
    };
    let (hub, handle) = Hub::new(settings, site);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub_task = tokio::spawn(hub.run(shutdown_rx.clone()));

    let ws_app = ws::router(WsState {
        hub: handle.clone(),
        agent_user_agent: Arc::from(config.agent_user_agent.as_str()),
        queue_capacity: config.queue_capacity,
        write_timeout: config.write_timeout,
        max_message_bytes: config.max_message_bytes,
    });
    let admin_app = admin::router(handle);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("bind {admin_addr}"))?;

    info!(
        event = "hub_start",
        addr = %addr,
        admin_addr = %admin_addr,
        site_addr = config.site_addr.as_deref().unwrap_or("-")
    );

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    });

    let ws_server = axum::serve(
        listener,
        ws_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
    .into_future();
    let admin_server = axum::serve(admin_listener, admin_app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .into_future();
    let (ws_result, admin_result) = tokio::join!(ws_server, admin_server);
    ws_result.context("websocket server")?;
    admin_result.context("admin server")?;
    let _ = hub_task.await;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let (secret, secret_from_flag) =
        pick_secret(&args.secret, std::env::var("RPIWS_HMAC_SECRET").ok());
    if secret.is_empty() {
        bail!("missing HMAC secret: pass --secret or set RPIWS_HMAC_SECRET");
    }
    let site_addr = resolve_value(&args.site_addr, "RPIWS_SITE_ADDR", "");
    Ok(Config {
        addr: resolve_value(&args.addr, "RPIWS_ADDR", DEFAULT_ADDR),
        admin_addr: resolve_value(&args.admin_addr, "RPIWS_ADMIN_ADDR", DEFAULT_ADMIN_ADDR),
        secret,
        secret_from_flag,
        agent_user_agent: resolve_value(
            &args.agent_user_agent,
            "RPIWS_AGENT_USER_AGENT",
            DEFAULT_AGENT_USER_AGENT,
        ),
        site_addr: (!site_addr.is_empty()).then_some(site_addr),
        queue_capacity: args.queue_capacity.max(1),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        max_message_bytes: args.max_message_bytes,
        debug: args.debug || env_true("RPIWS_DEBUG"),
        log_dir: resolve_value(&args.log_dir, "RPIWS_LOG_DIR", ""),
    })
}

/// The environment wins over `--secret`; the flag is a development fallback.
/// Returns the secret and whether it came from the flag.
fn pick_secret(flag: &str, env_value: Option<String>) -> (String, bool) {
    if let Some(value) = env_value.map(|value| value.trim().to_string()) {
        if !value.is_empty() {
            return (value, false);
        }
    }
    let flag = flag.trim().to_string();
    let from_flag = !flag.is_empty();
    (flag, from_flag)
}

/// Flag, then environment, then default.
fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RPIWS_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &log_file_name(&config.addr)) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

fn log_file_name(addr: &str) -> String {
    let port = addr.rsplit(':').next().unwrap_or("hub");
    format!("rpiws-hub-{port}.log")
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, file_name: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file_name))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
