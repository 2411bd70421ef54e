mod io;
mod session;

use anyhow::{bail, Context};
use clap::Parser;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use io::{DeviceConfig, DriverRegistry};
use rpiws_core::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use rpiws_core::TickOutcome;
use session::{AgentSession, AgentSettings};
use std::{
	env,
	fs::OpenOptions,
	io::{self as stdio, Write},
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
	self,
	client::IntoClientRequest,
	handshake::client::Request,
	http::{header::USER_AGENT, HeaderValue},
	Message,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:9000/rpi/";
const DEFAULT_USER_AGENT: &str = "rpiws-agent";
const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";
const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
const DEFAULT_W1_ROOT: &str = "/sys/bus/w1/devices";
const NET_ROOT: &str = "/sys/class/net";

#[derive(Parser, Debug)]
#[command(name = "rpiws-agent-rs")]
struct Args {
	#[arg(long, default_value = "")]
	hub_url: String,
	/// Development only: visible in the process list. Prefer RPIWS_HMAC_SECRET.
	#[arg(long, default_value = "")]
	secret: String,
	#[arg(long, default_value = "")]
	mac: String,
	#[arg(long, default_value = "")]
	user_agent: String,
	#[arg(long, default_value_t = 20)]
	idle_poll_ms: u64,
	#[arg(long, default_value = "")]
	i2c_bus: String,
	#[arg(long, default_value = "")]
	gpio_root: String,
	#[arg(long, default_value = "")]
	w1_root: String,
	#[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
	max_message_bytes: usize,
	#[arg(long, default_value_t = false)]
	debug: bool,
	#[arg(long, default_value = "")]
	log_dir: String,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
	hub_url: Url,
	secret: String,
	secret_from_flag: bool,
	mac: String,
	user_agent: String,
	idle_poll: Duration,
	devices: DeviceConfig,
	max_message_bytes: usize,
	debug: bool,
	log_dir: String,
}

impl RuntimeConfig {
	fn session_settings(&self) -> AgentSettings {
		AgentSettings {
			mac: self.mac.clone(),
			secret: Arc::from(self.secret.as_bytes()),
			max_message_bytes: self.max_message_bytes,
		}
	}
}

#[tokio::main]
async fn main() {
	let config = match load_config(Args::parse(), Path::new(NET_ROOT)) {
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
	let registry = Arc::new(DriverRegistry::with_defaults(&config.devices));
	let descriptor = registry.descriptor();
	info!(
		event = "agent_start",
		mac = %config.mac,
		hub_url = %config.hub_url,
		read_classes = descriptor.read.len(),
		write_classes = descriptor.write.len()
	);
	tokio::select! {
		_ = hub_loop(&config, registry) => {}
		_ = tokio::signal::ctrl_c() => info!(event = "agent_shutdown"),
	}
}

/// Connects, runs one session per connection, reconnects with backoff.
async fn hub_loop(config: &RuntimeConfig, registry: Arc<DriverRegistry>) {
	let mut backoff = Duration::from_secs(1);
	loop {
		let request = match connect_request(&config.hub_url, &config.user_agent) {
			Ok(request) => request,
			Err(err) => {
				warn!(event = "hub_request_error", error = %format!("{err:#}"));
				tokio::time::sleep(backoff).await;
				backoff = next_backoff(backoff);
				continue;
			}
		};
		let (mut ws, _) = match connect_async(request).await {
			Ok(value) => value,
			Err(err) => {
				warn!(event = "hub_connect_error", error = %err);
				tokio::time::sleep(backoff).await;
				backoff = next_backoff(backoff);
				continue;
			}
		};
		backoff = Duration::from_secs(1);
		info!(event = "hub_connected", url = %config.hub_url);

		let session = AgentSession::new(config.session_settings(), registry.clone());
		match run_session(&mut ws, session, config.idle_poll).await {
			Ok(()) => info!(event = "hub_disconnected"),
			Err(err) => warn!(event = "hub_session_error", error = %format!("{err:#}")),
		}
		let _ = ws.close(None).await;
		tokio::time::sleep(backoff).await;
	}
}

fn connect_request(hub_url: &Url, user_agent: &str) -> anyhow::Result<Request> {
	let mut request = hub_url
		.as_str()
		.into_client_request()
		.with_context(|| format!("invalid hub url {hub_url}"))?;
	let value = HeaderValue::from_str(user_agent).context("invalid user agent")?;
	request.headers_mut().insert(USER_AGENT, value);
	Ok(request)
}

/// Pumps one connection: inbound messages go to the session, stream
/// ticks run whenever no message is waiting. Both may touch drivers, so
/// both run under `block_in_place`. A tick that sent a frame is
/// followed by another after a yield; an idle one waits `idle_poll`; a halted
/// stream sleeps until the broker says something.
async fn run_session<S>(ws: &mut S, mut session: AgentSession, idle_poll: Duration) -> anyhow::Result<()>
where
	S: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Unpin,
{
	let mut next_tick: Option<Instant> = None;
	let result = loop {
		if let Err(err) = flush(ws, &mut session).await {
			break Err(err);
		}
		let tick_at = next_tick;
		tokio::select! {
			inbound = ws.next() => {
				let text = match inbound {
					Some(Ok(Message::Text(text))) => text,
					Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
					Some(Ok(Message::Close(_))) | None => break Ok(()),
					Some(Ok(_)) => continue,
					Some(Err(err)) => break Err(err.into()),
				};
				if let Err(err) = tokio::task::block_in_place(|| session.on_message(&text)) {
					break Err(err.into());
				}
				next_tick = Some(Instant::now());
			}
			_ = async {
				match tick_at {
					Some(at) => tokio::time::sleep_until(at).await,
					None => std::future::pending::<()>().await,
				}
			} => {
				next_tick = match tokio::task::block_in_place(|| session.tick()) {
					TickOutcome::Sent => {
						tokio::task::yield_now().await;
						Some(Instant::now())
					}
					TickOutcome::Idle => Some(Instant::now() + idle_poll),
					TickOutcome::Halted => None,
				};
			}
		}
	};
	info!(
		event = "session_end",
		phase = session.phase(),
		streaming = session.is_streaming()
	);
	session.teardown();
	result
}

async fn flush<S>(ws: &mut S, session: &mut AgentSession) -> anyhow::Result<()>
where
	S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
	for outgoing in session.take_outgoing() {
		let text = outgoing.encode()?;
		ws.send(Message::Text(text)).await.context("send to hub")?;
	}
	Ok(())
}

fn load_config(args: Args, net_root: &Path) -> anyhow::Result<RuntimeConfig> {
	let (secret, secret_from_flag) = pick_secret(&args.secret, env::var("RPIWS_HMAC_SECRET").ok());
	if secret.is_empty() {
		bail!("missing HMAC secret: pass --secret or set RPIWS_HMAC_SECRET");
	}
	let raw_url = resolve_value(&args.hub_url, "RPIWS_HUB_URL", DEFAULT_HUB_URL);
	let hub_url = Url::parse(&raw_url).with_context(|| format!("invalid hub url {raw_url}"))?;
	let user_agent = resolve_value(&args.user_agent, "RPIWS_AGENT_USER_AGENT", DEFAULT_USER_AGENT);
	HeaderValue::from_str(&user_agent).context("invalid user agent")?;
	Ok(RuntimeConfig {
		hub_url,
		secret,
		secret_from_flag,
		mac: resolve_mac(&args.mac, net_root)?,
		user_agent,
		idle_poll: Duration::from_millis(args.idle_poll_ms.max(1)),
		devices: DeviceConfig {
			gpio_root: PathBuf::from(resolve_value(&args.gpio_root, "RPIWS_GPIO_ROOT", DEFAULT_GPIO_ROOT)),
			w1_root: PathBuf::from(resolve_value(&args.w1_root, "RPIWS_W1_ROOT", DEFAULT_W1_ROOT)),
			i2c_bus: PathBuf::from(resolve_value(&args.i2c_bus, "RPIWS_I2C_BUS", DEFAULT_I2C_BUS)),
		},
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

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
	if !flag.trim().is_empty() {
		return flag.trim().to_string();
	}
	if let Ok(value) = env::var(env_key) {
		if !value.trim().is_empty() {
			return value.trim().to_string();
		}
	}
	default.to_string()
}

fn resolve_mac(flag: &str, net_root: &Path) -> anyhow::Result<String> {
	let value = resolve_value(flag, "RPIWS_MAC", "");
	if !value.is_empty() {
		return Ok(value.to_uppercase());
	}
	interface_mac(net_root).context("no interface MAC found: pass --mac or set RPIWS_MAC")
}

/// First interface (by name) other than loopback with a non-zero address.
fn interface_mac(net_root: &Path) -> Option<String> {
	let mut names: Vec<String> = std::fs::read_dir(net_root)
		.ok()?
		.filter_map(Result::ok)
		.map(|entry| entry.file_name().to_string_lossy().into_owned())
		.filter(|name| name != "lo")
		.collect();
	names.sort();
	names.into_iter().find_map(|name| {
		let raw = std::fs::read_to_string(net_root.join(name).join("address")).ok()?;
		let mac = raw.trim().to_uppercase();
		(!mac.is_empty() && mac != "00:00:00:00:00:00").then_some(mac)
	})
}

fn env_true(key: &str) -> bool {
	match env::var(key) {
		Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
		Err(_) => false,
	}
}

fn next_backoff(current: Duration) -> Duration {
	let next = current + current;
	if next > Duration::from_secs(10) {
		Duration::from_secs(10)
	} else {
		next
	}
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
	let level = if config.debug {
		"debug".to_string()
	} else if let Ok(level) = env::var("RPIWS_LOG_LEVEL") {
		level
	} else {
		"info".to_string()
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let writer = match open_log_file(&config.log_dir, &config.mac) {
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

struct LogGuard {
	file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
	file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
	fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
		Self { file }
	}
}

impl Write for MultiWriter {
	fn write(&mut self, buf: &[u8]) -> stdio::Result<usize> {
		let _ = stdio::stdout().write_all(buf);
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.write_all(buf);
			}
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> stdio::Result<()> {
		let _ = stdio::stdout().flush();
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.flush();
			}
		}
		Ok(())
	}
}

fn log_file_name(mac: &str) -> String {
	format!("rpiws-agent-{}.log", sanitize_component(mac))
}

fn open_log_file(log_dir: &str, mac: &str) -> stdio::Result<LogGuard> {
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
		.open(dir.join(log_file_name(mac)))?;
	Ok(LogGuard {
		file: Some(Arc::new(Mutex::new(file))),
	})
}

fn sanitize_component(input: &str) -> String {
	input
		.chars()
		.map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
		.collect()
}
