//! The agent side of the streaming protocol.
//!
//! Two states on a [`StateStack`]: `Register` answers the challenge and
//! applies configurations, `Stream` owns the polling loop. Leaving
//! `Stream` releases every driver the configuration built.

use crate::io::{ChannelTable, DriverRegistry};
use rpiws_core::auth::sign_challenge;
use rpiws_core::protocol::{
	decode_message, encode_message, peek_cmd, AgentToBroker, BrokerToAgent, ConfigPayload,
	ProtocolError, RegisterRequest, TokenPayload,
};
use rpiws_core::{AckWindow, DeltaBuffer, Lifecycle, SessionError, StateStack, TickOutcome, Transition};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentSettings {
	pub mac: String,
	pub secret: Arc<[u8]>,
	pub max_message_bytes: usize,
}

/// Everything the agent sends. The registration request is the only
/// message without a `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
	Register(RegisterRequest),
	Message(AgentToBroker),
}

impl Outgoing {
	pub fn encode(&self) -> Result<String, ProtocolError> {
		encode_message(self)
	}
}

struct Shared {
	settings: AgentSettings,
	registry: Arc<DriverRegistry>,
	channels: ChannelTable,
	outbox: Vec<Outgoing>,
}

impl Shared {
	fn send(&mut self, message: AgentToBroker) {
		self.outbox.push(Outgoing::Message(message));
	}
}

enum AgentState {
	Register,
	Stream(StreamState),
}

impl AgentState {
	fn name(&self) -> &'static str {
		match self {
			AgentState::Register => "register",
			AgentState::Stream(_) => "stream",
		}
	}
}

impl Lifecycle<Shared> for AgentState {
	fn activated(&mut self, shared: &mut Shared) {
		if let AgentState::Stream(stream) = self {
			info!(
				event = "stream_ready",
				reads = stream.reads.len(),
				writes = stream.writes.len(),
				live = shared.channels.len()
			);
		}
	}

	fn deactivated(&mut self, shared: &mut Shared) {
		if let AgentState::Stream(_) = self {
			shared.channels.release_all();
		}
	}
}

struct StreamState {
	reads: Vec<String>,
	writes: Vec<String>,
	read_buffer: DeltaBuffer<String, Value>,
	write_buffer: DeltaBuffer<String, Value>,
	window: AckWindow,
	paused: bool,
}

impl StreamState {
	fn new(reads: Vec<String>, writes: Vec<String>) -> Self {
		Self {
			reads,
			writes,
			read_buffer: DeltaBuffer::new(),
			write_buffer: DeltaBuffer::new(),
			window: AckWindow::new(),
			paused: true,
		}
	}

	fn handle(&mut self, message: BrokerToAgent, shared: &mut Shared) -> Transition<AgentState> {
		match message {
			BrokerToAgent::AckData { ack_count } => {
				self.window.grant(ack_count);
				Transition::Stay
			}
			BrokerToAgent::ResumeStreaming => {
				self.paused = false;
				info!(event = "stream_resumed");
				Transition::Stay
			}
			BrokerToAgent::PauseStreaming => {
				self.paused = true;
				info!(event = "stream_paused");
				Transition::Stay
			}
			BrokerToAgent::WriteData {
				inter_face_port,
				value,
			} => {
				match shared.channels.write(&inter_face_port, value) {
					None => debug!(event = "write_unbound", key = %inter_face_port),
					Some(Ok(())) => debug!(event = "write_applied", key = %inter_face_port),
					Some(Err(err)) => {
						warn!(event = "write_failed", key = %inter_face_port, error = %err)
					}
				}
				Transition::Stay
			}
			BrokerToAgent::DropToConfig => Transition::Pop,
			other => {
				warn!(event = "message_ignored", state = "stream", message = ?other);
				Transition::Stay
			}
		}
	}

	/// Reads every binding; a failed or unbound read is reported as null.
	fn sample(keys: &[String], buffer: &mut DeltaBuffer<String, Value>, channels: &mut ChannelTable) {
		for key in keys {
			let value = match channels.read(key) {
				Some(Ok(value)) => value,
				Some(Err(err)) => {
					debug!(event = "read_failed", key = %key, error = %err);
					Value::Null
				}
				None => Value::Null,
			};
			buffer.insert(key.clone(), value);
		}
	}

	fn tick(&mut self, shared: &mut Shared) -> TickOutcome {
		if self.paused || !self.window.is_open() {
			return TickOutcome::Halted;
		}
		Self::sample(&self.reads, &mut self.read_buffer, &mut shared.channels);
		Self::sample(&self.writes, &mut self.write_buffer, &mut shared.channels);
		if self.read_buffer.is_empty() && self.write_buffer.is_empty() {
			return TickOutcome::Idle;
		}
		if !self.window.try_consume() {
			return TickOutcome::Halted;
		}
		shared.send(AgentToBroker::Data {
			read: self.read_buffer.drain(),
			write: self.write_buffer.drain(),
		});
		TickOutcome::Sent
	}
}

pub struct AgentSession {
	stack: StateStack<AgentState>,
	shared: Shared,
}

impl AgentSession {
	/// Starts in `Register` with the registration request already queued.
	pub fn new(settings: AgentSettings, registry: Arc<DriverRegistry>) -> Self {
		let request = RegisterRequest {
			mac: settings.mac.clone(),
			inter_face: registry.descriptor(),
		};
		let mut shared = Shared {
			settings,
			registry,
			channels: ChannelTable::new(),
			outbox: vec![Outgoing::Register(request)],
		};
		let mut stack = StateStack::new();
		stack.push(AgentState::Register, &mut shared);
		Self { stack, shared }
	}

	pub fn phase(&self) -> &'static str {
		self.stack.current().map(AgentState::name).unwrap_or("closed")
	}

	pub fn is_streaming(&self) -> bool {
		matches!(
			self.stack.current(),
			Ok(AgentState::Stream(stream)) if !stream.paused
		)
	}

	pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
		std::mem::take(&mut self.shared.outbox)
	}

	/// Invalid JSON is a protocol violation. A CONFIG whose payload cannot
	/// be decoded is answered with CONFIG_FAIL; other undecodable commands
	/// are logged and skipped.
	pub fn on_message(&mut self, raw: &str) -> Result<(), SessionError> {
		debug!(event = "message_received", raw = %raw);
		let max = self.shared.settings.max_message_bytes;
		let cmd = peek_cmd(raw, max)?;
		let message = match decode_message::<BrokerToAgent>(raw, max) {
			Ok(message) => message,
			Err(err) if cmd.as_deref() == Some("CONFIG") => {
				warn!(event = "config_rejected", error = %err);
				self.shared.send(AgentToBroker::ConfigFail);
				return Ok(());
			}
			Err(err) => {
				warn!(event = "message_ignored", cmd = ?cmd, error = %err);
				return Ok(());
			}
		};

		let shared = &mut self.shared;
		let transition = match self.stack.current_mut()? {
			AgentState::Register => Self::handle_register(message, shared),
			AgentState::Stream(stream) => stream.handle(message, shared),
		};
		let dropped = matches!(transition, Transition::Pop);
		let pushed = matches!(transition, Transition::Push(_));
		self.stack.apply(transition, shared)?;
		if pushed {
			shared.send(AgentToBroker::ConfigOk);
		}
		if dropped {
			info!(event = "dropped_to_config");
			shared.send(AgentToBroker::DropToConfigOk);
		}
		Ok(())
	}

	fn handle_register(message: BrokerToAgent, shared: &mut Shared) -> Transition<AgentState> {
		match message {
			BrokerToAgent::Auth { payload } => {
				let token = sign_challenge(&shared.settings.secret, &shared.settings.mac, &payload.token);
				shared.send(AgentToBroker::Auth {
					payload: TokenPayload { token },
				});
				Transition::Stay
			}
			BrokerToAgent::Ack => {
				info!(event = "agent_registered", mac = %shared.settings.mac);
				Transition::Stay
			}
			BrokerToAgent::Config { payload } => Transition::Push(AgentState::Stream(Self::configure(payload, shared))),
			other => {
				warn!(event = "message_ignored", state = "register", message = ?other);
				Transition::Stay
			}
		}
	}

	/// Builds one driver per binding. A binding whose driver cannot be
	/// built stays in the stream and reports null.
	fn configure(payload: ConfigPayload, shared: &mut Shared) -> StreamState {
		let mut keys = |bindings: rpiws_core::BindingMap| -> Vec<String> {
			bindings
				.into_values()
				.map(|binding| {
					let key = binding.key();
					if let Err(err) = shared.channels.open(&shared.registry, &binding) {
						warn!(event = "binding_failed", key = %key, error = %err);
					}
					key
				})
				.collect()
		};
		let reads = keys(payload.read);
		let writes = keys(payload.write);
		StreamState::new(reads, writes)
	}

	/// One cooperative stream tick. Anything but `Stream` is halted.
	pub fn tick(&mut self) -> TickOutcome {
		match self.stack.current_mut() {
			Ok(AgentState::Stream(stream)) => stream.tick(&mut self.shared),
			_ => TickOutcome::Halted,
		}
	}

	/// Drops every state, releasing any live drivers.
	pub fn teardown(&mut self) {
		self.stack.clear(&mut self.shared);
	}
}
