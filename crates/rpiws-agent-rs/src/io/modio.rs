//! Olimex MOD-IO expansion board: four relays, four opto-isolated digital
//! inputs and four analogue inputs behind one I2C address.
//!
//! Every MOD-IO channel shares one [`ModIoBoard`]. Relay states live in the
//! board because the relay register is written as a whole byte; input
//! registers are cached for [`REFRESH`] so a frame reading all four inputs
//! costs one bus transfer.

use super::{choice, ChannelClass, ChannelDriver, Direction, DriverError, DriverRegistry};
use embedded_hal::i2c::I2c;
use rpiws_core::binding::ChannelPort;
use rpiws_core::protocol::{IoType, PortChoice};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

pub const ADDRESS: u8 = 0x58;
const RELAY_REGISTER: u8 = 0x10;
const DIGITAL_REGISTER: u8 = 0x20;
const ANALOGUE_REGISTER: u8 = 0x30;
pub const REFRESH: Duration = Duration::from_millis(20);

const RELAY_COUNT: usize = 4;
const DIGITAL_BASE: i64 = 20;
const ANALOGUE_BASE: i64 = 30;

fn relay_choices() -> Vec<PortChoice> {
	(1..=RELAY_COUNT as i64)
		.rev()
		.map(|relay| choice(relay, format!("Relay {}", 5 - relay)))
		.collect()
}

pub fn input_choices() -> Vec<PortChoice> {
	let mut choices = relay_choices();
	for n in 0..4 {
		choices.push(choice(DIGITAL_BASE + n, format!("Digital input {}", n + 1)));
	}
	for n in 0..4 {
		choices.push(choice(ANALOGUE_BASE + n, format!("Analogue inputs {}", n + 1)));
	}
	choices
}

pub fn output_choices() -> Vec<PortChoice> {
	relay_choices()
}

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
	value: T,
	at: Instant,
}

impl<T: Copy> Cached<T> {
	fn fresh(slot: &Option<Self>) -> Option<T> {
		slot.as_ref()
			.filter(|cached| cached.at.elapsed() < REFRESH)
			.map(|cached| cached.value)
	}
}

#[derive(Debug)]
pub struct ModIoBoard<I> {
	bus: I,
	address: u8,
	relays: [bool; RELAY_COUNT],
	digital: Option<Cached<u8>>,
	analogue: [Option<Cached<u16>>; 4],
}

fn bus_error<E: embedded_hal::i2c::Error>(err: E) -> DriverError {
	DriverError::Bus(format!("{:?}", err.kind()))
}

impl<I: I2c> ModIoBoard<I> {
	pub fn new(bus: I) -> Self {
		Self {
			bus,
			address: ADDRESS,
			relays: [false; RELAY_COUNT],
			digital: None,
			analogue: [None; 4],
		}
	}

	/// Relay `n` (1-based) is bit `4 - n` of the relay register.
	fn relay_byte(&self) -> u8 {
		self.relays
			.iter()
			.enumerate()
			.filter(|(_, on)| **on)
			.fold(0u8, |byte, (index, _)| byte | 1 << (RELAY_COUNT - 1 - index))
	}

	pub fn relay(&self, relay: usize) -> bool {
		self.relays.get(relay.wrapping_sub(1)).copied().unwrap_or(false)
	}

	/// Writes the relay register only when the state actually changes.
	pub fn set_relay(&mut self, relay: usize, on: bool) -> Result<(), DriverError> {
		let Some(slot) = self.relays.get_mut(relay.wrapping_sub(1)) else {
			return Err(DriverError::Malformed(format!("relay {relay}")));
		};
		if *slot == on {
			return Ok(());
		}
		let previous = *slot;
		*slot = on;
		let byte = self.relay_byte();
		if let Err(err) = self.bus.write(self.address, &[RELAY_REGISTER, byte]) {
			self.relays[relay - 1] = previous;
			return Err(bus_error(err));
		}
		debug!(event = "modio_relays", value = byte);
		Ok(())
	}

	/// Input `n` (0-based) is bit `3 - n` of the digital register.
	pub fn digital_input(&mut self, input: u8) -> Result<bool, DriverError> {
		let byte = match Cached::fresh(&self.digital) {
			Some(byte) => byte,
			None => {
				let mut buffer = [0u8; 1];
				self.bus
					.write_read(self.address, &[DIGITAL_REGISTER], &mut buffer)
					.map_err(bus_error)?;
				self.digital = Some(Cached {
					value: buffer[0],
					at: Instant::now(),
				});
				buffer[0]
			}
		};
		Ok(byte >> (3 - input.min(3)) & 1 == 1)
	}

	pub fn analogue_input(&mut self, input: u8) -> Result<u16, DriverError> {
		let index = usize::from(input.min(3));
		if let Some(value) = Cached::fresh(&self.analogue[index]) {
			return Ok(value);
		}
		let mut buffer = [0u8; 2];
		self.bus
			.write_read(self.address, &[ANALOGUE_REGISTER + input.min(3)], &mut buffer)
			.map_err(bus_error)?;
		let value = u16::from_le_bytes(buffer);
		self.analogue[index] = Some(Cached {
			value,
			at: Instant::now(),
		});
		Ok(value)
	}
}

pub type SharedBoard<I> = Arc<Mutex<ModIoBoard<I>>>;

fn lock<I>(board: &SharedBoard<I>) -> Result<std::sync::MutexGuard<'_, ModIoBoard<I>>, DriverError> {
	board
		.lock()
		.map_err(|_| DriverError::Bus("mod-io board lock poisoned".to_string()))
}

/// Opens the bus on first use and hands every channel the same board.
struct LazyBoard<I, F> {
	open: F,
	board: Mutex<Option<SharedBoard<I>>>,
}

impl<I, F> LazyBoard<I, F>
where
	I: I2c,
	F: Fn() -> Result<I, DriverError>,
{
	fn get(&self) -> Result<SharedBoard<I>, DriverError> {
		let mut slot = self
			.board
			.lock()
			.map_err(|_| DriverError::Bus("mod-io bus lock poisoned".to_string()))?;
		if let Some(board) = slot.as_ref() {
			return Ok(board.clone());
		}
		let board = Arc::new(Mutex::new(ModIoBoard::new((self.open)()?)));
		*slot = Some(board.clone());
		Ok(board)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputPort {
	Relay(usize),
	Digital(u8),
	Analogue(u8),
}

fn input_port(port: &ChannelPort) -> Result<InputPort, DriverError> {
	let invalid = || DriverError::PortDoesNotExist {
		class: "MODIOInput".to_string(),
		port: port.clone(),
	};
	let number = port.as_number().ok_or_else(invalid)?;
	match number {
		1..=4 => Ok(InputPort::Relay(number as usize)),
		20..=23 => Ok(InputPort::Digital((number - DIGITAL_BASE) as u8)),
		30..=33 => Ok(InputPort::Analogue((number - ANALOGUE_BASE) as u8)),
		_ => Err(invalid()),
	}
}

pub fn register<I, F>(registry: &mut DriverRegistry, open: F)
where
	I: I2c + Send + 'static,
	F: Fn() -> Result<I, DriverError> + Send + Sync + 'static,
{
	let lazy = Arc::new(LazyBoard {
		open,
		board: Mutex::new(None),
	});
	let input_board = lazy.clone();
	registry.register(ChannelClass::new(
		"MODIOInput",
		"MOD-IO relay states, digital and analogue inputs",
		IoType::Binary,
		Direction::Read,
		input_choices(),
		move |port| {
			let port = input_port(port)?;
			Ok(Box::new(ModIoInput {
				board: input_board.get()?,
				port,
			}) as Box<dyn ChannelDriver>)
		},
	));
	registry.register(ChannelClass::new(
		"MODIOOutput",
		"MOD-IO relays",
		IoType::Binary,
		Direction::Write,
		output_choices(),
		move |port| {
			let InputPort::Relay(relay) = input_port(port)? else {
				return Err(DriverError::PortDoesNotExist {
					class: "MODIOOutput".to_string(),
					port: port.clone(),
				});
			};
			Ok(Box::new(ModIoOutput {
				board: lazy.get()?,
				relay,
				last: false,
			}) as Box<dyn ChannelDriver>)
		},
	));
}

pub struct ModIoInput<I> {
	board: SharedBoard<I>,
	port: InputPort,
}

impl<I: I2c + Send> ChannelDriver for ModIoInput<I> {
	fn read(&mut self) -> Result<Value, DriverError> {
		let mut board = lock(&self.board)?;
		Ok(match self.port {
			InputPort::Relay(relay) => Value::from(u8::from(board.relay(relay))),
			InputPort::Digital(input) => Value::from(u8::from(board.digital_input(input)?)),
			InputPort::Analogue(input) => Value::from(board.analogue_input(input)?),
		})
	}
}

/// A relay. Accepts booleans and 0/1; reports the last accepted value.
pub struct ModIoOutput<I> {
	board: SharedBoard<I>,
	relay: usize,
	last: bool,
}

fn relay_level(value: &Value) -> Option<bool> {
	match value {
		Value::Bool(on) => Some(*on),
		Value::Number(n) => match n.as_i64() {
			Some(0) => Some(false),
			Some(1) => Some(true),
			_ => None,
		},
		_ => None,
	}
}

impl<I: I2c + Send> ChannelDriver for ModIoOutput<I> {
	fn read(&mut self) -> Result<Value, DriverError> {
		Ok(Value::Bool(self.last))
	}

	fn write(&mut self, value: Value) -> Result<(), DriverError> {
		let Some(on) = relay_level(&value) else {
			return Err(DriverError::InvalidValue(value));
		};
		lock(&self.board)?.set_relay(self.relay, on)?;
		self.last = on;
		Ok(())
	}

	/// Opens the relay so the next configuration starts from a known state.
	fn release(&mut self) -> Result<(), DriverError> {
		lock(&self.board)?.set_relay(self.relay, false)
	}
}
