//! Hardware channel drivers and the table that owns their live instances.
//!
//! A [`DriverRegistry`] knows every channel class this agent can build and
//! which ports each class accepts. The [`ChannelTable`] holds the instances
//! built for the current configuration, one per `(class, port)`, and
//! releases them all when the configuration is dropped.

pub mod gpio;
pub mod i2c;
pub mod modio;
pub mod temperature;

use indexmap::IndexMap;
use rpiws_core::binding::{binding_key, ChannelBinding, ChannelPort};
use rpiws_core::protocol::{InterfaceDescription, InterfaceDescriptor, IoType, PortChoice};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DriverError {
	#[error("unknown channel class {0}")]
	UnknownClass(String),
	#[error("{class} has no port {port}")]
	PortDoesNotExist { class: String, port: ChannelPort },
	#[error("{class} port {port} is already in use")]
	PortInUse { class: String, port: ChannelPort },
	#[error("channel is read only")]
	ReadOnly,
	#[error("invalid value {0}")]
	InvalidValue(Value),
	#[error("bus error: {0}")]
	Bus(String),
	#[error("malformed device output: {0}")]
	Malformed(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// A live, owned hardware channel.
pub trait ChannelDriver: Send {
	fn read(&mut self) -> Result<Value, DriverError>;

	fn write(&mut self, _value: Value) -> Result<(), DriverError> {
		Err(DriverError::ReadOnly)
	}

	/// Hands the channel back to the system. Called once, before drop.
	fn release(&mut self) -> Result<(), DriverError> {
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Read,
	Write,
}

type Builder = dyn Fn(&ChannelPort) -> Result<Box<dyn ChannelDriver>, DriverError> + Send + Sync;

/// One constructible class: its descriptor plus a constructor.
#[derive(Clone)]
pub struct ChannelClass {
	pub name: String,
	pub desc: String,
	pub io_type: IoType,
	pub direction: Direction,
	pub choices: Vec<PortChoice>,
	build: Arc<Builder>,
}

impl std::fmt::Debug for ChannelClass {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelClass")
			.field("name", &self.name)
			.field("direction", &self.direction)
			.field("choices", &self.choices.len())
			.finish_non_exhaustive()
	}
}

impl ChannelClass {
	pub fn new<F>(
		name: &str,
		desc: &str,
		io_type: IoType,
		direction: Direction,
		choices: Vec<PortChoice>,
		build: F,
	) -> Self
	where
		F: Fn(&ChannelPort) -> Result<Box<dyn ChannelDriver>, DriverError> + Send + Sync + 'static,
	{
		Self {
			name: name.to_string(),
			desc: desc.to_string(),
			io_type,
			direction,
			choices,
			build: Arc::new(build),
		}
	}

	pub fn accepts(&self, port: &ChannelPort) -> bool {
		self.choices.iter().any(|choice| choice.s == *port)
	}

	pub fn description(&self) -> InterfaceDescription {
		InterfaceDescription {
			name: self.name.clone(),
			desc: self.desc.clone(),
			choices: self.choices.clone(),
			io_type: self.io_type,
		}
	}
}

pub fn choice(port: impl Into<ChannelPort>, label: impl Into<String>) -> PortChoice {
	PortChoice {
		s: port.into(),
		d: label.into(),
	}
}

/// Where the concrete drivers find their devices.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
	pub gpio_root: PathBuf,
	pub w1_root: PathBuf,
	pub i2c_bus: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct DriverRegistry {
	classes: IndexMap<String, ChannelClass>,
}

impl DriverRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// GPIO, MOD-IO and 1-wire temperature classes.
	pub fn with_defaults(devices: &DeviceConfig) -> Self {
		let mut registry = Self::new();
		gpio::register(&mut registry, devices.gpio_root.clone());
		let bus_path = devices.i2c_bus.clone();
		modio::register(&mut registry, move || {
			i2c::LinuxI2c::open(&bus_path).map_err(DriverError::from)
		});
		temperature::register(&mut registry, &devices.w1_root);
		registry
	}

	pub fn register(&mut self, class: ChannelClass) {
		self.classes.insert(class.name.clone(), class);
	}

	/// What the agent advertises in its registration request.
	pub fn descriptor(&self) -> InterfaceDescriptor {
		let mut descriptor = InterfaceDescriptor::default();
		for class in self.classes.values() {
			match class.direction {
				Direction::Read => descriptor.read.push(class.description()),
				Direction::Write => descriptor.write.push(class.description()),
			}
		}
		descriptor
	}

	/// Builds a driver after checking the port is one the class offers.
	pub fn build(
		&self,
		class_name: &str,
		port: &ChannelPort,
	) -> Result<Box<dyn ChannelDriver>, DriverError> {
		let class = self
			.classes
			.get(class_name)
			.ok_or_else(|| DriverError::UnknownClass(class_name.to_string()))?;
		if !class.accepts(port) {
			return Err(DriverError::PortDoesNotExist {
				class: class_name.to_string(),
				port: port.clone(),
			});
		}
		(class.build)(port)
	}
}

/// Live driver instances keyed by binding key. At most one per
/// `(class, port)`; a second open of the same pair is refused.
#[derive(Default)]
pub struct ChannelTable {
	live: IndexMap<String, Box<dyn ChannelDriver>>,
}

impl std::fmt::Debug for ChannelTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.live.keys()).finish()
	}
}

impl ChannelTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.live.len()
	}

	/// Builds and stores the driver for `binding`, returning its key.
	pub fn open(
		&mut self,
		registry: &DriverRegistry,
		binding: &ChannelBinding,
	) -> Result<String, DriverError> {
		let key = binding_key(&binding.class_name, &binding.channel_port);
		if self.live.contains_key(&key) {
			return Err(DriverError::PortInUse {
				class: binding.class_name.clone(),
				port: binding.channel_port.clone(),
			});
		}
		let driver = registry.build(&binding.class_name, &binding.channel_port)?;
		self.live.insert(key.clone(), driver);
		Ok(key)
	}

	/// `None` when nothing is bound under `key`.
	pub fn read(&mut self, key: &str) -> Option<Result<Value, DriverError>> {
		self.live.get_mut(key).map(|driver| driver.read())
	}

	pub fn write(&mut self, key: &str, value: Value) -> Option<Result<(), DriverError>> {
		self.live.get_mut(key).map(|driver| driver.write(value))
	}

	pub fn release_all(&mut self) {
		for (key, mut driver) in self.live.drain(..) {
			match driver.release() {
				Ok(()) => debug!(event = "channel_released", key = %key),
				Err(err) => warn!(event = "channel_release_error", key = %key, error = %err),
			}
		}
	}
}

impl Drop for ChannelTable {
	fn drop(&mut self) {
		self.release_all();
	}
}
