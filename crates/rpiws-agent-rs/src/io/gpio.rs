//! Raspberry Pi header pins through the sysfs GPIO interface.

use super::{choice, ChannelClass, ChannelDriver, Direction, DriverError, DriverRegistry};
use rpiws_core::binding::ChannelPort;
use rpiws_core::protocol::{IoType, PortChoice};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// BCM number and physical header position of every usable pin.
const PINS: [(u32, u32); 17] = [
	(2, 3),
	(3, 5),
	(4, 7),
	(7, 26),
	(8, 24),
	(9, 21),
	(10, 19),
	(11, 23),
	(14, 8),
	(15, 10),
	(17, 11),
	(18, 12),
	(22, 15),
	(23, 16),
	(24, 18),
	(25, 22),
	(27, 13),
];

pub fn choices() -> Vec<PortChoice> {
	PINS
		.iter()
		.map(|(bcm, header)| choice(i64::from(*bcm), format!("GPIO{bcm} P{header}")))
		.collect()
}

pub fn register(registry: &mut DriverRegistry, root: PathBuf) {
	let input_root = root.clone();
	registry.register(ChannelClass::new(
		"GPIOInput",
		"Raspberry Pi GPIO input",
		IoType::Binary,
		Direction::Read,
		choices(),
		move |port| Ok(Box::new(GpioInput::open(&input_root, pin_number(port)?)?) as Box<dyn ChannelDriver>),
	));
	registry.register(ChannelClass::new(
		"GPIOOutput",
		"Raspberry Pi GPIO output",
		IoType::Binary,
		Direction::Write,
		choices(),
		move |port| Ok(Box::new(GpioOutput::open(&root, pin_number(port)?)?) as Box<dyn ChannelDriver>),
	));
}

fn pin_number(port: &ChannelPort) -> Result<u32, DriverError> {
	port.as_number()
		.and_then(|pin| u32::try_from(pin).ok())
		.ok_or_else(|| DriverError::PortDoesNotExist {
			class: "GPIO".to_string(),
			port: port.clone(),
		})
}

/// An exported pin under `root/gpioN`.
#[derive(Debug)]
struct SysfsPin {
	root: PathBuf,
	pin: u32,
}

impl SysfsPin {
	fn export(root: &Path, pin: u32, direction: &str) -> Result<Self, DriverError> {
		let pin_dir = root.join(format!("gpio{pin}"));
		if !pin_dir.exists() {
			fs::write(root.join("export"), pin.to_string())?;
		}
		fs::write(pin_dir.join("direction"), direction)?;
		debug!(event = "gpio_exported", pin = pin, direction = direction);
		Ok(Self {
			root: root.to_path_buf(),
			pin,
		})
	}

	fn value_path(&self) -> PathBuf {
		self.root.join(format!("gpio{}", self.pin)).join("value")
	}

	fn get(&self) -> Result<bool, DriverError> {
		let raw = fs::read_to_string(self.value_path())?;
		match raw.trim() {
			"0" => Ok(false),
			"1" => Ok(true),
			other => Err(DriverError::Malformed(format!("gpio value {other:?}"))),
		}
	}

	fn set(&self, high: bool) -> Result<(), DriverError> {
		fs::write(self.value_path(), if high { "1" } else { "0" })?;
		Ok(())
	}

	fn unexport(&self) -> Result<(), DriverError> {
		let unexport = self.root.join("unexport");
		if unexport.exists() {
			fs::write(unexport, self.pin.to_string())?;
		}
		Ok(())
	}
}

#[derive(Debug)]
pub struct GpioInput {
	pin: SysfsPin,
}

impl GpioInput {
	pub fn open(root: &Path, pin: u32) -> Result<Self, DriverError> {
		Ok(Self {
			pin: SysfsPin::export(root, pin, "in")?,
		})
	}
}

impl ChannelDriver for GpioInput {
	fn read(&mut self) -> Result<Value, DriverError> {
		Ok(Value::from(u8::from(self.pin.get()?)))
	}

	fn release(&mut self) -> Result<(), DriverError> {
		self.pin.unexport()
	}
}

/// Drives a pin low on open and reports the last accepted level.
#[derive(Debug)]
pub struct GpioOutput {
	pin: SysfsPin,
	last: bool,
}

impl GpioOutput {
	pub fn open(root: &Path, pin: u32) -> Result<Self, DriverError> {
		let pin = SysfsPin::export(root, pin, "out")?;
		pin.set(false)?;
		Ok(Self { pin, last: false })
	}
}

impl ChannelDriver for GpioOutput {
	fn read(&mut self) -> Result<Value, DriverError> {
		Ok(Value::Bool(self.last))
	}

	fn write(&mut self, value: Value) -> Result<(), DriverError> {
		let Value::Bool(high) = value else {
			return Err(DriverError::InvalidValue(value));
		};
		self.pin.set(high)?;
		self.last = high;
		Ok(())
	}

	fn release(&mut self) -> Result<(), DriverError> {
		self.pin.unexport()
	}
}
