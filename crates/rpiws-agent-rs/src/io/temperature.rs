//! DS18B20 1-wire thermometers via the kernel `w1_therm` driver.
//!
//! Each sensor shows up as `<w1_root>/28-xxxxxxxxxxxx/w1_slave`; the file
//! path is the channel port. A read yields millidegrees Celsius.

use super::{choice, ChannelClass, ChannelDriver, Direction, DriverError, DriverRegistry};
use rpiws_core::protocol::{IoType, PortChoice};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// CRC failures are common on long wires; a read is retried this often.
const READ_ATTEMPTS: usize = 3;

/// Every `28*/w1_slave` under `root`, sorted by path.
pub fn discover(root: &Path) -> Vec<PortChoice> {
	let entries = match fs::read_dir(root) {
		Ok(entries) => entries,
		Err(err) => {
			debug!(event = "w1_scan_skipped", root = %root.display(), error = %err);
			return Vec::new();
		}
	};
	let mut paths: Vec<PathBuf> = entries
		.filter_map(Result::ok)
		.filter(|entry| entry.file_name().to_string_lossy().starts_with("28"))
		.map(|entry| entry.path().join("w1_slave"))
		.filter(|path| path.is_file())
		.collect();
	paths.sort();
	paths
		.into_iter()
		.map(|path| {
			let path = path.to_string_lossy().into_owned();
			choice(path.as_str(), path.clone())
		})
		.collect()
}

pub fn register(registry: &mut DriverRegistry, root: &Path) {
	registry.register(ChannelClass::new(
		"Temperature",
		"DS18B20 temperature sensor",
		IoType::Integer,
		Direction::Read,
		discover(root),
		|port| Ok(Box::new(Thermometer::new(port.as_str())) as Box<dyn ChannelDriver>),
	));
}

/// Millidegrees from a `w1_slave` dump, `None` when the CRC line is not
/// `YES` or the reading is missing.
pub fn parse_w1_slave(raw: &str) -> Option<i64> {
	let mut lines = raw.lines();
	if !lines.next()?.trim_end().ends_with("YES") {
		return None;
	}
	let (_, value) = lines.next()?.split_once("t=")?;
	value.trim().parse().ok()
}

#[derive(Debug)]
pub struct Thermometer {
	path: PathBuf,
}

impl Thermometer {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ChannelDriver for Thermometer {
	fn read(&mut self) -> Result<Value, DriverError> {
		let mut last = String::new();
		for _ in 0..READ_ATTEMPTS {
			last = fs::read_to_string(&self.path)?;
			if let Some(millidegrees) = parse_w1_slave(&last) {
				return Ok(Value::from(millidegrees));
			}
		}
		Err(DriverError::Malformed(
			last.lines().next().unwrap_or_default().to_string(),
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rpiws_core::binding::ChannelPort;
	use serde_json::json;

	const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";
	const BAD_CRC: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";

	fn sensor(root: &Path, id: &str, contents: &str) -> PathBuf {
		let dir = root.join(id);
		fs::create_dir_all(&dir).expect("device dir");
		let path = dir.join("w1_slave");
		fs::write(&path, contents).expect("w1_slave");
		path
	}

	#[test]
	fn parses_millidegrees_after_a_good_crc() {
		assert_eq!(parse_w1_slave(GOOD), Some(23125));
		assert_eq!(parse_w1_slave(BAD_CRC), None);
		assert_eq!(parse_w1_slave("crc=00 YES\n"), None);
		assert_eq!(parse_w1_slave("crc=00 YES\nt=-1250\n"), Some(-1250));
	}

	#[test]
	fn discovers_only_ds18b20_devices() {
		let root = tempfile::tempdir().expect("tempdir");
		let first = sensor(root.path(), "28-000005e2fdc3", GOOD);
		sensor(root.path(), "10-000802cc5bd5", GOOD);
		fs::create_dir_all(root.path().join("w1_bus_master1")).expect("master");

		let choices = discover(root.path());
		assert_eq!(choices.len(), 1);
		assert_eq!(choices[0].s.as_str(), first.to_string_lossy());
		assert_eq!(choices[0].d, first.to_string_lossy());
		assert!(discover(&root.path().join("missing")).is_empty());
	}

	#[test]
	fn reads_through_the_registry() {
		let root = tempfile::tempdir().expect("tempdir");
		let path = sensor(root.path(), "28-000005e2fdc3", GOOD);
		let mut registry = DriverRegistry::new();
		register(&mut registry, root.path());
		let port = ChannelPort::new(path.to_string_lossy());
		let mut driver = registry.build("Temperature", &port).expect("build");
		assert_eq!(driver.read().expect("read"), json!(23125));

		fs::write(&path, BAD_CRC).expect("rewrite");
		assert!(matches!(driver.read(), Err(DriverError::Malformed(_))));
	}
}
