//! `/dev/i2c-N` as an `embedded_hal` I2C bus.
//!
//! Each operation is a separate read(2)/write(2) on the character device
//! after selecting the target with the `I2C_SLAVE` ioctl, which is what
//! the SMBus-style register access of the MOD-IO board needs.

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, Operation, SevenBitAddress};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

const I2C_SLAVE: libc::c_ulong = 0x0703;

#[derive(Debug)]
pub struct LinuxI2cError(pub io::Error);

impl std::fmt::Display for LinuxI2cError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

impl embedded_hal::i2c::Error for LinuxI2cError {
	fn kind(&self) -> ErrorKind {
		ErrorKind::Other
	}
}

#[derive(Debug)]
pub struct LinuxI2c {
	file: File,
	selected: Option<SevenBitAddress>,
}

impl LinuxI2c {
	pub fn open(path: &Path) -> io::Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		Ok(Self {
			file,
			selected: None,
		})
	}

	fn select(&mut self, address: SevenBitAddress) -> io::Result<()> {
		if self.selected == Some(address) {
			return Ok(());
		}
		// SAFETY: the fd is owned by `self.file` and stays open for the call;
		// I2C_SLAVE takes the address by value.
		let rc = unsafe {
			libc::ioctl(
				self.file.as_raw_fd(),
				I2C_SLAVE as _,
				libc::c_ulong::from(address),
			)
		};
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}
		self.selected = Some(address);
		Ok(())
	}
}

impl ErrorType for LinuxI2c {
	type Error = LinuxI2cError;
}

impl I2c<SevenBitAddress> for LinuxI2c {
	fn transaction(
		&mut self,
		address: SevenBitAddress,
		operations: &mut [Operation<'_>],
	) -> Result<(), Self::Error> {
		self.select(address).map_err(LinuxI2cError)?;
		for operation in operations {
			let result = match operation {
				Operation::Read(buffer) => self.file.read_exact(buffer),
				Operation::Write(bytes) => self.file.write_all(bytes),
			};
			result.map_err(LinuxI2cError)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_bus_fails_to_open() {
		let dir = tempfile::tempdir().expect("tempdir");
		let err = LinuxI2c::open(&dir.path().join("i2c-9")).expect_err("no such device");
		assert_eq!(err.kind(), io::ErrorKind::NotFound);
	}

	#[test]
	fn errors_report_kind_other() {
		use embedded_hal::i2c::Error;
		let err = LinuxI2cError(io::Error::from(io::ErrorKind::TimedOut));
		assert_eq!(err.kind(), ErrorKind::Other);
	}
}
