//! The serial half of the bridge: desired-settings bookkeeping, the
//! opened-port wrapper, and device enumeration.
//!
//! Actual device access goes through the [`serialport`] crate. The wrapper
//! here exists for two reasons: a control channel carries its *desired*
//! configuration ([`SerialConfig`]) independently of whether a port is open,
//! and the two pump threads need to share one opened device (a cloned
//! handle for the blocking reader, a mutex-held handle for writes, settings
//! and modem-line operations).

use crate::errors::SerialError;
// The backend trait must be in scope to call its methods on boxed handles;
// aliased away so it doesn't collide with our own `SerialPort`.
use serialport::SerialPort as _;
use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	io::{ErrorKind as IoErrorKind, Read, Write},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, MutexGuard, PoisonError,
	},
	time::Duration,
};

/// Baud rate used by a control channel that never issued a `U` command.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Default read and write timeout for newly opened ports.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of bits per character.
///
/// Unlike the backend's equivalent this one exists so the protocol layer
/// can parse, store, and display the value without an open port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataBits {
	Five,
	Six,
	Seven,
	Eight,
}

impl Display for DataBits {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match *self {
			Self::Five => write!(fmt, "5"),
			Self::Six => write!(fmt, "6"),
			Self::Seven => write!(fmt, "7"),
			Self::Eight => write!(fmt, "8"),
		}
	}
}

impl From<DataBits> for serialport::DataBits {
	fn from(value: DataBits) -> Self {
		match value {
			DataBits::Five => Self::Five,
			DataBits::Six => Self::Six,
			DataBits::Seven => Self::Seven,
			DataBits::Eight => Self::Eight,
		}
	}
}

/// Parity checking mode.
///
/// Mark and space parity are accepted on the wire and stored, but the
/// backend cannot apply them; see [`SerialError::Unsupported`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
	None,
	Odd,
	Even,
	Mark,
	Space,
}

impl Display for Parity {
	/// Single character form, as used in `par:` status fields.
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match *self {
			Self::None => write!(fmt, "N"),
			Self::Odd => write!(fmt, "O"),
			Self::Even => write!(fmt, "E"),
			Self::Mark => write!(fmt, "M"),
			Self::Space => write!(fmt, "S"),
		}
	}
}

impl TryFrom<Parity> for serialport::Parity {
	type Error = SerialError;

	fn try_from(value: Parity) -> Result<Self, SerialError> {
		match value {
			Parity::None => Ok(Self::None),
			Parity::Odd => Ok(Self::Odd),
			Parity::Even => Ok(Self::Even),
			Parity::Mark => Err(SerialError::Unsupported("mark parity")),
			Parity::Space => Err(SerialError::Unsupported("space parity")),
		}
	}
}

/// Number of stop bits.
///
/// 1.5 stop bits is accepted on the wire and stored, but the backend
/// cannot apply it; see [`SerialError::Unsupported`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopBits {
	One,
	OnePointFive,
	Two,
}

impl Display for StopBits {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match *self {
			Self::One => write!(fmt, "1"),
			Self::OnePointFive => write!(fmt, "1.5"),
			Self::Two => write!(fmt, "2"),
		}
	}
}

impl TryFrom<StopBits> for serialport::StopBits {
	type Error = SerialError;

	fn try_from(value: StopBits) -> Result<Self, SerialError> {
		match value {
			StopBits::One => Ok(Self::One),
			StopBits::OnePointFive => Err(SerialError::Unsupported("1.5 stop bits")),
			StopBits::Two => Ok(Self::Two),
		}
	}
}

/// The full set of serial parameters a control channel maintains.
///
/// `rts`/`dtr` of `None` mean the line is unmanaged: nothing is pushed to
/// the device and the OS/driver default stands. The write and inter-byte
/// timeouts are tracked and reported in status lines; the backend exposes
/// a single I/O timeout, which follows `read_timeout`.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialConfig {
	pub baud_rate: u32,
	pub data_bits: DataBits,
	pub stop_bits: StopBits,
	pub parity: Parity,
	pub read_timeout: Option<Duration>,
	pub write_timeout: Option<Duration>,
	pub inter_byte_timeout: Option<Duration>,
	pub xonxoff: bool,
	pub rtscts: bool,
	pub dsrdtr: bool,
	pub rts: Option<bool>,
	pub dtr: Option<bool>,
}

impl Default for SerialConfig {
	fn default() -> Self {
		Self {
			baud_rate: DEFAULT_BAUD_RATE,
			data_bits: DataBits::Eight,
			stop_bits: StopBits::One,
			parity: Parity::None,
			read_timeout: Some(DEFAULT_IO_TIMEOUT),
			write_timeout: Some(DEFAULT_IO_TIMEOUT),
			inter_byte_timeout: None,
			xonxoff: false,
			rtscts: false,
			dsrdtr: false,
			rts: None,
			dtr: None,
		}
	}
}

impl SerialConfig {
	/// The backend models flow control as a single mode; hardware flow
	/// control wins over software when both toggles are set.
	fn flow_control(&self) -> serialport::FlowControl {
		if self.rtscts {
			serialport::FlowControl::Hardware
		} else if self.xonxoff {
			serialport::FlowControl::Software
		} else {
			serialport::FlowControl::None
		}
	}

	/// The backend has no notion of an infinite timeout, so an unset read
	/// timeout becomes a day-long one.
	fn effective_read_timeout(&self) -> Duration {
		self.read_timeout.unwrap_or(Duration::from_secs(86_400))
	}

	fn builder(&self, name: &str) -> Result<serialport::SerialPortBuilder, SerialError> {
		Ok(serialport::new(name.to_owned(), self.baud_rate)
			.data_bits(self.data_bits.into())
			.parity(self.parity.try_into()?)
			.stop_bits(self.stop_bits.try_into()?)
			.flow_control(self.flow_control())
			.timeout(self.effective_read_timeout()))
	}
}

#[cfg(unix)]
fn open_native(
	builder: serialport::SerialPortBuilder,
) -> Result<Box<dyn serialport::SerialPort>, SerialError> {
	let mut port = serialport::TTYPort::open(&builder)?;
	// Duplicate-open policy is the registry's job (keyed by device name),
	// and the original server never claimed OS-level exclusivity either.
	port.set_exclusive(false)?;
	Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_native(
	builder: serialport::SerialPortBuilder,
) -> Result<Box<dyn serialport::SerialPort>, SerialError> {
	Ok(builder.open()?)
}

/// One opened serial device.
///
/// Writes, reconfiguration, and modem-line operations share the primary
/// handle behind a mutex; the rx pump reads on its own cloned handle (see
/// [`SerialPort::reader`]) so a blocked read never delays a write.
pub struct SerialPort {
	name: String,
	handle: Mutex<Box<dyn serialport::SerialPort>>,
	/// Milliseconds, mirrored out to [`SerialReader`]s between reads.
	read_timeout_ms: Arc<AtomicU64>,
}

impl SerialPort {
	/// Open and configure a device.
	///
	/// On unix `name` must be a path to a TTY device; on Windows a COM
	/// device name (`COM1`, `COM2`, ...). Managed RTS/DTR levels are pushed
	/// right after the open.
	///
	/// ## Errors
	///
	/// If the OS refuses the open, or the configuration cannot be applied.
	pub fn open(name: &str, cfg: &SerialConfig) -> Result<Self, SerialError> {
		let mut handle = open_native(cfg.builder(name)?)?;
		if let Some(level) = cfg.rts {
			handle.write_request_to_send(level)?;
		}
		if let Some(level) = cfg.dtr {
			handle.write_data_terminal_ready(level)?;
		}
		let timeout_ms = cfg.effective_read_timeout().as_millis() as u64;
		Ok(Self {
			name: name.to_owned(),
			handle: Mutex::new(handle),
			read_timeout_ms: Arc::new(AtomicU64::new(timeout_ms)),
		})
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	fn lock(&self) -> MutexGuard<'_, Box<dyn serialport::SerialPort>> {
		self.handle.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Clone a handle for the dedicated reader thread.
	///
	/// ## Errors
	///
	/// If the OS cannot duplicate the underlying descriptor/handle.
	pub fn reader(&self) -> Result<SerialReader, SerialError> {
		let handle = self.lock().try_clone()?;
		let applied_ms = self.read_timeout_ms.load(Ordering::Relaxed);
		Ok(SerialReader {
			handle,
			shared_timeout_ms: Arc::clone(&self.read_timeout_ms),
			applied_ms,
		})
	}

	/// Blocking write of the whole chunk, honoring the write timeout the
	/// driver enforces.
	///
	/// ## Errors
	///
	/// If the device fails or disappears mid-write.
	pub fn write_all(&self, bytes: &[u8]) -> Result<(), SerialError> {
		self.lock().write_all(bytes)?;
		Ok(())
	}

	/// Reconfigure the open port from `cfg`.
	///
	/// All values are validated against the backend before any of them are
	/// pushed to the device, so an unsupported combination leaves the port
	/// untouched.
	///
	/// ## Errors
	///
	/// If a value is unsupported by the backend, or the device rejects one.
	pub fn apply(&self, cfg: &SerialConfig) -> Result<(), SerialError> {
		let data_bits = cfg.data_bits.into();
		let parity = cfg.parity.try_into()?;
		let stop_bits = cfg.stop_bits.try_into()?;
		let timeout = cfg.effective_read_timeout();

		let mut handle = self.lock();
		handle.set_baud_rate(cfg.baud_rate)?;
		handle.set_data_bits(data_bits)?;
		handle.set_parity(parity)?;
		handle.set_stop_bits(stop_bits)?;
		handle.set_flow_control(cfg.flow_control())?;
		handle.set_timeout(timeout)?;
		if let Some(level) = cfg.rts {
			handle.write_request_to_send(level)?;
		}
		if let Some(level) = cfg.dtr {
			handle.write_data_terminal_ready(level)?;
		}
		self.read_timeout_ms
			.store(timeout.as_millis() as u64, Ordering::Relaxed);
		Ok(())
	}

	/// Set the Request To Send line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn set_rts(&self, level: bool) -> Result<(), SerialError> {
		self.lock().write_request_to_send(level).map_err(Into::into)
	}

	/// Set the Data Terminal Ready line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn set_dtr(&self, level: bool) -> Result<(), SerialError> {
		self.lock()
			.write_data_terminal_ready(level)
			.map_err(Into::into)
	}

	/// Read the Clear To Send line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn read_cts(&self) -> Result<bool, SerialError> {
		self.lock().read_clear_to_send().map_err(Into::into)
	}

	/// Read the Data Set Ready line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn read_dsr(&self) -> Result<bool, SerialError> {
		self.lock().read_data_set_ready().map_err(Into::into)
	}

	/// Read the Ring Indicator line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn read_ri(&self) -> Result<bool, SerialError> {
		self.lock().read_ring_indicator().map_err(Into::into)
	}

	/// Read the Carrier Detect line.
	///
	/// ## Errors
	///
	/// If the device rejects the operation.
	pub fn read_cd(&self) -> Result<bool, SerialError> {
		self.lock().read_carrier_detect().map_err(Into::into)
	}
}

/// The rx pump's private read handle.
pub struct SerialReader {
	handle: Box<dyn serialport::SerialPort>,
	shared_timeout_ms: Arc<AtomicU64>,
	applied_ms: u64,
}

impl SerialReader {
	/// Blocking read of up to `buf.len()` bytes.
	///
	/// Returns `Ok(0)` on a read timeout; serial devices have no EOF. A
	/// read-timeout change made through [`SerialPort::apply`] is picked up
	/// before the next read.
	///
	/// ## Errors
	///
	/// If the device fails or disappears mid-read.
	pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
		let wanted_ms = self.shared_timeout_ms.load(Ordering::Relaxed);
		if wanted_ms != self.applied_ms {
			self.handle.set_timeout(Duration::from_millis(wanted_ms))?;
			self.applied_ms = wanted_ms;
		}
		match self.handle.read(buf) {
			Ok(read) => Ok(read),
			Err(cause)
				if matches!(
					cause.kind(),
					IoErrorKind::TimedOut | IoErrorKind::WouldBlock
				) =>
			{
				Ok(0)
			}
			Err(cause) => Err(cause.into()),
		}
	}
}

/// One row of `L` command output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortListing {
	pub name: String,
	pub description: String,
	pub hardware_id: String,
}

impl From<serialport::SerialPortInfo> for PortListing {
	fn from(info: serialport::SerialPortInfo) -> Self {
		let (description, hardware_id) = match info.port_type {
			serialport::SerialPortType::UsbPort(usb) => {
				let description = usb
					.product
					.or(usb.manufacturer)
					.unwrap_or_else(|| "n/a".to_owned());
				let mut hardware_id = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
				if let Some(serial_number) = usb.serial_number {
					hardware_id.push_str(" SER=");
					hardware_id.push_str(&serial_number);
				}
				(description, hardware_id)
			}
			serialport::SerialPortType::PciPort => ("PCI device".to_owned(), "PCI".to_owned()),
			serialport::SerialPortType::BluetoothPort => {
				("Bluetooth device".to_owned(), "Bluetooth".to_owned())
			}
			serialport::SerialPortType::Unknown => ("n/a".to_owned(), "n/a".to_owned()),
		};
		Self {
			name: info.port_name,
			description,
			hardware_id,
		}
	}
}

/// List the serial devices the OS knows about, sorted by name.
///
/// ## Errors
///
/// If the OS-level enumeration itself fails.
pub fn list_ports() -> Result<Vec<PortListing>, SerialError> {
	let mut ports = serialport::available_ports()?
		.into_iter()
		.map(PortListing::from)
		.collect::<Vec<_>>();
	ports.sort_by(|left, right| left.name.cmp(&right.name));
	Ok(ports)
}
