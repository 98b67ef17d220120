//! One opened serial device plus the rx/tx pump pair that ties it to the
//! owning control channel's attachment sets.

use crate::{
	errors::SerialError,
	registry::{ChannelId, Registry},
	serial::{SerialConfig, SerialPort, SerialReader},
};
use bytes::Bytes;
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		mpsc::{channel, Receiver, RecvTimeoutError, Sender},
		Arc,
	},
	thread,
	time::Duration,
};
use tracing::{debug, error, warn};

/// How long the tx pump sleeps between checks of the running flags.
const TX_POLL: Duration = Duration::from_secs(1);

/// One open UART: the device, its tx queue, and the flags its pump pair
/// polls. Owned by exactly one control channel through the registry.
pub struct Uart {
	name: String,
	exclusive: bool,
	ctrl: ChannelId,
	running: AtomicBool,
	tx: Sender<Bytes>,
	port: SerialPort,
}

impl Uart {
	/// Open the device with the owner's desired configuration and prepare
	/// the pump plumbing. The caller commits the UART to the registry and
	/// then calls [`Uart::start_pumps`] with the pieces returned here.
	///
	/// ## Errors
	///
	/// If the device cannot be opened or configured, or the reader handle
	/// cannot be cloned.
	pub(crate) fn open(
		ctrl: ChannelId,
		name: &str,
		exclusive: bool,
		cfg: &SerialConfig,
	) -> Result<(Arc<Self>, SerialReader, Receiver<Bytes>), SerialError> {
		let port = SerialPort::open(name, cfg)?;
		let reader = port.reader()?;
		let (tx, tx_queue) = channel();
		let uart = Arc::new(Self {
			name: name.to_owned(),
			exclusive,
			ctrl,
			running: AtomicBool::new(true),
			tx,
			port,
		});
		debug!(uart = name, channel = ctrl, "serial device opened");
		Ok((uart, reader, tx_queue))
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn exclusive(&self) -> bool {
		self.exclusive
	}

	#[must_use]
	pub fn ctrl(&self) -> ChannelId {
		self.ctrl
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Ask both pumps to wind down; they notice within one poll/timeout.
	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}

	/// Sending half of the queue the tx pump drains into the device.
	#[must_use]
	pub fn tx_sender(&self) -> Sender<Bytes> {
		self.tx.clone()
	}

	#[must_use]
	pub fn port(&self) -> &SerialPort {
		&self.port
	}

	/// Start the rx/tx pump pair.
	pub(crate) fn start_pumps(
		self: &Arc<Self>,
		registry: Arc<Registry>,
		reader: SerialReader,
		tx_queue: Receiver<Bytes>,
		ser_recv_size: usize,
	) {
		let rx_uart = Arc::clone(self);
		let rx_registry = Arc::clone(&registry);
		let spawned = thread::Builder::new()
			.name(format!("uartsocket::uart_rx::{}", self.name))
			.spawn(move || rx_pump(&rx_registry, &rx_uart, reader, ser_recv_size));
		if let Err(cause) = spawned {
			error!(uart = self.name(), ?cause, "could not spawn the rx pump");
			registry.close_uart(self);
			return;
		}

		let tx_uart = Arc::clone(self);
		let tx_registry = Arc::clone(&registry);
		let spawned = thread::Builder::new()
			.name(format!("uartsocket::uart_tx::{}", self.name))
			.spawn(move || tx_pump(&tx_registry, &tx_uart, &tx_queue));
		if let Err(cause) = spawned {
			error!(uart = self.name(), ?cause, "could not spawn the tx pump");
			// The rx pump notices the cleared flag within one read timeout.
			registry.close_uart(self);
		}
	}
}

/// Device-to-network direction: read the UART, publish every chunk to the
/// owner's rx-side attachees.
fn rx_pump(registry: &Arc<Registry>, uart: &Arc<Uart>, mut reader: SerialReader, chunk_size: usize) {
	let mut buf = vec![0_u8; chunk_size.max(1)];
	while registry.is_running() && uart.is_running() {
		match reader.read(&mut buf) {
			// Read timeout; just recheck the flags.
			Ok(0) => {}
			Ok(read) => {
				let chunk = Bytes::copy_from_slice(&buf[..read]);
				for target in registry.rx_targets(uart.ctrl()) {
					let _ = target.send(chunk.clone());
				}
			}
			Err(cause) => {
				fail_uart(registry, uart, &cause);
				return;
			}
		}
	}
	debug!(uart = uart.name(), "rx pump done");
}

/// Network-to-device direction: drain the tx queue into the UART, then
/// mirror each written chunk to the tx sniffers.
fn tx_pump(registry: &Arc<Registry>, uart: &Arc<Uart>, tx_queue: &Receiver<Bytes>) {
	while registry.is_running() && uart.is_running() {
		match tx_queue.recv_timeout(TX_POLL) {
			Ok(chunk) => {
				if let Err(cause) = uart.port().write_all(&chunk) {
					fail_uart(registry, uart, &cause);
					return;
				}
				for target in registry.tx_sniffer_targets(uart.ctrl()) {
					let _ = target.send(chunk.clone());
				}
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}
	debug!(uart = uart.name(), "tx pump done");
}

/// A device failure seen by either pump: report to the owning control
/// channel, mark it for termination, and tear the UART down.
fn fail_uart(registry: &Registry, uart: &Arc<Uart>, cause: &SerialError) {
	warn!(uart = uart.name(), %cause, "serial failure, closing the uart");
	if let Some(owner) = registry.ctrl_channel(uart.ctrl()) {
		owner.send(Bytes::from(format!("ERROR serial:{cause}\n").into_bytes()));
		owner.stop();
	}
	registry.close_uart(uart);
}
