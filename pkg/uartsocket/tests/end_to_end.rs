//! End to end tests driving a real bound server over localhost TCP.
//!
//! Everything serial runs against pseudo-terminal pairs, so these only
//! exercise device paths on unix; the protocol-only tests run everywhere.
//! Sessions always end through `C`/`X` so no connection is ever left
//! half-closed against a live server.

use std::{
	io::{ErrorKind as IoErrorKind, Read, Write},
	net::{SocketAddr, TcpStream},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};
use uartsocket::{errors::BridgeError, Server, Tuning};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
	addr: SocketAddr,
	thread: JoinHandle<Result<(), BridgeError>>,
}

fn start_server() -> TestServer {
	let bound = Server::new(Tuning::default())
		.bind("127.0.0.1", 0)
		.expect("Failed to bind a test server on an ephemeral port!");
	let addr = bound.local_addr();
	let thread = thread::spawn(move || bound.serve());
	TestServer { addr, thread }
}

impl TestServer {
	/// Issue the broadcast shutdown through `client` and wait for the
	/// server to exit cleanly.
	fn shutdown_via(self, client: &mut TestClient) {
		client.send_line("X");
		client.expect_line("OK");
		self.thread
			.join()
			.expect("The server thread panicked!")
			.expect("The server exited with an error after a clean shutdown!");
	}
}

struct TestClient {
	stream: TcpStream,
	buffered: Vec<u8>,
}

impl TestClient {
	fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).expect("Failed to connect to the test server!");
		stream
			.set_read_timeout(Some(IO_TIMEOUT))
			.expect("Failed to set the client read timeout!");
		Self {
			stream,
			buffered: Vec::new(),
		}
	}

	fn send_line(&mut self, line: &str) {
		self.send_raw(format!("{line}\n").as_bytes());
	}

	fn send_raw(&mut self, bytes: &[u8]) {
		self.stream
			.write_all(bytes)
			.expect("Failed to write to the test server!");
	}

	fn read_line(&mut self) -> String {
		loop {
			if let Some(pos) = self.buffered.iter().position(|byte| *byte == b'\n') {
				let line = self.buffered.drain(..=pos).collect::<Vec<_>>();
				return String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
			}
			let mut chunk = [0_u8; 256];
			let read = self
				.stream
				.read(&mut chunk)
				.expect("Timed out waiting for a response line!");
			assert!(
				read > 0,
				"The server closed the connection while a line was expected!"
			);
			self.buffered.extend_from_slice(&chunk[..read]);
		}
	}

	fn expect_line(&mut self, want: &str) {
		assert_eq!(self.read_line(), want, "Unexpected response line.");
	}

	/// Read raw (non-line) bytes until exactly `want` have arrived.
	fn read_raw_exactly(&mut self, want: usize) -> Vec<u8> {
		while self.buffered.len() < want {
			let mut chunk = [0_u8; 256];
			let read = self
				.stream
				.read(&mut chunk)
				.expect("Timed out waiting for raw data!");
			assert!(
				read > 0,
				"The server closed the connection while raw data was expected!"
			);
			self.buffered.extend_from_slice(&chunk[..read]);
		}
		self.buffered.drain(..want).collect()
	}

	/// Wait for the server side to close this connection.
	fn expect_closed(&mut self) {
		let deadline = Instant::now() + IO_TIMEOUT;
		let mut chunk = [0_u8; 256];
		loop {
			assert!(
				Instant::now() < deadline,
				"Timed out waiting for the server to close the connection!"
			);
			match self.stream.read(&mut chunk) {
				Ok(0) => return,
				// Stray bytes queued before the close are fine to skip.
				Ok(_) => {}
				Err(cause)
					if matches!(
						cause.kind(),
						IoErrorKind::ConnectionReset | IoErrorKind::ConnectionAborted
					) =>
				{
					return;
				}
				Err(cause)
					if matches!(
						cause.kind(),
						IoErrorKind::WouldBlock | IoErrorKind::TimedOut
					) => {}
				Err(cause) => panic!("Unexpected socket error while awaiting close: {cause}"),
			}
		}
	}
}

#[test]
fn identify_returns_monotonic_ids() {
	let server = start_server();
	let mut first = TestClient::connect(server.addr);
	first.send_line("I");
	first.expect_line("0");
	first.expect_line("OK");

	let mut second = TestClient::connect(server.addr);
	second.send_line("I");
	second.expect_line("1");
	second.expect_line("OK");

	server.shutdown_via(&mut first);
	second.expect_closed();
}

#[test]
fn attach_rejections_use_the_protocol_error_strings() {
	let server = start_server();
	let mut first = TestClient::connect(server.addr);
	let mut second = TestClient::connect(server.addr);

	first.send_line("A 0");
	first.expect_line("ERROR cannot attach to self");
	first.send_line("A 99");
	first.expect_line("ERROR no such channel");
	first.send_line("A zero");
	first.expect_line("ERROR bad channel id");
	second.send_line("A 0 Q");
	second.expect_line("ERROR unknown type (R,T or nothing)");
	first.send_line("Z");
	first.expect_line("ERROR unknown command");

	server.shutdown_via(&mut first);
	second.expect_closed();
}

#[test]
fn close_terminates_channels() {
	let server = start_server();
	let mut first = TestClient::connect(server.addr);
	let mut second = TestClient::connect(server.addr);
	// Make sure the second channel is registered before naming its id.
	second.send_line("I");
	second.expect_line("1");
	second.expect_line("OK");

	first.send_line("C 1");
	first.expect_line("OK");
	second.expect_closed();

	first.send_line("C");
	first.expect_line("OK");
	first.expect_closed();

	let mut last = TestClient::connect(server.addr);
	server.shutdown_via(&mut last);
}

#[test]
fn help_and_listings_frame_their_output() {
	let server = start_server();
	let mut chan = TestClient::connect(server.addr);

	chan.send_line("?");
	let banner = chan.read_line();
	assert!(
		banner.starts_with("uartsocket "),
		"Help must lead with the version banner, got: {banner:?}"
	);
	let mut seen_ok = false;
	for _ in 0..64 {
		if chan.read_line() == "OK" {
			seen_ok = true;
			break;
		}
	}
	assert!(seen_ok, "Help output must end with OK.");

	chan.send_line("D");
	let listing = chan.read_line();
	assert!(
		listing.starts_with("C0\t["),
		"D must list this control channel, got: {listing:?}"
	);
	chan.expect_line("OK");

	// No serials are open, so S has nothing but the OK to say.
	chan.send_line("S");
	chan.expect_line("OK");

	chan.send_line("-");
	let own = chan.read_line();
	assert!(own.starts_with("C0\t["));
	assert!(
		!own.contains("uart:"),
		"A channel with no open serial must not report uart fields."
	);
	chan.expect_line("OK");

	server.shutdown_via(&mut chan);
}

#[cfg(unix)]
mod with_pty {
	use super::*;
	use serialport::{SerialPort as _, TTYPort};

	/// A pty pair; the server opens the slave end by name, the test drives
	/// the master end directly.
	fn pty_pair() -> (TTYPort, String) {
		let (mut master, slave) = TTYPort::pair().expect("Failed to create a pty pair!");
		master
			.set_timeout(IO_TIMEOUT)
			.expect("Failed to set the pty master timeout!");
		let name = slave.name().expect("The pty slave must have a name!");
		drop(slave);
		(master, name)
	}

	fn read_exactly(port: &mut TTYPort, want: usize) -> Vec<u8> {
		let deadline = Instant::now() + IO_TIMEOUT;
		let mut collected = Vec::new();
		let mut chunk = [0_u8; 64];
		while collected.len() < want {
			assert!(
				Instant::now() < deadline,
				"Timed out waiting for {want} bytes on the pty master!"
			);
			match port.read(&mut chunk) {
				Ok(0) => {}
				Ok(read) => collected.extend_from_slice(&chunk[..read]),
				Err(cause)
					if matches!(
						cause.kind(),
						IoErrorKind::WouldBlock | IoErrorKind::TimedOut
					) => {}
				Err(cause) => panic!("pty master read failed: {cause}"),
			}
		}
		collected
	}

	#[test]
	fn open_configure_and_report_status() {
		let server = start_server();
		let (_master, slave) = pty_pair();
		let mut ctrl = TestClient::connect(server.addr);

		ctrl.send_line(&format!("O {slave}"));
		ctrl.expect_line("OK");
		ctrl.send_line("U B9600 D8 Pn S1");
		ctrl.expect_line("OK");

		ctrl.send_line("-");
		let status = ctrl.read_line();
		assert!(status.starts_with("C0\t["), "got: {status:?}");
		for field in [
			format!("\tuart:{slave}"),
			"\tbaud:9600".to_owned(),
			"\tdata:8".to_owned(),
			"\tstop:1".to_owned(),
			"\tpar:N".to_owned(),
			"\trtmo:1000".to_owned(),
			"\twtmo:1000".to_owned(),
			"\titmo:-".to_owned(),
			"\tdsrdtr:0".to_owned(),
			"\trtscts:0".to_owned(),
			"\txonxoff:0".to_owned(),
		] {
			assert!(
				status.contains(&field),
				"Status line missing {field:?}, got: {status:?}"
			);
		}
		ctrl.expect_line("OK");

		// The S listing now carries the same line.
		ctrl.send_line("S");
		let listing = ctrl.read_line();
		assert!(listing.contains(&format!("\tuart:{slave}")));
		ctrl.expect_line("OK");

		server.shutdown_via(&mut ctrl);
	}

	#[test]
	fn sniffers_and_duplex_channels_fan_out() {
		let server = start_server();
		let (mut master, slave) = pty_pair();
		let mut ctrl = TestClient::connect(server.addr);
		ctrl.send_line(&format!("O {slave}"));
		ctrl.expect_line("OK");

		let mut sniffer = TestClient::connect(server.addr);
		sniffer.send_line("A 0 R");
		sniffer.expect_line("OK");
		let mut duplex = TestClient::connect(server.addr);
		duplex.send_line("A 0");
		duplex.expect_line("OK");

		// Network -> UART: the duplex channel's raw bytes come out of the
		// device (i.e. reach the pty master).
		duplex.send_raw(b"hello");
		assert_eq!(read_exactly(&mut master, 5), b"hello");

		// UART -> network: device bytes reach the rx sniffer AND the
		// duplex channel, in order.
		master
			.write_all(b"world")
			.expect("Failed to write to the pty master!");
		assert_eq!(sniffer.read_raw_exactly(5), b"world");
		assert_eq!(duplex.read_raw_exactly(5), b"world");

		let listing_check = {
			ctrl.send_line("-");
			let line = ctrl.read_line();
			ctrl.expect_line("OK");
			line
		};
		assert!(
			listing_check.contains("\tattachees:2"),
			"The owner must report both attachees, got: {listing_check:?}"
		);

		server.shutdown_via(&mut ctrl);
		sniffer.expect_closed();
		duplex.expect_closed();
	}

	#[test]
	fn tx_sniffers_mirror_written_bytes() {
		let server = start_server();
		let (mut master, slave) = pty_pair();
		let mut ctrl = TestClient::connect(server.addr);
		ctrl.send_line(&format!("O {slave}"));
		ctrl.expect_line("OK");

		let mut tx_sniffer = TestClient::connect(server.addr);
		tx_sniffer.send_line("A 0 T");
		tx_sniffer.expect_line("OK");
		let mut duplex = TestClient::connect(server.addr);
		duplex.send_line("A 0");
		duplex.expect_line("OK");

		duplex.send_raw(b"ping!");
		assert_eq!(read_exactly(&mut master, 5), b"ping!");
		assert_eq!(
			tx_sniffer.read_raw_exactly(5),
			b"ping!",
			"A tx sniffer must see a copy of everything written to the device.",
		);

		server.shutdown_via(&mut ctrl);
	}

	#[test]
	fn exclusive_open_admits_one_duplex_channel() {
		let server = start_server();
		let (_master, slave) = pty_pair();
		let mut ctrl = TestClient::connect(server.addr);
		ctrl.send_line(&format!("O {slave} X"));
		ctrl.expect_line("OK");

		let mut first = TestClient::connect(server.addr);
		first.send_line("A 0");
		first.expect_line("OK");

		let mut second = TestClient::connect(server.addr);
		second.send_line("A 0");
		second.expect_line("ERROR control channel denies access of data channel type");

		let mut rx_sniffer = TestClient::connect(server.addr);
		rx_sniffer.send_line("A 0 R");
		rx_sniffer.expect_line("ERROR control channel denies access of data channel type");

		// Tx sniffing is always allowed.
		let mut tx_sniffer = TestClient::connect(server.addr);
		tx_sniffer.send_line("A 0 T");
		tx_sniffer.expect_line("OK");

		server.shutdown_via(&mut ctrl);
	}

	#[test]
	fn duplicate_opens_are_rejected() {
		let server = start_server();
		let (_master, slave) = pty_pair();
		let mut ctrl = TestClient::connect(server.addr);
		ctrl.send_line(&format!("O {slave}"));
		ctrl.expect_line("OK");

		let mut other = TestClient::connect(server.addr);
		other.send_line(&format!("O {slave}"));
		other.expect_line("ERROR already opened in other channel");

		server.shutdown_via(&mut ctrl);
	}

	#[test]
	fn open_failures_report_and_keep_the_channel() {
		let server = start_server();
		let mut ctrl = TestClient::connect(server.addr);

		ctrl.send_line("O /dev/this-device-does-not-exist");
		let response = ctrl.read_line();
		assert!(
			response.starts_with("ERROR serial:"),
			"A failed open must report a serial error, got: {response:?}"
		);

		// The channel survives and keeps working.
		ctrl.send_line("I");
		ctrl.expect_line("0");
		ctrl.expect_line("OK");

		server.shutdown_via(&mut ctrl);
	}

	#[test]
	fn line_queries_answer_dash_without_a_uart() {
		let server = start_server();
		let mut ctrl = TestClient::connect(server.addr);

		ctrl.send_line("U c s i e");
		for _ in 0..4 {
			ctrl.expect_line("-");
		}
		ctrl.expect_line("OK");

		server.shutdown_via(&mut ctrl);
	}
}
