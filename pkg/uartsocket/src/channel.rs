//! One TCP connection: the shared channel handle, plus the ingress and
//! egress loops that live on its two threads.
//!
//! The ingress loop runs on the thread the listener spawned for the
//! connection; the egress loop runs on a thread owned here. Everything the
//! server ever writes to the peer goes through the egress queue, so there
//! is exactly one socket writer per channel and responses never interleave
//! with forwarded UART data mid-chunk.

use crate::{
	protocol,
	registry::{ChannelId, Registry, Role},
	server::Tuning,
};
use bytes::Bytes;
use std::{
	any::Any,
	io::{ErrorKind as IoErrorKind, Read, Result as IoResult, Write},
	net::{Shutdown, SocketAddr, TcpStream},
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		mpsc::{channel, Receiver, RecvTimeoutError, Sender},
		Arc,
	},
	thread,
	time::Duration,
};
use tracing::{debug, error, warn};

/// Consecutive zero-byte socket reads tolerated before the watchdog trips.
const ZERO_READ_LIMIT: u32 = 100_000;
/// Watchdog trips abort the whole process with this code (the CLI reserves
/// it for exactly this and argument-parse failures).
const WATCHDOG_EXIT_CODE: i32 = 1;
/// How long the egress thread sleeps between checks of the running flag.
const EGRESS_POLL: Duration = Duration::from_secs(1);

/// The part of a channel other threads get to see: identity, the running
/// flag, the socket, and the sending half of the egress queue.
pub struct ChannelShared {
	id: ChannelId,
	peer: SocketAddr,
	running: AtomicBool,
	stream: TcpStream,
	egress: Sender<Bytes>,
}

impl ChannelShared {
	pub(crate) fn new(
		id: ChannelId,
		peer: SocketAddr,
		stream: TcpStream,
	) -> (Arc<Self>, Receiver<Bytes>) {
		let (egress, egress_queue) = channel();
		let shared = Arc::new(Self {
			id,
			peer,
			running: AtomicBool::new(true),
			stream,
			egress,
		});
		(shared, egress_queue)
	}

	#[must_use]
	pub fn id(&self) -> ChannelId {
		self.id
	}

	#[must_use]
	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// The universal cancellation signal; both loops observe it within one
	/// poll interval.
	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}

	/// Queue a chunk for transmission to the peer.
	pub fn send(&self, chunk: Bytes) {
		// A closed queue means the egress thread is already gone, which only
		// happens during teardown; nothing useful left to do with the bytes.
		let _ = self.egress.send(chunk);
	}

	/// Queue a protocol line (or any text) for transmission to the peer.
	pub fn send_text(&self, text: &str) {
		self.send(Bytes::copy_from_slice(text.as_bytes()));
	}

	pub(crate) fn egress_sender(&self) -> Sender<Bytes> {
		self.egress.clone()
	}

	/// Unblock the peer (and our own ingress read) immediately; used by the
	/// cancelling thread on broadcast shutdown.
	pub(crate) fn shutdown_socket(&self) {
		let _ = self.stream.shutdown(Shutdown::Both);
	}

	fn read_chunk(&self, buf: &mut [u8]) -> IoResult<usize> {
		(&self.stream).read(buf)
	}

	fn write_chunk(&self, chunk: &[u8]) -> IoResult<()> {
		(&self.stream).write_all(chunk)
	}
}

/// Entry point for a freshly accepted connection; runs until the channel
/// terminates, then cleans up after it.
pub(crate) fn serve(stream: TcpStream, registry: Arc<Registry>, tuning: Tuning) {
	let peer = match stream.peer_addr() {
		Ok(peer) => peer,
		Err(cause) => {
			debug!(?cause, "connection vanished before it got a channel");
			return;
		}
	};
	if let Err(cause) = stream.set_read_timeout(Some(tuning.eth_poll)) {
		warn!(%peer, ?cause, "could not set the socket poll timeout, dropping connection");
		return;
	}

	let (shared, egress_queue) = registry.register(stream, peer);
	let egress_shared = Arc::clone(&shared);
	let egress_thread = thread::Builder::new()
		.name(format!("uartsocket::egress::{}", shared.id()))
		.spawn(move || egress_loop(&egress_shared, &egress_queue));
	let egress_thread = match egress_thread {
		Ok(handle) => handle,
		Err(cause) => {
			error!(channel = shared.id(), ?cause, "could not spawn the egress thread");
			registry.finalize(&shared);
			return;
		}
	};

	ingress_loop(&registry, &shared, &tuning);
	registry.finalize(&shared);
	// Joining after finalize: the egress thread drains whatever is still
	// queued (a final OK, a serial error report) and exits within one poll.
	let _ = egress_thread.join();
	debug!(channel = shared.id(), "channel threads done");
}

fn ingress_loop(registry: &Arc<Registry>, shared: &Arc<ChannelShared>, tuning: &Tuning) {
	let mut buf = vec![0_u8; tuning.eth_recv_size.max(1)];
	let mut cmd_buffer: Vec<u8> = Vec::new();
	let mut role = Role::Control;
	let mut ctrl_ref: Option<ChannelId> = None;
	let mut zero_reads: u32 = 0;

	while registry.is_running() && shared.is_running() {
		match shared.read_chunk(&mut buf) {
			Ok(0) => {
				// Could be a half-closed peer replaying zero-length reads at
				// us forever; the channel stays up but the process won't.
				zero_reads += 1;
				if zero_reads > ZERO_READ_LIMIT {
					error!(
						channel = shared.id(),
						"zero-read watchdog tripped, aborting the process"
					);
					std::process::exit(WATCHDOG_EXIT_CODE);
				}
			}
			Ok(read) => {
				zero_reads = 0;
				match role {
					Role::Control => {
						cmd_buffer.extend_from_slice(&buf[..read]);
						if buf[..read].ends_with(b"\n") {
							let line = String::from_utf8_lossy(&cmd_buffer).into_owned();
							cmd_buffer.clear();
							role = dispatch_command(registry, shared, &line, tuning);
							if role != Role::Control {
								ctrl_ref = registry.ctrl_of(shared.id());
							}
						}
					}
					Role::DataRxTx => {
						// Dropped silently when the owner has no open UART.
						if let Some(sender) =
							ctrl_ref.and_then(|ctrl| registry.uart_sender(ctrl))
						{
							let _ = sender.send(Bytes::copy_from_slice(&buf[..read]));
						}
					}
					// Sniffers only ever receive.
					Role::DataRx | Role::DataTx => {}
				}
			}
			Err(cause)
				if matches!(
					cause.kind(),
					IoErrorKind::WouldBlock | IoErrorKind::TimedOut
				) => {}
			Err(cause)
				if matches!(
					cause.kind(),
					IoErrorKind::BrokenPipe
						| IoErrorKind::ConnectionReset
						| IoErrorKind::ConnectionAborted
				) =>
			{
				debug!(channel = shared.id(), "peer hung up");
				break;
			}
			Err(cause) => {
				warn!(
					channel = shared.id(),
					?cause,
					"socket error on ingress, terminating channel"
				);
				break;
			}
		}
	}
}

/// Run one control line through the protocol, treating a panic anywhere in
/// dispatch as a reportable error instead of a dead channel.
fn dispatch_command(
	registry: &Arc<Registry>,
	shared: &Arc<ChannelShared>,
	line: &str,
	tuning: &Tuning,
) -> Role {
	match catch_unwind(AssertUnwindSafe(|| {
		protocol::dispatch(registry, shared, line, tuning)
	})) {
		Ok(role) => role,
		Err(payload) => {
			let detail = panic_detail(payload.as_ref());
			error!(
				channel = shared.id(),
				detail = detail,
				"panic during command dispatch"
			);
			shared.send_text(&format!("ERROR unknown:{detail}\n"));
			Role::Control
		}
	}
}

fn panic_detail(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("panic")
}

fn egress_loop(shared: &ChannelShared, queue: &Receiver<Bytes>) {
	loop {
		if !shared.is_running() {
			// Flush what was queued before the stop, then leave. The socket
			// itself closes when the last Arc to the channel drops.
			while let Ok(chunk) = queue.try_recv() {
				if shared.write_chunk(&chunk).is_err() {
					break;
				}
			}
			break;
		}
		match queue.recv_timeout(EGRESS_POLL) {
			Ok(chunk) => {
				if let Err(cause) = shared.write_chunk(&chunk) {
					debug!(channel = shared.id(), ?cause, "egress write failed");
					shared.stop();
					break;
				}
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}
}
