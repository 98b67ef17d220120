//! The TCP listener: accepts connections and hands each one to a channel
//! ingress thread.
//!
//! The accept loop is the only place in the whole server that blocks
//! without a timeout; the broadcast shutdown path unblocks it by making a
//! throwaway connection to our own listening address.

use crate::{channel, errors::BridgeError, registry::Registry};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
	io::{Error as IoError, ErrorKind as IoErrorKind},
	net::{SocketAddr, TcpListener, ToSocketAddrs},
	sync::Arc,
	thread::{self, JoinHandle},
	time::Duration,
};
use tracing::{debug, info, warn};

/// The knobs the command line exposes: chunk sizes and the socket poll
/// interval. The timeouts here exist so worker threads can observe
/// shutdown flags, they are not part of any wire contract.
#[derive(Clone, Copy, Debug)]
pub struct Tuning {
	/// Bytes read from a TCP socket per ingress read.
	pub eth_recv_size: usize,
	/// TCP read timeout; bounds how fast a channel notices termination.
	pub eth_poll: Duration,
	/// Bytes read from a serial device per rx-pump read.
	pub ser_recv_size: usize,
}

impl Default for Tuning {
	fn default() -> Self {
		Self {
			eth_recv_size: 8,
			eth_poll: Duration::from_secs(1),
			ser_recv_size: 1,
		}
	}
}

/// An unbound server: a registry plus its tuning.
pub struct Server {
	registry: Arc<Registry>,
	tuning: Tuning,
}

impl Server {
	#[must_use]
	pub fn new(tuning: Tuning) -> Self {
		Self {
			registry: Arc::new(Registry::new()),
			tuning,
		}
	}

	/// Bind the control listener with address reuse enabled.
	///
	/// `host` may resolve to several addresses; the first one that binds
	/// wins.
	///
	/// ## Errors
	///
	/// - If the host/port pair does not resolve to any address.
	/// - If every resolved address refuses to bind.
	pub fn bind(self, host: &str, port: u16) -> Result<BoundServer, BridgeError> {
		let spec = format!("{host}:{port}");
		let candidates = (host, port)
			.to_socket_addrs()
			.map_err(|cause| BridgeError::AddressResolution {
				spec: spec.clone(),
				cause,
			})?;

		let mut last_failure: Option<IoError> = None;
		for candidate in candidates {
			match bind_reusable(candidate) {
				Ok(listener) => {
					let local = listener.local_addr().map_err(|cause| {
						BridgeError::BindFailure {
							spec: spec.clone(),
							cause,
						}
					})?;
					self.registry.set_listener_addr(local);
					info!(%local, "listening");
					return Ok(BoundServer {
						listener,
						local,
						registry: self.registry,
						tuning: self.tuning,
					});
				}
				Err(cause) => {
					debug!(%candidate, ?cause, "bind candidate refused");
					last_failure = Some(cause);
				}
			}
		}
		Err(BridgeError::BindFailure {
			spec,
			cause: last_failure.unwrap_or_else(|| {
				IoError::new(IoErrorKind::AddrNotAvailable, "no addresses resolved")
			}),
		})
	}
}

/// A server that holds its listening socket and is ready to accept.
pub struct BoundServer {
	listener: TcpListener,
	local: SocketAddr,
	registry: Arc<Registry>,
	tuning: Tuning,
}

impl BoundServer {
	/// The address we actually listen on (useful with port 0).
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local
	}

	/// A handle onto the topology, mostly interesting for tests and for
	/// embedding the server.
	#[must_use]
	pub fn registry(&self) -> Arc<Registry> {
		Arc::clone(&self.registry)
	}

	/// Accept until a broadcast shutdown (`X`) clears the running flag,
	/// then wait for every channel thread to drain and exit.
	///
	/// ## Errors
	///
	/// If the accept loop dies while the server was still supposed to be
	/// running.
	pub fn serve(self) -> Result<(), BridgeError> {
		let mut workers: Vec<JoinHandle<()>> = Vec::new();
		while self.registry.is_running() {
			match self.listener.accept() {
				Ok((stream, peer)) => {
					workers.retain(|worker| !worker.is_finished());
					if !self.registry.is_running() {
						// The shutdown kick itself.
						break;
					}
					let registry = Arc::clone(&self.registry);
					let tuning = self.tuning;
					let spawned = thread::Builder::new()
						.name(format!("uartsocket::ingress::{peer}"))
						.spawn(move || channel::serve(stream, registry, tuning));
					match spawned {
						Ok(handle) => workers.push(handle),
						Err(cause) => {
							warn!(%peer, ?cause, "could not spawn an ingress thread, dropping connection");
						}
					}
				}
				Err(cause) if cause.kind() == IoErrorKind::Interrupted => {}
				Err(cause) => {
					if !self.registry.is_running() {
						break;
					}
					return Err(BridgeError::AcceptFailure(cause));
				}
			}
		}

		// Every channel got its stop flag in the shutdown broadcast; give
		// their egress queues the chance to flush the final answers.
		for worker in workers {
			let _ = worker.join();
		}
		info!(local = %self.local, "server stopped");
		Ok(())
	}
}

/// `TcpListener::bind` with `SO_REUSEADDR`, so a restart doesn't trip over
/// the previous instance's sockets in TIME_WAIT.
fn bind_reusable(addr: SocketAddr) -> Result<TcpListener, IoError> {
	let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
	// Windows' SO_REUSEADDR semantics are different enough (it allows
	// hijacking active listeners) that the plain bind is the right call
	// there.
	#[cfg(unix)]
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(128)?;
	Ok(socket.into())
}
