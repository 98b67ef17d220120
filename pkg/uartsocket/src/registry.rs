//! The process-wide topology: who is a control channel, who is attached to
//! whom, and which serial devices are open.
//!
//! Everything lives behind one mutex. Holds are short, O(channel count),
//! and never cover I/O: opening a serial device happens between
//! [`Registry::begin_open`] and [`Registry::commit_open`], and the pump
//! threads snapshot their fan-out targets under the lock but send after
//! releasing it. Cross-object references are channel ids resolved through
//! the tables, never owning links, so teardown order can't deadlock.

use crate::{channel::ChannelShared, errors::TopologyError, serial::SerialConfig, uart::Uart};
use bytes::Bytes;
use fnv::FnvHashMap;
use std::{
	net::{SocketAddr, TcpStream},
	sync::{
		atomic::{AtomicBool, Ordering},
		mpsc::{Receiver, Sender},
		Arc, Mutex, MutexGuard, PoisonError,
	},
	time::Duration,
};
use tracing::debug;

/// Monotonically increasing channel identifier, unique for the lifetime of
/// the server.
pub type ChannelId = u32;

/// What a channel currently is. Every channel starts as `Control`; the `A`
/// command moves it to one of the data roles, and there is no way back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Control,
	/// Sniffs bytes received from the UART.
	DataRx,
	/// Sniffs bytes sent to the UART.
	DataTx,
	/// Full duplex: receives UART bytes and may send to the UART.
	DataRxTx,
}

impl Role {
	/// Short form used in `D` listing lines.
	#[must_use]
	pub fn label(self) -> &'static str {
		match self {
			Self::Control => "ctrl",
			Self::DataRx => "rx",
			Self::DataTx => "tx",
			Self::DataRxTx => "rxtx",
		}
	}
}

struct CtrlEntry {
	chan: Arc<ChannelShared>,
	cfg: SerialConfig,
	uart: Option<Arc<Uart>>,
	/// DataRx and DataRxTx attachees; the rx pump fans out to these.
	attach_rx: Vec<ChannelId>,
	/// DataTx attachees; the tx pump mirrors written bytes to these.
	attach_tx: Vec<ChannelId>,
}

struct DataEntry {
	chan: Arc<ChannelShared>,
	role: Role,
	ctrl: ChannelId,
}

#[derive(Default)]
struct Tables {
	next_id: ChannelId,
	ctrl: FnvHashMap<ChannelId, CtrlEntry>,
	data: FnvHashMap<ChannelId, DataEntry>,
	uarts: FnvHashMap<String, Arc<Uart>>,
}

/// A point-in-time description of one channel, for `D`/`S`/`-` rendering.
#[derive(Clone, Debug)]
pub enum ChannelSnapshot {
	Control {
		id: ChannelId,
		peer: SocketAddr,
		uart: Option<String>,
		cfg: SerialConfig,
		attachees: usize,
	},
	Data {
		id: ChannelId,
		peer: SocketAddr,
		role: Role,
		ctrl: ChannelId,
		uart: Option<String>,
	},
}

/// The server-global state: channel tables, UART table, id allocator, and
/// the running flag every worker thread polls.
pub struct Registry {
	running: AtomicBool,
	listener_addr: Mutex<Option<SocketAddr>>,
	tables: Mutex<Tables>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	#[must_use]
	pub fn new() -> Self {
		Self {
			running: AtomicBool::new(true),
			listener_addr: Mutex::new(None),
			tables: Mutex::new(Tables::default()),
		}
	}

	fn tables(&self) -> MutexGuard<'_, Tables> {
		self.tables.lock().unwrap_or_else(PoisonError::into_inner)
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub(crate) fn set_listener_addr(&self, addr: SocketAddr) {
		*self
			.listener_addr
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(addr);
	}

	/// Admit a freshly accepted connection as a new control channel.
	pub(crate) fn register(
		&self,
		stream: TcpStream,
		peer: SocketAddr,
	) -> (Arc<ChannelShared>, Receiver<Bytes>) {
		let mut tables = self.tables();
		let id = tables.next_id;
		tables.next_id += 1;
		let (shared, egress_queue) = ChannelShared::new(id, peer, stream);
		tables.ctrl.insert(
			id,
			CtrlEntry {
				chan: Arc::clone(&shared),
				cfg: SerialConfig::default(),
				uart: None,
				attach_rx: Vec::new(),
				attach_tx: Vec::new(),
			},
		);
		debug!(channel = id, peer = %peer, "channel connected");
		(shared, egress_queue)
	}

	/// Ask any channel (control or data) to terminate.
	///
	/// ## Errors
	///
	/// If no channel has this id.
	pub fn request_stop(&self, id: ChannelId) -> Result<(), TopologyError> {
		let tables = self.tables();
		let chan = tables
			.ctrl
			.get(&id)
			.map(|entry| &entry.chan)
			.or_else(|| tables.data.get(&id).map(|entry| &entry.chan))
			.ok_or(TopologyError::NoSuchChannel)?;
		debug!(channel = id, "termination requested");
		chan.stop();
		Ok(())
	}

	/// Turn the control channel `id` into a data channel of `target`.
	///
	/// On success the issuer's own UART (if any) is closed first, its table
	/// entry moves, and the target's attachment set gains the issuer. On
	/// failure nothing changes.
	///
	/// ## Errors
	///
	/// - [`TopologyError::AttachToSelf`] when `target == id`.
	/// - [`TopologyError::HaveAttachees`] when the issuer has attachees.
	/// - [`TopologyError::NoSuchChannel`] when `target` is not a live
	///   control channel.
	/// - [`TopologyError::AttachDenied`] per the exclusivity policy.
	pub fn attach(&self, id: ChannelId, target: ChannelId, role: Role) -> Result<(), TopologyError> {
		debug_assert!(role != Role::Control, "can only attach as a data role");
		let mut tables = self.tables();
		if target == id {
			return Err(TopologyError::AttachToSelf);
		}
		{
			let own = tables.ctrl.get(&id).ok_or(TopologyError::NoSuchChannel)?;
			if !own.attach_rx.is_empty() || !own.attach_tx.is_empty() {
				return Err(TopologyError::HaveAttachees);
			}
		}
		if !tables.ctrl.contains_key(&target) {
			return Err(TopologyError::NoSuchChannel);
		}
		if role != Role::DataTx && !accept_attach(&tables, target) {
			return Err(TopologyError::AttachDenied);
		}

		// All checks passed; commit.
		let Some(own) = tables.ctrl.remove(&id) else {
			return Err(TopologyError::NoSuchChannel);
		};
		if let Some(uart) = own.uart {
			// A data channel must never own a UART.
			debug!(channel = id, uart = uart.name(), "closing uart before attach");
			uart.stop();
			tables.uarts.remove(uart.name());
		}
		let Some(entry) = tables.ctrl.get_mut(&target) else {
			return Err(TopologyError::NoSuchChannel);
		};
		if role == Role::DataTx {
			entry.attach_tx.push(id);
		} else {
			entry.attach_rx.push(id);
		}
		tables.data.insert(
			id,
			DataEntry {
				chan: own.chan,
				role,
				ctrl: target,
			},
		);
		debug!(
			channel = id,
			target = target,
			role = role.label(),
			"channel attached"
		);
		Ok(())
	}

	/// The control channel a data channel is attached to.
	#[must_use]
	pub fn ctrl_of(&self, id: ChannelId) -> Option<ChannelId> {
		self.tables().data.get(&id).map(|entry| entry.ctrl)
	}

	/// First phase of `O`: close the issuer's own UART, reject duplicate
	/// device names, and apply the exclusivity trim. Returns the issuer's
	/// current desired configuration for the actual device open, which
	/// happens without the lock held.
	///
	/// ## Errors
	///
	/// - [`TopologyError::NoSuchChannel`] if the issuer vanished.
	/// - [`TopologyError::AlreadyOpened`] on a duplicate device name.
	pub fn begin_open(
		&self,
		id: ChannelId,
		name: &str,
		exclusive: bool,
	) -> Result<SerialConfig, TopologyError> {
		let mut tables = self.tables();
		let Some(entry) = tables.ctrl.get_mut(&id) else {
			return Err(TopologyError::NoSuchChannel);
		};
		if let Some(old) = entry.uart.take() {
			debug!(channel = id, uart = old.name(), "closing previous uart");
			old.stop();
			let old_name = old.name().to_owned();
			tables.uarts.remove(&old_name);
		}
		if tables.uarts.contains_key(name) {
			return Err(TopologyError::AlreadyOpened);
		}
		if exclusive {
			trim_extra_rxtx(&mut tables, id);
		}
		tables
			.ctrl
			.get(&id)
			.map(|entry| entry.cfg.clone())
			.ok_or(TopologyError::NoSuchChannel)
	}

	/// Second phase of `O`: record the opened UART, unless someone raced us
	/// to the same device name while the open was in flight.
	///
	/// ## Errors
	///
	/// - [`TopologyError::AlreadyOpened`] if the name got taken meanwhile.
	/// - [`TopologyError::NoSuchChannel`] if the issuer vanished meanwhile.
	///
	/// Either way the caller still owns the UART and dropping it closes the
	/// device.
	pub fn commit_open(&self, id: ChannelId, uart: &Arc<Uart>) -> Result<(), TopologyError> {
		let mut tables = self.tables();
		if tables.uarts.contains_key(uart.name()) {
			return Err(TopologyError::AlreadyOpened);
		}
		let Some(entry) = tables.ctrl.get_mut(&id) else {
			return Err(TopologyError::NoSuchChannel);
		};
		entry.uart = Some(Arc::clone(uart));
		tables
			.uarts
			.insert(uart.name().to_owned(), Arc::clone(uart));
		debug!(channel = id, uart = uart.name(), "uart open");
		Ok(())
	}

	/// Stop a UART's pumps and drop it from the tables; idempotent. The
	/// device itself closes once the pump threads let go of their handles.
	pub(crate) fn close_uart(&self, uart: &Arc<Uart>) {
		let mut tables = self.tables();
		uart.stop();
		tables.uarts.remove(uart.name());
		if let Some(entry) = tables.ctrl.get_mut(&uart.ctrl()) {
			if entry
				.uart
				.as_ref()
				.is_some_and(|owned| owned.name() == uart.name())
			{
				entry.uart = None;
			}
		}
		debug!(uart = uart.name(), "uart closed");
	}

	/// Tear down a channel that is leaving: detach it everywhere, stop its
	/// dependents, and drop it from the tables.
	pub(crate) fn finalize(&self, chan: &Arc<ChannelShared>) {
		let id = chan.id();
		let mut tables = self.tables();
		if let Some(entry) = tables.ctrl.remove(&id) {
			for attached in entry.attach_rx.iter().chain(entry.attach_tx.iter()) {
				if let Some(data) = tables.data.remove(attached) {
					debug!(channel = *attached, "attached data channel stopped");
					data.chan.stop();
				}
			}
			if let Some(uart) = entry.uart {
				debug!(channel = id, uart = uart.name(), "owned uart stopped");
				uart.stop();
				let name = uart.name().to_owned();
				tables.uarts.remove(&name);
			}
		} else if let Some(entry) = tables.data.remove(&id) {
			if let Some(owner) = tables.ctrl.get_mut(&entry.ctrl) {
				owner.attach_rx.retain(|attached| *attached != id);
				owner.attach_tx.retain(|attached| *attached != id);
			}
		}
		chan.stop();
		debug!(channel = id, "channel finalized");
	}

	/// The tx-queue sender of the UART owned by control channel `ctrl`, if
	/// one is open. Resolved per chunk so a close/reopen is always honored.
	#[must_use]
	pub fn uart_sender(&self, ctrl: ChannelId) -> Option<Sender<Bytes>> {
		self.tables()
			.ctrl
			.get(&ctrl)
			.and_then(|entry| entry.uart.as_ref())
			.map(|uart| uart.tx_sender())
	}

	/// Egress senders of every rx-side attachee of `ctrl` (DataRx and
	/// DataRxTx); the rx pump publishes UART bytes to these.
	#[must_use]
	pub fn rx_targets(&self, ctrl: ChannelId) -> Vec<Sender<Bytes>> {
		let tables = self.tables();
		attachment_targets(&tables, ctrl, |entry| &entry.attach_rx)
	}

	/// Egress senders of every tx sniffer of `ctrl`; the tx pump mirrors
	/// written bytes to these.
	#[must_use]
	pub fn tx_sniffer_targets(&self, ctrl: ChannelId) -> Vec<Sender<Bytes>> {
		let tables = self.tables();
		attachment_targets(&tables, ctrl, |entry| &entry.attach_tx)
	}

	/// The live channel handle of a control channel; pump threads use this
	/// to report failures to their owner.
	#[must_use]
	pub fn ctrl_channel(&self, ctrl: ChannelId) -> Option<Arc<ChannelShared>> {
		self.tables()
			.ctrl
			.get(&ctrl)
			.map(|entry| Arc::clone(&entry.chan))
	}

	/// The UART currently owned by a control channel.
	#[must_use]
	pub fn uart_of(&self, ctrl: ChannelId) -> Option<Arc<Uart>> {
		self.tables()
			.ctrl
			.get(&ctrl)
			.and_then(|entry| entry.uart.as_ref().map(Arc::clone))
	}

	/// A control channel's desired serial configuration.
	#[must_use]
	pub fn ctrl_cfg(&self, ctrl: ChannelId) -> Option<SerialConfig> {
		self.tables().ctrl.get(&ctrl).map(|entry| entry.cfg.clone())
	}

	pub(crate) fn set_ctrl_cfg(&self, ctrl: ChannelId, cfg: SerialConfig) {
		if let Some(entry) = self.tables().ctrl.get_mut(&ctrl) {
			entry.cfg = cfg;
		}
	}

	/// Everything, control channels first, each group in id order.
	#[must_use]
	pub fn snapshot_all(&self) -> Vec<ChannelSnapshot> {
		let tables = self.tables();
		let mut ctrl_ids = tables.ctrl.keys().copied().collect::<Vec<_>>();
		ctrl_ids.sort_unstable();
		let mut data_ids = tables.data.keys().copied().collect::<Vec<_>>();
		data_ids.sort_unstable();
		ctrl_ids
			.into_iter()
			.chain(data_ids)
			.filter_map(|id| snapshot_in(&tables, id))
			.collect()
	}

	/// Control channels that currently own a UART, in id order.
	#[must_use]
	pub fn snapshot_open_serials(&self) -> Vec<ChannelSnapshot> {
		let tables = self.tables();
		let mut ids = tables
			.ctrl
			.iter()
			.filter(|(_, entry)| entry.uart.is_some())
			.map(|(id, _)| *id)
			.collect::<Vec<_>>();
		ids.sort_unstable();
		ids.into_iter()
			.filter_map(|id| snapshot_in(&tables, id))
			.collect()
	}

	/// One channel, if it exists.
	#[must_use]
	pub fn snapshot_one(&self, id: ChannelId) -> Option<ChannelSnapshot> {
		snapshot_in(&self.tables(), id)
	}

	/// Broadcast shutdown: flips the global running flag, stops every
	/// channel and UART, unblocks peers, and kicks the accept loop awake.
	/// The initiator's socket is left to close via its own egress drain so
	/// its final `OK` still gets out.
	pub fn shutdown(&self, initiator: Option<ChannelId>) {
		debug!("server shutdown");
		self.running.store(false, Ordering::SeqCst);
		// Flag everything under the lock, but do the actual socket work
		// after releasing it.
		let peers = {
			let mut tables = self.tables();
			let mut peers = Vec::with_capacity(tables.ctrl.len() + tables.data.len());
			for entry in tables.ctrl.values() {
				entry.chan.stop();
				peers.push(Arc::clone(&entry.chan));
			}
			for entry in tables.data.values() {
				entry.chan.stop();
				peers.push(Arc::clone(&entry.chan));
			}
			for uart in tables.uarts.values() {
				uart.stop();
			}
			tables.uarts.clear();
			peers
		};
		for peer in peers {
			// The initiator's socket closes through its own egress drain, so
			// the final OK still gets out.
			if initiator != Some(peer.id()) {
				peer.shutdown_socket();
			}
		}
		// A blocked accept() only notices the flag once something connects.
		let addr = *self
			.listener_addr
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if let Some(addr) = addr {
			let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
		}
	}
}

/// The attach accept policy: a full-duplex or rx attach is denied when the
/// target's UART is open exclusively and a DataRxTx is already attached.
fn accept_attach(tables: &Tables, target: ChannelId) -> bool {
	let Some(entry) = tables.ctrl.get(&target) else {
		return false;
	};
	let exclusive = entry.uart.as_ref().is_some_and(|uart| uart.exclusive());
	if !exclusive {
		return true;
	}
	!entry.attach_rx.iter().any(|attached| {
		tables
			.data
			.get(attached)
			.is_some_and(|data| data.role == Role::DataRxTx)
	})
}

/// Opening exclusively with several DataRxTx channels already attached
/// keeps the first and terminates the rest.
fn trim_extra_rxtx(tables: &mut Tables, id: ChannelId) {
	let Some(entry) = tables.ctrl.get(&id) else {
		return;
	};
	let rxtx = entry
		.attach_rx
		.iter()
		.filter(|attached| {
			tables
				.data
				.get(attached)
				.is_some_and(|data| data.role == Role::DataRxTx)
		})
		.copied()
		.collect::<Vec<_>>();
	for victim in rxtx.into_iter().skip(1) {
		if let Some(data) = tables.data.get(&victim) {
			debug!(
				channel = id,
				victim = victim,
				"exclusive open, dropping extra full-duplex channel"
			);
			data.chan.stop();
		}
	}
}

fn attachment_targets(
	tables: &Tables,
	ctrl: ChannelId,
	pick: impl Fn(&CtrlEntry) -> &Vec<ChannelId>,
) -> Vec<Sender<Bytes>> {
	let Some(entry) = tables.ctrl.get(&ctrl) else {
		return Vec::new();
	};
	pick(entry)
		.iter()
		.filter_map(|attached| {
			tables
				.data
				.get(attached)
				.map(|data| data.chan.egress_sender())
		})
		.collect()
}

fn snapshot_in(tables: &Tables, id: ChannelId) -> Option<ChannelSnapshot> {
	if let Some(entry) = tables.ctrl.get(&id) {
		return Some(ChannelSnapshot::Control {
			id,
			peer: entry.chan.peer(),
			uart: entry.uart.as_ref().map(|uart| uart.name().to_owned()),
			cfg: entry.cfg.clone(),
			attachees: entry.attach_rx.len() + entry.attach_tx.len(),
		});
	}
	let entry = tables.data.get(&id)?;
	let uart = tables
		.ctrl
		.get(&entry.ctrl)
		.and_then(|owner| owner.uart.as_ref().map(|uart| uart.name().to_owned()));
	Some(ChannelSnapshot::Data {
		id,
		peer: entry.chan.peer(),
		role: entry.role,
		ctrl: entry.ctrl,
		uart,
	})
}
