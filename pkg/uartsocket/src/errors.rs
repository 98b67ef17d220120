//! A container for all the types of errors generated crate-wide.
//!
//! [`BridgeError`] is what running the server itself can fail with;
//! everything a client can trigger funnels into [`CommandError`] instead.
//! The string renderings of [`CommandError`] (and the [`TopologyError`]s
//! nested inside it) are part of the wire protocol: a failed control
//! command answers `ERROR <display>\n`, so the `#[error]` texts below are
//! protocol text, not just log text.

use miette::Diagnostic;
use std::io::Error as IoError;
use thiserror::Error;

/// The 'top-level' error type for this entire crate, all error types
/// wrap underneath this.
#[derive(Error, Diagnostic, Debug)]
pub enum BridgeError {
	/// We could not turn the configured host/port pair into a concrete
	/// socket address to listen on.
	#[error("Could not resolve `{spec}` into an address to listen on: {cause}")]
	#[diagnostic(code(uartsocket::net::address_resolution))]
	AddressResolution {
		spec: String,
		#[source]
		cause: IoError,
	},
	/// We failed to bind the control listener.
	///
	/// This can happen for numerous reasons, such as:
	///
	/// - The program does not have permission to listen on this specific port.
	/// - The address is already being used by another process.
	#[error("Failed to bind the control listener on `{spec}`: {cause}")]
	#[diagnostic(code(uartsocket::net::bind_failure))]
	BindFailure {
		spec: String,
		#[source]
		cause: IoError,
	},
	/// The accept loop died with a socket error while the server was still
	/// supposed to be running.
	#[error("Failed to accept an incoming connection: {0}")]
	#[diagnostic(code(uartsocket::net::accept_failure))]
	AcceptFailure(#[source] IoError),
}

/// A serial device failure, from open, I/O, reconfiguration, or a modem
/// line operation.
///
/// Any of these surfacing inside a pump thread tears the owning UART down;
/// surfacing while handling an `O`/`U` command they are reported to the
/// issuing control channel as `ERROR serial:<detail>`.
#[derive(Error, Diagnostic, Debug)]
pub enum SerialError {
	/// The underlying serial library reported a failure.
	#[error("{0}")]
	#[diagnostic(code(uartsocket::serial::native))]
	Native(#[from] serialport::Error),
	/// A configuration value that the wire protocol can express, but this
	/// serial backend cannot apply to a real device.
	#[error("{0} is not supported by this serial backend")]
	#[diagnostic(code(uartsocket::serial::unsupported))]
	Unsupported(&'static str),
}

impl From<IoError> for SerialError {
	fn from(cause: IoError) -> Self {
		Self::Native(serialport::Error::from(cause))
	}
}

/// A rejected mutation of the channel/UART topology. State is unchanged
/// whenever one of these is returned.
#[derive(Error, Diagnostic, Debug, PartialEq, Eq)]
pub enum TopologyError {
	/// `A` with the issuer's own channel id.
	#[error("cannot attach to self")]
	#[diagnostic(code(uartsocket::topology::attach_to_self))]
	AttachToSelf,
	/// `A` issued by a control channel that still has data channels of its
	/// own attached.
	#[error("have attachees")]
	#[diagnostic(code(uartsocket::topology::have_attachees))]
	HaveAttachees,
	/// The channel id named by an `A` or `C` does not exist (for `A` it must
	/// also be a control channel).
	#[error("no such channel")]
	#[diagnostic(code(uartsocket::topology::no_such_channel))]
	NoSuchChannel,
	/// The target control channel's accept policy denied the attach: its
	/// UART is open exclusively and already has a full-duplex data channel.
	#[error("control channel denies access of data channel type")]
	#[diagnostic(code(uartsocket::topology::attach_denied))]
	AttachDenied,
	/// `O` for a device some other control channel already has open.
	#[error("already opened in other channel")]
	#[diagnostic(code(uartsocket::topology::already_opened))]
	AlreadyOpened,
}

/// Everything that can go wrong while executing one control command.
///
/// The display string is what goes over the wire after `ERROR `.
#[derive(Error, Diagnostic, Debug)]
pub enum CommandError {
	/// See [`TopologyError`] for details.
	#[error(transparent)]
	#[diagnostic(transparent)]
	Topology(#[from] TopologyError),
	/// See [`SerialError`] for details.
	#[error("serial:{0}")]
	#[diagnostic(code(uartsocket::protocol::serial))]
	Serial(#[from] SerialError),
	#[error("unknown command")]
	#[diagnostic(code(uartsocket::protocol::unknown_command))]
	UnknownCommand,
	#[error("unknown type (R,T or nothing)")]
	#[diagnostic(code(uartsocket::protocol::unknown_attach_kind))]
	UnknownAttachKind,
	#[error("unknown flag (X or nothing)")]
	#[diagnostic(code(uartsocket::protocol::unknown_open_flag))]
	UnknownOpenFlag,
	#[error("missing argument")]
	#[diagnostic(code(uartsocket::protocol::missing_argument))]
	MissingArgument,
	#[error("bad channel id")]
	#[diagnostic(code(uartsocket::protocol::bad_channel_id))]
	BadChannelId,
	#[error("bad numeric value")]
	#[diagnostic(code(uartsocket::protocol::bad_number))]
	BadNumber,
	#[error("unknown parity (n,o,e,m,s)")]
	#[diagnostic(code(uartsocket::protocol::unknown_parity))]
	UnknownParity,
	#[error("unknown bytesize (8,7,6,5)")]
	#[diagnostic(code(uartsocket::protocol::unknown_bytesize))]
	UnknownByteSize,
	#[error("unknown stopbits (1,1.5,2)")]
	#[diagnostic(code(uartsocket::protocol::unknown_stopbits))]
	UnknownStopBits,
	#[error("unknown setting (0,1)")]
	#[diagnostic(code(uartsocket::protocol::unknown_setting))]
	UnknownToggle,
	#[error("unknown line state (0,1,-)")]
	#[diagnostic(code(uartsocket::protocol::unknown_line_state))]
	UnknownLineState,
	#[error("unknown argument")]
	#[diagnostic(code(uartsocket::protocol::unknown_argument))]
	UnknownArgument,
}
