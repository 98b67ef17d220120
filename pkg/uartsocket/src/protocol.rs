//! The newline-delimited ASCII control language spoken on control
//! channels.
//!
//! One line is one command; the first whitespace-separated token is the
//! command letter. Every successful command answers `OK`, every failure
//! `ERROR <text>`, and listing commands emit their content lines first.
//! The command letters `X` and `S` also exist as `U` sub-tokens (xon/xoff
//! and stop bits); that collision is resolved positionally, since
//! sub-tokens only ever appear after a leading `U`.

use crate::{
	channel::ChannelShared,
	errors::CommandError,
	registry::{ChannelId, ChannelSnapshot, Registry, Role},
	serial::{self, DataBits, Parity, SerialConfig, StopBits},
	server::Tuning,
	uart::Uart,
};
use std::{fmt::Write as _, sync::Arc, time::Duration};
use tracing::debug;

const HELP_BODY: &str = "\
X            shuts down server, closes all serials, and detaches all clients and channels\n\
C (<n>)      shuts down given channel or self if no id\n\
I            returns this channels' id\n\
A <n> (R|T)  attaches this channel to given channel, making this channel a full duplex data channel, or an Rx/Tx sniff channel\n\
D            lists all control and data channels\n\
L (*)        lists serial ports, gives extra info if non-empty argument\n\
S            lists opened ports by channel id and associated serial port\n\
O <ser> (X)  opens serial port, eXclusively if wanted\n\
U <config params> sets/gets serial port params and reconfigures if open\n\
  B<baud>      sets serial baudrate\n\
  P<par>       sets serial parity\n\
  D<byte>      sets serial bytesize\n\
  S<stop>      sets serial stopbits\n\
  T<tmo>       sets serial read and write timeout in milliseconds\n\
  R<tmo>       sets serial read timeout in milliseconds\n\
  W<tmo>       sets serial write timeout in milliseconds\n\
  M<tmo>       sets serial intracharacter timeout in milliseconds\n\
  Y<ena>       enable or disable rts/cts hw flow control\n\
  Z<ena>       enable or disable dsr/dtr hw flow control\n\
  X<ena>       enable or disable xon/xoff sw flow control\n\
  r<rts>       sets serial rts line hi/lo\n\
  d<dtr>       sets serial dtr line hi/lo\n\
  c            returns serial cts line state\n\
  s            returns serial dsr line state\n\
  i            returns serial ri line state\n\
  e            returns serial cd line state\n";

/// Execute one control line on behalf of `chan` and queue the response.
///
/// Returns the channel's role afterwards: everything leaves it `Control`
/// except a successful `A`.
pub fn dispatch(
	registry: &Arc<Registry>,
	chan: &Arc<ChannelShared>,
	line: &str,
	tuning: &Tuning,
) -> Role {
	let tokens = line.split_whitespace().collect::<Vec<_>>();
	let Some(cmd) = tokens.first() else {
		send_error(chan, &CommandError::UnknownCommand);
		return Role::Control;
	};
	let arg = tokens.get(1).copied();
	let arg2 = tokens.get(2).copied();

	if *cmd == "X" {
		// The answer has to be queued before the shutdown clears the
		// running flags, or it would never be written out.
		send_ok(chan);
		registry.shutdown(Some(chan.id()));
		return Role::Control;
	}

	let outcome = match *cmd {
		"C" => close_channel(registry, chan, arg).map(|()| Role::Control),
		"I" => {
			chan.send_text(&format!("{}\n", chan.id()));
			Ok(Role::Control)
		}
		"A" => attach(registry, chan, arg, arg2),
		"D" => {
			for snapshot in registry.snapshot_all() {
				chan.send_text(&render_snapshot(&snapshot));
			}
			Ok(Role::Control)
		}
		"L" => list_serials(chan, arg).map(|()| Role::Control),
		"S" => {
			for snapshot in registry.snapshot_open_serials() {
				chan.send_text(&render_snapshot(&snapshot));
			}
			Ok(Role::Control)
		}
		"O" => open_serial(registry, chan, arg, arg2, tuning).map(|()| Role::Control),
		"U" => configure_serial(registry, chan, &tokens[1..]).map(|()| Role::Control),
		"?" => {
			chan.send_text(&format!("uartsocket {}\n", env!("CARGO_PKG_VERSION")));
			chan.send_text(HELP_BODY);
			Ok(Role::Control)
		}
		"-" => {
			if let Some(snapshot) = registry.snapshot_one(chan.id()) {
				chan.send_text(&render_snapshot(&snapshot));
			}
			Ok(Role::Control)
		}
		_ => Err(CommandError::UnknownCommand),
	};

	match outcome {
		Ok(role) => {
			send_ok(chan);
			role
		}
		Err(cause) => {
			debug!(channel = chan.id(), %cause, "command rejected");
			send_error(chan, &cause);
			Role::Control
		}
	}
}

fn close_channel(
	registry: &Registry,
	chan: &ChannelShared,
	arg: Option<&str>,
) -> Result<(), CommandError> {
	match arg {
		None => {
			chan.stop();
			Ok(())
		}
		Some(raw) => {
			let target = raw
				.parse::<ChannelId>()
				.map_err(|_| CommandError::BadChannelId)?;
			registry.request_stop(target)?;
			Ok(())
		}
	}
}

fn attach(
	registry: &Registry,
	chan: &ChannelShared,
	arg: Option<&str>,
	arg2: Option<&str>,
) -> Result<Role, CommandError> {
	let target = arg
		.ok_or(CommandError::BadChannelId)?
		.parse::<ChannelId>()
		.map_err(|_| CommandError::BadChannelId)?;
	let role = match arg2 {
		None => Role::DataRxTx,
		Some("R") => Role::DataRx,
		Some("T") => Role::DataTx,
		Some(_) => return Err(CommandError::UnknownAttachKind),
	};
	registry.attach(chan.id(), target, role)?;
	Ok(role)
}

fn open_serial(
	registry: &Arc<Registry>,
	chan: &ChannelShared,
	arg: Option<&str>,
	arg2: Option<&str>,
	tuning: &Tuning,
) -> Result<(), CommandError> {
	let name = arg.ok_or(CommandError::MissingArgument)?;
	let exclusive = match arg2 {
		None => false,
		Some("X") => true,
		Some(_) => return Err(CommandError::UnknownOpenFlag),
	};
	let cfg = registry.begin_open(chan.id(), name, exclusive)?;
	// The device open runs without the registry lock held.
	let (uart, reader, tx_queue) = Uart::open(chan.id(), name, exclusive, &cfg)?;
	registry.commit_open(chan.id(), &uart)?;
	uart.start_pumps(Arc::clone(registry), reader, tx_queue, tuning.ser_recv_size);
	Ok(())
}

fn list_serials(chan: &ChannelShared, arg: Option<&str>) -> Result<(), CommandError> {
	let verbose = arg.is_some();
	for port in serial::list_ports()? {
		if verbose {
			chan.send_text(&format!(
				"{}\t{}\t{}\n",
				port.name, port.description, port.hardware_id
			));
		} else {
			chan.send_text(&format!("{}\n", port.name));
		}
	}
	Ok(())
}

/// Which modem output line an `r`/`d` token drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModemLine {
	Rts,
	Dtr,
}

/// Which modem input line a `c`/`s`/`i`/`e` token samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusLine {
	Cts,
	Dsr,
	Ri,
	Cd,
}

/// What a single `U` sub-token did to the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenEffect {
	/// A parameter changed; the port wants a reconfigure at the end.
	Configured,
	/// An output line level was stored (and should be pushed when open).
	SetLine(ModemLine, Option<bool>),
	/// An input line should be sampled and reported.
	Query(StatusLine),
}

fn configure_serial(
	registry: &Registry,
	chan: &ChannelShared,
	tokens: &[&str],
) -> Result<(), CommandError> {
	let Some(mut cfg) = registry.ctrl_cfg(chan.id()) else {
		// The issuer raced its own teardown; nothing left to configure.
		return Ok(());
	};
	let uart = registry.uart_of(chan.id());
	let mut touched = false;
	let mut failure: Option<CommandError> = None;

	for token in tokens {
		match apply_config_token(&mut cfg, token) {
			Ok(TokenEffect::Configured) => touched = true,
			Ok(TokenEffect::SetLine(line, level)) => {
				if let (Some(uart), Some(level)) = (uart.as_ref(), level) {
					let pushed = match line {
						ModemLine::Rts => uart.port().set_rts(level),
						ModemLine::Dtr => uart.port().set_dtr(level),
					};
					if let Err(cause) = pushed {
						failure = Some(cause.into());
						break;
					}
				}
			}
			Ok(TokenEffect::Query(line)) => match query_line(uart.as_deref(), line) {
				Ok(text) => chan.send_text(text),
				Err(cause) => {
					failure = Some(cause.into());
					break;
				}
			},
			Err(cause) => {
				failure = Some(cause);
				break;
			}
		}
	}

	// Values parsed before a failure stay stored; only the port
	// reconfigure is withheld.
	registry.set_ctrl_cfg(chan.id(), cfg.clone());
	if let Some(cause) = failure {
		return Err(cause);
	}
	if touched {
		if let Some(uart) = uart {
			uart.port().apply(&cfg)?;
		}
	}
	Ok(())
}

/// Parse one `U` sub-token (letter immediately followed by its value) into
/// `cfg`. Pure bookkeeping; pushing line levels and querying the port is
/// the caller's problem.
fn apply_config_token(cfg: &mut SerialConfig, token: &str) -> Result<TokenEffect, CommandError> {
	let letter = token.chars().next().ok_or(CommandError::UnknownArgument)?;
	let value = &token[letter.len_utf8()..];
	match letter {
		'B' => {
			cfg.baud_rate = value.parse().map_err(|_| CommandError::BadNumber)?;
			Ok(TokenEffect::Configured)
		}
		'P' => {
			cfg.parity = match value {
				"n" => Parity::None,
				"o" => Parity::Odd,
				"e" => Parity::Even,
				"m" => Parity::Mark,
				"s" => Parity::Space,
				_ => return Err(CommandError::UnknownParity),
			};
			Ok(TokenEffect::Configured)
		}
		'D' => {
			cfg.data_bits = match value {
				"5" => DataBits::Five,
				"6" => DataBits::Six,
				"7" => DataBits::Seven,
				"8" => DataBits::Eight,
				_ => return Err(CommandError::UnknownByteSize),
			};
			Ok(TokenEffect::Configured)
		}
		'S' => {
			cfg.stop_bits = match value {
				"1" => StopBits::One,
				"1.5" => StopBits::OnePointFive,
				"2" => StopBits::Two,
				_ => return Err(CommandError::UnknownStopBits),
			};
			Ok(TokenEffect::Configured)
		}
		'T' => {
			let timeout = parse_millis(value)?;
			cfg.read_timeout = Some(timeout);
			cfg.write_timeout = Some(timeout);
			Ok(TokenEffect::Configured)
		}
		'R' => {
			cfg.read_timeout = Some(parse_millis(value)?);
			Ok(TokenEffect::Configured)
		}
		'W' => {
			cfg.write_timeout = Some(parse_millis(value)?);
			Ok(TokenEffect::Configured)
		}
		'M' => {
			cfg.inter_byte_timeout = Some(parse_millis(value)?);
			Ok(TokenEffect::Configured)
		}
		'X' => {
			cfg.xonxoff = parse_toggle(value)?;
			Ok(TokenEffect::Configured)
		}
		'Y' => {
			cfg.rtscts = parse_toggle(value)?;
			Ok(TokenEffect::Configured)
		}
		'Z' => {
			cfg.dsrdtr = parse_toggle(value)?;
			Ok(TokenEffect::Configured)
		}
		'r' => {
			let level = parse_line_state(value)?;
			cfg.rts = level;
			Ok(TokenEffect::SetLine(ModemLine::Rts, level))
		}
		'd' => {
			let level = parse_line_state(value)?;
			cfg.dtr = level;
			Ok(TokenEffect::SetLine(ModemLine::Dtr, level))
		}
		'c' => Ok(TokenEffect::Query(StatusLine::Cts)),
		's' => Ok(TokenEffect::Query(StatusLine::Dsr)),
		'i' => Ok(TokenEffect::Query(StatusLine::Ri)),
		'e' => Ok(TokenEffect::Query(StatusLine::Cd)),
		_ => Err(CommandError::UnknownArgument),
	}
}

fn query_line(
	uart: Option<&Uart>,
	line: StatusLine,
) -> Result<&'static str, crate::errors::SerialError> {
	let Some(uart) = uart else {
		return Ok("-\n");
	};
	let level = match line {
		StatusLine::Cts => uart.port().read_cts()?,
		StatusLine::Dsr => uart.port().read_dsr()?,
		StatusLine::Ri => uart.port().read_ri()?,
		StatusLine::Cd => uart.port().read_cd()?,
	};
	Ok(if level { "1\n" } else { "0\n" })
}

fn parse_millis(value: &str) -> Result<Duration, CommandError> {
	value
		.parse::<u64>()
		.map(Duration::from_millis)
		.map_err(|_| CommandError::BadNumber)
}

fn parse_toggle(value: &str) -> Result<bool, CommandError> {
	match value {
		"0" => Ok(false),
		"1" => Ok(true),
		_ => Err(CommandError::UnknownToggle),
	}
}

fn parse_line_state(value: &str) -> Result<Option<bool>, CommandError> {
	match value {
		"0" => Ok(Some(false)),
		"1" => Ok(Some(true)),
		"-" => Ok(None),
		_ => Err(CommandError::UnknownLineState),
	}
}

fn fmt_timeout(timeout: Option<Duration>) -> String {
	timeout.map_or_else(|| "-".to_owned(), |tmo| tmo.as_millis().to_string())
}

/// One tab-separated status line, `\n`-terminated, as emitted by `D`, `S`
/// and `-`.
fn render_snapshot(snapshot: &ChannelSnapshot) -> String {
	match snapshot {
		ChannelSnapshot::Control {
			id,
			peer,
			uart,
			cfg,
			attachees,
		} => {
			let mut line = format!("C{id}\t[{peer}]");
			if let Some(name) = uart {
				let _ = write!(
					line,
					"\tuart:{name}\tbaud:{}\tdata:{}\tstop:{}\tpar:{}",
					cfg.baud_rate, cfg.data_bits, cfg.stop_bits, cfg.parity
				);
				let _ = write!(
					line,
					"\trtmo:{}\twtmo:{}\titmo:{}",
					fmt_timeout(cfg.read_timeout),
					fmt_timeout(cfg.write_timeout),
					fmt_timeout(cfg.inter_byte_timeout)
				);
				let _ = write!(
					line,
					"\tdsrdtr:{}\trtscts:{}\txonxoff:{}",
					u8::from(cfg.dsrdtr),
					u8::from(cfg.rtscts),
					u8::from(cfg.xonxoff)
				);
			}
			if *attachees > 0 {
				let _ = write!(line, "\tattachees:{attachees}");
			}
			line.push('\n');
			line
		}
		ChannelSnapshot::Data {
			id,
			peer,
			role,
			ctrl,
			uart,
		} => {
			let mut line = format!("D{id}\t[{peer}]\t{}\tattached:C{ctrl}", role.label());
			if let Some(name) = uart {
				let _ = write!(line, "\tuart:{name}");
			}
			line.push('\n');
			line
		}
	}
}

fn send_ok(chan: &ChannelShared) {
	chan.send_text("OK\n");
}

fn send_error(chan: &ChannelShared, cause: &CommandError) {
	chan.send_text(&format!("ERROR {cause}\n"));
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn config_tokens_set_their_own_fields() {
		let mut cfg = SerialConfig::default();
		for token in ["B9600", "D7", "Pe", "S2"] {
			assert_eq!(
				apply_config_token(&mut cfg, token).expect("Token must parse!"),
				TokenEffect::Configured,
			);
		}
		assert_eq!(cfg.baud_rate, 9600);
		assert_eq!(cfg.data_bits, DataBits::Seven);
		assert_eq!(cfg.parity, Parity::Even);
		assert_eq!(
			cfg.stop_bits,
			StopBits::Two,
			"Stop bits must land in the stop bits field, never in bytesize.",
		);
		// And the bytesize field must be untouched by the stopbits parse.
		assert_eq!(cfg.data_bits, DataBits::Seven);
	}

	#[test]
	pub fn fractional_stopbits_and_exotic_parity_parse() {
		let mut cfg = SerialConfig::default();
		assert_eq!(
			apply_config_token(&mut cfg, "S1.5").expect("Token must parse!"),
			TokenEffect::Configured,
		);
		assert_eq!(cfg.stop_bits, StopBits::OnePointFive);
		assert_eq!(
			apply_config_token(&mut cfg, "Pm").expect("Token must parse!"),
			TokenEffect::Configured,
		);
		assert_eq!(cfg.parity, Parity::Mark);
	}

	#[test]
	pub fn timeout_tokens_are_milliseconds() {
		let mut cfg = SerialConfig::default();
		assert_eq!(
			apply_config_token(&mut cfg, "T250").expect("Token must parse!"),
			TokenEffect::Configured,
		);
		assert_eq!(cfg.read_timeout, Some(Duration::from_millis(250)));
		assert_eq!(
			cfg.write_timeout,
			Some(Duration::from_millis(250)),
			"T must set the read and the write timeout together.",
		);
		for token in ["R100", "W300", "M42"] {
			assert_eq!(
				apply_config_token(&mut cfg, token).expect("Token must parse!"),
				TokenEffect::Configured,
			);
		}
		assert_eq!(cfg.read_timeout, Some(Duration::from_millis(100)));
		assert_eq!(cfg.write_timeout, Some(Duration::from_millis(300)));
		assert_eq!(cfg.inter_byte_timeout, Some(Duration::from_millis(42)));
	}

	#[test]
	pub fn line_tokens_store_and_report_their_effects() {
		let mut cfg = SerialConfig::default();
		assert_eq!(
			apply_config_token(&mut cfg, "r1").expect("Token must parse!"),
			TokenEffect::SetLine(ModemLine::Rts, Some(true)),
		);
		assert_eq!(cfg.rts, Some(true));
		assert_eq!(
			apply_config_token(&mut cfg, "d-").expect("Token must parse!"),
			TokenEffect::SetLine(ModemLine::Dtr, None),
		);
		assert_eq!(cfg.dtr, None);
		assert_eq!(
			apply_config_token(&mut cfg, "c").expect("Token must parse!"),
			TokenEffect::Query(StatusLine::Cts),
		);
		assert_eq!(
			apply_config_token(&mut cfg, "e").expect("Token must parse!"),
			TokenEffect::Query(StatusLine::Cd),
		);
	}

	#[test]
	pub fn bad_config_tokens_use_the_protocol_error_strings() {
		let mut cfg = SerialConfig::default();
		let cases: [(&str, &str); 6] = [
			("Pq", "unknown parity (n,o,e,m,s)"),
			("D9", "unknown bytesize (8,7,6,5)"),
			("S3", "unknown stopbits (1,1.5,2)"),
			("Y2", "unknown setting (0,1)"),
			("rX", "unknown line state (0,1,-)"),
			("Q1", "unknown argument"),
		];
		for (token, expected) in cases {
			let cause = apply_config_token(&mut cfg, token)
				.expect_err("A malformed token must be rejected!");
			assert_eq!(format!("{cause}"), expected, "Wrong wire text for {token:?}");
		}
		assert_eq!(
			format!(
				"{}",
				apply_config_token(&mut cfg, "Bxyz")
					.expect_err("A non-numeric baud rate must be rejected!")
			),
			"bad numeric value",
		);
	}

	#[test]
	pub fn reapplying_the_same_tokens_is_idempotent() {
		let tokens = ["B9600", "D8", "Pn", "S1", "T1000", "X1", "r0"];
		let mut first = SerialConfig::default();
		for token in tokens {
			apply_config_token(&mut first, token).expect("Token must parse!");
		}
		let mut second = first.clone();
		for token in tokens {
			apply_config_token(&mut second, token).expect("Token must parse!");
		}
		assert_eq!(
			first, second,
			"The same U tokens twice must yield identical settings.",
		);
	}

	#[test]
	pub fn control_status_line_shape() {
		let cfg = SerialConfig {
			baud_rate: 9600,
			..SerialConfig::default()
		};
		let line = render_snapshot(&ChannelSnapshot::Control {
			id: 0,
			peer: "127.0.0.1:40001".parse().expect("static addr"),
			uart: Some("/dev/ttyUSB0".to_owned()),
			cfg,
			attachees: 2,
		});
		assert_eq!(
			line,
			"C0\t[127.0.0.1:40001]\tuart:/dev/ttyUSB0\tbaud:9600\tdata:8\tstop:1\tpar:N\
			 \trtmo:1000\twtmo:1000\titmo:-\tdsrdtr:0\trtscts:0\txonxoff:0\tattachees:2\n",
		);
	}

	#[test]
	pub fn bare_control_status_line_has_no_uart_fields() {
		let line = render_snapshot(&ChannelSnapshot::Control {
			id: 3,
			peer: "127.0.0.1:40002".parse().expect("static addr"),
			uart: None,
			cfg: SerialConfig::default(),
			attachees: 0,
		});
		assert_eq!(line, "C3\t[127.0.0.1:40002]\n");
	}

	#[test]
	pub fn data_status_line_shape() {
		let line = render_snapshot(&ChannelSnapshot::Data {
			id: 5,
			peer: "127.0.0.1:40003".parse().expect("static addr"),
			role: Role::DataRxTx,
			ctrl: 0,
			uart: Some("/dev/ttyS0".to_owned()),
		});
		assert_eq!(
			line,
			"D5\t[127.0.0.1:40003]\trxtx\tattached:C0\tuart:/dev/ttyS0\n"
		);
	}
}
