//! The series of knobs that you can use to configure `uartsocketd`.
//!
//! NOTE: this doesn't include any flags potentially included in shared
//! libraries like those used for [`log`].

pub mod cli;
pub mod env;

use crate::knobs::{cli::CliArguments, env::BIND_SPEC};
use std::time::Duration;
use uartsocket::{Tuning, DEFAULT_HOST, DEFAULT_PORT};

/// Turn the positional arguments into the host/port pair to bind.
///
/// The original tools accepted `[host] [port]`, or a lone positional that
/// is a port when it parses as one and a host otherwise; the
/// `UARTSOCKET_BIND` environment variable (`host:port`) fills in when no
/// positionals are present.
#[must_use]
pub fn resolve_bind(argv: &CliArguments) -> (String, u16) {
	match (argv.host_or_port.as_deref(), argv.port) {
		(Some(host), Some(port)) => (host.to_owned(), port),
		(Some(single), None) => match single.parse::<u16>() {
			Ok(port) => (DEFAULT_HOST.to_owned(), port),
			Err(_) => (single.to_owned(), DEFAULT_PORT),
		},
		(None, _) => BIND_SPEC
			.as_deref()
			.and_then(split_bind_spec)
			.unwrap_or_else(|| (DEFAULT_HOST.to_owned(), DEFAULT_PORT)),
	}
}

fn split_bind_spec(spec: &str) -> Option<(String, u16)> {
	let (host, port) = spec.rsplit_once(':')?;
	let port = port.parse::<u16>().ok()?;
	Some((host.to_owned(), port))
}

/// Collect the `-e`/`-p`/`-s` flags into the library's tuning knobs.
#[must_use]
pub fn resolve_tuning(argv: &CliArguments) -> Tuning {
	let defaults = Tuning::default();
	Tuning {
		eth_recv_size: argv.eth_recv_size.unwrap_or(defaults.eth_recv_size),
		eth_poll: argv
			.eth_poll
			.map_or(defaults.eth_poll, Duration::from_secs),
		ser_recv_size: argv.ser_recv_size.unwrap_or(defaults.ser_recv_size),
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;
	use clap::Parser;

	fn argv(args: &[&str]) -> CliArguments {
		CliArguments::try_parse_from(
			std::iter::once("uartsocketd").chain(args.iter().copied()),
		)
		.expect("These test arguments must parse!")
	}

	#[test]
	pub fn bare_invocation_binds_the_defaults() {
		assert_eq!(resolve_bind(&argv(&[])), ("localhost".to_owned(), 5001));
	}

	#[test]
	pub fn lone_positional_port() {
		assert_eq!(resolve_bind(&argv(&["6001"])), ("localhost".to_owned(), 6001));
	}

	#[test]
	pub fn lone_positional_host() {
		assert_eq!(
			resolve_bind(&argv(&["0.0.0.0"])),
			("0.0.0.0".to_owned(), 5001),
			"A non-numeric positional must be treated as the bind host.",
		);
	}

	#[test]
	pub fn host_and_port_positionals() {
		assert_eq!(
			resolve_bind(&argv(&["127.0.0.1", "9000"])),
			("127.0.0.1".to_owned(), 9000)
		);
	}

	#[test]
	pub fn tuning_flags_override_the_defaults() {
		let tuning = resolve_tuning(&argv(&["-e", "64", "-p", "2", "-s", "16"]));
		assert_eq!(tuning.eth_recv_size, 64);
		assert_eq!(tuning.eth_poll, Duration::from_secs(2));
		assert_eq!(tuning.ser_recv_size, 16);

		let defaults = resolve_tuning(&argv(&[]));
		assert_eq!(defaults.eth_recv_size, 8);
		assert_eq!(defaults.eth_poll, Duration::from_secs(1));
		assert_eq!(defaults.ser_recv_size, 1);
	}
}
